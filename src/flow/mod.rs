//! Authorization flow orchestrator
//!
//! Drives one client context through
//! `Idle -> Initiated -> AwaitingCallback -> Exchanging -> Validating -> Established`,
//! with `Refreshing` hanging off `Established` and logout reachable from
//! everywhere.
//!
//! Exchanges run on spawned tasks: if the caller's future is dropped
//! mid-exchange, the exchange still finishes and the session store is
//! written in one piece or not at all. Refreshes are single-flight per
//! session: concurrent callers share the outcome of the one in-flight grant.
//!
//! Logout bumps a session epoch. An exchange that started under an older
//! epoch drops its token response instead of writing it back.

pub mod state;

pub use state::{FailureReason, FlowPhase, FlowState, FlowStore};

use crate::error::{AuthError, CallbackError, Result};
use crate::oidc::callback::CallbackParams;
use crate::oidc::{id_token, pkce, PkceParams, TokenExchange, TokenSet};
use crate::session::{Session, SessionStore, Slot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

/// Non-secret settings for building redirects.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub authorization_endpoint: Url,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub end_session_endpoint: Option<Url>,
    pub post_logout_redirect_uri: Option<String>,
}

impl FlowSettings {
    /// Authorization URL with PKCE parameters
    pub fn authorization_url(&self, state: &str, nonce: &str, code_challenge: &str) -> Url {
        let mut url = self.authorization_endpoint.clone();

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("scope", &self.scope)
            .append_pair("state", state)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("nonce", nonce)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");

        url
    }

    /// RP-initiated logout URL; the hint is left out when there is no ID token
    pub fn end_session_url(&self, id_token_hint: Option<&str>) -> Result<Url> {
        let mut url = self.end_session_endpoint.clone().ok_or_else(|| {
            AuthError::Config(
                "OAUTH2_END_SESSION_ENDPOINT is required for global logout".to_string(),
            )
        })?;

        let post_logout = match self.post_logout_redirect_uri {
            Some(ref uri) => uri.clone(),
            None => {
                let redirect = Url::parse(&self.redirect_uri)?;
                format!("{}/?logged_out=true", redirect.origin().ascii_serialization())
            }
        };

        {
            let mut pairs = url.query_pairs_mut();
            if let Some(hint) = id_token_hint {
                pairs.append_pair("id_token_hint", hint);
            }
            pairs.append_pair("post_logout_redirect_uri", &post_logout);
        }

        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutScope {
    /// Clear this client's session store only
    Local,
    /// Also end the session at the authorization server
    Global,
}

#[derive(Debug)]
pub struct LogoutOutcome {
    /// Where to send the user agent for a global logout
    pub end_session_url: Option<Url>,
    /// Set when part of the store could not be cleared; logging out again retries it
    pub clear_error: Option<AuthError>,
}

struct RefreshGate {
    generation: u64,
    last: Option<Result<Session>>,
}

struct Inner {
    settings: FlowSettings,
    exchanger: Arc<dyn TokenExchange>,
    store: Arc<dyn SessionStore>,
    flows: Arc<FlowStore>,
    phase: RwLock<FlowPhase>,
    refresh_gate: Mutex<RefreshGate>,
    refresh_generation: AtomicU64,
    session_epoch: AtomicU64,
    /// Serializes store writes and phase changes against logout
    commit: Mutex<()>,
}

/// Handle to one client context's authentication state machine.
#[derive(Clone)]
pub struct AuthFlow {
    inner: Arc<Inner>,
}

impl AuthFlow {
    pub fn new(
        settings: FlowSettings,
        exchanger: Arc<dyn TokenExchange>,
        store: Arc<dyn SessionStore>,
        flows: Arc<FlowStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                exchanger,
                store,
                flows,
                phase: RwLock::new(FlowPhase::Idle),
                refresh_gate: Mutex::new(RefreshGate {
                    generation: 0,
                    last: None,
                }),
                refresh_generation: AtomicU64::new(0),
                session_epoch: AtomicU64::new(0),
                commit: Mutex::new(()),
            }),
        }
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    pub async fn phase(&self) -> FlowPhase {
        *self.inner.phase.read().await
    }

    /// Resume a session persisted by an earlier run
    pub async fn restore(&self) -> Result<Option<Session>> {
        let session = self.current_session().await?;
        if session.is_some() {
            self.inner.set_phase(FlowPhase::Established).await;
            debug!("restored persisted session");
        }
        Ok(session)
    }

    pub async fn current_session(&self) -> Result<Option<Session>> {
        let stored = self.inner.store.snapshot().await?;
        Ok(Session::from_stored(&stored))
    }

    /// Current access token, for attaching to resource calls
    pub async fn access_token(&self) -> Result<String> {
        self.inner
            .store
            .read(Slot::Access)
            .await?
            .ok_or(AuthError::NoSession)
    }

    /// `Idle -> Initiated`: generate PKCE material and build the authorization URL.
    ///
    /// No network call is made.
    pub async fn initiate(&self) -> Result<Url> {
        let pkce = PkceParams::generate()?;
        let state = pkce::generate_state()?;
        let nonce = pkce::generate_nonce()?;

        let url = self
            .inner
            .settings
            .authorization_url(&state, &nonce, &pkce.code_challenge);

        self.inner
            .flows
            .put(FlowState {
                state,
                nonce,
                code_verifier: pkce.code_verifier,
            })
            .await;
        self.inner.set_phase(FlowPhase::Initiated).await;

        info!(
            client_id = %self.inner.settings.client_id,
            "authorization request prepared"
        );
        Ok(url)
    }

    /// `Initiated -> AwaitingCallback`, once the user agent has been sent off
    pub async fn mark_redirected(&self) {
        let mut phase = self.inner.phase.write().await;
        if *phase == FlowPhase::Initiated {
            *phase = FlowPhase::AwaitingCallback;
        }
    }

    /// Process the authorization server's callback.
    ///
    /// The stored flow state is consumed whatever the outcome. State is
    /// checked before any token endpoint call.
    pub async fn handle_callback(&self, params: CallbackParams) -> Result<Session> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.complete_flow(params).await })
            .await
            .map_err(|e| AuthError::Task(e.to_string()))?
    }

    /// `Established -> Refreshing -> Established | Failed(RefreshDenied)`.
    ///
    /// Callers arriving while a refresh is in flight get that refresh's
    /// outcome instead of issuing their own grant.
    pub async fn refresh(&self) -> Result<Session> {
        let seen = self.inner.refresh_generation.load(Ordering::Acquire);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.refresh_single_flight(seen).await })
            .await
            .map_err(|e| AuthError::Task(e.to_string()))?
    }

    /// Clear the session from any phase.
    ///
    /// A global logout builds the end-session redirect from the held ID
    /// token first, then clears local state. Local state is cleared even if
    /// the end-session endpoint is not configured. Exchanges still in flight
    /// when this runs never write their tokens back.
    pub async fn logout(&self, scope: LogoutScope) -> Result<LogoutOutcome> {
        let inner = &self.inner;

        let end_session = match scope {
            LogoutScope::Local => Ok(None),
            LogoutScope::Global => {
                let id_token = inner.store.read(Slot::Id).await.ok().flatten();
                inner.settings.end_session_url(id_token.as_deref()).map(Some)
            }
        };

        let cleared = {
            let _commit = inner.commit.lock().await;
            inner.session_epoch.fetch_add(1, Ordering::AcqRel);
            let cleared = inner.store.clear().await;
            inner.flows.clear().await;
            inner.set_phase(FlowPhase::Idle).await;
            cleared
        };

        match cleared {
            Ok(()) => info!(?scope, "session cleared"),
            Err(ref e) => warn!(?scope, error = %e, "session partially cleared"),
        }

        Ok(LogoutOutcome {
            end_session_url: end_session?,
            clear_error: cleared.err(),
        })
    }
}

impl Inner {
    async fn set_phase(&self, next: FlowPhase) {
        let mut phase = self.phase.write().await;
        if *phase != next {
            debug!(from = ?*phase, to = ?next, "flow phase change");
            *phase = next;
        }
    }

    /// Move to `next` unless the session was ended since `epoch`
    async fn settle(&self, epoch: u64, next: FlowPhase) -> bool {
        let _commit = self.commit.lock().await;
        if self.session_epoch.load(Ordering::Acquire) != epoch {
            return false;
        }
        self.set_phase(next).await;
        true
    }

    /// Persist `tokens` and enter `Established` unless the session was ended since `epoch`
    async fn commit_tokens(&self, epoch: u64, tokens: &TokenSet) -> Result<()> {
        let _commit = self.commit.lock().await;
        if self.session_epoch.load(Ordering::Acquire) != epoch {
            info!("session ended during the exchange, dropping token response");
            return Err(AuthError::NoSession);
        }
        self.store.write(tokens).await?;
        self.set_phase(FlowPhase::Established).await;
        Ok(())
    }

    async fn complete_flow(&self, params: CallbackParams) -> Result<Session> {
        let epoch = self.session_epoch.load(Ordering::Acquire);
        let stored = self.flows.take().await;
        let pending = stored.is_some();
        let result = self.process_callback(params, stored, epoch).await;
        let stray = !pending && self.phase.read().await.has_session();

        match result {
            Ok(_) => info!("authentication completed, session established"),
            Err(ref e) if stray => {
                warn!(error = %e, "callback without a pending attempt ignored, session kept");
            }
            Err(AuthError::NoSession) => {}
            Err(ref e) => {
                let reason = e.failure_reason().unwrap_or(FailureReason::ExchangeError);
                self.settle(epoch, FlowPhase::Failed(reason)).await;
                warn!(?reason, error = %e, "authorization callback failed");
            }
        }

        result
    }

    async fn process_callback(
        &self,
        params: CallbackParams,
        stored: Option<FlowState>,
        epoch: u64,
    ) -> Result<Session> {
        if let Some(error) = params.error {
            return Err(CallbackError::AuthServerDenied {
                error,
                description: params.error_description,
            }
            .into());
        }

        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        let (code, state) = match (non_empty(params.code), non_empty(params.state)) {
            (Some(code), Some(state)) => (code, state),
            _ => {
                return Err(CallbackError::InvalidCallback(
                    "missing code or state parameter".to_string(),
                )
                .into())
            }
        };

        let flow = stored.ok_or(CallbackError::FlowExpired)?;
        if state != flow.state {
            return Err(CallbackError::StateMismatch.into());
        }
        if !flow.has_verifier() {
            return Err(CallbackError::FlowExpired.into());
        }

        if !self.settle(epoch, FlowPhase::Exchanging).await {
            return Err(AuthError::NoSession);
        }
        let tokens = self
            .exchanger
            .exchange_code(&code, &flow.code_verifier)
            .await?;

        if !self.settle(epoch, FlowPhase::Validating).await {
            info!("session ended during the exchange, dropping token response");
            return Err(AuthError::NoSession);
        }
        match (tokens.id_token.as_deref(), flow.expected_nonce()) {
            (Some(token), Some(nonce)) => {
                let claims = id_token::validate(token, nonce)?;
                debug!(subject = ?claims.subject, "ID token nonce verified");
            }
            _ => debug!("no ID token or nonce, skipping ID token validation"),
        }

        self.commit_tokens(epoch, &tokens).await?;

        let stored = self.store.snapshot().await?;
        Session::from_stored(&stored)
            .ok_or_else(|| AuthError::Storage("session vanished after write".to_string()))
    }

    async fn refresh_single_flight(&self, seen: u64) -> Result<Session> {
        let mut gate = self.refresh_gate.lock().await;

        if gate.generation != seen {
            if let Some(ref outcome) = gate.last {
                debug!("joined in-flight refresh");
                return outcome.clone();
            }
        }

        let outcome = self.run_refresh().await;

        gate.generation += 1;
        self.refresh_generation
            .store(gate.generation, Ordering::Release);
        gate.last = Some(outcome.clone());

        outcome
    }

    async fn run_refresh(&self) -> Result<Session> {
        let epoch = self.session_epoch.load(Ordering::Acquire);
        if !self.phase.read().await.has_session()
            || !self.settle(epoch, FlowPhase::Refreshing).await
        {
            return Err(AuthError::NoSession);
        }
        debug!("refreshing access token");

        match self.store.exchange_refresh(self.exchanger.as_ref()).await {
            Ok(tokens) => {
                match self.commit_tokens(epoch, &tokens).await {
                    Ok(()) => {}
                    Err(AuthError::NoSession) => return Err(AuthError::NoSession),
                    Err(e) => {
                        self.settle(epoch, FlowPhase::Established).await;
                        return Err(e);
                    }
                }

                info!(
                    rotated = tokens.rotated_refresh_token().is_some(),
                    "access token refreshed"
                );
                let stored = self.store.snapshot().await?;
                Session::from_stored(&stored).ok_or(AuthError::NoSession)
            }
            Err(AuthError::Exchange(e)) if e.is_grant_rejection() => {
                warn!(
                    status = e.status,
                    error = %e.code,
                    "refresh token rejected, discarding it"
                );
                let _commit = self.commit.lock().await;
                if self.session_epoch.load(Ordering::Acquire) == epoch {
                    if let Err(discard) = self.store.discard_refresh().await {
                        warn!(error = %discard, "discarding rejected refresh token failed");
                    }
                    self.set_phase(FlowPhase::Failed(FailureReason::RefreshDenied))
                        .await;
                }
                Err(AuthError::RefreshDenied(e.to_string()))
            }
            Err(e @ AuthError::RefreshDenied(_)) => {
                warn!(error = %e, "no usable refresh token");
                self.settle(epoch, FlowPhase::Failed(FailureReason::RefreshDenied))
                    .await;
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "refresh failed transiently, keeping session");
                self.settle(epoch, FlowPhase::Established).await;
                Err(e)
            }
        }
    }
}
