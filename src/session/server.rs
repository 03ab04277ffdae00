//! Server-trusted session backend
//!
//! The refresh token never reaches the calling context. It is sealed into a
//! [`RefreshVault`] (the server trust boundary), which runs refresh grants on
//! the caller's behalf. [`CookieVault`] models that boundary as an HTTP-only
//! cookie and queues the `Set-Cookie` headers an HTTP layer has to emit.

use super::{persist, SessionStore, Slot, StoredTokens, TrustModel};
use crate::error::{AuthError, Result};
use crate::oidc::{TokenExchange, TokenSet};
use crate::secret::Secret;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const REFRESH_COOKIE_NAME: &str = "refresh_token";

/// 30 days
pub const REFRESH_COOKIE_MAX_AGE_SECS: i64 = 30 * 24 * 60 * 60;

/// Owner of the refresh token in the confidential trust model.
#[async_trait]
pub trait RefreshVault: Send + Sync {
    /// Store a (rotated) refresh token
    async fn seal(&self, refresh_token: &str) -> Result<()>;

    async fn is_sealed(&self) -> bool;

    /// Run the refresh grant inside the boundary with the sealed token
    async fn redeem(&self, exchanger: &dyn TokenExchange) -> Result<TokenSet>;

    /// Round trip to the boundary to drop the sealed token
    async fn revoke(&self) -> Result<()>;
}

/// HTTP-only, same-site-lax, path-scoped refresh cookie.
#[derive(Clone)]
pub struct RefreshCookie {
    value: Secret<String>,
    secure: bool,
    issued_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct PersistedCookie {
    value: String,
    secure: bool,
    issued_at: i64,
}

impl RefreshCookie {
    pub fn issue(value: impl Into<String>, secure: bool) -> Self {
        Self {
            value: Secret::new(value.into()),
            secure,
            issued_at: Utc::now(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(REFRESH_COOKIE_MAX_AGE_SECS)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// `Set-Cookie` value that installs this cookie
    pub fn set_cookie_header(&self) -> Result<HeaderValue> {
        let mut cookie = format!(
            "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            REFRESH_COOKIE_NAME,
            self.value.expose(),
            REFRESH_COOKIE_MAX_AGE_SECS
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
            .map_err(|_| AuthError::Storage("refresh token is not a valid cookie value".to_string()))
    }

    /// `Set-Cookie` value that deletes the cookie in the browser
    pub fn removal_header(secure: bool) -> HeaderValue {
        let cookie = if secure {
            "refresh_token=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax; Secure"
        } else {
            "refresh_token=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax"
        };
        HeaderValue::from_static(cookie)
    }

    fn to_persisted(&self) -> PersistedCookie {
        PersistedCookie {
            value: self.value.expose().clone(),
            secure: self.secure,
            issued_at: self.issued_at.timestamp(),
        }
    }

    fn from_persisted(persisted: PersistedCookie) -> Option<Self> {
        Some(Self {
            value: Secret::new(persisted.value),
            secure: persisted.secure,
            issued_at: DateTime::from_timestamp(persisted.issued_at, 0)?,
        })
    }
}

impl std::fmt::Debug for RefreshCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCookie")
            .field("value", &self.value)
            .field("secure", &self.secure)
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

/// Cookie jar acting as the server trust boundary
pub struct CookieVault {
    jar: Mutex<Option<RefreshCookie>>,
    outbox: Mutex<Vec<HeaderValue>>,
    secure: bool,
    path: Option<PathBuf>,
}

impl CookieVault {
    pub fn new(secure: bool) -> Self {
        Self {
            jar: Mutex::new(None),
            outbox: Mutex::new(Vec::new()),
            secure,
            path: None,
        }
    }

    /// File-backed jar, so a later process can redeem the cookie
    pub async fn open(path: PathBuf, secure: bool) -> Result<Self> {
        let cookie = persist::read_json::<PersistedCookie>(&path)
            .await?
            .and_then(RefreshCookie::from_persisted)
            .filter(|c| !c.is_expired_at(Utc::now()));

        Ok(Self {
            jar: Mutex::new(cookie),
            outbox: Mutex::new(Vec::new()),
            secure,
            path: Some(path),
        })
    }

    /// Drain the `Set-Cookie` headers produced since the last call
    pub async fn take_set_cookie_headers(&self) -> Vec<HeaderValue> {
        std::mem::take(&mut *self.outbox.lock().await)
    }

    async fn live_cookie(&self) -> Option<RefreshCookie> {
        let mut jar = self.jar.lock().await;
        if jar.as_ref().is_some_and(|c| c.is_expired_at(Utc::now())) {
            debug!("refresh cookie expired");
            *jar = None;
        }
        jar.clone()
    }
}

#[async_trait]
impl RefreshVault for CookieVault {
    async fn seal(&self, refresh_token: &str) -> Result<()> {
        let cookie = RefreshCookie::issue(refresh_token, self.secure);
        let header = cookie.set_cookie_header()?;

        let mut jar = self.jar.lock().await;
        if let Some(ref path) = self.path {
            persist::write_json_atomic(path, &cookie.to_persisted()).await?;
        }
        *jar = Some(cookie);
        self.outbox.lock().await.push(header);

        debug!("refresh cookie sealed");
        Ok(())
    }

    async fn is_sealed(&self) -> bool {
        self.live_cookie().await.is_some()
    }

    async fn redeem(&self, exchanger: &dyn TokenExchange) -> Result<TokenSet> {
        let cookie = self
            .live_cookie()
            .await
            .ok_or_else(|| AuthError::RefreshDenied("no refresh token available".to_string()))?;

        exchanger.exchange_refresh(cookie.value.expose()).await
    }

    async fn revoke(&self) -> Result<()> {
        let mut jar = self.jar.lock().await;
        if let Some(ref path) = self.path {
            persist::remove(path).await?;
        }
        *jar = None;
        self.outbox
            .lock()
            .await
            .push(RefreshCookie::removal_header(self.secure));

        info!("refresh cookie revoked");
        Ok(())
    }
}

/// Session store for the confidential trust model
pub struct ServerSessionStore {
    visible: Mutex<StoredTokens>,
    path: Option<PathBuf>,
    vault: Arc<dyn RefreshVault>,
}

impl ServerSessionStore {
    pub fn new(vault: Arc<dyn RefreshVault>) -> Self {
        Self {
            visible: Mutex::new(StoredTokens::default()),
            path: None,
            vault,
        }
    }

    /// File-backed visible slots
    pub async fn open(path: PathBuf, vault: Arc<dyn RefreshVault>) -> Result<Self> {
        let mut visible = persist::read_json::<StoredTokens>(&path)
            .await?
            .unwrap_or_default();
        // A file written by a public-mode run must not leak its refresh token here
        visible.refresh_token = None;

        Ok(Self {
            visible: Mutex::new(visible),
            path: Some(path),
            vault,
        })
    }

    async fn persist(&self, tokens: &StoredTokens) -> Result<()> {
        match self.path {
            Some(ref path) if tokens.is_empty() => persist::remove(path).await,
            Some(ref path) => persist::write_json_atomic(path, tokens).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SessionStore for ServerSessionStore {
    fn trust_model(&self) -> TrustModel {
        TrustModel::Confidential
    }

    async fn read(&self, slot: Slot) -> Result<Option<String>> {
        match slot {
            Slot::Refresh => Err(AuthError::RefreshOpaque),
            other => Ok(self.visible.lock().await.slot(other)),
        }
    }

    async fn snapshot(&self) -> Result<StoredTokens> {
        Ok(self.visible.lock().await.clone())
    }

    async fn write(&self, tokens: &TokenSet) -> Result<()> {
        let mut guard = self.visible.lock().await;
        let previous = guard.clone();
        let next = guard.rotated(tokens, false);

        self.persist(&next).await?;

        if let Some(refresh_token) = tokens.rotated_refresh_token() {
            if let Err(e) = self.vault.seal(refresh_token).await {
                warn!(error = %e, "sealing refresh token failed, restoring previous session");
                if let Err(rollback) = self.persist(&previous).await {
                    warn!(error = %rollback, "restoring previous session file failed");
                }
                return Err(e);
            }
        }

        *guard = next;
        debug!(rotated = tokens.rotated_refresh_token().is_some(), "session tokens written");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let visible = {
            let mut guard = self.visible.lock().await;
            *guard = StoredTokens::default();
            self.persist(&guard).await
        };

        // Always attempted, even if the visible clear failed
        let revoked = self.vault.revoke().await;
        if let Err(ref e) = revoked {
            warn!(error = %e, "revoking refresh cookie failed; retry logout to finish");
        }

        visible.and(revoked)
    }

    async fn discard_refresh(&self) -> Result<()> {
        self.vault.revoke().await
    }

    async fn has_refresh_token(&self) -> bool {
        self.vault.is_sealed().await
    }

    async fn exchange_refresh(&self, exchanger: &dyn TokenExchange) -> Result<TokenSet> {
        self.vault.redeem(exchanger).await
    }
}
