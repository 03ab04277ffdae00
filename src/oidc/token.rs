//! Token endpoint exchanges
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (completes the PKCE flow)
//! 2. Refresh token exchange (rotation-aware)
//!
//! Both POST `application/x-www-form-urlencoded` bodies. Error responses are
//! parsed into a structured [`ExchangeError`]; transport failures and
//! malformed success bodies surface as [`AuthError::Transport`].

use crate::error::{AuthError, ExchangeError, Result};
use crate::secret::Secret;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const EXCHANGE_TIMEOUT_SECS: u64 = 30;

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Successful token endpoint response, for both code and refresh grants.
///
/// A refresh response may omit `refresh_token`; that means the refresh token
/// already held stays valid and must be kept.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenSet {
    /// The rotated refresh token, if the response carried a usable one.
    pub fn rotated_refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Error body returned by the token endpoint with a non-2xx status
#[derive(Debug, Deserialize)]
pub struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// How a confidential client presents its secret to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ClientAuthMethod {
    /// `client_secret` as a form field
    #[default]
    #[value(name = "post")]
    ClientSecretPost,
    /// HTTP Basic `client_id:client_secret`
    #[value(name = "basic")]
    ClientSecretBasic,
}

#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub auth_method: ClientAuthMethod,
}

impl ClientCredentials {
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            auth_method: ClientAuthMethod::ClientSecretPost,
        }
    }

    pub fn confidential(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        auth_method: ClientAuthMethod,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Some(Secret::new(client_secret.into())),
            auth_method,
        }
    }

    pub fn is_confidential(&self) -> bool {
        self.client_secret.is_some()
    }
}

/// The two grants the authentication flow needs from a token endpoint.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenSet>;

    async fn exchange_refresh(&self, refresh_token: &str) -> Result<TokenSet>;
}

/// reqwest-backed token endpoint client
pub struct TokenClient {
    http: reqwest::Client,
    token_endpoint: Url,
    redirect_uri: String,
    credentials: ClientCredentials,
}

impl TokenClient {
    pub fn new(
        token_endpoint: Url,
        redirect_uri: impl Into<String>,
        credentials: ClientCredentials,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(EXCHANGE_TIMEOUT_SECS))
            .build()
            .map_err(|e| AuthError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_endpoint,
            redirect_uri: redirect_uri.into(),
            credentials,
        })
    }

    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    /// POST a grant, attaching client credentials per the configured method
    async fn post_grant(
        &self,
        grant_type: &'static str,
        mut params: Vec<(&'static str, String)>,
    ) -> Result<TokenSet> {
        params.insert(0, ("grant_type", grant_type.to_string()));
        params.push(("client_id", self.credentials.client_id.clone()));

        let mut request = self.http.post(self.token_endpoint.clone());

        if let Some(ref secret) = self.credentials.client_secret {
            match self.credentials.auth_method {
                ClientAuthMethod::ClientSecretPost => {
                    params.push(("client_secret", secret.expose().clone()));
                }
                ClientAuthMethod::ClientSecretBasic => {
                    request = request.basic_auth(
                        &self.credentials.client_id,
                        Some(secret.expose().as_str()),
                    );
                }
            }
        }

        debug!(
            grant_type,
            endpoint = %self.token_endpoint,
            confidential = self.credentials.is_confidential(),
            "posting token request"
        );

        let response = request.form(&params).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (code, description) = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(parsed) => (parsed.error, parsed.error_description),
                Err(_) => (format!("HTTP {}", status.as_u16()), None),
            };

            warn!(
                grant_type,
                status = status.as_u16(),
                error = %code,
                "token endpoint rejected request"
            );

            return Err(ExchangeError {
                status: status.as_u16(),
                code,
                description,
            }
            .into());
        }

        let body = response.bytes().await?;
        let tokens: TokenSet = serde_json::from_slice(&body).map_err(malformed_response)?;

        if tokens.access_token.is_empty() {
            return Err(AuthError::Transport(
                "malformed token response: empty access_token".to_string(),
            ));
        }

        debug!(grant_type, tokens = ?tokens, "token request succeeded");
        Ok(tokens)
    }
}

/// The serde message can quote field values, so only its category and position are kept
fn malformed_response(err: serde_json::Error) -> AuthError {
    AuthError::Transport(format!(
        "malformed token response: {:?} error at line {} column {}",
        err.classify(),
        err.line(),
        err.column()
    ))
}

#[async_trait]
impl TokenExchange for TokenClient {
    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenSet> {
        self.post_grant(
            "authorization_code",
            vec![
                ("code", code.to_string()),
                ("redirect_uri", self.redirect_uri.clone()),
                ("code_verifier", code_verifier.to_string()),
            ],
        )
        .await
    }

    async fn exchange_refresh(&self, refresh_token: &str) -> Result<TokenSet> {
        self.post_grant(
            "refresh_token",
            vec![("refresh_token", refresh_token.to_string())],
        )
        .await
    }
}
