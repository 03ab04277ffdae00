//! Error types for the authentication core
//!
//! Protocol errors (callback, exchange, ID token) are kept as distinct typed
//! values so callers can tell a CSRF rejection from a revoked refresh token
//! from a flaky network. Nothing here ever carries a raw token or secret.

use crate::flow::FailureReason;
use thiserror::Error;

/// Rejections raised while processing the authorization callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("authorization server returned {error}: {}", .description.as_deref().unwrap_or("no description provided"))]
    AuthServerDenied {
        error: String,
        description: Option<String>,
    },

    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    #[error("state parameter mismatch - possible CSRF attack")]
    StateMismatch,

    #[error("authorization flow expired or was never started")]
    FlowExpired,
}

/// Structured failure from the token endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("token endpoint returned {status} ({code}){}", .description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct ExchangeError {
    pub status: u16,
    pub code: String,
    pub description: Option<String>,
}

impl ExchangeError {
    /// 400 and 401 mean the grant itself was refused.
    pub fn is_grant_rejection(&self) -> bool {
        self.status == 400 || self.status == 401
    }

    pub fn is_server_side(&self) -> bool {
        self.status >= 500 || self.status == 429
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("malformed ID token: {0}")]
    MalformedToken(String),

    #[error("ID token nonce does not match the authorization request")]
    NonceMismatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    TokenValidation(#[from] TokenValidationError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Refresh denied: {0}")]
    RefreshDenied(String),

    #[error("Randomness source unavailable: {0}")]
    Entropy(String),

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("Refresh token is held by the server and cannot be read here")]
    RefreshOpaque,

    #[error("No active session")]
    NoSession,

    #[error("Background task failed: {0}")]
    Task(String),
}

impl AuthError {
    /// Whether retrying the same operation may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::Transport(_) | AuthError::Storage(_) => true,
            AuthError::Exchange(e) => e.is_server_side(),
            _ => false,
        }
    }

    /// Whether the user has to start over from a fresh authorization request.
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            AuthError::Callback(_)
                | AuthError::TokenValidation(_)
                | AuthError::RefreshDenied(_)
                | AuthError::NoSession
        )
    }

    /// Terminal state reason for errors raised during the authorization flow.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            AuthError::Callback(CallbackError::AuthServerDenied { .. }) => {
                Some(FailureReason::AuthServerError)
            }
            AuthError::Callback(CallbackError::InvalidCallback(_)) => {
                Some(FailureReason::InvalidCallback)
            }
            AuthError::Callback(CallbackError::StateMismatch) => Some(FailureReason::StateMismatch),
            AuthError::Callback(CallbackError::FlowExpired) => Some(FailureReason::FlowExpired),
            AuthError::Exchange(_) | AuthError::Transport(_) => Some(FailureReason::ExchangeError),
            AuthError::TokenValidation(_) => Some(FailureReason::IdTokenInvalid),
            AuthError::RefreshDenied(_) => Some(FailureReason::RefreshDenied),
            AuthError::Storage(_) => Some(FailureReason::SessionStorage),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest includes the URL but never the form body, so this is safe to surface
        AuthError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for AuthError {
    fn from(err: url::ParseError) -> Self {
        AuthError::Config(format!("invalid URL: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
