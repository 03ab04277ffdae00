//! Session storage
//!
//! One capability contract, [`SessionStore`], over three logical slots
//! (access, refresh, id) with two interchangeable backends:
//!
//! - [`ClientSessionStore`]: every slot is readable and writable by the
//!   calling context (public client trust model).
//! - [`ServerSessionStore`]: access and id slots are visible, the refresh
//!   token lives behind a [`RefreshVault`] and is only ever used through
//!   [`SessionStore::exchange_refresh`] (confidential client trust model).
//!
//! Both backends apply the same rotation rule: a token response replaces
//! the refresh token only if it carries a non-empty one.

pub mod client;
pub mod persist;
pub mod server;

pub use client::ClientSessionStore;
pub use server::{CookieVault, RefreshCookie, RefreshVault, ServerSessionStore};

use crate::error::Result;
use crate::oidc::id_token::{self, IdentityClaims};
use crate::oidc::{TokenExchange, TokenSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Access,
    Refresh,
    Id,
}

/// Which side of the deployment may hold the refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TrustModel {
    /// Refresh token exposed to the calling context
    #[default]
    Public,
    /// Refresh token kept in a server-held HTTP-only cookie
    Confidential,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    fn trust_model(&self) -> TrustModel;

    /// Read one slot. The confidential backend refuses `Slot::Refresh`.
    async fn read(&self, slot: Slot) -> Result<Option<String>>;

    /// Visible slots as one consistent snapshot
    async fn snapshot(&self) -> Result<StoredTokens>;

    /// Persist a token response atomically, applying the rotation rule
    async fn write(&self, tokens: &TokenSet) -> Result<()>;

    /// Zero all three slots
    async fn clear(&self) -> Result<()>;

    /// Drop only the refresh token (after the issuer refused it)
    async fn discard_refresh(&self) -> Result<()>;

    async fn has_refresh_token(&self) -> bool;

    /// Run a refresh grant with the held refresh token.
    ///
    /// Does not persist the result; the caller writes it back through
    /// [`SessionStore::write`].
    async fn exchange_refresh(&self, exchanger: &dyn TokenExchange) -> Result<TokenSet>;
}

/// Slot contents as persisted by a backend.
///
/// `refresh_token` is only ever populated by the public backend.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl StoredTokens {
    /// Slots after applying `tokens`.
    ///
    /// Access token and expiry are always replaced. The id token is replaced
    /// only when the response carries one. The refresh token follows the
    /// rotation rule, and is dropped entirely when `keep_refresh` is false.
    pub fn rotated(&self, tokens: &TokenSet, keep_refresh: bool) -> Self {
        let refresh_token = if keep_refresh {
            tokens
                .rotated_refresh_token()
                .map(str::to_string)
                .or_else(|| self.refresh_token.clone())
        } else {
            None
        };

        Self {
            access_token: Some(tokens.access_token.clone()),
            token_type: Some(tokens.token_type.clone()),
            id_token: tokens.id_token.clone().or_else(|| self.id_token.clone()),
            refresh_token,
            expires_at: tokens
                .expires_in
                .map(|secs| Utc::now().timestamp().saturating_add(secs as i64)),
        }
    }

    pub fn slot(&self, slot: Slot) -> Option<String> {
        match slot {
            Slot::Access => self.access_token.clone(),
            Slot::Refresh => self.refresh_token.clone(),
            Slot::Id => self.id_token.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.id_token.is_none() && self.refresh_token.is_none()
    }
}

impl std::fmt::Debug for StoredTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredTokens")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The authenticated identity as the presentation layer sees it.
#[derive(Clone)]
pub struct Session {
    pub access_token: String,
    pub token_type: String,
    pub id_token: Option<String>,
    /// Only populated in the public trust model
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Recomputed from `id_token`; `None` if absent or undecodable
    pub claims: Option<IdentityClaims>,
}

impl Session {
    pub fn from_stored(stored: &StoredTokens) -> Option<Self> {
        let access_token = stored.access_token.clone()?;
        let claims = stored
            .id_token
            .as_deref()
            .and_then(|token| id_token::decode_claims(token).ok());

        Some(Self {
            access_token,
            token_type: stored
                .token_type
                .clone()
                .unwrap_or_else(|| "Bearer".to_string()),
            id_token: stored.id_token.clone(),
            refresh_token: stored.refresh_token.clone(),
            expires_at: stored
                .expires_at
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            claims,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token_type", &self.token_type)
            .field("has_id_token", &self.id_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("subject", &self.claims.as_ref().and_then(|c| c.subject.as_deref()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(access: &str, refresh: Option<&str>, id: Option<&str>) -> TokenSet {
        TokenSet {
            access_token: access.to_string(),
            token_type: "Bearer".to_string(),
            expires_in: Some(600),
            refresh_token: refresh.map(str::to_string),
            id_token: id.map(str::to_string),
            scope: None,
        }
    }

    #[test]
    fn test_rotation_keeps_refresh_when_omitted() {
        let first = StoredTokens::default().rotated(&response("AT1", Some("RT1"), Some("ID1")), true);
        let second = first.rotated(&response("AT2", None, None), true);

        assert_eq!(second.access_token.as_deref(), Some("AT2"));
        assert_eq!(second.refresh_token.as_deref(), Some("RT1"));
        assert_eq!(second.id_token.as_deref(), Some("ID1"));
    }

    #[test]
    fn test_rotation_replaces_refresh_when_present() {
        let first = StoredTokens::default().rotated(&response("AT1", Some("RT1"), None), true);
        let second = first.rotated(&response("AT2", Some("RT2"), Some("ID2")), true);

        assert_eq!(second.refresh_token.as_deref(), Some("RT2"));
        assert_eq!(second.id_token.as_deref(), Some("ID2"));
    }

    #[test]
    fn test_rotation_ignores_empty_refresh() {
        let first = StoredTokens::default().rotated(&response("AT1", Some("RT1"), None), true);
        let second = first.rotated(&response("AT2", Some(""), None), true);
        assert_eq!(second.refresh_token.as_deref(), Some("RT1"));
    }

    #[test]
    fn test_rotation_without_refresh_slot() {
        let stored = StoredTokens::default().rotated(&response("AT1", Some("RT1"), None), false);
        assert!(stored.refresh_token.is_none());
        assert!(stored.expires_at.is_some());
    }

    #[test]
    fn test_session_view_decodes_claims() {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
        let id = format!(
            "h.{}.s",
            URL_SAFE_NO_PAD.encode(r#"{"sub":"u1","email":"a@b.c"}"#)
        );
        let stored = StoredTokens::default().rotated(&response("AT1", None, Some(&id)), true);

        let session = Session::from_stored(&stored).unwrap();
        assert_eq!(session.access_token, "AT1");
        assert!(!session.is_expired());
        let claims = session.claims.clone().unwrap();
        assert_eq!(claims.subject.as_deref(), Some("u1"));
    }

    #[test]
    fn test_session_view_requires_access_token() {
        assert!(Session::from_stored(&StoredTokens::default()).is_none());
    }
}
