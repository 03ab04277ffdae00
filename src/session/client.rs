//! Client-trusted session backend
//!
//! All three slots live in the calling context, optionally mirrored to a
//! JSON file so a later process can resume the session.

use super::{persist, SessionStore, Slot, StoredTokens, TrustModel};
use crate::error::{AuthError, Result};
use crate::oidc::{TokenExchange, TokenSet};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

pub struct ClientSessionStore {
    tokens: Mutex<StoredTokens>,
    path: Option<PathBuf>,
}

impl ClientSessionStore {
    pub fn in_memory() -> Self {
        Self {
            tokens: Mutex::new(StoredTokens::default()),
            path: None,
        }
    }

    /// Open a file-backed store, loading any previously persisted slots
    pub async fn open(path: PathBuf) -> Result<Self> {
        let tokens = persist::read_json::<StoredTokens>(&path)
            .await?
            .unwrap_or_default();

        Ok(Self {
            tokens: Mutex::new(tokens),
            path: Some(path),
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
impl SessionStore for ClientSessionStore {
    fn trust_model(&self) -> TrustModel {
        TrustModel::Public
    }

    async fn read(&self, slot: Slot) -> Result<Option<String>> {
        Ok(self.tokens.lock().await.slot(slot))
    }

    async fn snapshot(&self) -> Result<StoredTokens> {
        Ok(self.tokens.lock().await.clone())
    }

    async fn write(&self, tokens: &TokenSet) -> Result<()> {
        let mut guard = self.tokens.lock().await;
        let next = guard.rotated(tokens, true);

        // Disk first: memory only changes once the new slots are durable
        self.persist(&next).await?;
        *guard = next;

        debug!(rotated = tokens.rotated_refresh_token().is_some(), "session tokens written");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut guard = self.tokens.lock().await;
        *guard = StoredTokens::default();
        self.persist(&guard).await
    }

    async fn discard_refresh(&self) -> Result<()> {
        let mut guard = self.tokens.lock().await;
        let mut next = guard.clone();
        next.refresh_token = None;
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    async fn has_refresh_token(&self) -> bool {
        self.tokens.lock().await.refresh_token.is_some()
    }

    async fn exchange_refresh(&self, exchanger: &dyn TokenExchange) -> Result<TokenSet> {
        let refresh_token = self
            .tokens
            .lock()
            .await
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::RefreshDenied("no refresh token available".to_string()))?;

        exchanger.exchange_refresh(&refresh_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(access: &str, refresh: Option<&str>) -> TokenSet {
        TokenSet {
            access_token: access.to_string(),
            token_type: "Bearer".to_string(),
            expires_in: None,
            refresh_token: refresh.map(str::to_string),
            id_token: None,
            scope: None,
        }
    }

    #[tokio::test]
    async fn test_all_slots_are_readable() {
        let store = ClientSessionStore::in_memory();
        store.write(&tokens("AT1", Some("RT1"))).await.unwrap();

        assert_eq!(store.read(Slot::Access).await.unwrap().as_deref(), Some("AT1"));
        assert_eq!(store.read(Slot::Refresh).await.unwrap().as_deref(), Some("RT1"));
        assert_eq!(store.read(Slot::Id).await.unwrap(), None);
        assert!(store.has_refresh_token().await);
    }

    #[tokio::test]
    async fn test_write_applies_rotation_rule() {
        let store = ClientSessionStore::in_memory();
        store.write(&tokens("AT1", Some("RT1"))).await.unwrap();
        store.write(&tokens("AT2", None)).await.unwrap();
        assert_eq!(store.read(Slot::Refresh).await.unwrap().as_deref(), Some("RT1"));

        store.write(&tokens("AT3", Some("RT3"))).await.unwrap();
        assert_eq!(store.read(Slot::Refresh).await.unwrap().as_deref(), Some("RT3"));
        assert_eq!(store.read(Slot::Access).await.unwrap().as_deref(), Some("AT3"));
    }

    #[tokio::test]
    async fn test_clear_zeroes_everything() {
        let store = ClientSessionStore::in_memory();
        store.write(&tokens("AT1", Some("RT1"))).await.unwrap();
        store.clear().await.unwrap();

        assert!(store.snapshot().await.unwrap().is_empty());
        assert!(!store.has_refresh_token().await);
    }

    #[tokio::test]
    async fn test_persisted_session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = ClientSessionStore::open(path.clone()).await.unwrap();
        store.write(&tokens("AT1", Some("RT1"))).await.unwrap();
        drop(store);

        let reopened = ClientSessionStore::open(path.clone()).await.unwrap();
        assert_eq!(reopened.read(Slot::Refresh).await.unwrap().as_deref(), Some("RT1"));

        reopened.clear().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_exchange_without_refresh_token_is_denied() {
        struct Unreachable;

        #[async_trait]
        impl TokenExchange for Unreachable {
            async fn exchange_code(&self, _: &str, _: &str) -> Result<TokenSet> {
                unreachable!("code exchange not expected")
            }
            async fn exchange_refresh(&self, _: &str) -> Result<TokenSet> {
                unreachable!("refresh exchange not expected")
            }
        }

        let store = ClientSessionStore::in_memory();
        let err = store.exchange_refresh(&Unreachable).await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshDenied(_)));
    }
}
