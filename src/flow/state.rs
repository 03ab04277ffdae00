//! Flow-scoped state and the orchestrator's phases

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Per-attempt values that must survive the redirect round trip.
#[derive(Clone, PartialEq, Eq)]
pub struct FlowState {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
}

impl FlowState {
    /// Nonce to check the ID token against, if one was issued
    pub fn expected_nonce(&self) -> Option<&str> {
        Some(self.nonce.as_str()).filter(|n| !n.is_empty())
    }

    pub fn has_verifier(&self) -> bool {
        !self.code_verifier.is_empty()
    }
}

impl std::fmt::Debug for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowState")
            .field("state", &self.state)
            .field("has_nonce", &!self.nonce.is_empty())
            .field("has_code_verifier", &self.has_verifier())
            .finish()
    }
}

struct PendingFlow {
    flow: FlowState,
    created: Instant,
}

/// Ephemeral storage for the one pending authorization attempt.
///
/// Starting a new attempt replaces the previous one. Entries older than the
/// TTL read as absent, so a stale callback cannot be replayed.
pub struct FlowStore {
    pending: Mutex<Option<PendingFlow>>,
    ttl: Duration,
}

impl FlowStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(None),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn put(&self, flow: FlowState) {
        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            debug!("replacing pending authorization attempt");
        }
        *pending = Some(PendingFlow {
            flow,
            created: Instant::now(),
        });
    }

    /// Remove and return the pending flow if it is still live
    pub async fn take(&self) -> Option<FlowState> {
        let pending = self.pending.lock().await.take()?;
        if pending.created.elapsed() > self.ttl {
            debug!(
                age_secs = pending.created.elapsed().as_secs(),
                "pending authorization attempt expired"
            );
            return None;
        }
        Some(pending.flow)
    }

    pub async fn clear(&self) {
        self.pending.lock().await.take();
    }

    pub async fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .await
            .as_ref()
            .is_some_and(|p| p.created.elapsed() <= self.ttl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPhase {
    Idle,
    Initiated,
    AwaitingCallback,
    Exchanging,
    Validating,
    Established,
    Refreshing,
    Failed(FailureReason),
}

impl FlowPhase {
    pub fn has_session(&self) -> bool {
        matches!(self, FlowPhase::Established | FlowPhase::Refreshing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    AuthServerError,
    InvalidCallback,
    StateMismatch,
    FlowExpired,
    ExchangeError,
    IdTokenInvalid,
    RefreshDenied,
    SessionStorage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowState {
        FlowState {
            state: "S".into(),
            nonce: "N".into(),
            code_verifier: "V".into(),
        }
    }

    #[tokio::test]
    async fn test_take_consumes_flow() {
        let store = FlowStore::new(Duration::from_secs(60));
        store.put(flow()).await;
        assert!(store.is_pending().await);

        assert_eq!(store.take().await, Some(flow()));
        assert_eq!(store.take().await, None);
    }

    #[tokio::test]
    async fn test_expired_flow_reads_as_absent() {
        let store = FlowStore::new(Duration::from_millis(10));
        store.put(flow()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!store.is_pending().await);
        assert_eq!(store.take().await, None);
    }

    #[tokio::test]
    async fn test_new_attempt_replaces_old() {
        let store = FlowStore::new(Duration::from_secs(60));
        store.put(flow()).await;
        let second = FlowState {
            state: "S2".into(),
            ..flow()
        };
        store.put(second.clone()).await;
        assert_eq!(store.take().await, Some(second));
    }

    #[test]
    fn test_debug_hides_verifier_and_empty_nonce_skips_validation() {
        let mut flow = FlowState {
            code_verifier: "very-secret-verifier".into(),
            ..flow()
        };
        assert!(!format!("{:?}", flow).contains("very-secret-verifier"));
        assert_eq!(flow.expected_nonce(), Some("N"));

        flow.nonce.clear();
        assert_eq!(flow.expected_nonce(), None);
    }
}
