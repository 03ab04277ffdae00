//! Authful Session Library
//!
//! OAuth 2.0 Authorization Code + PKCE client core with OIDC nonce checks,
//! refresh token rotation and two session trust models.

pub mod config;
pub mod error;
pub mod flow;
pub mod middleware;
pub mod oidc;
pub mod secret;
pub mod session;

pub use error::{AuthError, Result};
pub use flow::{AuthFlow, FlowPhase, FlowSettings, LogoutOutcome, LogoutScope};
pub use middleware::{BearerAuth, RetryPolicy};
pub use session::{Session, SessionStore, TrustModel};
