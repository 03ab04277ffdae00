//! OIDC provider discovery
//!
//! Fetches endpoints from /.well-known/openid-configuration. Only used when
//! an issuer URL is configured and some endpoint was not given explicitly.

use crate::error::{AuthError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Discover provider metadata from an issuer URL
    pub async fn discover(issuer_url: &str) -> Result<Self> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer_url.trim_end_matches('/')
        );

        let response = reqwest::Client::new()
            .get(&discovery_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| AuthError::Config(format!("OIDC discovery request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AuthError::Config(format!(
                "OIDC discovery returned status {}",
                response.status()
            )));
        }

        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| AuthError::Config(format!("invalid OIDC discovery document: {}", e)))?;

        if metadata.authorization_endpoint.is_empty() {
            return Err(AuthError::Config(
                "OIDC discovery document missing authorization_endpoint".to_string(),
            ));
        }

        if metadata.token_endpoint.is_empty() {
            return Err(AuthError::Config(
                "OIDC discovery document missing token_endpoint".to_string(),
            ));
        }

        if !metadata.supports_s256() {
            tracing::warn!(
                issuer = %metadata.issuer,
                "provider does not advertise S256 PKCE support"
            );
        }

        Ok(metadata)
    }

    /// An empty list means the provider did not advertise methods at all.
    pub fn supports_s256(&self) -> bool {
        self.code_challenge_methods_supported.is_empty()
            || self.code_challenge_methods_supported.iter().any(|m| m == "S256")
    }
}
