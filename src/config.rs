//! Configuration parsing and resolution

use crate::error::{AuthError, Result};
use crate::flow::FlowSettings;
use crate::oidc::{ClientAuthMethod, ClientCredentials, ProviderMetadata};
use crate::session::{persist, TrustModel};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_SCOPES: &str = "openid profile email";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080/auth/callback";
const DEFAULT_FLOW_TTL_SECS: u64 = 300;

#[derive(clap::Args, Debug, Clone, Default)]
pub struct Config {
    /// Authorization endpoint (e.g., https://auth.example.com/oauth2/authorize)
    #[arg(long, env = "OAUTH2_AUTHORIZATION_ENDPOINT", global = true)]
    pub authorization_endpoint: Option<String>,

    /// Token endpoint (e.g., https://auth.example.com/oauth2/token)
    #[arg(long, env = "OAUTH2_TOKEN_ENDPOINT", global = true)]
    pub token_endpoint: Option<String>,

    /// OIDC end-session endpoint, needed for global logout
    #[arg(long, env = "OAUTH2_END_SESSION_ENDPOINT", global = true)]
    pub end_session_endpoint: Option<String>,

    /// OIDC issuer URL; fills in any endpoint not given explicitly
    #[arg(long, env = "OIDC_ISSUER_URL", global = true)]
    pub oidc_issuer_url: Option<String>,

    /// OAuth client ID
    #[arg(long, env = "OAUTH2_CLIENT_ID", global = true)]
    pub client_id: Option<String>,

    /// OAuth client secret (confidential clients only)
    #[arg(long, env = "OAUTH2_CLIENT_SECRET", global = true, hide_env_values = true)]
    pub client_secret: Option<String>,

    /// How the client secret is presented to the token endpoint
    #[arg(long, env = "OAUTH2_CLIENT_AUTH_METHOD", value_enum, default_value_t, global = true)]
    pub client_auth_method: ClientAuthMethod,

    /// Redirect URI registered with the authorization server (default: http://localhost:8080/auth/callback)
    #[arg(long, env = "OAUTH2_REDIRECT_URI", global = true)]
    pub redirect_uri: Option<String>,

    /// Space-separated OAuth scopes (default: "openid profile email")
    #[arg(long, env = "OAUTH2_SCOPE", global = true)]
    pub scope: Option<String>,

    /// Where the end-session endpoint sends the user afterwards
    #[arg(long, env = "OAUTH2_POST_LOGOUT_REDIRECT_URI", global = true)]
    pub post_logout_redirect_uri: Option<String>,

    /// Who holds the refresh token
    #[arg(long, env = "OAUTH2_SESSION_MODE", value_enum, default_value_t, global = true)]
    pub session_mode: TrustModel,

    /// Directory for persisted sessions (default: ~/.authful/sessions)
    #[arg(long, env = "AUTHFUL_TOKEN_DIR", global = true)]
    pub token_dir: Option<PathBuf>,

    /// Mark refresh cookies Secure
    #[arg(long, env = "AUTHFUL_PRODUCTION", global = true)]
    pub production: bool,

    /// Seconds a started login stays valid (default: 300)
    #[arg(long, env = "AUTHFUL_FLOW_TTL_SECS", global = true)]
    pub flow_ttl_secs: Option<u64>,

    /// Show only error messages
    #[arg(long, conflicts_with = "debug", global = true)]
    pub silent: bool,

    /// Enable debug logging
    #[arg(long, env = "AUTHFUL_DEBUG", global = true)]
    pub debug: bool,
}

/// Endpoints and credentials after discovery and defaults are applied.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub flow: FlowSettings,
    pub token_endpoint: Url,
    pub credentials: ClientCredentials,
}

impl Config {
    /// Validate what is present; required values are checked by [`Config::resolve`]
    pub fn validate(&self) -> Result<()> {
        let urls = [
            ("OAUTH2_AUTHORIZATION_ENDPOINT", &self.authorization_endpoint),
            ("OAUTH2_TOKEN_ENDPOINT", &self.token_endpoint),
            ("OAUTH2_END_SESSION_ENDPOINT", &self.end_session_endpoint),
            ("OIDC_ISSUER_URL", &self.oidc_issuer_url),
            ("OAUTH2_REDIRECT_URI", &self.redirect_uri),
            ("OAUTH2_POST_LOGOUT_REDIRECT_URI", &self.post_logout_redirect_uri),
        ];

        for (name, value) in urls {
            if let Some(value) = value {
                parse_url(name, value)?;
            }
        }

        if self.session_mode == TrustModel::Confidential && self.client_secret().is_none() {
            return Err(AuthError::Config(
                "OAUTH2_CLIENT_SECRET is required when OAUTH2_SESSION_MODE=confidential"
                    .to_string(),
            ));
        }

        if self.flow_ttl_secs == Some(0) {
            return Err(AuthError::Config(
                "AUTHFUL_FLOW_TTL_SECS must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve endpoints and credentials, running discovery if needed
    pub async fn resolve(&self) -> Result<ProviderSettings> {
        let needs_discovery =
            self.authorization_endpoint.is_none() || self.token_endpoint.is_none();

        let discovered = match self.oidc_issuer_url {
            Some(ref issuer) if needs_discovery => Some(ProviderMetadata::discover(issuer).await?),
            _ => None,
        };

        let authorization_endpoint = self
            .authorization_endpoint
            .clone()
            .or_else(|| discovered.as_ref().map(|m| m.authorization_endpoint.clone()))
            .ok_or_else(|| missing("OAUTH2_AUTHORIZATION_ENDPOINT"))?;

        let token_endpoint = self
            .token_endpoint
            .clone()
            .or_else(|| discovered.as_ref().map(|m| m.token_endpoint.clone()))
            .ok_or_else(|| missing("OAUTH2_TOKEN_ENDPOINT"))?;

        let end_session_endpoint = self
            .end_session_endpoint
            .clone()
            .or_else(|| discovered.and_then(|m| m.end_session_endpoint))
            .map(|url| parse_url("OAUTH2_END_SESSION_ENDPOINT", &url))
            .transpose()?;

        let client_id = self
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| missing("OAUTH2_CLIENT_ID"))?;

        let credentials = match self.client_secret() {
            Some(secret) => {
                ClientCredentials::confidential(&client_id, secret, self.client_auth_method)
            }
            None => ClientCredentials::public(&client_id),
        };

        Ok(ProviderSettings {
            flow: FlowSettings {
                authorization_endpoint: parse_url(
                    "OAUTH2_AUTHORIZATION_ENDPOINT",
                    &authorization_endpoint,
                )?,
                client_id,
                redirect_uri: self.redirect_uri(),
                scope: self.scopes().join(" "),
                end_session_endpoint,
                post_logout_redirect_uri: self.post_logout_redirect_uri.clone(),
            },
            token_endpoint: parse_url("OAUTH2_TOKEN_ENDPOINT", &token_endpoint)?,
            credentials,
        })
    }

    fn client_secret(&self) -> Option<&str> {
        self.client_secret.as_deref().filter(|s| !s.is_empty())
    }

    /// Get OAuth scopes as a list (with defaults)
    pub fn scopes(&self) -> Vec<String> {
        let scopes_str = self.scope.as_deref().unwrap_or(DEFAULT_SCOPES);

        let mut scopes: Vec<String> = scopes_str.split_whitespace().map(String::from).collect();

        // Ensure "openid" scope is always included
        if !scopes.iter().any(|s| s == "openid") {
            scopes.insert(0, "openid".to_string());
        }

        scopes
    }

    /// Get redirect URI (with default)
    pub fn redirect_uri(&self) -> String {
        self.redirect_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string())
    }

    pub fn flow_ttl(&self) -> Duration {
        Duration::from_secs(self.flow_ttl_secs.unwrap_or(DEFAULT_FLOW_TTL_SECS))
    }

    pub fn storage_dir(&self) -> Result<PathBuf> {
        match self.token_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => persist::default_storage_dir(),
        }
    }

    /// Per-provider, per-client file name prefix inside the storage dir
    pub fn session_file_prefix(&self, settings: &ProviderSettings) -> String {
        format!(
            "{}_{}",
            persist::sanitize_endpoint(settings.token_endpoint.as_str()),
            persist::sanitize_endpoint(&settings.credentials.client_id)
        )
    }

    /// Get log level based on flags
    pub fn log_level(&self) -> tracing::Level {
        if self.silent {
            tracing::Level::ERROR
        } else if self.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

fn missing(name: &str) -> AuthError {
    AuthError::Config(format!("{} is not set", name))
}

fn parse_url(name: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| AuthError::Config(format!("invalid {}: {}", name, e)))
}
