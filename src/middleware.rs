//! HTTP middleware for bearer token injection and 401 handling
//!
//! Implements `reqwest-middleware::Middleware` to attach the session's access
//! token to outgoing requests. What happens on a 401 is the caller's choice
//! via [`RetryPolicy`].

use crate::error::AuthError;
use crate::flow::AuthFlow;
use async_trait::async_trait;
use http::Extensions;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Refresh through the flow's single-flight refresh, then retry once
    #[default]
    RefreshOnce,
    /// Hand the 401 back to the caller untouched
    Fail,
}

/// Middleware that injects the current access token
pub struct BearerAuth {
    flow: AuthFlow,
    policy: RetryPolicy,
}

impl BearerAuth {
    pub fn new(flow: AuthFlow, policy: RetryPolicy) -> Self {
        Self { flow, policy }
    }

    /// Token for the retry after `sent` drew a 401.
    ///
    /// Another request may already have rotated the session while this one
    /// was in flight; its token is reused instead of spending another grant.
    async fn retry_token(&self, sent: &str) -> Result<String, AuthError> {
        match self.flow.access_token().await {
            Ok(current) if current != sent => {
                debug!("access token already refreshed, retrying with it");
                Ok(current)
            }
            _ => Ok(self.flow.refresh().await?.access_token),
        }
    }
}

fn middleware_error(err: AuthError) -> reqwest_middleware::Error {
    reqwest_middleware::Error::Middleware(err.into())
}

fn bearer(token: &str) -> MiddlewareResult<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
        reqwest_middleware::Error::Middleware(anyhow::anyhow!(
            "access token is not a valid header value"
        ))
    })
}

#[async_trait]
impl Middleware for BearerAuth {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let token = self.flow.access_token().await.map_err(middleware_error)?;
        req.headers_mut().insert(AUTHORIZATION, bearer(&token)?);

        debug!("Injected Authorization header with bearer token");

        // Streaming bodies cannot be replayed, so such requests never retry
        let retry = match self.policy {
            RetryPolicy::RefreshOnce => req.try_clone(),
            RetryPolicy::Fail => None,
        };

        let response = next.clone().run(req, extensions).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut retry) = retry else {
            debug!(policy = ?self.policy, "401 returned to caller without retry");
            return Ok(response);
        };

        warn!("Received 401 Unauthorized, refreshing session and retrying");

        let fresh = self.retry_token(&token).await.map_err(middleware_error)?;
        retry.headers_mut().insert(AUTHORIZATION, bearer(&fresh)?);

        // Only once, a second 401 goes back to the caller
        next.run(retry, extensions).await
    }
}
