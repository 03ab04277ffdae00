//! OAuth callback input and loopback listener
//!
//! [`CallbackParams`] is the raw query the authorization server appends to
//! the redirect URI. It is deliberately unvalidated here: the flow
//! orchestrator decides what a missing code or a foreign state means.
//!
//! [`run_callback_server`] is a one-shot localhost listener used by the CLI
//! to receive that query.

use crate::error::{AuthError, CallbackError, Result};
use axum::{
    extract::Query,
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Read the callback parameters out of a full redirect URL
    pub fn from_url(url: &Url) -> Self {
        let mut params = CallbackParams::default();
        for (key, value) in url.query_pairs() {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                _ => {}
            }
        }
        params
    }
}

type CallbackSender = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

/// Router answering a single GET on `path` and forwarding its query to `tx`
pub fn callback_router(path: &str, tx: oneshot::Sender<CallbackParams>) -> Router {
    let tx: CallbackSender = Arc::new(Mutex::new(Some(tx)));

    Router::new().route(
        path,
        get(move |Query(params): Query<CallbackParams>| {
            let tx = tx.clone();
            async move { handle_callback(params, tx).await }
        }),
    )
}

/// Listen on the redirect URI's port and wait for one callback
pub async fn run_callback_server(redirect_uri: &Url, timeout: Duration) -> Result<CallbackParams> {
    let port = redirect_uri.port_or_known_default().unwrap_or(8080);
    let path = redirect_uri.path().to_string();
    let (tx, rx) = oneshot::channel::<CallbackParams>();

    let app = callback_router(&path, tx);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AuthError::Config(format!("cannot listen on {}: {}", addr, e)))?;

    tracing::info!("OAuth callback server listening on http://{}{}", addr, path);

    let server = axum::serve(listener, app);

    tokio::select! {
        result = rx => {
            result.map_err(|_| AuthError::Transport("callback channel closed".to_string()))
        }
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "OAuth callback timed out");
            Err(CallbackError::FlowExpired.into())
        }
        server_result = server => {
            server_result.map_err(|e| AuthError::Transport(format!("callback server failed: {}", e)))?;
            Err(AuthError::Transport("callback server stopped unexpectedly".to_string()))
        }
    }
}

async fn handle_callback(params: CallbackParams, tx: CallbackSender) -> impl IntoResponse {
    let page = match (&params.error, &params.code, &params.state) {
        (Some(error), _, _) => failure_page(&format!(
            "{} - {}",
            error,
            params
                .error_description
                .as_deref()
                .unwrap_or("No description provided")
        )),
        (None, Some(_), Some(_)) => Html(
            r#"
            <html>
                <head><title>Authorization Received</title></head>
                <body>
                    <h1>Authorization Received</h1>
                    <p>You can close this window and return to your terminal.</p>
                </body>
            </html>
            "#
            .to_string(),
        ),
        _ => failure_page("Missing code or state parameter in callback"),
    };

    if let Some(sender) = tx.lock().await.take() {
        let _ = sender.send(params);
    }

    page
}

fn failure_page(message: &str) -> Html<String> {
    Html(format!(
        r#"
        <html>
            <head><title>Authentication Failed</title></head>
            <body>
                <h1>Authentication Failed</h1>
                <p>{}</p>
                <p>You can close this window.</p>
            </body>
        </html>
        "#,
        escape_html(message)
    ))
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
