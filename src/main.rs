//! Authful Session - command line entry point
//!
//! Signs in through the browser with Authorization Code + PKCE, keeps the
//! session on disk, and calls protected resources with the access token.

use anyhow::{bail, Context};
use authful_session::config::Config;
use authful_session::flow::{AuthFlow, FlowStore, LogoutScope};
use authful_session::middleware::{BearerAuth, RetryPolicy};
use authful_session::oidc::callback::run_callback_server;
use authful_session::oidc::TokenClient;
use authful_session::session::{
    ClientSessionStore, CookieVault, ServerSessionStore, Session, SessionStore, TrustModel,
};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "authful-session",
    version,
    about = "OAuth 2.0 / OIDC session client",
    long_about = "Signs in with the Authorization Code + PKCE flow, keeps the session on disk, refreshes it, and calls protected resources with the access token"
)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in through the browser
    Login {
        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },
    /// Exchange the refresh token for a new access token
    Refresh,
    /// Clear the local session
    Logout {
        /// Also end the session at the authorization server
        #[arg(long)]
        global: bool,
    },
    /// GET a protected resource with the session's access token
    Get {
        url: String,
        /// Return a 401 as-is instead of refreshing and retrying
        #[arg(long)]
        no_retry: bool,
    },
    /// Show the current session without revealing tokens
    Status,
}

fn setup_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}", config.log_level())));

    // Logs go to stderr; stdout carries command output only
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(&cli.config);

    if let Err(e) = cli.config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

struct Runtime {
    flow: AuthFlow,
    cookies: Option<Arc<CookieVault>>,
}

async fn build_runtime(config: &Config) -> anyhow::Result<Runtime> {
    let settings = config.resolve().await?;
    let dir = config.storage_dir()?;
    let prefix = config.session_file_prefix(&settings);
    let session_path = dir.join(format!("{}_session.json", prefix));

    let mut cookies = None;
    let store: Arc<dyn SessionStore> = match config.session_mode {
        TrustModel::Public => Arc::new(ClientSessionStore::open(session_path).await?),
        TrustModel::Confidential => {
            let cookie_path = dir.join(format!("{}_refresh_cookie.json", prefix));
            let vault = Arc::new(CookieVault::open(cookie_path, config.production).await?);
            cookies = Some(vault.clone());
            Arc::new(ServerSessionStore::open(session_path, vault).await?)
        }
    };

    let exchanger = Arc::new(TokenClient::new(
        settings.token_endpoint,
        settings.flow.redirect_uri.clone(),
        settings.credentials,
    )?);

    info!(
        client_id = %settings.flow.client_id,
        mode = ?config.session_mode,
        "session client initialized"
    );

    let flow = AuthFlow::new(
        settings.flow,
        exchanger,
        store,
        Arc::new(FlowStore::new(config.flow_ttl())),
    );

    Ok(Runtime { flow, cookies })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config;
    let runtime = build_runtime(&config).await?;
    let flow = &runtime.flow;

    match cli.command {
        Command::Login { no_browser } => {
            let session = login(flow, &config, no_browser).await?;
            print_session(&session, flow).await;
        }
        Command::Refresh => {
            require_session(flow).await?;
            let session = flow.refresh().await?;
            println!("Access token refreshed");
            if let Some(expires_at) = session.expires_at {
                println!("Expires: {}", expires_at.to_rfc3339());
            }
        }
        Command::Logout { global } => {
            flow.restore().await?;
            let scope = if global {
                LogoutScope::Global
            } else {
                LogoutScope::Local
            };

            let outcome = flow.logout(scope).await?;
            if let Some(e) = outcome.clear_error {
                warn!("Session partially cleared, run logout again: {}", e);
            }
            println!("Signed out locally");

            if let Some(url) = outcome.end_session_url {
                open_in_browser(&url, false, "end the provider session");
            }
        }
        Command::Get { url, no_retry } => {
            require_session(flow).await?;
            let policy = if no_retry {
                RetryPolicy::Fail
            } else {
                RetryPolicy::RefreshOnce
            };

            let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
                .with(BearerAuth::new(flow.clone(), policy))
                .build();

            let response = client.get(&url).send().await?;
            let status = response.status();
            let body = response.text().await?;

            eprintln!("HTTP {}", status);
            println!("{}", body);
            if !status.is_success() {
                bail!("request to {} failed with status {}", url, status);
            }
        }
        Command::Status => match flow.restore().await? {
            Some(session) => print_session(&session, flow).await,
            None => println!("Not signed in"),
        },
    }

    if let Some(ref vault) = runtime.cookies {
        let headers = vault.take_set_cookie_headers().await;
        if !headers.is_empty() {
            tracing::debug!(count = headers.len(), "refresh cookie updated on disk");
        }
    }

    Ok(())
}

async fn login(flow: &AuthFlow, config: &Config, no_browser: bool) -> anyhow::Result<Session> {
    let redirect_uri = Url::parse(&flow.settings().redirect_uri)
        .context("redirect URI is not a valid URL")?;
    let ttl = config.flow_ttl();

    let authorization_url = flow.initiate().await?;

    // Listen before the browser can come back
    let listener = tokio::spawn(async move { run_callback_server(&redirect_uri, ttl).await });

    open_in_browser(&authorization_url, no_browser, "sign in");
    flow.mark_redirected().await;

    let params = tokio::select! {
        result = listener => result.context("callback listener task failed")??,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, abandoning sign-in");
            bail!("sign-in cancelled");
        }
    };

    Ok(flow.handle_callback(params).await?)
}

async fn require_session(flow: &AuthFlow) -> anyhow::Result<Session> {
    match flow.restore().await? {
        Some(session) => Ok(session),
        None => bail!("not signed in, run `authful-session login` first"),
    }
}

fn open_in_browser(url: &Url, no_browser: bool, purpose: &str) {
    if !no_browser {
        info!("Opening browser to {}", purpose);
        match webbrowser::open(url.as_str()) {
            Ok(()) => return,
            Err(e) => warn!("Failed to open browser: {}", e),
        }
    }
    eprintln!("\nOpen this URL in your browser to {}:\n\n{}\n", purpose, url);
}

async fn print_session(session: &Session, flow: &AuthFlow) {
    let claims = session.claims.clone().unwrap_or_default();

    println!("Signed in as {}", claims.display_name());
    if let Some(ref subject) = claims.subject {
        println!("Subject:  {}", subject);
    }
    if let Some(ref email) = claims.email {
        println!("Email:    {}", email);
    }
    match session.expires_at {
        Some(at) if session.is_expired() => println!("Expires:  {} (expired)", at.to_rfc3339()),
        Some(at) => println!("Expires:  {}", at.to_rfc3339()),
        None => println!("Expires:  unknown"),
    }
    println!("Mode:     {:?}", flow.store().trust_model());
    println!(
        "Refresh:  {}",
        if flow.store().has_refresh_token().await {
            "available"
        } else {
            "none"
        }
    );
}
