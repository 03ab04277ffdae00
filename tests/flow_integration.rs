//! End-to-end authorization flow tests
//!
//! Drives the real token client against a mocked authorization server
//! through login, refresh and logout in both trust models.

use authful_session::error::{AuthError, CallbackError};
use authful_session::flow::{AuthFlow, FailureReason, FlowPhase, FlowSettings, FlowStore, LogoutScope};
use authful_session::oidc::callback::CallbackParams;
use authful_session::oidc::{ClientAuthMethod, ClientCredentials, TokenClient};
use authful_session::session::{
    ClientSessionStore, CookieVault, ServerSessionStore, SessionStore, Slot, TrustModel,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use mockito::{Matcher, ServerGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use url::Url;

const REDIRECT: &str = "http://localhost:8080/auth/callback";

fn settings(server: &ServerGuard) -> FlowSettings {
    FlowSettings {
        authorization_endpoint: Url::parse(&format!("{}/authorize", server.url())).unwrap(),
        client_id: "spa".to_string(),
        redirect_uri: REDIRECT.to_string(),
        scope: "openid profile email".to_string(),
        end_session_endpoint: Some(Url::parse(&format!("{}/logout", server.url())).unwrap()),
        post_logout_redirect_uri: None,
    }
}

fn token_client(server: &ServerGuard, credentials: ClientCredentials) -> Arc<TokenClient> {
    Arc::new(
        TokenClient::new(
            Url::parse(&format!("{}/token", server.url())).unwrap(),
            REDIRECT,
            credentials,
        )
        .unwrap(),
    )
}

fn new_flow(
    server: &ServerGuard,
    credentials: ClientCredentials,
    store: Arc<dyn SessionStore>,
) -> AuthFlow {
    AuthFlow::new(
        settings(server),
        token_client(server, credentials),
        store,
        Arc::new(FlowStore::new(Duration::from_secs(300))),
    )
}

fn id_token(nonce: &str) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(format!(
            r#"{{"sub":"user-1","name":"Ada Lovelace","email":"ada@example.com","nonce":"{}"}}"#,
            nonce
        ))
    )
}

fn query(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}

fn callback_for(url: &Url) -> CallbackParams {
    CallbackParams {
        code: Some("abc123".to_string()),
        state: Some(query(url)["state"].clone()),
        ..Default::default()
    }
}

async fn code_mock(server: &mut ServerGuard, body: String) -> mockito::Mock {
    server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "abc123".into()),
            Matcher::UrlEncoded("redirect_uri".into(), REDIRECT.into()),
            Matcher::UrlEncoded("client_id".into(), "spa".into()),
            Matcher::Regex("code_verifier=[A-Za-z0-9_-]{43}".to_string()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .expect(1)
        .create_async()
        .await
}

#[tokio::test]
async fn test_public_client_login_refresh_logout() {
    let mut server = mockito::Server::new_async().await;
    let store = Arc::new(ClientSessionStore::in_memory());
    let flow = new_flow(&server, ClientCredentials::public("spa"), store.clone());

    let authorization_url = flow.initiate().await.unwrap();
    flow.mark_redirected().await;
    assert_eq!(flow.phase().await, FlowPhase::AwaitingCallback);

    let params = query(&authorization_url);
    assert!(authorization_url.as_str().starts_with(&format!("{}/authorize?", server.url())));
    assert_eq!(params["code_challenge_method"], "S256");
    assert_eq!(params["code_challenge"].len(), 43);

    let id = id_token(&params["nonce"]);
    let login = code_mock(
        &mut server,
        format!(
            r#"{{"access_token":"AT1","token_type":"Bearer","expires_in":3600,"refresh_token":"RT1","id_token":"{}"}}"#,
            id
        ),
    )
    .await;

    let session = assert_ok!(flow.handle_callback(callback_for(&authorization_url)).await);
    login.assert_async().await;

    assert_eq!(session.access_token, "AT1");
    assert_eq!(session.refresh_token.as_deref(), Some("RT1"));
    let claims = session.claims.unwrap();
    assert_eq!(claims.display_name(), "Ada Lovelace");
    assert_eq!(claims.email.as_deref(), Some("ada@example.com"));
    assert_eq!(flow.phase().await, FlowPhase::Established);

    let refresh = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "RT1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"AT2","token_type":"Bearer","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let refreshed = assert_ok!(flow.refresh().await);
    refresh.assert_async().await;
    assert_eq!(refreshed.access_token, "AT2");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("RT1"));
    assert_eq!(refreshed.id_token.as_deref(), Some(id.as_str()));

    let outcome = flow.logout(LogoutScope::Global).await.unwrap();
    let end_session = outcome.end_session_url.unwrap();
    let logout_params = query(&end_session);
    assert_eq!(logout_params["id_token_hint"], id);
    assert_eq!(
        logout_params["post_logout_redirect_uri"],
        "http://localhost:8080/?logged_out=true"
    );
    assert!(store.snapshot().await.unwrap().is_empty());
    assert_eq!(flow.phase().await, FlowPhase::Idle);
}

#[tokio::test]
async fn test_forged_state_never_reaches_token_endpoint() {
    let mut server = mockito::Server::new_async().await;
    let flow = new_flow(
        &server,
        ClientCredentials::public("spa"),
        Arc::new(ClientSessionStore::in_memory()),
    );

    let token = server
        .mock("POST", "/token")
        .expect(0)
        .create_async()
        .await;

    flow.initiate().await.unwrap();
    let err = flow
        .handle_callback(CallbackParams {
            code: Some("abc123".to_string()),
            state: Some("attacker-state".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert_eq!(err, AuthError::Callback(CallbackError::StateMismatch));
    token.assert_async().await;
}

#[tokio::test]
async fn test_rejected_code_leaves_store_empty() {
    let mut server = mockito::Server::new_async().await;
    let store = Arc::new(ClientSessionStore::in_memory());
    let flow = new_flow(&server, ClientCredentials::public("spa"), store.clone());

    let token = server
        .mock("POST", "/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_grant","error_description":"code already used"}"#)
        .expect(1)
        .create_async()
        .await;

    let url = flow.initiate().await.unwrap();
    let err = assert_err!(flow.handle_callback(callback_for(&url)).await);
    token.assert_async().await;

    match err {
        AuthError::Exchange(e) => {
            assert_eq!(e.status, 400);
            assert_eq!(e.code, "invalid_grant");
            assert_eq!(e.description.as_deref(), Some("code already used"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        flow.phase().await,
        FlowPhase::Failed(FailureReason::ExchangeError)
    );
    assert!(store.snapshot().await.unwrap().is_empty());

    // The attempt was consumed, replaying the callback is rejected locally
    let replay = assert_err!(flow.handle_callback(callback_for(&url)).await);
    assert_eq!(replay, AuthError::Callback(CallbackError::FlowExpired));
}

#[tokio::test]
async fn test_persisted_public_session_resumes() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");

    let store = Arc::new(ClientSessionStore::open(path.clone()).await.unwrap());
    let flow = new_flow(&server, ClientCredentials::public("spa"), store);
    let url = flow.initiate().await.unwrap();
    let _login = code_mock(
        &mut server,
        r#"{"access_token":"AT1","token_type":"Bearer","refresh_token":"RT1"}"#.to_string(),
    )
    .await;
    flow.handle_callback(callback_for(&url)).await.unwrap();
    drop(flow);

    // A new process picks the session back up
    let store = Arc::new(ClientSessionStore::open(path.clone()).await.unwrap());
    let resumed = new_flow(&server, ClientCredentials::public("spa"), store);
    assert_eq!(resumed.phase().await, FlowPhase::Idle);

    let session = resumed.restore().await.unwrap().unwrap();
    assert_eq!(session.access_token, "AT1");
    assert_eq!(resumed.phase().await, FlowPhase::Established);
    assert_eq!(resumed.access_token().await.unwrap(), "AT1");

    resumed.logout(LogoutScope::Local).await.unwrap();
    assert!(!path.exists());
}

#[tokio::test]
async fn test_confidential_client_keeps_refresh_token_in_vault() {
    let mut server = mockito::Server::new_async().await;
    let dir = tempfile::tempdir().unwrap();
    let session_path = dir.path().join("session.json");
    let cookie_path = dir.path().join("refresh_cookie.json");
    let credentials =
        ClientCredentials::confidential("spa", "s3cret", ClientAuthMethod::ClientSecretBasic);

    let vault = Arc::new(CookieVault::open(cookie_path.clone(), true).await.unwrap());
    let store = Arc::new(
        ServerSessionStore::open(session_path.clone(), vault.clone())
            .await
            .unwrap(),
    );
    let flow = new_flow(&server, credentials.clone(), store.clone());
    assert_eq!(store.trust_model(), TrustModel::Confidential);

    let url = flow.initiate().await.unwrap();
    let login = server
        .mock("POST", "/token")
        .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "authorization_code".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"AT1","token_type":"Bearer","refresh_token":"RT1"}"#)
        .expect(1)
        .create_async()
        .await;

    let session = flow.handle_callback(callback_for(&url)).await.unwrap();
    login.assert_async().await;

    assert!(session.refresh_token.is_none());
    assert_eq!(store.read(Slot::Refresh).await.unwrap_err(), AuthError::RefreshOpaque);

    let cookies = vault.take_set_cookie_headers().await;
    assert_eq!(cookies.len(), 1);
    let cookie = cookies[0].to_str().unwrap();
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Secure"));
    assert!(cookie.contains("SameSite=Lax"));

    let persisted = std::fs::read_to_string(&session_path).unwrap();
    assert!(!persisted.contains("RT1"));
    drop(flow);

    // A later process redeems the persisted cookie
    let refresh = server
        .mock("POST", "/token")
        .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "RT1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"AT2","token_type":"Bearer","refresh_token":"RT2"}"#)
        .expect(1)
        .create_async()
        .await;

    let vault = Arc::new(CookieVault::open(cookie_path.clone(), true).await.unwrap());
    let store = Arc::new(
        ServerSessionStore::open(session_path.clone(), vault.clone())
            .await
            .unwrap(),
    );
    let resumed = new_flow(&server, credentials, store.clone());
    resumed.restore().await.unwrap().unwrap();

    let refreshed = resumed.refresh().await.unwrap();
    refresh.assert_async().await;
    assert_eq!(refreshed.access_token, "AT2");
    assert!(refreshed.refresh_token.is_none());
    assert!(store.has_refresh_token().await);

    let outcome = resumed.logout(LogoutScope::Local).await.unwrap();
    assert!(outcome.clear_error.is_none());
    assert!(!cookie_path.exists());
    assert!(!session_path.exists());
}
