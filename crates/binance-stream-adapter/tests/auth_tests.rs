/*
[INPUT]:  Mock listen-key endpoints
[OUTPUT]: Test results for the session token lifecycle over HTTP
[POS]:    Integration tests - session tokens
[UPDATE]: When token endpoints or lifecycle rules change
*/

mod common;

use std::sync::Arc;

use binance_stream_adapter::auth::DEFAULT_LISTEN_KEY_PATH;
use binance_stream_adapter::{BinanceError, SessionTokenManager, TokenConfig, TokenState};
use common::{TEST_API_KEY, TEST_LISTEN_KEY, setup_mock_server, signed_client};
use tokio_test::assert_ok;
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_create(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(DEFAULT_LISTEN_KEY_PATH))
        .and(header("X-MBX-APIKEY", TEST_API_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "listenKey": TEST_LISTEN_KEY,
        })))
        .mount(server)
        .await;
}

fn manager(server: &MockServer) -> SessionTokenManager {
    assert_ok!(SessionTokenManager::new(
        Arc::new(signed_client(server)),
        TokenConfig::default()
    ))
}

#[tokio::test]
async fn test_acquire_creates_valid_token() {
    let server = setup_mock_server().await;
    mount_create(&server).await;
    let tokens = manager(&server);

    let token = assert_ok!(tokens.acquire().await);
    assert_eq!(token.value, TEST_LISTEN_KEY);
    assert_eq!(token.expires_at - token.issued_at, chrono::Duration::minutes(60));
    assert_eq!(tokens.state(), Some(TokenState::Valid));
    assert_eq!(tokens.current(), Some(token));

    let requests = server.received_requests().await.unwrap();
    let query = requests[0].url.query().unwrap_or_default().to_string();
    assert!(query.contains("timestamp="));
    assert!(query.contains("signature="));
}

#[tokio::test]
async fn test_keep_alive_sends_listen_key() {
    let server = setup_mock_server().await;
    mount_create(&server).await;
    Mock::given(method("PUT"))
        .and(path(DEFAULT_LISTEN_KEY_PATH))
        .and(query_param("listenKey", TEST_LISTEN_KEY))
        .and(header_exists("X-MBX-APIKEY"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;
    let tokens = manager(&server);

    let token = assert_ok!(tokens.acquire().await);
    let refreshed = assert_ok!(tokens.keep_alive(&token).await);
    assert!(refreshed.last_keep_alive_at.is_some());
    assert!(refreshed.expires_at >= token.expires_at);
}

#[tokio::test]
async fn test_invalid_listen_key_expires_token() {
    let server = setup_mock_server().await;
    mount_create(&server).await;
    Mock::given(method("PUT"))
        .and(path(DEFAULT_LISTEN_KEY_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "code": -1125,
            "msg": "This listenKey does not exist.",
        })))
        .mount(&server)
        .await;
    let tokens = manager(&server);

    let token = assert_ok!(tokens.acquire().await);
    assert!(matches!(
        tokens.keep_alive(&token).await,
        Err(BinanceError::TokenExpired)
    ));
    assert_eq!(tokens.state(), Some(TokenState::Expired));
    assert!(tokens.current().is_none());
    assert!(matches!(
        tokens.keep_alive(&token).await,
        Err(BinanceError::TokenExpired)
    ));
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let server = setup_mock_server().await;
    mount_create(&server).await;
    Mock::given(method("DELETE"))
        .and(path(DEFAULT_LISTEN_KEY_PATH))
        .and(query_param("listenKey", TEST_LISTEN_KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;
    let tokens = manager(&server);

    let token = assert_ok!(tokens.acquire().await);
    assert_ok!(tokens.release(&token).await);
    assert_ok!(tokens.release(&token).await);
    assert_eq!(tokens.state(), Some(TokenState::Released));
    assert!(matches!(
        tokens.keep_alive(&token).await,
        Err(BinanceError::TokenReleased)
    ));
}

#[tokio::test]
async fn test_acquire_rejected_credentials() {
    let server = setup_mock_server().await;
    Mock::given(method("POST"))
        .and(path(DEFAULT_LISTEN_KEY_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "code": -2015,
            "msg": "Invalid API-key, IP, or permissions for action.",
        })))
        .mount(&server)
        .await;
    let tokens = manager(&server);

    let err = tokens.acquire().await.unwrap_err();
    assert!(err.is_auth_error());
    assert!(tokens.state().is_none());
}
