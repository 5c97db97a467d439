//! End-to-end token lifecycle tests against a mock Google token endpoint.

use std::sync::Arc;

use chrono::Utc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use okaimy_connect::config::{AppConfig, TokenRefreshConfig};
use okaimy_connect::google::scope_string;
use okaimy_connect::models::token_record::TokenRecord;
use okaimy_connect::store::{MemoryTokenStore, TokenStore, token_key};
use okaimy_connect::{OAuthTokenManager, TokenError};

fn test_config(server_uri: &str) -> Arc<AppConfig> {
    Arc::new(AppConfig {
        google_client_id: Some("client-id".to_string()),
        google_client_secret: Some("client-secret".to_string()),
        google_token_url: format!("{server_uri}/token"),
        google_userinfo_url: format!("{server_uri}/userinfo"),
        token_refresh: TokenRefreshConfig {
            http_timeout_seconds: 5,
            max_retries: 1,
            retry_base_ms: 1,
        },
        ..Default::default()
    })
}

fn record(user_id: &str, access_token: &str, refresh_token: Option<&str>, expires_at_ms: i64) -> TokenRecord {
    TokenRecord {
        user_id: user_id.to_string(),
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        expires_at_ms,
        scope: scope_string(),
        connected_at: Utc::now(),
        provider_email: Some("user@example.com".to_string()),
    }
}

async fn seed(store: &MemoryTokenStore, record: &TokenRecord) {
    store
        .hash_set(&token_key(&record.user_id), record.to_hash())
        .await
        .unwrap();
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn token_response(access_token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "access_token": access_token,
        "expires_in": 3600,
        "token_type": "Bearer"
    }))
}

#[tokio::test]
async fn fresh_token_is_served_without_touching_the_provider() {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryTokenStore::new());
    seed(&store, &record("u1", "at-fresh", Some("rt-1"), now_ms() + 3_600_000)).await;

    let manager = OAuthTokenManager::new(test_config(&server.uri()), store);
    let token = manager.get_access_token("u1").await.unwrap();

    assert_eq!(token, "at-fresh");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_token_is_refreshed_once_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(token_response("at-new"))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    seed(&store, &record("u1", "at-old", Some("rt-1"), now_ms() - 1_000)).await;

    let manager = OAuthTokenManager::new(test_config(&server.uri()), store.clone());
    assert_eq!(manager.get_access_token("u1").await.unwrap(), "at-new");

    // The refreshed token was persisted: the second call is served from the
    // store without another provider request.
    assert_eq!(manager.get_access_token("u1").await.unwrap(), "at-new");

    let stored = store.hash_get_all(&token_key("u1")).await.unwrap();
    assert_eq!(stored.get("access_token").map(String::as_str), Some("at-new"));
}

#[tokio::test]
async fn token_inside_skew_window_is_refreshed_early() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("at-new"))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    // Still 30 seconds of nominal validity left, inside the 60s skew.
    seed(&store, &record("u1", "at-old", Some("rt-1"), now_ms() + 30_000)).await;

    let manager = OAuthTokenManager::new(test_config(&server.uri()), store);
    assert_eq!(manager.get_access_token("u1").await.unwrap(), "at-new");
}

#[tokio::test]
async fn refresh_keeps_stored_refresh_token_unless_provider_rotates_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("at-new"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    seed(&store, &record("u1", "at-old", Some("rt-original"), now_ms() - 1_000)).await;

    let manager = OAuthTokenManager::new(test_config(&server.uri()), store.clone());
    manager.get_access_token("u1").await.unwrap();

    let stored = store.hash_get_all(&token_key("u1")).await.unwrap();
    assert_eq!(
        stored.get("refresh_token").map(String::as_str),
        Some("rt-original")
    );
}

#[tokio::test]
async fn refresh_adopts_rotated_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "at-new",
            "refresh_token": "rt-rotated",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    seed(&store, &record("u1", "at-old", Some("rt-original"), now_ms() - 1_000)).await;

    let manager = OAuthTokenManager::new(test_config(&server.uri()), store.clone());
    manager.get_access_token("u1").await.unwrap();

    let stored = store.hash_get_all(&token_key("u1")).await.unwrap();
    assert_eq!(
        stored.get("refresh_token").map(String::as_str),
        Some("rt-rotated")
    );
}

#[tokio::test]
async fn rejected_refresh_leaves_the_stored_record_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(serde_json::json!({"error": "invalid_grant"})),
        )
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    seed(&store, &record("u1", "at-old", Some("rt-revoked"), now_ms() - 1_000)).await;
    let before = store.hash_get_all(&token_key("u1")).await.unwrap();

    let manager = OAuthTokenManager::new(test_config(&server.uri()), store.clone());
    let err = manager.get_access_token("u1").await.unwrap_err();
    match err {
        TokenError::RefreshFailed { reason } => assert!(reason.contains("invalid_grant")),
        other => panic!("expected RefreshFailed, got {other:?}"),
    }

    let after = store.hash_get_all(&token_key("u1")).await.unwrap();
    assert_eq!(before, after);

    // The quirk: the user still reports connected after a dead refresh.
    let status = manager.get_connection_status("u1").await.unwrap();
    assert!(status.connected);
}

#[tokio::test]
async fn concurrent_callers_share_a_single_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("at-new").set_delay(std::time::Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    seed(&store, &record("u1", "at-old", Some("rt-1"), now_ms() - 1_000)).await;

    let manager = Arc::new(OAuthTokenManager::new(test_config(&server.uri()), store));

    let a = tokio::spawn({
        let manager = manager.clone();
        async move { manager.get_access_token("u1").await }
    });
    let b = tokio::spawn({
        let manager = manager.clone();
        async move { manager.get_access_token("u1").await }
    });

    assert_eq!(a.await.unwrap().unwrap(), "at-new");
    assert_eq!(b.await.unwrap().unwrap(), "at-new");
    // expect(1) on the mock verifies only one provider call happened.
}

#[tokio::test]
async fn forced_refresh_ignores_remaining_validity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("at-new"))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    seed(&store, &record("u1", "at-fresh", Some("rt-1"), now_ms() + 3_600_000)).await;

    let manager = OAuthTokenManager::new(test_config(&server.uri()), store);
    let updated = manager.refresh_access_token("u1").await.unwrap();
    assert_eq!(updated.access_token, "at-new");
}

#[tokio::test]
async fn completed_authorization_enables_token_access_until_disconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_in": 3600,
            "scope": "https://www.googleapis.com/auth/gmail.readonly https://www.googleapis.com/auth/calendar.events"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "email": "user@example.com"
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    let manager = OAuthTokenManager::new(test_config(&server.uri()), store);

    let status = manager.complete_authorization("u1", "auth-code").await.unwrap();
    assert!(status.connected);
    assert_eq!(status.provider_email.as_deref(), Some("user@example.com"));
    assert!(status.has_gmail);
    assert!(status.has_calendar);

    assert_eq!(manager.get_access_token("u1").await.unwrap(), "at-1");

    manager.disconnect("u1").await.unwrap();
    assert!(!manager.get_connection_status("u1").await.unwrap().connected);
    assert!(matches!(
        manager.get_access_token("u1").await,
        Err(TokenError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn authorization_url_state_round_trips_the_user_id() {
    let manager = OAuthTokenManager::new(
        test_config("http://localhost:0"),
        Arc::new(MemoryTokenStore::new()),
    );

    let url = manager.build_authorization_url("user with spaces").unwrap();
    let parsed = url::Url::parse(&url).unwrap();
    let state = parsed
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    assert_eq!(state, "user with spaces");
}
