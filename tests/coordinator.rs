//! End-to-end scenarios for the auth coordinator.
//!
//! One axum server plays both roles: the authorization-server zone (under
//! `/zone`) and the protected MCP server (under `/mcp`). The test stands in
//! for the user's browser: it reads the authorization URL the coordinator
//! produced, registers the PKCE challenge with the mock zone, and invokes
//! the callback with a code. The zone's token endpoint enforces PKCE
//! (challenge must equal the S256 digest of the presented verifier) and
//! single-use codes, so a passing flow demonstrates the invariants rather
//! than assuming them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::json;
use tokio::sync::Mutex;
use url::Url;

use mcp_delegate::BoxError;
use mcp_delegate::coordinator::{
    CompletionEvent, CompletionSubscriber, ConnectOutcome, CoordinatorConfig,
    LocalAuthCoordinator, LocalConfig, MemoryStorage, RemoteAuthCoordinator, ServerEntry,
    SessionStatus, StorageBackend, keys,
};
use mcp_delegate::oauth::pkce::challenge_for;

struct Harness {
    base: String,
    register_count: AtomicUsize,
    /// Challenge the "browser" saw in the authorization URL; the token
    /// endpoint verifies the presented verifier against it.
    expected_challenge: std::sync::Mutex<Option<String>>,
    redeemed_codes: std::sync::Mutex<HashSet<String>>,
    issued_tokens: std::sync::Mutex<HashSet<String>>,
    token_counter: AtomicUsize,
}

impl Harness {
    fn zone_url(&self) -> String {
        format!("{}/zone", self.base)
    }

    fn mcp_url(&self) -> String {
        format!("{}/mcp", self.base)
    }

    fn expect_challenge(&self, challenge: &str) {
        *self.expected_challenge.lock().unwrap() = Some(challenge.to_string());
    }
}

async fn zone_discovery(State(harness): State<Arc<Harness>>) -> Json<serde_json::Value> {
    let zone = harness.zone_url();
    Json(json!({
        "issuer": zone,
        "authorization_endpoint": format!("{zone}/authorize"),
        "token_endpoint": format!("{zone}/oauth2/token"),
        "registration_endpoint": format!("{zone}/oauth2/register"),
        "jwks_uri": format!("{zone}/jwks.json"),
        "code_challenge_methods_supported": ["S256"],
        "grant_types_supported": ["authorization_code", "refresh_token"]
    }))
}

async fn zone_register(
    State(harness): State<Arc<Harness>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    harness.register_count.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::CREATED,
        Json(json!({
            "client_id": "c123",
            "client_name": body["client_name"],
            "redirect_uris": body["redirect_uris"],
            "token_endpoint_auth_method": "none"
        })),
    )
        .into_response()
}

async fn zone_token(
    State(harness): State<Arc<Harness>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if form.get("grant_type").map(String::as_str) != Some("authorization_code") {
        return oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type", None);
    }

    let code = form.get("code").cloned().unwrap_or_default();
    if code != "abc" {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", Some("unknown code"));
    }
    if !harness.redeemed_codes.lock().unwrap().insert(code) {
        // Second redemption of the same code (verifier reuse).
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            Some("code already redeemed"),
        );
    }

    let verifier = form.get("code_verifier").cloned().unwrap_or_default();
    let expected = harness.expected_challenge.lock().unwrap().clone();
    if expected.as_deref() != Some(challenge_for(&verifier).as_str()) {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            Some("PKCE verification failed"),
        );
    }

    let n = harness.token_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let token = format!("T{n}");
    harness.issued_tokens.lock().unwrap().insert(token.clone());
    Json(json!({
        "access_token": token,
        "token_type": "Bearer",
        "expires_in": 3600
    }))
    .into_response()
}

fn oauth_error(status: StatusCode, code: &str, description: Option<&str>) -> Response {
    let mut body = json!({ "error": code });
    if let Some(description) = description {
        body["error_description"] = json!(description);
    }
    (status, Json(body)).into_response()
}

async fn mcp_endpoint(State(harness): State<Arc<Harness>>, headers: HeaderMap) -> Response {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if let Some(token) = bearer
        && harness.issued_tokens.lock().unwrap().contains(token)
    {
        return (StatusCode::OK, "ok").into_response();
    }

    let hint = format!(
        "Bearer resource_metadata=\"{}/.well-known/oauth-protected-resource/mcp\"",
        harness.base
    );
    let mut response = (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    response
        .headers_mut()
        .insert("WWW-Authenticate", hint.parse().unwrap());
    response
}

async fn resource_metadata(State(harness): State<Arc<Harness>>) -> Json<serde_json::Value> {
    Json(json!({
        "resource": format!("{}/", harness.base),
        "authorization_servers": [harness.zone_url()],
        "bearer_methods_supported": ["header"]
    }))
}

async fn start_harness() -> Arc<Harness> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let harness = Arc::new(Harness {
        base,
        register_count: AtomicUsize::new(0),
        expected_challenge: std::sync::Mutex::new(None),
        redeemed_codes: std::sync::Mutex::new(HashSet::new()),
        issued_tokens: std::sync::Mutex::new(HashSet::new()),
        token_counter: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route(
            "/zone/.well-known/oauth-authorization-server",
            get(zone_discovery),
        )
        .route("/zone/oauth2/register", post(zone_register))
        .route("/zone/oauth2/token", post(zone_token))
        .route("/mcp", get(mcp_endpoint))
        .route(
            "/.well-known/oauth-protected-resource/mcp",
            get(resource_metadata),
        )
        .with_state(harness.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    harness
}

fn remote_config(harness: &Harness) -> CoordinatorConfig {
    CoordinatorConfig::new("Test MCP Client")
        .server("srv", ServerEntry::new(harness.mcp_url()))
}

struct Recorder {
    events: Mutex<Vec<CompletionEvent>>,
}

#[async_trait]
impl CompletionSubscriber for Recorder {
    async fn on_completion(&self, event: &CompletionEvent) -> Result<(), BoxError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Parse the coordinator's authorization URL and hand its PKCE challenge to
/// the mock zone, as the authorization server would see it when the user's
/// browser follows the redirect.
fn inspect_authorization_url(harness: &Harness, authorization_url: &str) -> HashMap<String, String> {
    let url = Url::parse(authorization_url).unwrap();
    assert!(authorization_url.starts_with(&format!("{}/authorize", harness.zone_url())));

    let params: HashMap<String, String> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    harness.expect_challenge(&params["code_challenge"]);
    params
}

#[tokio::test]
async fn test_full_pkce_flow_from_unauthenticated_call() {
    let harness = start_harness().await;
    let storage = Arc::new(MemoryStorage::new());
    let coordinator = RemoteAuthCoordinator::new(
        remote_config(&harness),
        "http://localhost:8080/oauth/callback",
        storage.clone(),
    )
    .unwrap();

    // First connect: 401 from the MCP server triggers discovery,
    // registration, and PKCE setup.
    let outcome = coordinator.connect("alice", "srv").await.unwrap();
    let ConnectOutcome::AuthorizationRequired(challenge) = outcome else {
        panic!("expected an authorization challenge");
    };

    let params = inspect_authorization_url(&harness, &challenge.authorization_url);
    assert_eq!(params["client_id"], "c123");
    assert_eq!(params["redirect_uri"], "http://localhost:8080/oauth/callback");
    assert_eq!(params["response_type"], "code");
    assert_eq!(params["code_challenge_method"], "S256");
    assert_eq!(params["state"], challenge.state);
    assert_eq!(params["resource"], format!("{}/", harness.base));

    assert!(
        coordinator
            .coordinator()
            .session_status("alice", "srv")
            .await
            .unwrap()
            .requires_user_action()
    );

    // The user authorizes; the zone redirects with a code.
    let mut callback = HashMap::new();
    callback.insert("code".to_string(), "abc".to_string());
    callback.insert("state".to_string(), challenge.state.clone());
    let (status, body) = coordinator.handle_completion(&callback).await;
    assert_eq!(status, 200, "completion failed: {body}");
    assert_eq!(body["status"], "complete");

    // PKCE held (the zone verified the digest), the token is stored, and
    // the session is operational.
    assert_eq!(
        coordinator
            .coordinator()
            .session_status("alice", "srv")
            .await
            .unwrap(),
        SessionStatus::Connected
    );
    assert!(
        storage
            .get(&keys::token("alice", "srv"))
            .await
            .unwrap()
            .is_some()
    );

    // The repeat call now succeeds with the stored token.
    let outcome = coordinator.connect("alice", "srv").await.unwrap();
    assert!(outcome.is_connected());
}

#[tokio::test]
async fn test_state_is_single_use() {
    let harness = start_harness().await;
    let coordinator = RemoteAuthCoordinator::new(
        remote_config(&harness),
        "http://localhost:8080/oauth/callback",
        Arc::new(MemoryStorage::new()),
    )
    .unwrap();

    let outcome = coordinator.connect("alice", "srv").await.unwrap();
    let ConnectOutcome::AuthorizationRequired(challenge) = outcome else {
        panic!("expected an authorization challenge");
    };
    inspect_authorization_url(&harness, &challenge.authorization_url);

    let mut callback = HashMap::new();
    callback.insert("code".to_string(), "abc".to_string());
    callback.insert("state".to_string(), challenge.state.clone());

    let (status, _) = coordinator.handle_completion(&callback).await;
    assert_eq!(status, 200);

    // Replay: the state was consumed on first use.
    let (status, body) = coordinator.handle_completion(&callback).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_user_denial_fails_the_session() {
    let harness = start_harness().await;
    let coordinator = RemoteAuthCoordinator::new(
        remote_config(&harness),
        "http://localhost:8080/oauth/callback",
        Arc::new(MemoryStorage::new()),
    )
    .unwrap();
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
    });
    coordinator.subscribe(recorder.clone()).await;

    let outcome = coordinator.connect("alice", "srv").await.unwrap();
    let ConnectOutcome::AuthorizationRequired(challenge) = outcome else {
        panic!("expected an authorization challenge");
    };

    let mut callback = HashMap::new();
    callback.insert("state".to_string(), challenge.state.clone());
    callback.insert("error".to_string(), "access_denied".to_string());
    let (status, body) = coordinator.handle_completion(&callback).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "access_denied");

    assert_eq!(
        coordinator
            .coordinator()
            .session_status("alice", "srv")
            .await
            .unwrap(),
        SessionStatus::AuthFailed
    );

    let events = recorder.events.lock().await;
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].reason.as_deref(), Some("access_denied"));
}

#[tokio::test]
async fn test_multi_user_isolation() {
    let harness = start_harness().await;
    let storage = Arc::new(MemoryStorage::new());
    let coordinator = RemoteAuthCoordinator::new(
        remote_config(&harness),
        "http://localhost:8080/oauth/callback",
        storage.clone(),
    )
    .unwrap();
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
    });
    coordinator.subscribe(recorder.clone()).await;

    // Both contexts start flows concurrently.
    let ConnectOutcome::AuthorizationRequired(alice) =
        coordinator.connect("alice", "srv").await.unwrap()
    else {
        panic!("expected challenge for alice");
    };
    let ConnectOutcome::AuthorizationRequired(bob) =
        coordinator.connect("bob", "srv").await.unwrap()
    else {
        panic!("expected challenge for bob");
    };

    assert_ne!(alice.state, bob.state);

    // Challenges are scoped per context: alice never sees bob's URL.
    let alice_challenges = coordinator.get_auth_challenges("alice").await.unwrap();
    assert_eq!(alice_challenges.len(), 1);
    assert_eq!(alice_challenges[0].authorization_url, alice.authorization_url);
    assert_ne!(alice_challenges[0].authorization_url, bob.authorization_url);

    // Registration was coalesced: one client per (zone, app name).
    assert_eq!(harness.register_count.load(Ordering::SeqCst), 1);

    // Complete both flows.
    for challenge in [&alice, &bob] {
        inspect_authorization_url(&harness, &challenge.authorization_url);
        harness.redeemed_codes.lock().unwrap().clear();
        let mut callback = HashMap::new();
        callback.insert("code".to_string(), "abc".to_string());
        callback.insert("state".to_string(), challenge.state.clone());
        let (status, body) = coordinator.handle_completion(&callback).await;
        assert_eq!(status, 200, "completion failed: {body}");
    }

    let alice_token = storage.get(&keys::token("alice", "srv")).await.unwrap().unwrap();
    let bob_token = storage.get(&keys::token("bob", "srv")).await.unwrap().unwrap();
    assert_ne!(alice_token, bob_token);

    // Events arrived in completion order.
    let events = recorder.events.lock().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].context_id, "alice");
    assert_eq!(events[1].context_id, "bob");
    assert!(events.iter().all(|e| e.success));
}

#[tokio::test]
async fn test_pending_ttl_expires_to_auth_failed() {
    let harness = start_harness().await;
    let storage = Arc::new(MemoryStorage::new());
    let coordinator = RemoteAuthCoordinator::new(
        remote_config(&harness).pending_ttl(Duration::from_millis(200)),
        "http://localhost:8080/oauth/callback",
        storage.clone(),
    )
    .unwrap();
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
    });
    coordinator.subscribe(recorder.clone()).await;

    let ConnectOutcome::AuthorizationRequired(challenge) =
        coordinator.connect("alice", "srv").await.unwrap()
    else {
        panic!("expected challenge");
    };

    // The user never completes; the pending record outlives its TTL.
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(
        coordinator
            .coordinator()
            .get_auth_pending("alice", "srv")
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        coordinator
            .coordinator()
            .session_status("alice", "srv")
            .await
            .unwrap(),
        SessionStatus::AuthFailed
    );

    // The reverse index is gone ...
    assert!(
        storage
            .get(&keys::state(&challenge.state))
            .await
            .unwrap()
            .is_none()
    );

    // ... so a late callback is an invalid_request.
    let mut callback = HashMap::new();
    callback.insert("code".to_string(), "abc".to_string());
    callback.insert("state".to_string(), challenge.state.clone());
    let (status, body) = coordinator.handle_completion(&callback).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "invalid_request");

    let events = recorder.events.lock().await;
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].reason.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_cancellation_cleans_up_pending_state() {
    let harness = start_harness().await;
    let storage = Arc::new(MemoryStorage::new());
    let coordinator = RemoteAuthCoordinator::new(
        remote_config(&harness),
        "http://localhost:8080/oauth/callback",
        storage.clone(),
    )
    .unwrap();

    let ConnectOutcome::AuthorizationRequired(challenge) =
        coordinator.connect("alice", "srv").await.unwrap()
    else {
        panic!("expected challenge");
    };

    coordinator
        .coordinator()
        .cancel_authorization("alice", "srv")
        .await
        .unwrap();

    assert_eq!(
        coordinator
            .coordinator()
            .session_status("alice", "srv")
            .await
            .unwrap(),
        SessionStatus::AuthFailed
    );
    assert!(
        storage
            .get(&keys::pending("alice", "srv"))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        storage
            .get(&keys::state(&challenge.state))
            .await
            .unwrap()
            .is_none()
    );

    // Cancelling again is a no-op.
    coordinator
        .coordinator()
        .cancel_authorization("alice", "srv")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_session_can_retry() {
    let harness = start_harness().await;
    let coordinator = RemoteAuthCoordinator::new(
        remote_config(&harness),
        "http://localhost:8080/oauth/callback",
        Arc::new(MemoryStorage::new()),
    )
    .unwrap();

    let ConnectOutcome::AuthorizationRequired(_) =
        coordinator.connect("alice", "srv").await.unwrap()
    else {
        panic!("expected challenge");
    };
    coordinator
        .coordinator()
        .cancel_authorization("alice", "srv")
        .await
        .unwrap();

    // AuthFailed is retriable: a new connect mints a fresh challenge.
    let outcome = coordinator.connect("alice", "srv").await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::AuthorizationRequired(_)));
}

#[tokio::test]
async fn test_local_profile_blocks_until_callback() {
    let harness = start_harness().await;
    let local = LocalAuthCoordinator::start(
        CoordinatorConfig::new("Test MCP Client")
            .server("srv", ServerEntry::new(harness.mcp_url())),
        LocalConfig {
            host: "127.0.0.1".to_string(),
            auto_open_browser: false,
            block_until_callback: true,
            ..LocalConfig::default()
        },
        Arc::new(MemoryStorage::new()),
    )
    .await
    .unwrap();

    // Stand in for the user's browser: wait for the challenge, register its
    // PKCE digest with the zone, then hit the loopback callback endpoint.
    let inner = local.coordinator().clone();
    let harness_for_user = harness.clone();
    let callback_addr = local.callback_addr();
    let user = tokio::spawn(async move {
        let challenge = loop {
            if let Some(challenge) = inner.get_auth_pending("default", "srv").await.unwrap() {
                break challenge;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        inspect_authorization_url(&harness_for_user, &challenge.authorization_url);

        let callback_url = format!(
            "http://{callback_addr}/oauth/callback?code=abc&state={}",
            challenge.state
        );
        let response = reqwest::get(&callback_url).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    });

    // Blocks until the "user" completes, then reconnects with the token.
    let outcome = local.connect("default", "srv").await.unwrap();
    assert!(outcome.is_connected());

    user.await.unwrap();
    local.shutdown().await;
}
