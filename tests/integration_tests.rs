//! End-to-end tests against a mock HTTP server.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use moorage::{
    ApiClient, BackoffPolicy, ErrorCode, MemoryStorage, RequestOptions, SharedConnectivity,
    Storage, AUTH_TOKEN_KEY,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Unsigned three-part token with the given expiry claim.
fn make_token(exp: u64) -> String {
    let head = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp},"sub":"user-1"}}"#).as_bytes());
    format!("{head}.{payload}.sig")
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn client_for(server: &MockServer) -> ApiClient {
    init_tracing();
    ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .backoff(fast_backoff())
        .build()
        .unwrap()
}

#[tokio::test]
async fn get_unwraps_data_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"id": 7, "name": "Ada"},
            "message": "ok"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let resp = client.get("/user/profile", RequestOptions::new()).await.unwrap();

    assert!(resp.success);
    assert_eq!(resp.data, Some(json!({"id": 7, "name": "Ada"})));
    assert_eq!(resp.message.as_deref(), Some("ok"));
}

#[tokio::test]
async fn bare_payload_becomes_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wallet/0xabc/balance"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"balance": "1.5"})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let resp = client
        .get("/wallet/0xabc/balance", RequestOptions::new())
        .await
        .unwrap();

    assert_eq!(resp.data, Some(json!({"balance": "1.5"})));
    assert_eq!(resp.message, None);
}

#[tokio::test]
async fn empty_body_is_a_bare_success() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/contacts/3"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let resp = client.delete("/contacts/3", RequestOptions::new()).await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.data, None);
}

#[tokio::test]
async fn not_found_maps_to_error_code() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transactions/999"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client
        .get("/transactions/999", RequestOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::NotFound);
    assert_eq!(err.status, 404);
}

#[tokio::test]
async fn server_errors_retry_exactly_three_times() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client.get("/flaky", RequestOptions::new()).await.unwrap_err();

    assert_eq!(err.code, ErrorCode::ServerError);
    assert_eq!(err.status, 500);
}

#[tokio::test]
async fn recovers_when_a_retry_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"ok": true}})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let resp = client.get("/flaky", RequestOptions::new()).await.unwrap();
    assert_eq!(resp.data, Some(json!({"ok": true})));
}

#[tokio::test]
async fn rate_limit_hint_is_honored_then_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let resp = client.get("/limited", RequestOptions::new()).await.unwrap();
    assert_eq!(resp.data, Some(json!([])));
}

#[tokio::test]
async fn validation_errors_are_terminal_and_carry_details() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transactions"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "code": "VALIDATION_ERROR",
            "message": "amount is required",
            "details": {"amount": "required"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client
        .post("/transactions", &json!({"to": "0xabc"}), RequestOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::ValidationError);
    assert_eq!(err.message, "amount is required");
    assert_eq!(err.details, Some(json!({"amount": "required"})));
}

#[tokio::test]
async fn repeated_gets_are_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/settings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"theme": "dark"}})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let first = client.get("/settings", RequestOptions::new()).await.unwrap();
    let second = client.get("/settings", RequestOptions::new()).await.unwrap();

    assert_eq!(first, second);
    let stats = client.cache_stats();
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn cache_busting_params_collapse_to_one_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transactions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [1, 2]})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client
        .get("/transactions", RequestOptions::new().param("_t", "111"))
        .await
        .unwrap();
    client
        .get("/transactions", RequestOptions::new().param("_t", "222"))
        .await
        .unwrap();
}

#[tokio::test]
async fn mutation_invalidates_related_cache_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transactions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [1]})))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/transactions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": 2}})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client.get("/transactions", RequestOptions::new()).await.unwrap();
    client
        .post("/transactions", &json!({"amount": 5}), RequestOptions::new())
        .await
        .unwrap();
    // The cached listing was evicted by the mutation, so this hits the wire.
    client.get("/transactions", RequestOptions::new()).await.unwrap();
}

#[tokio::test]
async fn offline_mutations_queue_then_replay_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .mount(&server)
        .await;

    let connectivity = Arc::new(SharedConnectivity::new(false));
    let client = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .backoff(fast_backoff())
        .connectivity(connectivity.clone())
        .build()
        .unwrap();

    let ack_a = client
        .post("/transactions", &json!({"n": 1}), RequestOptions::new())
        .await
        .unwrap();
    let ack_b = client
        .post("/contacts", &json!({"n": 2}), RequestOptions::new())
        .await
        .unwrap();

    assert!(!ack_a.success);
    assert!(ack_a.queue_id().is_some());
    assert_ne!(ack_a.queue_id(), ack_b.queue_id());
    assert_eq!(client.queue_status().length, 2);
    assert!(server.received_requests().await.unwrap().is_empty());

    connectivity.set_online(true);
    let report = client.process_offline_queue().await;
    assert_eq!(report.replayed, 2);
    assert_eq!(report.remaining, 0);
    assert_eq!(client.queue_status().length, 0);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].url.path(), "/transactions");
    assert_eq!(requests[1].url.path(), "/contacts");
}

#[tokio::test]
async fn offline_gets_still_fail() {
    // Only mutations queue; a GET with no reachable server surfaces a
    // network error.
    let connectivity = Arc::new(SharedConnectivity::new(false));
    let client = ApiClient::builder()
        .base_url("http://127.0.0.1:9")
        .unwrap()
        .backoff(BackoffPolicy {
            max_attempts: 1,
            ..fast_backoff()
        })
        .connectivity(connectivity)
        .build()
        .unwrap();

    let err = client.get("/wallet", RequestOptions::new()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NetworkError);
    assert_eq!(err.status, 0);
}

#[tokio::test]
async fn near_expiry_token_is_refreshed_before_the_call() {
    let server = MockServer::start().await;
    let fresh = make_token(unix_now() + 3600);
    Mock::given(method("GET"))
        .and(path("/user/profile"))
        .and(header("authorization", format!("Bearer {fresh}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    storage
        .set(AUTH_TOKEN_KEY, &make_token(unix_now() + 120))
        .unwrap();

    let fresh_for_cb = fresh.clone();
    let client = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .storage(storage.clone())
        .on_token_expired(move || {
            let fresh = fresh_for_cb.clone();
            async move { Ok(fresh) }
        })
        .build()
        .unwrap();

    client.get("/user/profile", RequestOptions::new()).await.unwrap();
    assert_eq!(storage.get(AUTH_TOKEN_KEY), Some(fresh));
}

#[tokio::test]
async fn malformed_token_is_dropped_and_call_goes_unauthenticated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wallet"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    storage.set(AUTH_TOKEN_KEY, "garbage").unwrap();

    let client = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .storage(storage.clone())
        .build()
        .unwrap();

    client.get("/wallet", RequestOptions::new()).await.unwrap();
    assert_eq!(storage.get(AUTH_TOKEN_KEY), None);

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn terminal_401_clears_token_and_fires_handler() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/profile"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let fired = Arc::new(AtomicBool::new(false));
    let fired_in_handler = fired.clone();
    let client = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .storage(storage.clone())
        .on_unauthorized(move || {
            fired_in_handler.store(true, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    client
        .store_auth_token(&make_token(unix_now() + 3600))
        .unwrap();

    let err = client.get("/user/profile", RequestOptions::new()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(storage.get(AUTH_TOKEN_KEY), None);
}

#[tokio::test]
async fn skip_auth_omits_the_bearer_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client
        .store_auth_token(&make_token(unix_now() + 3600))
        .unwrap();
    client
        .get("/config", RequestOptions::new().skip_auth())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn slow_responses_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let err = client
        .get(
            "/slow",
            RequestOptions::new()
                .timeout(Duration::from_millis(50))
                .no_retry(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::Timeout);
    assert_eq!(err.status, 408);
}

#[tokio::test]
async fn queued_replay_keeps_params_and_headers() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transactions"))
        .and(query_param("idempotency_key", "k-123"))
        .and(header("x-device", "pixel-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .expect(1)
        .mount(&server)
        .await;

    let connectivity = Arc::new(SharedConnectivity::new(false));
    let client = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .backoff(fast_backoff())
        .connectivity(connectivity.clone())
        .build()
        .unwrap();

    client
        .post(
            "/transactions",
            &json!({"amount": 5}),
            RequestOptions::new()
                .param("idempotency_key", "k-123")
                .header("x-device", "pixel-9")
                .unwrap(),
        )
        .await
        .unwrap();

    connectivity.set_online(true);
    let report = client.process_offline_queue().await;
    assert_eq!(report.replayed, 1);
    assert_eq!(report.dropped, 0);
}

#[tokio::test]
async fn replay_does_not_nest_engine_retries() {
    init_tracing();
    let server = MockServer::start().await;
    // Exactly the queue's own budget of wire attempts, no engine multiplier.
    Mock::given(method("POST"))
        .and(path("/transactions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let connectivity = Arc::new(SharedConnectivity::new(false));
    let client = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .backoff(fast_backoff())
        .connectivity(connectivity.clone())
        .build()
        .unwrap();

    client
        .post("/transactions", &json!({"n": 1}), RequestOptions::new())
        .await
        .unwrap();

    connectivity.set_online(true);
    let report = client.process_offline_queue().await;
    assert_eq!(report.dropped, 1);
    assert_eq!(report.replayed, 0);
}

#[tokio::test]
async fn full_queue_surfaces_a_stable_local_error() {
    init_tracing();
    let connectivity = Arc::new(SharedConnectivity::new(false));
    let client = ApiClient::builder()
        .base_url("http://127.0.0.1:9")
        .unwrap()
        .connectivity(connectivity)
        .build()
        .unwrap();

    for i in 0..moorage::MAX_QUEUE_SIZE {
        client
            .post(&format!("/transactions/{i}"), &json!({}), RequestOptions::new())
            .await
            .unwrap();
    }
    let err = client
        .post("/transactions/overflow", &json!({}), RequestOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::UnknownError);
    assert_eq!(err.status, 0);
    assert!(err.message.contains("offline queue is full"), "{}", err.message);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn cancel_all_aborts_in_flight_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/slow", RequestOptions::new().no_retry()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.cancel_all_requests();

    let err = in_flight.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Timeout);
    assert_eq!(err.status, 408);
}

#[tokio::test]
async fn cancellation_is_immediate_with_retries_enabled() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let client = ApiClient::builder()
        .base_url(server.uri())
        .unwrap()
        .backoff(BackoffPolicy {
            initial_delay: Duration::from_millis(300),
            jitter: false,
            ..Default::default()
        })
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let in_flight = {
        let client = client.clone();
        // Retries left at their default; cancellation must still cut through
        // any backoff sleep.
        tokio::spawn(async move { client.get("/slow", RequestOptions::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.cancel_all_requests();

    let err = in_flight.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Timeout);
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "cancellation took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn query_params_reach_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transactions"))
        .and(query_param("page", "2"))
        .and(query_param("limit", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client
        .get(
            "/transactions?page=2",
            RequestOptions::new().param("limit", "10"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn request_log_captures_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wallet"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    client.get("/wallet", RequestOptions::new()).await.unwrap();

    let logs = client.api_logs();
    assert!(logs.iter().any(|e| e.endpoint == "/wallet" && e.status == Some(200)));

    let exported = client.export_logs().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&exported).unwrap();
    assert!(!parsed.as_array().unwrap().is_empty());
}
