use super::*;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::error::{ErrorBody, ErrorCode};
use tokio::net::TcpListener;

#[derive(Default)]
struct ServerState {
    hits: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    flaky_failures_left: AtomicUsize,
    flaky_arrivals: Mutex<Vec<Instant>>,
    /// `start:<index>` / `finish:<index>` for `timed` requests, in arrival order.
    events: Mutex<Vec<String>>,
}

fn envelope(status: StatusCode, envelope: ResponseEnvelope) -> Response {
    (status, Json(envelope)).into_response()
}

async fn handle_ajax(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let action = body[ACTION_FIELD].as_str().unwrap_or_default().to_string();
    match action.as_str() {
        "echo" => envelope(StatusCode::OK, ResponseEnvelope::success(body)),
        "out_of_stock" => envelope(
            StatusCode::BAD_REQUEST,
            ResponseEnvelope::failure(
                ErrorBody::custom("out_of_stock", "Product is out of stock")
                    .with_data(json!({ "product_id": 5 })),
            ),
        ),
        "forbidden" => envelope(
            StatusCode::FORBIDDEN,
            ResponseEnvelope::failure(ErrorBody::new(
                ErrorCode::InvalidNonce,
                "Security check failed",
            )),
        ),
        "slow" => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            envelope(StatusCode::OK, ResponseEnvelope::success(json!("late")))
        }
        "flaky" => {
            state
                .flaky_arrivals
                .lock()
                .expect("arrivals")
                .push(Instant::now());
            let remaining = state.flaky_failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                state.flaky_failures_left.store(remaining - 1, Ordering::SeqCst);
                return (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
            }
            envelope(StatusCode::OK, ResponseEnvelope::success(json!("recovered")))
        }
        "plain" => (StatusCode::OK, "not an envelope").into_response(),
        "mismatched" => envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            ResponseEnvelope::success(json!("inconsistent")),
        ),
        "too_large" => envelope(
            StatusCode::PAYLOAD_TOO_LARGE,
            ResponseEnvelope::failure(ErrorBody::new(
                ErrorCode::InvalidParameters,
                "Request body is too large",
            )),
        ),
        "timed" => {
            let index = body["index"].as_u64().unwrap_or_default();
            let delay = body["delay_ms"].as_u64().unwrap_or_default();
            state.events.lock().expect("events").push(format!("start:{index}"));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            state.events.lock().expect("events").push(format!("finish:{index}"));
            envelope(StatusCode::OK, ResponseEnvelope::success(json!(index)))
        }
        "tracked" => {
            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            envelope(
                StatusCode::OK,
                ResponseEnvelope::success(body["index"].clone()),
            )
        }
        _ => envelope(
            StatusCode::NOT_FOUND,
            ResponseEnvelope::failure(ErrorBody::new(
                ErrorCode::ActionNotFound,
                "The requested action does not exist",
            )),
        ),
    }
}

async fn handle_token() -> Json<ResponseEnvelope> {
    Json(ResponseEnvelope::success(json!({
        "token": "fresh-token",
        "purpose": "ajax_router",
        "lifetime_seconds": 86_400,
    })))
}

async fn handle_actions() -> Json<ResponseEnvelope> {
    Json(ResponseEnvelope::success(json!({
        "echo": { "description": "Echo", "require_auth_token": false },
        "list_submissions": {
            "description": "List",
            "require_auth_token": true,
            "required_capability": "manage_options",
        },
    })))
}

async fn spawn_action_server() -> (String, Arc<ServerState>) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Arc::new(ServerState::default());
    let app = Router::new()
        .route("/ajax", post(handle_ajax))
        .route("/auth/token", get(handle_token))
        .route("/actions", get(handle_actions))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        multiplier: 2,
    }
}

#[test]
fn retry_delay_grows_exponentially() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(3), Duration::from_secs(4));
}

#[test]
fn retry_delay_keeps_growing_for_small_multipliers() {
    for multiplier in [0, 1] {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}

#[test]
fn client_defaults() {
    let config = ClientConfig::new("http://localhost");
    assert_eq!(config.timeout, Duration::from_secs(30));
    assert_eq!(config.cache_ttl, Duration::from_secs(300));
    assert_eq!(config.batch_concurrency, 3);
    assert_eq!(RetryPolicy::default().max_attempts, 3);
}

#[tokio::test]
async fn send_posts_action_token_and_payload_fields() {
    let (server_url, _state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(format!("{server_url}/")));
    client.set_auth_token("tok-1").await;

    let data = client
        .send("echo", json!({ "product_id": 9 }), &SendOptions::default())
        .await
        .expect("send");
    assert_eq!(
        data,
        json!({ "action": "echo", "nonce": "tok-1", "product_id": 9 })
    );

    let data = client
        .send("echo", json!([1, 2]), &SendOptions::default())
        .await
        .expect("send");
    assert_eq!(data["payload"], json!([1, 2]));
}

#[tokio::test]
async fn server_failures_pass_through_without_retry() {
    let (server_url, state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(server_url));

    let err = client
        .send(
            "out_of_stock",
            json!({}),
            &SendOptions::default().with_retry(fast_retry()),
        )
        .await
        .expect_err("business error");
    assert_eq!(
        err,
        ClientError::Server {
            code: "out_of_stock".into(),
            message: "Product is out of stock".into(),
            data: Some(json!({ "product_id": 5 })),
        }
    );
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    let err = client
        .send("forbidden", json!({}), &SendOptions::default())
        .await
        .expect_err("nonce error");
    assert_eq!(err.code(), "invalid_nonce");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn slow_responses_time_out() {
    let (server_url, _state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(server_url));

    let timeout = Duration::from_millis(50);
    let err = client
        .send("slow", json!({}), &SendOptions::default().with_timeout(timeout))
        .await
        .expect_err("timeout");
    assert_eq!(err, ClientError::Timeout(timeout));
    assert_eq!(err.code(), "timeout");
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = ActionClient::new(ClientConfig::new(format!("http://{addr}")));
    let err = client
        .send("echo", json!({}), &SendOptions::default())
        .await
        .expect_err("network error");
    assert_eq!(err.code(), "network_error");
}

#[tokio::test]
async fn responses_without_envelope_are_network_errors() {
    let (server_url, state) = spawn_action_server().await;
    state.flaky_failures_left.store(1, Ordering::SeqCst);
    let client = ActionClient::new(ClientConfig::new(server_url));

    let err = client
        .send("flaky", json!({}), &SendOptions::default())
        .await
        .expect_err("bad gateway");
    assert!(matches!(err, ClientError::Network(ref message) if message.contains("502")));

    let err = client
        .send("plain", json!({}), &SendOptions::default())
        .await
        .expect_err("plain text");
    assert_eq!(err.code(), "network_error");
}

#[tokio::test]
async fn retry_recovers_from_transient_failures() {
    let (server_url, state) = spawn_action_server().await;
    state.flaky_failures_left.store(2, Ordering::SeqCst);
    let client = ActionClient::new(ClientConfig::new(server_url));

    let data = client
        .send(
            "flaky",
            json!({}),
            &SendOptions::default().with_retry(fast_retry()),
        )
        .await
        .expect("recovered");
    assert_eq!(data, json!("recovered"));
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_gives_up_after_max_attempts() {
    let (server_url, state) = spawn_action_server().await;
    state.flaky_failures_left.store(10, Ordering::SeqCst);
    let client = ActionClient::new(ClientConfig::new(server_url));

    let err = client
        .send(
            "flaky",
            json!({}),
            &SendOptions::default().with_retry(fast_retry()),
        )
        .await
        .expect_err("exhausted");
    assert_eq!(err.code(), "network_error");
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cache_serves_repeat_successes_only() {
    let (server_url, state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(server_url));
    let cached = SendOptions::default().cached();

    let first = client
        .send("echo", json!({ "a": 1, "b": 2 }), &cached)
        .await
        .expect("first");
    let second = client
        .send("echo", json!({ "b": 2, "a": 1 }), &cached)
        .await
        .expect("second");
    assert_eq!(first, second);
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    client
        .send("echo", json!({ "a": 1, "b": 2 }), &SendOptions::default())
        .await
        .expect("uncached");
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);

    for _ in 0..2 {
        client
            .send("out_of_stock", json!({}), &cached)
            .await
            .expect_err("failure");
    }
    assert_eq!(state.hits.load(Ordering::SeqCst), 4);

    client.clear_cache();
    client
        .send("echo", json!({ "a": 1, "b": 2 }), &cached)
        .await
        .expect("after clear");
    assert_eq!(state.hits.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn batch_bounds_concurrency_and_keeps_order() {
    let (server_url, state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(server_url));

    let mut requests: Vec<BatchRequest> = (0..7)
        .map(|index| BatchRequest::new("tracked", json!({ "index": index })))
        .collect();
    requests.insert(4, BatchRequest::new("out_of_stock", Value::Null));

    let results = client.send_batch(&requests, &SendOptions::default()).await;
    assert_eq!(results.len(), 8);
    assert_eq!(results[0], Ok(json!(0)));
    assert_eq!(results[3], Ok(json!(3)));
    assert_eq!(results[4].as_ref().map_err(ClientError::code), Err("out_of_stock"));
    assert_eq!(results[7], Ok(json!(6)));

    let max_in_flight = state.max_in_flight.load(Ordering::SeqCst);
    assert!(max_in_flight <= 3, "max in flight {max_in_flight}");
    assert_eq!(state.hits.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn refreshed_token_is_sent_with_later_requests() {
    let (server_url, _state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(server_url));
    assert!(client.auth_token().await.is_none());

    let token = client.refresh_auth_token().await.expect("token");
    assert_eq!(token, "fresh-token");

    let data = client
        .send("echo", Value::Null, &SendOptions::default())
        .await
        .expect("send");
    assert_eq!(data["nonce"], json!("fresh-token"));
}

#[tokio::test]
async fn list_actions_decodes_summaries() {
    let (server_url, _state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(server_url));

    let actions = client.list_actions().await.expect("actions");
    assert_eq!(actions.len(), 2);
    assert!(!actions["echo"].require_auth_token);
    assert_eq!(
        actions["list_submissions"].required_capability.as_deref(),
        Some("manage_options")
    );
}

#[tokio::test]
async fn cached_entries_expire_after_ttl() {
    let (server_url, state) = spawn_action_server().await;
    let mut config = ClientConfig::new(server_url);
    config.cache_ttl = Duration::from_millis(100);
    let client = ActionClient::new(config);
    let cached = SendOptions::default().cached();

    client.send("echo", json!({ "q": 1 }), &cached).await.expect("first");
    client.send("echo", json!({ "q": 1 }), &cached).await.expect("hit");
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    client.send("echo", json!({ "q": 1 }), &cached).await.expect("expired");
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_waits_longer_between_each_attempt() {
    let (server_url, state) = spawn_action_server().await;
    state.flaky_failures_left.store(2, Ordering::SeqCst);
    let client = ActionClient::new(ClientConfig::new(server_url));
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(30),
        multiplier: 2,
    };

    client
        .send("flaky", json!({}), &SendOptions::default().with_retry(policy))
        .await
        .expect("recovered");

    let arrivals = state.flaky_arrivals.lock().expect("arrivals").clone();
    assert_eq!(arrivals.len(), 3);
    let first_gap = arrivals[1] - arrivals[0];
    let second_gap = arrivals[2] - arrivals[1];
    assert!(first_gap >= Duration::from_millis(30), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(60), "second gap {second_gap:?}");
    assert!(second_gap > first_gap);
}

#[tokio::test]
async fn batch_chunk_waits_for_slowest_item_of_previous_chunk() {
    let (server_url, state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(server_url));

    let requests: Vec<BatchRequest> = (0..6)
        .map(|index| {
            let delay_ms = if index == 0 { 200 } else { 10 };
            BatchRequest::new("timed", json!({ "index": index, "delay_ms": delay_ms }))
        })
        .collect();
    let results = client.send_batch(&requests, &SendOptions::default()).await;
    let values: Vec<Value> = results.into_iter().map(|r| r.expect("ok")).collect();
    assert_eq!(values, (0..6).map(|index| json!(index)).collect::<Vec<_>>());

    let events = state.events.lock().expect("events").clone();
    let position = |event: &str| {
        events
            .iter()
            .position(|recorded| recorded == event)
            .unwrap_or_else(|| panic!("{event} not recorded in {events:?}"))
    };
    let slow_finished = position("finish:0");
    for index in 3..6 {
        assert!(
            position(&format!("start:{index}")) > slow_finished,
            "item {index} started before the first chunk settled: {events:?}"
        );
    }
}

#[tokio::test]
async fn success_envelope_with_error_status_is_a_network_error() {
    let (server_url, _state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(server_url));

    let err = client
        .send("mismatched", json!({}), &SendOptions::default())
        .await
        .expect_err("error status");
    assert!(matches!(err, ClientError::Network(ref message) if message.contains("500")));
}

#[tokio::test]
async fn oversized_rejection_envelope_is_not_retried() {
    let (server_url, state) = spawn_action_server().await;
    let client = ActionClient::new(ClientConfig::new(server_url));

    let err = client
        .send(
            "too_large",
            json!({}),
            &SendOptions::default().with_retry(fast_retry()),
        )
        .await
        .expect_err("rejected");
    assert_eq!(err.code(), "invalid_parameters");
    assert!(!err.is_retryable());
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}
