//! Exercises `NavuClient` against a loopback server speaking the Navusoft
//! wire format, including read timeouts and non-retryable status codes.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use navu_client::{ClientConfig, Filter, NavuClient, NavuError, RetryPolicy};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SESSION: &str = "External dGVzdA==";

#[derive(Default)]
struct TestState {
    query_calls: AtomicU32,
    last_body: Mutex<Option<Value>>,
}

async fn entities(headers: HeaderMap) -> Response {
    if headers.get("sessionId").and_then(|v| v.to_str().ok()) != Some(SESSION) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([
        {"id": "v_query_workorder", "fields": [
            {"columnName": "workordernumber"},
            {"columnName": "site_id"},
            {"columnName": "updated_at"}
        ]},
        {"id": "v_query_blank", "fields": []},
        {"id": "v_query_site", "entityId": "site", "fields": [{"columnName": "site_id"}]}
    ]))
    .into_response()
}

async fn runquery(
    State(state): State<Arc<TestState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let call = state.query_calls.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_body.lock().unwrap() = Some(body.clone());

    if headers.get("sessionId").and_then(|v| v.to_str().ok()) != Some(SESSION) {
        return (StatusCode::UNAUTHORIZED, "invalid session").into_response();
    }

    let entity = body["rootEntity"]["id"].as_str().unwrap_or_default().to_string();
    match entity.as_str() {
        "slow_twice" if call <= 2 => tokio::time::sleep(Duration::from_millis(500)).await,
        "always_slow" => tokio::time::sleep(Duration::from_millis(500)).await,
        "sites" => return (StatusCode::UNAUTHORIZED, "session expired").into_response(),
        "broken" => return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        _ => {}
    }

    let rows: Vec<Value> = (1..=3)
        .map(|i| json!({"id": i, "updated_at": format!("2024-01-1{}T00:00:00Z", i)}))
        .collect();
    Json(json!({ "resultData": rows })).into_response()
}

async fn spawn_server() -> (String, Arc<TestState>) {
    let state = Arc::new(TestState::default());
    let app = Router::new()
        .route("/rest/external/navu/entities/", get(entities))
        .route("/rest/external/navu/runquery", post(runquery))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), state)
}

fn client(base_url: &str, session: &str) -> NavuClient {
    let config = ClientConfig::new(base_url, "/rest/external/navu/runquery", session)
        .with_timeouts(Duration::from_secs(2), Duration::from_millis(150))
        .with_retry(RetryPolicy::new(3, Duration::from_millis(5)));
    NavuClient::new(config).unwrap()
}

#[tokio::test]
async fn test_fetch_returns_all_rows_and_sends_filter() {
    let (url, state) = spawn_server().await;
    let client = client(&url, SESSION);

    let filter = Filter::at_least("updated_at", "2024-01-08T00:00:00Z").unwrap();
    let columns = vec!["id".to_string(), "updated_at".to_string()];
    let rows = client.fetch("orders", &columns, Some(&filter)).await.unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["id"], 1);

    let body = state.last_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["query"]["filter"], "updated_at >= '2024-01-08T00:00:00Z'");
    assert_eq!(body["displayFields"][1]["columnName"], "updated_at");
    assert_eq!(body["displayFields"][1]["displaysequence"], 2);
    assert!(body.get("topCount").is_none());
}

#[tokio::test]
async fn test_read_timeout_twice_then_success() {
    let (url, state) = spawn_server().await;
    let client = client(&url, SESSION);

    let rows = client
        .fetch_with_retries("slow_twice", &["id".to_string()], None, 3)
        .await
        .unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(state.query_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_read_timeout_on_every_attempt_is_terminal() {
    let (url, state) = spawn_server().await;
    let client = client(&url, SESSION);

    let err = client
        .fetch_with_retries("always_slow", &["id".to_string()], None, 3)
        .await
        .unwrap_err();

    assert!(matches!(err, NavuError::ReadTimeout { attempts: 3, .. }));
    assert_eq!(state.query_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_http_401_is_not_retried() {
    let (url, state) = spawn_server().await;
    let client = client(&url, SESSION);

    let err = client
        .fetch("sites", &["site_id".to_string()], None)
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(401));
    assert_eq!(state.query_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_http_500_is_not_retried() {
    let (url, state) = spawn_server().await;
    let client = client(&url, SESSION);

    let err = client.fetch("broken", &["id".to_string()], None).await.unwrap_err();

    assert!(matches!(err, NavuError::Api { status: 500, .. }));
    assert_eq!(state.query_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resolve_columns_from_catalog() {
    let (url, _) = spawn_server().await;
    let client = client(&url, SESSION);

    let cols = client.resolve_columns("v_query_workorder").await.unwrap();
    assert_eq!(cols, vec!["workordernumber", "site_id", "updated_at"]);

    let by_entity_id = client.resolve_columns("site").await.unwrap();
    assert_eq!(by_entity_id, vec!["site_id"]);

    assert!(matches!(
        client.resolve_columns("v_query_missing").await,
        Err(NavuError::EntityNotFound { .. })
    ));
    assert!(matches!(
        client.resolve_columns("v_query_blank").await,
        Err(NavuError::NoColumnsDefined { .. })
    ));
}

#[tokio::test]
async fn test_entity_ids() {
    let (url, _) = spawn_server().await;
    let ids = client(&url, SESSION).entity_ids().await.unwrap();
    assert_eq!(ids, vec!["v_query_workorder", "v_query_blank", "v_query_site"]);
}

#[tokio::test]
async fn test_bad_session_surfaces_status() {
    let (url, _) = spawn_server().await;
    let err = client(&url, "External wrong").entities().await.unwrap_err();
    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn test_probe_sets_top_count() {
    let (url, state) = spawn_server().await;
    client(&url, SESSION)
        .probe("v_query_workorder", &["workordernumber".to_string()])
        .await
        .unwrap();

    let body = state.last_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["topCount"], 1);
}
