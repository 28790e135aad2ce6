//! Integration test: run a throwaway ask endpoint with axum and drive the
//! request/response channel through a `ChatSession`.

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use lib::adapter::{DisplayEvent, Speaker};
use lib::config::{Config, RequestMode};
use lib::session::{ChatSession, Route};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn ask_query(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let get = |k: &str| params.get(k).cloned().unwrap_or_default();
    Json(json!({
        "result": format!("{} | {} | {}", get("query"), get("model_id"), get("user_id"))
    }))
}

async fn ask_json(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({
        "result": { "content": format!("echo {}", body["query"].as_str().unwrap_or("")) }
    }))
}

fn backend() -> Router {
    Router::new()
        .route("/v1/user_proxy/ask", post(ask_query))
        .route("/json/ask", post(ask_json))
        .route("/raw/ask", post(|| async { "not json at all" }))
        .route(
            "/status-error/ask",
            post(|| async { Json(json!({ "status": "error", "message": "bad request" })) }),
        )
        .route("/ping/ask", post(|| async { Json(json!({ "type": "ping" })) }))
        .route(
            "/broken/ask",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
}

fn config_for(url: String, mode: RequestMode) -> Config {
    let mut config = Config::default();
    config.identity.user_id = "tester".to_string();
    config.identity.model_id = "test-model".to_string();
    config.endpoint.url = url;
    config.endpoint.request_mode = mode;
    config.endpoint.timeout_secs = 5;
    config
}

async fn reply_for(config: &Config, query: &str) -> (Option<DisplayEvent>, usize) {
    let session = ChatSession::new(config).expect("session");
    let id = session.submit(query, Route::Http).await;
    let snap = session.transcript().snapshot().await;
    assert!(snap.iter().all(|e| !e.transient), "placeholder left behind");
    assert_eq!(snap[0].event, DisplayEvent::user("User", query));
    let reply = id.and_then(|id| snap.iter().find(|e| e.id == id).map(|e| e.event.clone()));
    (reply, snap.len())
}

#[tokio::test]
async fn query_mode_sends_parameters_and_shows_result() {
    let addr = serve(backend()).await;
    let config = config_for(format!("http://{}/v1/user_proxy/ask", addr), RequestMode::Query);
    let (reply, len) = reply_for(&config, "hello there").await;
    assert_eq!(len, 2);
    assert_eq!(
        reply,
        Some(DisplayEvent::responder("Assistant", "hello there | test-model | tester"))
    );
}

#[tokio::test]
async fn json_mode_uses_nested_result_content() {
    let addr = serve(backend()).await;
    let config = config_for(format!("http://{}/json/ask", addr), RequestMode::Json);
    let (reply, _) = reply_for(&config, "hi").await;
    assert_eq!(reply, Some(DisplayEvent::responder("Assistant", "echo hi")));
}

#[tokio::test]
async fn raw_text_body_is_shown_unchanged() {
    let addr = serve(backend()).await;
    let config = config_for(format!("http://{}/raw/ask", addr), RequestMode::Query);
    let (reply, _) = reply_for(&config, "q").await;
    assert_eq!(reply, Some(DisplayEvent::responder("Assistant", "not json at all")));
}

#[tokio::test]
async fn upstream_error_status_is_a_system_error() {
    let addr = serve(backend()).await;
    let config = config_for(format!("http://{}/status-error/ask", addr), RequestMode::Query);
    let (reply, _) = reply_for(&config, "q").await;
    assert_eq!(reply, Some(DisplayEvent::error("Error: bad request")));
}

#[tokio::test]
async fn heartbeat_reply_leaves_only_the_user_line() {
    let addr = serve(backend()).await;
    let config = config_for(format!("http://{}/ping/ask", addr), RequestMode::Query);
    let (reply, len) = reply_for(&config, "q").await;
    assert_eq!(reply, None);
    assert_eq!(len, 1);
}

#[tokio::test]
async fn server_failure_is_one_system_error_line() {
    let addr = serve(backend()).await;
    let config = config_for(format!("http://{}/broken/ask", addr), RequestMode::Query);
    let (reply, len) = reply_for(&config, "q").await;
    assert_eq!(len, 2);
    let reply = reply.expect("error line");
    assert_eq!(reply.speaker, Speaker::Error);
    assert!(reply.text.contains("500"), "{}", reply.text);
}

#[tokio::test]
async fn unreachable_endpoint_is_one_system_error_line() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
        listener.local_addr().expect("local_addr").port()
    };
    let config = config_for(format!("http://127.0.0.1:{}/ask", port), RequestMode::Query);
    let (reply, len) = reply_for(&config, "q").await;
    assert_eq!(len, 2);
    let reply = reply.expect("error line");
    assert_eq!(reply.speaker, Speaker::Error);
    assert!(reply.text.starts_with("Could not reach the language model service"));
}
