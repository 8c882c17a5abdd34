mod common;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use session_runtime::coordinator::ChatRequest;

use common::{test_config, TestRuntime};

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, headers, body)
}

async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let (status, headers, bytes) = send(app, builder.body(body).expect("request")).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, headers, value)
}

fn chat_request(session_id: &str, user_id: &str, message: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(format!("/v1/sessions/{session_id}/chat"))
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", user_id)
        .body(Body::from(json!({ "message": message }).to_string()))
        .expect("request")
}

#[tokio::test]
async fn health_and_openapi() {
    let runtime = TestRuntime::new(test_config());
    let app = runtime.router();

    let (status, _, body) = send_json(&app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));

    let (status, _, body) = send_json(&app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/v1/sessions/{session_id}/chat"].is_object());

    let (status, _, _) = send(
        &app,
        Request::builder()
            .uri("/nowhere")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_then_read_memory() {
    let runtime = TestRuntime::new(test_config());
    let app = runtime.router();

    let (status, headers, body) =
        send_json(&app, Method::GET, "/v1/sessions/s1/memory", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("application/problem+json")
    );
    assert_eq!(body["sessionId"], "s1");

    let (status, _, bytes) = send(&app, chat_request("s1", "alice", "hello")).await;
    assert_eq!(status, StatusCode::OK);
    let outcome: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(outcome["response"], "echo: hello");
    assert_eq!(outcome["agent_id"], "default");

    let (status, _, memory) = send_json(&app, Method::GET, "/v1/sessions/s1/memory", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(memory["summarized_rounds"], 0);
    assert_eq!(memory["recent_rounds"][0]["user_content"], "hello");
    assert_eq!(memory["recent_rounds"][0]["assistant_content"], "echo: hello");

    let (status, _, stats) = send_json(&app, Method::GET, "/v1/pool/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["totalInstances"], 1);
    assert_eq!(stats["sessions"], 1);
    assert_eq!(stats["maxIdleTime"], "30m");

    let (status, _, _) = send_json(&app, Method::DELETE, "/v1/sessions/s1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = send_json(&app, Method::GET, "/v1/sessions/s1/memory", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(runtime.coordinator.pool().count(), 0);
}

#[tokio::test]
async fn agent_catalog_crud() {
    let runtime = TestRuntime::new(test_config());
    let app = runtime.router();
    let writer = json!({
        "id": "writer",
        "name": "Writer",
        "systemPrompt": "Write tersely.",
        "allowedTools": ["search"]
    });

    let (status, _, created) =
        send_json(&app, Method::POST, "/v1/agents", Some(writer.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created, writer);

    let (status, _, problem) = send_json(&app, Method::POST, "/v1/agents", Some(writer)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["type"], "urn:session-runtime:error:already_exists");

    let (status, _, list) = send_json(&app, Method::GET, "/v1/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["agents"].as_array().map(Vec::len), Some(1));

    let (status, _, fetched) = send_json(&app, Method::GET, "/v1/agents/writer", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["systemPrompt"], "Write tersely.");

    let chat = Request::builder()
        .method(Method::POST)
        .uri("/v1/sessions/s1/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "message": "hi", "agent_id": "writer" }).to_string(),
        ))
        .expect("request");
    let (status, _, bytes) = send(&app, chat).await;
    assert_eq!(status, StatusCode::OK);
    let outcome: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(outcome["agent_id"], "writer");

    let (status, _, _) = send_json(&app, Method::DELETE, "/v1/agents/writer", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, problem) = send_json(&app, Method::GET, "/v1/agents/writer", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["agentId"], "writer");
}

#[tokio::test]
async fn rate_limited_chat_is_problem_json() {
    let mut config = test_config();
    config.rate_limit.enabled = true;
    config.rate_limit.user_burst = 1;
    config.rate_limit.user_requests_per_second = 0.001;
    let runtime = TestRuntime::new(config);
    let app = runtime.router();

    let (status, _, _) = send(&app, chat_request("s1", "bob", "one")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, bytes) = send(&app, chat_request("s1", "bob", "two")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        Some("application/problem+json")
    );
    let problem: Value = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(problem["status"], 429);
    assert_eq!(problem["type"], "urn:session-runtime:error:rate_limited");

    let (status, _, _) = send(&app, chat_request("s1", "carol", "three")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn events_stream_session_output() {
    let runtime = TestRuntime::new(test_config());
    let app = runtime.router();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/sessions/live/events?client_id=tab-1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("request handled");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(runtime.coordinator.hub().session_client_count("live"), 1);
    assert!(runtime.coordinator.hub().client("tab-1").is_some());

    runtime
        .coordinator
        .chat(
            ChatRequest {
                user_id: "dave".to_string(),
                session_id: "live".to_string(),
                agent_id: None,
                message: "hey".to_string(),
            },
            &CancellationToken::new(),
        )
        .await
        .expect("chat");

    let mut body = response.into_body();
    let frame = body
        .frame()
        .await
        .expect("frame")
        .expect("frame ok")
        .into_data()
        .expect("data frame");
    assert_eq!(&frame[..], b"event: delta\ndata: echo: \n\n");

    drop(body);
    assert_eq!(runtime.coordinator.hub().client_count(), 0);
}

#[tokio::test]
async fn broadcast_summarize_and_usage() {
    let mut config = test_config();
    config.summary.enabled = false;
    config.summary.max_recent_rounds = 1;
    let runtime = TestRuntime::new(config);
    let app = runtime.router();

    let (status, _, problem) =
        send_json(&app, Method::GET, "/v1/sessions/room/usage", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["sessionId"], "room");

    let (status, _, _) = send_json(
        &app,
        Method::POST,
        "/v1/agents",
        Some(json!({ "id": "alpha", "name": "Alpha" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, body) = send_json(
        &app,
        Method::POST,
        "/v1/sessions/room/broadcast",
        Some(json!({ "message": "hello", "agent_ids": ["alpha", "ghost"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().expect("results");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["agent_id"], "alpha");
    assert_eq!(results[0]["outcome"]["response"], "echo: hello");
    assert!(results[0].get("error").is_none());
    assert_eq!(results[1]["agent_id"], "ghost");
    assert_eq!(results[1]["error"]["status"], 404);
    assert!(results[1].get("outcome").is_none());

    let (status, _, problem) =
        send_json(&app, Method::POST, "/v1/sessions/room/summarize", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], "urn:session-runtime:error:invalid_request");

    let (status, _, _) = send(&app, chat_request("room", "erin", "again")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, record) =
        send_json(&app, Method::POST, "/v1/sessions/room/summarize", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["summarized_rounds"], 1);
    assert_eq!(record["recent_rounds"].as_array().map(Vec::len), Some(1));
    assert_eq!(record["recent_rounds"][0]["user_content"], "again");

    let (status, _, usage) = send_json(&app, Method::GET, "/v1/sessions/room/usage", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["exchanges"], 2);
    assert_eq!(usage["summarizedRounds"], 1);
    assert!(usage["summaryTokens"].as_u64().unwrap_or_default() > 0);
    assert!(usage["lastUpdated"].is_string());

    let (status, _, doc) = send_json(&app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/v1/sessions/{session_id}/broadcast"].is_object());
    assert!(doc["paths"]["/v1/sessions/{session_id}/usage"].is_object());
}
