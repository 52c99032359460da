//! Webhook receiver routes driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use parley_core::{AgentConfig, AgentResponse, OperationId, OutcomeStatus};
use parley_engine::{CorrelationRegistry, RunOptions, TaskExecutor, TaskRequest};
use parley_server::{ServerConfig, WebhookReply, WebhookServer};
use parley_transport::{ScriptedTransport, ScriptedTurn};
use parley_webhook::{sign, NotificationVerifier};

const SECRET: &str = "whsec_server_tests";

struct Harness {
    transport: Arc<ScriptedTransport>,
    executor: Arc<TaskExecutor>,
    server: WebhookServer,
}

fn harness() -> Harness {
    harness_with(NotificationVerifier::new(SECRET))
}

fn harness_with(verifier: NotificationVerifier) -> Harness {
    let transport = Arc::new(ScriptedTransport::new());
    let executor = Arc::new(TaskExecutor::new(
        transport.clone(),
        Arc::new(CorrelationRegistry::new()),
    ));
    let server = WebhookServer::new(executor.clone(), verifier, ServerConfig::default());
    Harness {
        transport,
        executor,
        server,
    }
}

/// Suspend one `create_media_buy` task on agent `sales` behind work id `work`.
async fn suspend(h: &Harness, op: &str, work: &str) {
    h.transport.script(
        "sales",
        vec![ScriptedTurn::Respond(AgentResponse::working().with_work(work))],
    );
    let outcome = h
        .executor
        .run(
            &AgentConfig::new("sales", "mock://sales"),
            TaskRequest::new("create_media_buy", json!({})).with_operation_id(OperationId::from_raw(op)),
            RunOptions::default(),
        )
        .await;
    assert_eq!(outcome.status, OutcomeStatus::Pending);
}

fn signed(uri: &str, payload: &Value) -> Request<Body> {
    let timestamp = Utc::now().timestamp().to_string();
    let signature = sign(payload, &timestamp, SECRET.as_bytes());
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-parley-signature", signature)
        .header("x-parley-timestamp", timestamp)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn signed_notification_resumes_and_broadcasts() {
    let h = harness();
    suspend(&h, "op_1", "w1").await;
    let mut outcomes = h.server.subscribe();

    let payload = json!({"taskId": "w1", "status": "completed", "result": {"media_buy_id": "mb-1"}});
    let (status, body) = send(
        h.server.router(),
        signed("/webhooks/create_media_buy/sales/op_1", &payload),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let reply: WebhookReply = serde_json::from_value(body).unwrap();
    let WebhookReply::Accepted { outcome } = reply else {
        panic!("expected an accepted reply");
    };
    assert!(outcome.success);
    assert_eq!(outcome.data, Some(json!({"media_buy_id": "mb-1"})));

    let published = outcomes.try_recv().unwrap();
    assert_eq!(published, outcome);
    assert!(h.executor.registry().is_empty());
}

#[tokio::test]
async fn ids_from_query_string_are_enough() {
    let h = harness();
    suspend(&h, "op_q", "wq").await;

    let payload = json!({"status": "completed", "result": 7});
    let (status, body) = send(
        h.server.router(),
        signed("/webhooks?task_type=create_media_buy&agent_id=sales&operation_id=op_q", &payload),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["outcome"]["data"], 7);
}

#[tokio::test]
async fn bad_signature_is_unauthorized_and_task_stays_pending() {
    let h = harness();
    suspend(&h, "op_2", "w2").await;

    let payload = json!({"taskId": "w2", "status": "completed"});
    let mut req = signed("/webhooks/create_media_buy/sales/op_2", &payload);
    let _ = req
        .headers_mut()
        .insert("x-parley-signature", format!("sha256={}", "0".repeat(64)).parse().unwrap());

    let (status, body) = send(h.server.router(), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "INVALID_SIGNATURE");
    assert_eq!(h.executor.registry().len(), 1);
}

#[tokio::test]
async fn tampered_body_is_unauthorized() {
    let h = harness();
    suspend(&h, "op_3", "w3").await;

    let signed_payload = json!({"taskId": "w3", "status": "completed", "result": {"amount": 10}});
    let req = signed("/webhooks/create_media_buy/sales/op_3", &signed_payload);
    let (parts, _) = req.into_parts();
    let forged = json!({"taskId": "w3", "status": "completed", "result": {"amount": 10_000}});
    let req = Request::from_parts(parts, Body::from(forged.to_string()));

    let (status, _) = send(h.server.router(), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_headers_are_unauthorized() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/webhooks")
        .body(Body::from(json!({"taskId": "w", "status": "completed"}).to_string()))
        .unwrap();
    let (status, _) = send(h.server.router(), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unconfigured_secret_rejects_everything() {
    let h = harness_with(NotificationVerifier::unconfigured());
    suspend(&h, "op_4", "w4").await;
    let payload = json!({"taskId": "w4", "status": "completed"});
    let (status, _) = send(h.server.router(), signed("/webhooks", &payload)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_bodies_are_bad_requests() {
    let h = harness();

    let req = Request::builder()
        .method("POST")
        .uri("/webhooks")
        .body(Body::from("not json"))
        .unwrap();
    let (status, body) = send(h.server.router(), req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_NOTIFICATION");

    // Signed correctly, but there is no status.
    let payload = json!({"taskId": "w"});
    let (status, body) = send(h.server.router(), signed("/webhooks", &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_NOTIFICATION");
}

#[tokio::test]
async fn unknown_correlation_is_ignored() {
    let h = harness();
    let payload = json!({"taskId": "nobody", "status": "completed"});
    let (status, body) = send(h.server.router(), signed("/webhooks", &payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn path_ids_conflicting_with_registry_are_a_conflict() {
    let h = harness();
    suspend(&h, "op_5", "w5").await;

    let payload = json!({"taskId": "w5", "status": "completed"});
    let (status, body) = send(
        h.server.router(),
        signed("/webhooks/create_media_buy/sales/op_other", &payload),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CORRELATION_MISMATCH");
    assert_eq!(body["recovery"], "correctable");
    assert_eq!(h.executor.registry().len(), 1);
}

#[tokio::test]
async fn health_and_metrics() {
    let h = harness();
    suspend(&h, "op_6", "w6").await;
    let server = h.server.with_prometheus(parley_telemetry::detached_prometheus());

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(server.router(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["correlations"], 1);
    assert_eq!(body["webhook_secret_configured"], true);

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = server.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"].to_str().unwrap().starts_with("text/plain"));
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let h = harness();
    let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
    let (status, _) = send(h.server.router(), req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
