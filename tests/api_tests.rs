mod common;

use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use notify_api::{
    api::{AppState, router},
    clients::{
        audit::AuditWriter,
        database::{AuditStore, MemoryAuditStore},
        health::HealthChecker,
        memory::MemoryBroker,
    },
    models::audit::{AuditLog, CreateAuditLog},
};
use serde_json::Value;
use tower::ServiceExt;

use common::{BROKER_URL, DIAL_TIMEOUT, dispatcher};

fn test_app(broker: &MemoryBroker) -> (Router, Arc<MemoryAuditStore>) {
    let store = Arc::new(MemoryAuditStore::new());
    (app_with_store(broker, store.clone()), store)
}

fn app_with_store(broker: &MemoryBroker, store: Arc<dyn AuditStore>) -> Router {
    let (audit_writer, _task) = AuditWriter::spawn(store.clone(), 64, Duration::from_secs(1));
    let health_checker = HealthChecker::new(
        Arc::new(broker.clone()),
        BROKER_URL.to_string(),
        DIAL_TIMEOUT,
        store.clone(),
    );

    let state = Arc::new(AppState::new(
        Arc::new(dispatcher(broker)),
        audit_writer,
        store,
        health_checker,
        100,
    ));

    router(state)
}

/// Audit store whose database is gone: every call fails, or never returns.
struct UnavailableStore {
    hang: bool,
}

#[async_trait]
impl AuditStore for UnavailableStore {
    async fn insert(&self, _log: CreateAuditLog) -> Result<AuditLog, Error> {
        Err(anyhow!("Database write failed: connection refused"))
    }

    async fn list(&self, _limit: i64) -> Result<Vec<AuditLog>, Error> {
        Err(anyhow!("Failed to read audit logs: connection refused"))
    }

    async fn health_check(&self) -> Result<(), Error> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Err(anyhow!("Database health check failed: connection refused"))
    }
}

fn send_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/send")
        .header("content-type", "application/json")
        .header("user-agent", "integration-test/1.0")
        .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

async fn json_body(response: axum::response::Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn wait_for_audit_logs(store: &MemoryAuditStore, count: usize) -> Result<Vec<AuditLog>> {
    for _ in 0..200 {
        let logs = store.list(100).await?;
        if logs.len() >= count {
            return Ok(logs);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow!("audit log was not written"))
}

/// Test: A successful send returns 200 and records a successful audit log
#[tokio::test]
async fn test_send_success_records_audit_log() -> Result<()> {
    let broker = MemoryBroker::new();
    let (app, store) = test_app(&broker);

    let response = app
        .oneshot(send_request(
            r#"{"userId":"alice","application":"Orders","message":"shipped"}"#,
        ))
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["routingKey"], "orders.user.alice");

    let logs = wait_for_audit_logs(&store, 1).await?;
    assert_eq!(logs[0].user_id, "alice");
    assert_eq!(logs[0].application, "Orders");
    assert_eq!(logs[0].message, "shipped");
    assert!(logs[0].success);
    assert_eq!(logs[0].error_message, None);
    assert_eq!(logs[0].ip, "203.0.113.9");
    assert_eq!(logs[0].user_agent, "integration-test/1.0");

    assert_eq!(broker.messages("orders.user.alice").len(), 1);

    Ok(())
}

/// Test: A failed dispatch returns 500 and the audit log agrees
#[tokio::test]
async fn test_send_failure_returns_error_and_audits_failure() -> Result<()> {
    let broker = MemoryBroker::new();
    broker.fail_publishes(true);
    let (app, store) = test_app(&broker);

    let response = app
        .oneshot(send_request(
            r#"{"userId":"alice","application":"Orders","message":"shipped"}"#,
        ))
        .await?;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await?;
    assert_eq!(body["success"], false);
    let error = body["error"].as_str().unwrap_or_default().to_string();
    assert!(!error.is_empty());

    let logs = wait_for_audit_logs(&store, 1).await?;
    assert!(!logs[0].success);
    assert_eq!(logs[0].error_message.as_deref(), Some(error.as_str()));

    Ok(())
}

/// Test: Malformed or incomplete payloads are rejected without dispatching
#[tokio::test]
async fn test_invalid_payload_is_bad_request() -> Result<()> {
    let broker = MemoryBroker::new();
    let (app, store) = test_app(&broker);

    for payload in [
        "{ invalid json }",
        r#"{"userId":"alice","message":"missing application"}"#,
    ] {
        let response = app.clone().oneshot(send_request(payload)).await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "payload {}", payload);
        let body = json_body(response).await?;
        assert_eq!(body["success"], false);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.is_empty());
    assert_eq!(broker.dial_count(), 0);

    Ok(())
}

/// Test: Audit logs are listed newest first and honour the limit
#[tokio::test]
async fn test_list_audit_logs() -> Result<()> {
    let broker = MemoryBroker::new();
    let (app, store) = test_app(&broker);

    for user in ["first", "second"] {
        let body = format!(
            r#"{{"userId":"{}","application":"Orders","message":"m"}}"#,
            user
        );
        app.clone().oneshot(send_request(&body)).await?;
        wait_for_audit_logs(&store, if user == "first" { 1 } else { 2 }).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/auditlogs").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    let logs = body["data"].as_array().cloned().unwrap_or_default();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0]["userId"], "second");
    assert_eq!(logs[1]["userId"], "first");
    assert!(logs[0]["timestamp"].is_string());
    assert!(logs[0]["userAgent"].is_string());

    let response = app
        .oneshot(Request::builder().uri("/auditlogs?limit=1").body(Body::empty())?)
        .await?;
    let body = json_body(response).await?;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

    Ok(())
}

/// Test: Health reports the broker connection and overall status
#[tokio::test]
async fn test_health_reflects_broker_reachability() -> Result<()> {
    let broker = MemoryBroker::new();
    let (app, _store) = test_app(&broker);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["broker_connection"], "absent");
    assert_eq!(body["checks"]["message_broker"]["status"], "healthy");
    assert_eq!(body["checks"]["audit_store"]["status"], "healthy");

    broker.refuse_connections(true);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await?;
    assert_eq!(body["status"], "unhealthy");

    Ok(())
}

/// Test: A failing audit store degrades health but the service stays available
#[tokio::test]
async fn test_health_degraded_when_audit_store_down() -> Result<()> {
    let broker = MemoryBroker::new();
    let app = app_with_store(&broker, Arc::new(UnavailableStore { hang: false }));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["message_broker"]["status"], "healthy");
    assert_eq!(body["checks"]["audit_store"]["status"], "unhealthy");
    let error = body["checks"]["audit_store"]["error"].as_str().unwrap_or_default();
    assert!(error.contains("connection refused"), "got: {}", error);

    // Dispatch does not depend on the audit store.
    let response = app
        .clone()
        .oneshot(send_request(
            r#"{"userId":"alice","application":"Orders","message":"shipped"}"#,
        ))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(broker.messages("orders.user.alice").len(), 1);

    let response = app
        .oneshot(Request::builder().uri("/auditlogs").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    Ok(())
}

/// Test: An audit store that never answers is reported within the dial timeout
#[tokio::test(start_paused = true)]
async fn test_health_bounded_when_audit_store_hangs() -> Result<()> {
    let broker = MemoryBroker::new();
    let app = app_with_store(&broker, Arc::new(UnavailableStore { hang: true }));

    let started = tokio::time::Instant::now();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;

    assert!(started.elapsed() <= DIAL_TIMEOUT + Duration::from_millis(100));
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["checks"]["audit_store"]["status"], "unhealthy");
    let error = body["checks"]["audit_store"]["error"].as_str().unwrap_or_default();
    assert!(error.contains("timed out"), "got: {}", error);

    Ok(())
}
