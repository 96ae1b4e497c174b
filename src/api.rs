use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::{Error, Result};
use axum::{
    Router,
    extract::{ConnectInfo, FromRequestParts, Query, State, rejection::JsonRejection},
    http::{StatusCode, header::USER_AGENT, request::Parts},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::{net::TcpListener, time::timeout};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    clients::{
        audit::AuditWriter,
        broker::Broker,
        database::{AuditStore, DatabaseClient},
        health::HealthChecker,
        rbmq::LapinBroker,
    },
    config::Config,
    dispatch::Dispatcher,
    models::{
        audit::{AuditLog, CreateAuditLog},
        health::HealthStatus,
        notification::Notification,
        response::{ApiResponse, DispatchReceipt},
    },
};

const MAX_AUDIT_LIST_LIMIT: i64 = 1000;

pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    audit_writer: AuditWriter,
    audit_store: Arc<dyn AuditStore>,
    health_checker: HealthChecker,
    audit_list_limit: i64,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        audit_writer: AuditWriter,
        audit_store: Arc<dyn AuditStore>,
        health_checker: HealthChecker,
        audit_list_limit: i64,
    ) -> Self {
        Self {
            dispatcher,
            audit_writer,
            audit_store,
            health_checker,
            audit_list_limit,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/send", post(send_notification))
        .route("/auditlogs", get(list_audit_logs))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(config: Config) -> Result<(), Error> {
    let broker: Arc<dyn Broker> = Arc::new(LapinBroker::new());
    let database =
        DatabaseClient::connect(&config.database_url, config.audit_write_timeout()).await?;
    let audit_store: Arc<dyn AuditStore> = Arc::new(database);

    let dispatcher = Arc::new(Dispatcher::from_config(Arc::clone(&broker), &config));
    let (audit_writer, audit_task) = AuditWriter::spawn(
        Arc::clone(&audit_store),
        config.audit_queue_capacity,
        config.audit_write_timeout(),
    );
    let health_checker = HealthChecker::new(
        broker,
        config.rabbitmq_url.clone(),
        config.dial_timeout(),
        Arc::clone(&audit_store),
    );

    let state = Arc::new(AppState::new(
        Arc::clone(&dispatcher),
        audit_writer,
        audit_store,
        health_checker,
        config.audit_list_limit,
    ));

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, exchange = %config.exchange_name, "Notification API started");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("HTTP server stopped, releasing broker connection");
    dispatcher.shutdown().await;

    if timeout(config.audit_write_timeout(), audit_task).await.is_err() {
        warn!("Audit writer did not drain before shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}

/// Caller address and user agent recorded in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            ip: forwarded.or(peer).unwrap_or_else(|| "unknown".to_string()),
            user_agent,
        })
    }
}

async fn send_notification(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    payload: Result<Json<Notification>, JsonRejection>,
) -> Response {
    let Json(notification) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<()>::error(
                    rejection.body_text(),
                    "Invalid notification payload".to_string(),
                )),
            )
                .into_response();
        }
    };

    let outcome = state.dispatcher.send(&notification).await;

    // Built from the same outcome as the response so the two always agree.
    let audit_log = CreateAuditLog::new(&notification, outcome.accepted)
        .with_error(outcome.error.clone())
        .with_client(client.ip, client.user_agent);
    state.audit_writer.submit(audit_log);

    match outcome.error {
        None => (
            StatusCode::OK,
            Json(ApiResponse::success(
                DispatchReceipt {
                    routing_key: notification.routing_key(),
                },
                "Notification dispatched".to_string(),
            )),
        )
            .into_response(),
        Some(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<()>::error(
                error,
                "Notification dispatch failed".to_string(),
            )),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<i64>,
}

async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(state.audit_list_limit)
        .clamp(1, MAX_AUDIT_LIST_LIMIT);

    match state.audit_store.list(limit).await {
        Ok(logs) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                logs,
                "Audit logs retrieved".to_string(),
            )),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to list audit logs");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<Vec<AuditLog>>::error(
                    e.to_string(),
                    "Failed to retrieve audit logs".to_string(),
                )),
            )
                .into_response()
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connection = state.dispatcher.connection_status().await;
    let health = state.health_checker.check_all(connection.to_string()).await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}
