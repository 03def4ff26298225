use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::{self, now_iso};
use crate::error::AppError;
use crate::ingest::{IngestOutcome, Ingestion};
use crate::ledger::Ledger;
use crate::realtime::RealtimeHub;
use crate::types::OutboundRequest;

pub struct AppState {
    pub ingestion: Ingestion,
    pub ledger: Ledger,
    pub hub: RealtimeHub,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/db", get(health_db))
        .route("/api/crm/webhook", post(crm_webhook))
        .route("/api/crm/conversations", get(list_conversations))
        .route(
            "/api/crm/conversations/{conversation_id}/messages",
            get(conversation_messages),
        )
        .route("/api/crm/customers", get(list_customers))
        .route(
            "/api/crm/customers/{customer_id}/messages",
            get(customer_messages),
        )
        .route("/api/crm/messages/send", post(send_message))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn health_db(State(state): State<Arc<AppState>>) -> Response {
    match db::ping(state.ledger.pool()).await {
        Ok(()) => Json(json!({ "ok": true, "now": now_iso() })).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Always answers 200 for payloads that are not chat messages, so the
/// gateway does not redeliver them.
async fn crm_webhook(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| {
        warn!(bytes = body.len(), "webhook body is not valid json");
        json!({})
    });

    match state.ingestion.ingest_webhook(&payload).await {
        Ok(IngestOutcome::Ignored(reason)) => {
            Json(json!({ "ok": true, "ignored": true, "reason": reason })).into_response()
        }
        Ok(IngestOutcome::Stored(_)) => Json(json!({ "ok": true })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn list_conversations(State(state): State<Arc<AppState>>) -> Response {
    match state.ledger.list_conversations().await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn conversation_messages(
    Path(conversation_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.ledger.conversation_messages(conversation_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn list_customers(State(state): State<Arc<AppState>>) -> Response {
    match state.ledger.list_customers().await {
        Ok(customers) => Json(customers).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn customer_messages(
    Path(customer_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.ledger.customer_messages(customer_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn send_message(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<OutboundRequest>(&body) {
        Ok(request) => request,
        Err(err) => {
            return AppError::Validation(format!("invalid request body: {err}")).into_response();
        }
    };

    match state.ingestion.send_message(&request).await {
        Ok(receipt) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "message": receipt.message,
                "conversationId": receipt.conversation_id,
                "customerId": receipt.customer_id,
                "phone": receipt.phone,
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub.handle_socket(socket))
}

pub async fn run(config: AppConfig) -> Result<(), AppError> {
    let pool = db::connect(&config).await?;
    let ledger = Ledger::new(pool);
    let hub = RealtimeHub::new();
    let state = Arc::new(AppState {
        ingestion: Ingestion::new(ledger.clone(), Arc::new(hub.clone())),
        ledger,
        hub,
    });

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "crm server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
