//! State-Machine Relay Service
//!
//! HTTP routes over a [`MessageStore`]:
//! - `GET /health`
//! - `POST /v1/msg` stores a round message (409 on a conflicting rewrite)
//! - `POST /v1/msg/get` fetches one

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sm_relay::wire::{GetMessageRequest, MessageResponse, PostMessageRequest, PostMessageResponse};
use sm_relay::{MessageStore, PutOutcome, RelayError};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Application state
pub struct AppState {
    pub store: MessageStore,
}

impl AppState {
    pub fn new(store: MessageStore) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/msg", post(post_message))
        .route("/v1/msg/get", post(get_message))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Drop expired messages every `every`
pub fn spawn_cleanup(store: MessageStore, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            store.cleanup();
        }
    })
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "sm-relay-svc",
        "version": env!("CARGO_PKG_VERSION"),
        "messages": state.store.len(),
    }))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PostMessageRequest>,
) -> Response {
    let payload = match req.decode_payload() {
        Ok(p) => p,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };

    let hash = req.id.hash();
    match state.store.put(req.id.clone(), payload) {
        Ok(outcome) => {
            info!(
                session_id = %req.id.session_id,
                round = req.id.round,
                from = req.id.from,
                to = ?req.id.to,
                ?outcome,
                "Message stored"
            );
            Json(PostMessageResponse {
                hash,
                duplicate: outcome == PutOutcome::Duplicate,
            })
            .into_response()
        }
        Err(e @ RelayError::Conflict(_)) => error_response(StatusCode::CONFLICT, &e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn get_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GetMessageRequest>,
) -> Json<MessageResponse> {
    match state.store.get(&req.id) {
        Ok(msg) => Json(MessageResponse::found(&msg.payload)),
        Err(_) => {
            debug!(round = req.id.round, from = req.id.from, "Message not yet available");
            Json(MessageResponse::missing())
        }
    }
}

fn error_response(status: StatusCode, e: &RelayError) -> Response {
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}
