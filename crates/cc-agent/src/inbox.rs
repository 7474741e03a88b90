//! The agent's own HTTP inbox: the `POST /inbox` endpoint peers and relays
//! post signed envelopes to.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use cc_crypto::envelope::Envelope;
use cc_client::errors::ClientError;
use cc_client::pipeline::MessagePipeline;
use cc_client::relay_client::ReqwestTransport;
use serde::Deserialize;
use tracing::warn;

#[derive(Clone)]
pub struct InboxState {
    pub pipeline: Arc<MessagePipeline<ReqwestTransport>>,
    pub default_community: String,
}

#[derive(Debug, Deserialize)]
pub struct InboxQuery {
    community: Option<String>,
}

pub fn router(state: InboxState) -> Router {
    Router::new()
        .route("/inbox", post(receive_envelope))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn receive_envelope(
    State(state): State<InboxState>,
    Query(query): Query<InboxQuery>,
    Json(envelope): Json<Envelope>,
) -> impl IntoResponse {
    let community = query.community.as_deref().unwrap_or(&state.default_community);
    match state.pipeline.receive(community, envelope).await {
        Ok(Some(())) => StatusCode::OK.into_response(),
        Ok(None) => StatusCode::OK.into_response(), // duplicate, dropped silently
        Err(err) => {
            warn!(%err, "inbox rejected envelope");
            client_error_response(&err)
        }
    }
}

fn client_error_response(err: &ClientError) -> axum::response::Response {
    let status = match err {
        ClientError::Validation(_) => StatusCode::BAD_REQUEST,
        ClientError::Auth(_) | ClientError::Crypto(_) => StatusCode::UNAUTHORIZED,
        ClientError::NotFound(_) | ClientError::NotAContact | ClientError::UnknownCommunity(_) => {
            StatusCode::NOT_FOUND
        }
        ClientError::Conflict(_) => StatusCode::CONFLICT,
        ClientError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ClientError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        ClientError::QueueFull => StatusCode::INSUFFICIENT_STORAGE,
        ClientError::Expired => StatusCode::GONE,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
