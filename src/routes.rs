use std::convert::Infallible;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tower_http::{
    compression::{
        predicate::{NotForContentType, Predicate},
        CompressionLayer, DefaultPredicate,
    },
    cors::{Any, CorsLayer},
};

use crate::{
    models::{GenerationRequest, HealthResponse, ValidationError},
    session::Generator,
};

pub const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
pub struct AppState {
    pub generator: Generator,
}

/// Errors surfaced before a stream starts.
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(e) => {
                tracing::warn!("🚫 Rejected request: {}", e);
                (StatusCode::BAD_REQUEST, Json(json!({ "detail": e.to_string() }))).into_response()
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    // NDJSON stays uncompressed so each event reaches the client as soon as it is written.
    let compression = CompressionLayer::new()
        .compress_when(DefaultPredicate::new().and(NotForContentType::const_new(NDJSON)));

    Router::new()
        .route("/generate_image", post(generate_image))
        .route("/health", get(health))
        .layer(compression)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn generate_image(
    State(state): State<AppState>,
    Json(body): Json<GenerationRequest>,
) -> Result<Response, ApiError> {
    let events = state.generator.start(body)?;
    tracing::info!("🎨 Streaming session {}", events.id());

    let lines = events.map(|event| Ok::<_, Infallible>(Bytes::from(event.to_ndjson())));
    Ok(([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response())
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
