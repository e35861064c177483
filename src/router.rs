use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::Instrument;

use crate::config::AppConfig;
use crate::gate;
use crate::models::ModelsResponse;
use crate::relay::Relay;

pub struct RouterState {
  pub started_at: Instant,
  pub config: Arc<AppConfig>,
  pub relay: Relay,
}

/// Failures before the event stream starts.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
  #[error("request body is not valid JSON: {0}")]
  MalformedJson(#[from] serde_json::Error),

  #[error("request body must be a JSON object")]
  NotAnObject,
}

pub fn build_router(state: RouterState) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/api/models", get(models))
    .route("/api/chat", post(chat))
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
    .with_state(Arc::new(state))
}

pub async fn run_router(listener: TcpListener, state: RouterState) -> anyhow::Result<()> {
  axum::serve(listener, build_router(state)).await?;
  Ok(())
}

async fn health(State(state): State<Arc<RouterState>>) -> Json<Value> {
  let uptime = state.started_at.elapsed().as_millis();
  Json(serde_json::json!({
    "status": "ok",
    "version": env!("CARGO_PKG_VERSION"),
    "uptime_ms": uptime
  }))
}

async fn models(State(state): State<Arc<RouterState>>) -> Json<ModelsResponse> {
  Json(ModelsResponse {
    default: state.config.models.default.clone(),
    thinking: state.config.models.thinking.clone(),
  })
}

async fn chat(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
  let request_id = uuid::Uuid::new_v4();
  let span = tracing::info_span!("chat", %request_id);

  let raw = match parse_body(&body) {
    Ok(raw) => raw,
    Err(err) => {
      span.in_scope(|| tracing::error!(%err, "rejecting unreadable chat body"));
      return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }
  };

  let req = match gate::validate(&raw) {
    Ok(req) => req,
    Err(rejected) => {
      span.in_scope(|| tracing::warn!(reason = %rejected, "chat request rejected"));
      return error_response(rejected.status(), &rejected.to_string());
    }
  };

  span.in_scope(|| {
    tracing::info!(
      thinking_mode = req.thinking_mode,
      image = req.image_reference.is_some(),
      prompt_chars = req.prompt.chars().count(),
      "relaying chat request"
    )
  });

  let inner = state.relay.relay(req);
  let events = stream! {
    tokio::pin!(inner);
    while let Some(event) = inner.next().instrument(span.clone()).await {
      yield Ok::<_, Infallible>(Event::default().data(event.to_sse_data()));
    }
  };

  Sse::new(events).into_response()
}

fn parse_body(body: &[u8]) -> Result<Map<String, Value>, BodyError> {
  match serde_json::from_slice::<Value>(body)? {
    Value::Object(map) => Ok(map),
    _ => Err(BodyError::NotAnObject),
  }
}

fn error_response(status: StatusCode, message: &str) -> Response {
  let body = Json(serde_json::json!({ "error": message }));
  (status, body).into_response()
}
