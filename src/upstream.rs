use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio_stream::{Stream, StreamExt};

use crate::config::AppConfig;
use crate::models::UpstreamRequest;

/// Upstream response body, chunk by chunk. Dropping it releases the connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamFailure>> + Send>>;

/// Failures talking to the upstream API. `Display` is the caller-facing message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpstreamFailure {
  #[error("Request timed out. Please try again.")]
  Timeout,

  #[error("API request failed: {0}")]
  Transport(String),

  #[error("API request failed: upstream returned {status}: {body}")]
  Status { status: u16, body: String },

  #[error("An unexpected error occurred: {0}")]
  Internal(String),
}

impl From<reqwest::Error> for UpstreamFailure {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      UpstreamFailure::Timeout
    } else {
      UpstreamFailure::Transport(err.to_string())
    }
  }
}

/// Opens a streaming chat-completions call.
///
/// Implementations report a non-success upstream status as `UpstreamFailure::Status`
/// instead of handing back its body.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
  async fn open(&self, request: &UpstreamRequest) -> Result<ByteStream, UpstreamFailure>;
}

const ERROR_BODY_LIMIT: usize = 512;

/// reqwest-backed client for OpenRouter-compatible endpoints.
pub struct OpenRouterClient {
  client: reqwest::Client,
  config: Arc<AppConfig>,
}

impl OpenRouterClient {
  pub fn new(config: Arc<AppConfig>) -> anyhow::Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(config.timeout())
      .build()?;
    Ok(Self { client, config })
  }

  fn headers(&self) -> Result<HeaderMap, UpstreamFailure> {
    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
      .map_err(|_| UpstreamFailure::Internal("credential is not a valid header value".to_string()))?;
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
      "HTTP-Referer",
      HeaderValue::from_str(&self.config.referer)
        .map_err(|err| UpstreamFailure::Internal(format!("invalid referer header: {err}")))?,
    );
    headers.insert(
      "X-Title",
      HeaderValue::from_str(&self.config.title)
        .map_err(|err| UpstreamFailure::Internal(format!("invalid title header: {err}")))?,
    );
    Ok(headers)
  }
}

#[async_trait::async_trait]
impl UpstreamClient for OpenRouterClient {
  async fn open(&self, request: &UpstreamRequest) -> Result<ByteStream, UpstreamFailure> {
    let timeout = self.config.timeout();
    let pending = self
      .client
      .post(&self.config.upstream_url)
      .headers(self.headers()?)
      .json(request)
      .send();

    let resp = tokio::time::timeout(timeout, pending)
      .await
      .map_err(|_| UpstreamFailure::Timeout)??;

    let status = resp.status();
    if !status.is_success() {
      let mut body = error_excerpt(resp, timeout).await;
      if body.is_empty() {
        body = status.canonical_reason().unwrap_or("no body").to_string();
      }
      return Err(UpstreamFailure::Status {
        status: status.as_u16(),
        body,
      });
    }

    Ok(Box::pin(idle_bounded(resp.bytes_stream(), timeout)))
  }
}

/// Reads at most `ERROR_BODY_LIMIT` bytes of an error body, giving up at the first
/// stalled or failed chunk.
async fn error_excerpt(resp: reqwest::Response, idle: Duration) -> String {
  let body = idle_bounded(resp.bytes_stream(), idle);
  tokio::pin!(body);
  let mut raw: Vec<u8> = Vec::new();
  while raw.len() < ERROR_BODY_LIMIT {
    match body.next().await {
      Some(Ok(chunk)) => raw.extend_from_slice(&chunk),
      Some(Err(err)) => {
        tracing::debug!(%err, "stopped reading upstream error body");
        break;
      }
      None => break,
    }
  }
  truncate_excerpt(&raw)
}

fn truncate_excerpt(raw: &[u8]) -> String {
  let text = String::from_utf8_lossy(raw);
  let mut body = text.trim().to_string();
  if body.len() > ERROR_BODY_LIMIT {
    let mut cut = ERROR_BODY_LIMIT;
    while !body.is_char_boundary(cut) {
      cut -= 1;
    }
    body.truncate(cut);
  }
  body
}

/// Ends the body with a `Timeout` when no chunk arrives within `idle`.
fn idle_bounded<S>(body: S, idle: Duration) -> impl Stream<Item = Result<Bytes, UpstreamFailure>> + Send
where
  S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
  stream! {
    tokio::pin!(body);
    loop {
      match tokio::time::timeout(idle, body.next()).await {
        Ok(Some(Ok(chunk))) => {
          yield Ok(chunk);
        }
        Ok(Some(Err(err))) => {
          yield Err(UpstreamFailure::from(err));
          return;
        }
        Ok(None) => return,
        Err(_) => {
          yield Err(UpstreamFailure::Timeout);
          return;
        }
      }
    }
  }
}
