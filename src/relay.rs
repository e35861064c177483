use std::sync::Arc;

use async_stream::stream;
use tokio_stream::{Stream, StreamExt};

use crate::config::AppConfig;
use crate::decoder;
use crate::models::{ChatRequest, Message, OutboundEvent, UpstreamEvent, UpstreamRequest};
use crate::sanitize::sanitize;
use crate::upstream::UpstreamClient;

/// Streams one chat request through the upstream API.
#[derive(Clone)]
pub struct Relay {
  config: Arc<AppConfig>,
  upstream: Arc<dyn UpstreamClient>,
}

impl Relay {
  pub fn new(config: Arc<AppConfig>, upstream: Arc<dyn UpstreamClient>) -> Self {
    Self { config, upstream }
  }

  pub fn build_request(&self, req: &ChatRequest) -> UpstreamRequest {
    UpstreamRequest {
      model: self.config.models.select(req.thinking_mode).to_string(),
      messages: vec![
        Message::system(&self.config.system_prompt),
        Message::user(&req.prompt, req.image_reference.as_deref()),
      ],
      stream: true,
    }
  }

  /// Always ends with exactly one `Done` or `Error`.
  ///
  /// The upstream body lives inside the returned stream, so dropping the stream
  /// (caller disconnect) closes the upstream connection.
  pub fn relay(&self, req: ChatRequest) -> impl Stream<Item = OutboundEvent> + Send + 'static {
    let upstream = self.upstream.clone();
    let payload = self.build_request(&req);

    stream! {
      tracing::debug!(model = %payload.model, image = req.image_reference.is_some(), "opening upstream stream");
      let body = match upstream.open(&payload).await {
        Ok(body) => body,
        Err(err) => {
          tracing::warn!(%err, "upstream call failed");
          yield OutboundEvent::Error(err.to_string());
          return;
        }
      };

      let events = decoder::decode(decoder::lines(body));
      tokio::pin!(events);
      let mut fragments = 0usize;

      while let Some(event) = events.next().await {
        match event {
          Ok(UpstreamEvent::ContentFragment(text)) => {
            let cleaned = sanitize(&text);
            if !cleaned.is_empty() {
              fragments += 1;
              yield OutboundEvent::Content(cleaned);
            }
          }
          Ok(UpstreamEvent::Ignorable) => {}
          Ok(UpstreamEvent::Done) => {
            tracing::info!(fragments, "upstream stream finished");
            yield OutboundEvent::Done;
            return;
          }
          Ok(UpstreamEvent::UpstreamError(message)) => {
            tracing::warn!(%message, fragments, "upstream reported an error");
            yield OutboundEvent::Error(message);
            return;
          }
          Err(err) => {
            tracing::warn!(%err, fragments, "upstream stream failed");
            yield OutboundEvent::Error(err.to_string());
            return;
          }
        }
      }

      tracing::warn!(fragments, "upstream closed without a terminal marker");
      yield OutboundEvent::Done;
    }
  }
}
