use axum::http::StatusCode;
use serde_json::{Map, Value};

use crate::models::{is_truthy, ChatRequest};

/// Reasons a well-formed body is refused before any upstream work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
  #[error("Authentication required for image uploads")]
  AuthRequired,
}

impl Rejected {
  pub fn status(&self) -> StatusCode {
    match self {
      Rejected::AuthRequired => StatusCode::FORBIDDEN,
    }
  }
}

/// Extracts a [`ChatRequest`] from an untyped body, defaulting anything missing.
///
/// Wrong field types never fail extraction; an image without authentication does.
pub fn validate(body: &Map<String, Value>) -> Result<ChatRequest, Rejected> {
  let req = ChatRequest {
    prompt: text_field(body.get("prompt")),
    image_reference: body
      .get("image_url")
      .filter(|v| is_truthy(v))
      .map(|v| text_field(Some(v))),
    thinking_mode: flag_field(body.get("thinking_mode")),
    caller_authenticated: flag_field(body.get("user_authenticated")),
  };

  if req.image_reference.is_some() && !req.caller_authenticated {
    return Err(Rejected::AuthRequired);
  }
  Ok(req)
}

fn text_field(value: Option<&Value>) -> String {
  match value {
    None | Some(Value::Null) => String::new(),
    Some(Value::String(s)) => s.clone(),
    Some(other) => other.to_string(),
  }
}

fn flag_field(value: Option<&Value>) -> bool {
  value.map(is_truthy).unwrap_or(false)
}
