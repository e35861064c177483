use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A validated inbound chat request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
  /// Defaults to the empty string.
  pub prompt: String,
  /// Defaults to absent.
  pub image_reference: Option<String>,
  /// Defaults to false.
  pub thinking_mode: bool,
  /// Defaults to false.
  pub caller_authenticated: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  System,
  User,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
  pub role: Role,
  pub content: MessageContent,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
  Text(String),
  Parts(Vec<ContentPart>),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
  Text { text: String },
  ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageUrl {
  pub url: String,
}

impl Message {
  pub fn system(content: &str) -> Self {
    Self {
      role: Role::System,
      content: MessageContent::Text(content.to_string()),
    }
  }

  /// Builds the user turn, switching to multi-part content when an image is attached.
  pub fn user(prompt: &str, image_reference: Option<&str>) -> Self {
    let content = match image_reference {
      Some(url) => MessageContent::Parts(vec![
        ContentPart::Text {
          text: prompt.to_string(),
        },
        ContentPart::ImageUrl {
          image_url: ImageUrl {
            url: url.to_string(),
          },
        },
      ]),
      None => MessageContent::Text(prompt.to_string()),
    };
    Self {
      role: Role::User,
      content,
    }
  }
}

/// Body of the streaming chat-completions call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UpstreamRequest {
  pub model: String,
  pub messages: Vec<Message>,
  pub stream: bool,
}

/// One decoded line of the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
  ContentFragment(String),
  UpstreamError(String),
  Done,
  Ignorable,
}

impl UpstreamEvent {
  /// Nothing after a terminal event is decoded.
  pub fn is_terminal(&self) -> bool {
    matches!(self, UpstreamEvent::UpstreamError(_) | UpstreamEvent::Done)
  }
}

/// Event delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
  Content(String),
  Error(String),
  Done,
}

impl OutboundEvent {
  /// Payload placed after `data: ` in the event-stream framing.
  pub fn to_sse_data(&self) -> String {
    match self {
      OutboundEvent::Content(text) => serde_json::json!({ "content": text }).to_string(),
      OutboundEvent::Error(message) => serde_json::json!({ "error": message }).to_string(),
      OutboundEvent::Done => "[DONE]".to_string(),
    }
  }
}

#[derive(Serialize, Deserialize)]
pub struct ModelsResponse {
  pub default: String,
  pub thinking: String,
}

/// Loose truthiness used when reading untyped JSON fields.
pub(crate) fn is_truthy(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Bool(b) => *b,
    Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
    Value::String(s) => !s.is_empty(),
    Value::Array(items) => !items.is_empty(),
    Value::Object(map) => !map.is_empty(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn plain_user_message_serializes_as_text() {
    let msg = Message::user("hi", None);
    assert_eq!(
      serde_json::to_value(&msg).unwrap(),
      json!({ "role": "user", "content": "hi" })
    );
  }

  #[test]
  fn image_user_message_serializes_as_parts() {
    let msg = Message::user("what is this?", Some("https://img.example/cat.png"));
    assert_eq!(
      serde_json::to_value(&msg).unwrap(),
      json!({
        "role": "user",
        "content": [
          { "type": "text", "text": "what is this?" },
          { "type": "image_url", "image_url": { "url": "https://img.example/cat.png" } }
        ]
      })
    );
  }

  #[test]
  fn outbound_events_use_fixed_framing() {
    assert_eq!(OutboundEvent::Content("a\"b".into()).to_sse_data(), r#"{"content":"a\"b"}"#);
    assert_eq!(OutboundEvent::Error("boom".into()).to_sse_data(), r#"{"error":"boom"}"#);
    assert_eq!(OutboundEvent::Done.to_sse_data(), "[DONE]");
  }

  #[test]
  fn truthiness_matches_loose_json_rules() {
    for falsy in [json!(null), json!(false), json!(0), json!(0.0), json!(""), json!([]), json!({})] {
      assert!(!is_truthy(&falsy), "{falsy} should be falsy");
    }
    for truthy in [json!(true), json!(1), json!("false"), json!([0]), json!({ "a": 1 })] {
      assert!(is_truthy(&truthy), "{truthy} should be truthy");
    }
  }

  #[test]
  fn only_error_and_done_are_terminal() {
    assert!(UpstreamEvent::Done.is_terminal());
    assert!(UpstreamEvent::UpstreamError("x".into()).is_terminal());
    assert!(!UpstreamEvent::ContentFragment("x".into()).is_terminal());
    assert!(!UpstreamEvent::Ignorable.is_terminal());
  }
}
