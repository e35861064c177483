//! Decoding of the upstream `data: <payload>` line protocol.
//!
//! Two composed stream transforms: [`lines`] reassembles text lines from raw
//! body chunks, [`decode`] turns lines into [`UpstreamEvent`]s and stops after
//! the first terminal event.

use async_stream::stream;
use bytes::Bytes;
use serde_json::Value;
use tokio_stream::{Stream, StreamExt};

use crate::models::{is_truthy, UpstreamEvent};
use crate::upstream::UpstreamFailure;

const DATA_PREFIX: &str = "data: ";
const SENTINEL: &str = "[DONE]";

/// Longest line accepted before the body is treated as broken.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a chunked body into non-blank lines without the line terminator.
pub fn lines<S>(body: S) -> impl Stream<Item = Result<String, UpstreamFailure>> + Send
where
  S: Stream<Item = Result<Bytes, UpstreamFailure>> + Send + 'static,
{
  stream! {
    tokio::pin!(body);
    let mut buffer: Vec<u8> = Vec::new();
    // Bytes of `buffer` already known to hold no newline.
    let mut scanned = 0;

    while let Some(chunk) = body.next().await {
      let chunk = match chunk {
        Ok(c) => c,
        Err(err) => {
          yield Err(err);
          return;
        }
      };
      buffer.extend_from_slice(&chunk);

      while let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=scanned + offset).collect();
        scanned = 0;
        match to_line(raw) {
          Ok(Some(line)) => {
            yield Ok(line);
          }
          Ok(None) => {}
          Err(err) => {
            yield Err(err);
            return;
          }
        }
      }
      scanned = buffer.len();

      if buffer.len() > MAX_LINE_BYTES {
        yield Err(UpstreamFailure::Internal(format!(
          "upstream line exceeds {MAX_LINE_BYTES} bytes"
        )));
        return;
      }
    }

    if !buffer.is_empty() {
      match to_line(buffer) {
        Ok(Some(line)) => {
          yield Ok(line);
        }
        Ok(None) => {}
        Err(err) => {
          yield Err(err);
        }
      }
    }
  }
}

fn to_line(mut raw: Vec<u8>) -> Result<Option<String>, UpstreamFailure> {
  if raw.last() == Some(&b'\n') {
    raw.pop();
  }
  if raw.last() == Some(&b'\r') {
    raw.pop();
  }
  if raw.is_empty() {
    return Ok(None);
  }
  String::from_utf8(raw)
    .map(Some)
    .map_err(|err| UpstreamFailure::Internal(format!("upstream sent invalid UTF-8: {err}")))
}

/// Decodes lines into events, ending after `Done` or `UpstreamError`.
///
/// Transport failures from the line source pass through and also end the stream.
pub fn decode<S>(lines: S) -> impl Stream<Item = Result<UpstreamEvent, UpstreamFailure>> + Send
where
  S: Stream<Item = Result<String, UpstreamFailure>> + Send + 'static,
{
  stream! {
    tokio::pin!(lines);
    while let Some(line) = lines.next().await {
      let line = match line {
        Ok(l) => l,
        Err(err) => {
          yield Err(err);
          return;
        }
      };
      let event = match decode_line(&line) {
        Some(e) => e,
        None => continue,
      };
      let terminal = event.is_terminal();
      yield Ok(event);
      if terminal {
        return;
      }
    }
  }
}

/// Decodes one line. `None` for lines outside the `data: ` framing.
pub fn decode_line(line: &str) -> Option<UpstreamEvent> {
  let data = line.strip_prefix(DATA_PREFIX)?;
  if data.trim() == SENTINEL {
    return Some(UpstreamEvent::Done);
  }

  let payload: Value = match serde_json::from_str(data) {
    Ok(v) => v,
    Err(err) => {
      tracing::debug!(%err, "skipping malformed upstream payload");
      return Some(UpstreamEvent::Ignorable);
    }
  };

  Some(interpret(&payload).unwrap_or_else(UpstreamEvent::UpstreamError))
}

/// Reads a parsed payload. `Err` means its shape could not be interpreted.
fn interpret(payload: &Value) -> Result<UpstreamEvent, String> {
  let chunk = payload
    .as_object()
    .ok_or_else(|| format!("unexpected upstream payload: {payload}"))?;

  if let Some(error) = chunk.get("error").filter(|e| is_truthy(e)) {
    return Ok(UpstreamEvent::UpstreamError(error_message(error)));
  }

  let choices = match chunk.get("choices") {
    Some(c) if is_truthy(c) => c,
    _ => return Ok(UpstreamEvent::Ignorable),
  };
  let first = choices
    .as_array()
    .and_then(|items| items.first())
    .ok_or_else(|| format!("unexpected choices in upstream payload: {choices}"))?;
  let choice = first
    .as_object()
    .ok_or_else(|| format!("unexpected choice in upstream payload: {first}"))?;

  let Some(delta) = choice.get("delta") else {
    return Ok(UpstreamEvent::Ignorable);
  };
  let delta = delta
    .as_object()
    .ok_or_else(|| format!("unexpected delta in upstream payload: {delta}"))?;

  match delta.get("content") {
    None | Some(Value::Null) => Ok(UpstreamEvent::ContentFragment(String::new())),
    Some(Value::String(text)) => Ok(UpstreamEvent::ContentFragment(text.clone())),
    Some(other) => Err(format!("unexpected content in upstream payload: {other}")),
  }
}

fn error_message(error: &Value) -> String {
  match error {
    Value::String(message) => message.clone(),
    Value::Object(fields) => match fields.get("message").and_then(Value::as_str) {
      Some(message) => message.to_string(),
      None => error.to_string(),
    },
    other => other.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn content_line(text: &str) -> String {
    format!("data: {}", serde_json::json!({ "choices": [{ "delta": { "content": text } }] }))
  }

  fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, UpstreamFailure>> + Send + 'static {
    tokio_stream::iter(
      parts
        .iter()
        .copied()
        .map(|p| Ok(Bytes::from_static(p.as_bytes())))
        .collect::<Vec<_>>(),
    )
  }

  async fn collect_lines(parts: &[&'static str]) -> Vec<Result<String, UpstreamFailure>> {
    lines(chunks(parts)).collect().await
  }

  async fn decode_all(input: Vec<String>) -> Vec<Result<UpstreamEvent, UpstreamFailure>> {
    decode(tokio_stream::iter(input.into_iter().map(Ok))).collect().await
  }

  #[test]
  fn content_line_decodes_to_fragment() {
    assert_eq!(
      decode_line(&content_line("Hello")),
      Some(UpstreamEvent::ContentFragment("Hello".to_string()))
    );
  }

  #[test]
  fn sentinel_decodes_to_done() {
    assert_eq!(decode_line("data: [DONE]"), Some(UpstreamEvent::Done));
    assert_eq!(decode_line("data: [DONE]  "), Some(UpstreamEvent::Done));
  }

  #[test]
  fn unprefixed_lines_are_skipped() {
    assert_eq!(decode_line(": OPENROUTER PROCESSING"), None);
    assert_eq!(decode_line("event: message"), None);
    assert_eq!(decode_line("data:{\"choices\":[]}"), None);
  }

  #[test]
  fn malformed_payload_is_ignorable() {
    assert_eq!(decode_line("data: {not json"), Some(UpstreamEvent::Ignorable));
  }

  #[test]
  fn error_field_variants() {
    assert_eq!(
      decode_line(r#"data: {"error":"rate limited"}"#),
      Some(UpstreamEvent::UpstreamError("rate limited".to_string()))
    );
    assert_eq!(
      decode_line(r#"data: {"error":{"message":"bad model","code":400}}"#),
      Some(UpstreamEvent::UpstreamError("bad model".to_string()))
    );
    assert_eq!(
      decode_line(r#"data: {"error":{"code":502}}"#),
      Some(UpstreamEvent::UpstreamError(r#"{"code":502}"#.to_string()))
    );
  }

  #[test]
  fn falsy_error_field_is_not_an_error() {
    assert_eq!(
      decode_line(r#"data: {"error":null,"choices":[{"delta":{"content":"ok"}}]}"#),
      Some(UpstreamEvent::ContentFragment("ok".to_string()))
    );
  }

  #[test]
  fn irrelevant_shapes_are_ignorable() {
    assert_eq!(decode_line(r#"data: {"id":"gen-1"}"#), Some(UpstreamEvent::Ignorable));
    assert_eq!(decode_line(r#"data: {"choices":[]}"#), Some(UpstreamEvent::Ignorable));
    assert_eq!(
      decode_line(r#"data: {"choices":[{"finish_reason":"stop"}]}"#),
      Some(UpstreamEvent::Ignorable)
    );
  }

  #[test]
  fn null_content_is_an_empty_fragment() {
    assert_eq!(
      decode_line(r#"data: {"choices":[{"delta":{"role":"assistant","content":null}}]}"#),
      Some(UpstreamEvent::ContentFragment(String::new()))
    );
  }

  #[test]
  fn uninterpretable_shapes_become_errors() {
    for line in [
      "data: [1,2,3]",
      r#"data: {"choices":{"delta":{}}}"#,
      r#"data: {"choices":["x"]}"#,
      r#"data: {"choices":[{"delta":"x"}]}"#,
      r#"data: {"choices":[{"delta":{"content":42}}]}"#,
    ] {
      assert!(
        matches!(decode_line(line), Some(UpstreamEvent::UpstreamError(_))),
        "line should fail interpretation: {line}"
      );
    }
  }

  #[tokio::test]
  async fn lines_reassembles_split_chunks() {
    let got = collect_lines(&["data: {\"a\"", ":1}\n\ndata: [DO", "NE]\n"]).await;
    assert_eq!(
      got,
      vec![Ok("data: {\"a\":1}".to_string()), Ok("data: [DONE]".to_string())]
    );
  }

  #[tokio::test]
  async fn lines_strips_crlf_and_keeps_trailing_line() {
    let got = collect_lines(&["data: one\r\n\r\n", "data: two"]).await;
    assert_eq!(got, vec![Ok("data: one".to_string()), Ok("data: two".to_string())]);
  }

  #[tokio::test]
  async fn lines_reports_invalid_utf8() {
    let body = tokio_stream::iter(vec![Ok(Bytes::from_static(b"data: \xff\xfe\n"))]);
    let got: Vec<_> = lines(body).collect().await;
    assert_eq!(got.len(), 1);
    assert!(matches!(got[0], Err(UpstreamFailure::Internal(_))));
  }

  #[tokio::test]
  async fn lines_passes_transport_errors_through() {
    let body = tokio_stream::iter(vec![
      Ok(Bytes::from_static(b"data: one\n")),
      Err(UpstreamFailure::Transport("reset".into())),
      Ok(Bytes::from_static(b"data: two\n")),
    ]);
    let got: Vec<_> = lines(body).collect().await;
    assert_eq!(
      got,
      vec![Ok("data: one".to_string()), Err(UpstreamFailure::Transport("reset".into()))]
    );
  }

  #[tokio::test]
  async fn lines_reassembles_a_line_spread_over_many_chunks() {
    let line = content_line(&"x".repeat(4096));
    let mut parts: Vec<Result<Bytes, UpstreamFailure>> = line
      .as_bytes()
      .chunks(7)
      .map(|c| Ok(Bytes::copy_from_slice(c)))
      .collect();
    parts.push(Ok(Bytes::from_static(b"\ndata: [DONE]\n")));

    let got: Vec<_> = lines(tokio_stream::iter(parts)).collect().await;
    assert_eq!(got, vec![Ok(line), Ok("data: [DONE]".to_string())]);
  }

  #[tokio::test]
  async fn overlong_line_is_an_error() {
    let filler = Bytes::from(vec![b'x'; 64 * 1024]);
    let mut parts = vec![Ok(Bytes::from_static(b"data: ok\ndata: "))];
    parts.extend((0..=MAX_LINE_BYTES / filler.len()).map(|_| Ok(filler.clone())));
    parts.push(Ok(Bytes::from_static(b"\ndata: late\n")));

    let got: Vec<_> = lines(tokio_stream::iter(parts)).collect().await;
    assert_eq!(got.len(), 2);
    assert_eq!(got[0], Ok("data: ok".to_string()));
    assert!(matches!(&got[1], Err(UpstreamFailure::Internal(msg)) if msg.contains("exceeds")));
  }

  #[tokio::test]
  async fn decode_stops_after_error() {
    let got = decode_all(vec![
      content_line("a"),
      r#"data: {"error":"boom"}"#.to_string(),
      content_line("b"),
    ])
    .await;
    assert_eq!(
      got,
      vec![
        Ok(UpstreamEvent::ContentFragment("a".into())),
        Ok(UpstreamEvent::UpstreamError("boom".into())),
      ]
    );
  }

  #[tokio::test]
  async fn decode_stops_after_done() {
    let got = decode_all(vec![content_line("a"), "data: [DONE]".to_string(), content_line("b")]).await;
    assert_eq!(
      got,
      vec![Ok(UpstreamEvent::ContentFragment("a".into())), Ok(UpstreamEvent::Done)]
    );
  }

  #[tokio::test]
  async fn decode_continues_past_malformed_lines() {
    let got = decode_all(vec![
      content_line("a"),
      "data: {oops".to_string(),
      ": keep-alive".to_string(),
      content_line("b"),
    ])
    .await;
    assert_eq!(
      got,
      vec![
        Ok(UpstreamEvent::ContentFragment("a".into())),
        Ok(UpstreamEvent::Ignorable),
        Ok(UpstreamEvent::ContentFragment("b".into())),
      ]
    );
  }
}
