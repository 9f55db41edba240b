//! Line-delimited JSON spoken with the sidecar process.
//!
//! Requests: `{"id":N,"method":"start"|"act"|"screenshot"|"stop","params":{..}}`
//! Responses: `{"id":N,"result":..}` or `{"id":N,"error":{"message":".."}}`
//! Notifications carry no id: `{"event":"thought"|"actionDone"|"nav",..}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::engine::{EngineAction, EngineEvent};

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

#[derive(Debug, PartialEq)]
pub enum Incoming {
    Response { id: u64, outcome: Result<Value, String> },
    Event(EngineEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line is neither a response nor a notification")]
    Unrecognized,
}

#[derive(Deserialize)]
struct RawResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RawFailure>,
}

#[derive(Deserialize)]
struct RawFailure {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum RawNotification {
    Thought { text: String },
    ActionDone { action: RawAction },
    Nav { url: String },
}

#[derive(Deserialize)]
struct RawAction {
    variant: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Serialize a request as one line, newline included.
pub fn encode_request(id: u64, method: &str, params: &Value) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(&Request { id, method, params })?;
    line.push('\n');
    Ok(line)
}

pub fn parse_line(line: &str) -> Result<Incoming, WireError> {
    let value: Value = serde_json::from_str(line)?;

    if value.get("id").is_some() {
        let raw: RawResponse = serde_json::from_value(value)?;
        let outcome = match raw.error {
            Some(failure) => Err(failure
                .message
                .unwrap_or_else(|| "sidecar reported an error".into())),
            None => Ok(raw.result.unwrap_or(Value::Null)),
        };
        return Ok(Incoming::Response { id: raw.id, outcome });
    }

    if value.get("event").is_some() {
        let event = match serde_json::from_value(value)? {
            RawNotification::Thought { text } => EngineEvent::Thought(text),
            RawNotification::ActionDone { action } => EngineEvent::ActionDone(EngineAction {
                variant: action.variant,
                target: action.target,
                content: action.content,
            }),
            RawNotification::Nav { url } => EngineEvent::Nav(url),
        };
        return Ok(Incoming::Event(event));
    }

    Err(WireError::Unrecognized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_is_one_line() {
        let line = encode_request(7, "act", &json!({"task": "click login"})).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let v: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v, json!({"id": 7, "method": "act", "params": {"task": "click login"}}));
    }

    #[test]
    fn parses_success_and_failure_responses() {
        assert_eq!(
            parse_line(r#"{"id":1,"result":{"ok":true}}"#).unwrap(),
            Incoming::Response { id: 1, outcome: Ok(json!({"ok": true})) }
        );
        assert_eq!(
            parse_line(r#"{"id":2}"#).unwrap(),
            Incoming::Response { id: 2, outcome: Ok(Value::Null) }
        );
        assert_eq!(
            parse_line(r#"{"id":3,"error":{"message":"element not found"}}"#).unwrap(),
            Incoming::Response { id: 3, outcome: Err("element not found".into()) }
        );
    }

    #[test]
    fn parses_notifications() {
        assert_eq!(
            parse_line(r#"{"event":"thought","text":"looking for login"}"#).unwrap(),
            Incoming::Event(EngineEvent::Thought("looking for login".into()))
        );
        assert_eq!(
            parse_line(r#"{"event":"actionDone","action":{"variant":"fill","content":"hello"}}"#)
                .unwrap(),
            Incoming::Event(EngineEvent::ActionDone(EngineAction {
                variant: "fill".into(),
                target: None,
                content: Some("hello".into()),
            }))
        );
        assert_eq!(
            parse_line(r#"{"event":"nav","url":"https://example.com/login"}"#).unwrap(),
            Incoming::Event(EngineEvent::Nav("https://example.com/login".into()))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse_line("npm WARN deprecated"), Err(WireError::Json(_))));
        assert!(matches!(parse_line(r#"{"hello":1}"#), Err(WireError::Unrecognized)));
        assert!(matches!(parse_line(r#"{"event":"teleport"}"#), Err(WireError::Json(_))));
    }
}
