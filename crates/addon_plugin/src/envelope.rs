//! Envelope format spoken between the host and a worker process.
//!
//! Every envelope is one JSON object on its own line. The object carries the
//! protocol version `v` and a `target` discriminator that multiplexes the
//! concerns sharing the channel:
//!
//! | target           | direction       | payload                                   |
//! |------------------|-----------------|-------------------------------------------|
//! | `call`           | host → worker   | `messageId`, `callback`, `header`, `args` |
//! | `response`       | worker → host   | `messageId`, `body?`, `error?`, `completed?` |
//! | `relay`          | worker → host   | `messageId`, `targetAddress`, `args`      |
//! | `relay-response` | host → worker   | same as `response`                        |
//! | `event`          | worker → host   | lifecycle event                           |
//! | `signal`         | host → worker   | lifecycle trigger                         |
//!
//! ```ignore
//! {"v":1,"target":"call","messageId":"6f1c…","callback":"echo","header":{"id":"…","from":"a"},"args":[42]}
//! {"v":1,"target":"response","messageId":"6f1c…","body":42}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::message::{CallbackHeader, Delivery, LifecycleEvent, LifecycleSignal};

pub const PROTOCOL_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "kebab-case")]
pub enum Frame {
    Call(CallFrame),
    Response(ResponseFrame),
    Relay(RelayFrame),
    RelayResponse(ResponseFrame),
    Event { event: LifecycleEvent },
    Signal { signal: LifecycleSignal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub message_id: String,
    pub callback: String,
    pub header: CallbackHeader,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayFrame {
    pub message_id: String,
    #[serde(rename = "targetAddress")]
    pub address: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// `error` marks a failure, `completed: false` a stream chunk,
/// `completed: true` the end of a stream. Neither means a single body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl ResponseFrame {
    pub fn from_delivery(message_id: impl Into<String>, delivery: Delivery) -> Self {
        let message_id = message_id.into();
        let (body, error, completed) = match delivery {
            Delivery::Body(v) => (Some(v), None, None),
            Delivery::Chunk(v) => (Some(v), None, Some(false)),
            Delivery::Completed => (None, None, Some(true)),
            Delivery::Error(e) => (None, Some(e), None),
        };
        Self { message_id, body, error, completed }
    }

    /// A final frame may carry a body; it is handed out as a last chunk
    /// before the completion.
    pub fn into_deliveries(self) -> Vec<Delivery> {
        if let Some(error) = self.error {
            return vec![Delivery::Error(error)];
        }
        match (self.completed, self.body) {
            (Some(false), body) => vec![Delivery::Chunk(body.unwrap_or(Value::Null))],
            (Some(true), Some(body)) => vec![Delivery::Chunk(body), Delivery::Completed],
            (Some(true), None) => vec![Delivery::Completed],
            (None, body) => vec![Delivery::Body(body.unwrap_or(Value::Null))],
        }
    }
}

/// Serialise a frame into one newline-terminated line.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    let mut value = serde_json::to_value(frame)?;
    if let Value::Object(map) = &mut value {
        map.insert("v".to_string(), Value::from(PROTOCOL_VERSION));
    }
    let mut line = serde_json::to_string(&value)?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &str) -> Result<Frame, CodecError> {
    let value: Value = serde_json::from_str(line.trim_end_matches(['\r', '\n']))?;
    match value.get("v").and_then(Value::as_u64) {
        None => return Err(CodecError::MissingVersion),
        Some(PROTOCOL_VERSION) => {}
        Some(other) => return Err(CodecError::UnsupportedVersion(other)),
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_frame_wire_shape() {
        let frame = Frame::Call(CallFrame {
            message_id: "m1".into(),
            callback: "echo".into(),
            header: CallbackHeader::new("h1", "a"),
            args: vec![json!(42)],
        });
        let line = encode(&frame).unwrap();
        assert!(line.ends_with('\n'));
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["v"], json!(1));
        assert_eq!(v["target"], json!("call"));
        assert_eq!(v["messageId"], json!("m1"));
        assert_eq!(v["header"], json!({"id": "h1", "from": "a"}));
        assert_eq!(decode(&line).unwrap(), frame);
    }

    #[test]
    fn relay_response_uses_kebab_target() {
        let frame = Frame::RelayResponse(ResponseFrame::from_delivery("r", Delivery::Completed));
        let v: Value = serde_json::from_str(&encode(&frame).unwrap()).unwrap();
        assert_eq!(v["target"], json!("relay-response"));
        assert_eq!(v["completed"], json!(true));
        assert!(v.get("body").is_none());
    }

    #[test]
    fn relay_carries_target_address() {
        let line = r#"{"v":1,"target":"relay","messageId":"x","targetAddress":"b.echo","args":[1]}"#;
        match decode(line).unwrap() {
            Frame::Relay(relay) => {
                assert_eq!(relay.address, "b.echo");
                assert_eq!(relay.args, vec![json!(1)]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn event_frame_nests_lifecycle_event() {
        let line = r#"{"v":1,"target":"event","event":{"name":"failed","transition":"start","message":"boom"}}"#;
        assert_eq!(
            decode(line).unwrap(),
            Frame::Event {
                event: LifecycleEvent::Failed { transition: "start".into(), message: "boom".into() }
            }
        );
    }

    #[test]
    fn rejects_other_versions() {
        let line = r#"{"v":2,"target":"event","event":{"name":"ready"}}"#;
        assert!(matches!(decode(line), Err(CodecError::UnsupportedVersion(2))));
        let line = r#"{"target":"event","event":{"name":"ready"}}"#;
        assert!(matches!(decode(line), Err(CodecError::MissingVersion)));
        assert!(matches!(decode("not json"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn response_frame_interpretation() {
        let chunk = ResponseFrame { message_id: "m".into(), body: Some(json!(1)), error: None, completed: Some(false) };
        assert_eq!(chunk.into_deliveries(), vec![Delivery::Chunk(json!(1))]);

        let last = ResponseFrame { message_id: "m".into(), body: Some(json!(2)), error: None, completed: Some(true) };
        assert_eq!(last.into_deliveries(), vec![Delivery::Chunk(json!(2)), Delivery::Completed]);

        let single = ResponseFrame { message_id: "m".into(), body: None, error: None, completed: None };
        assert_eq!(single.into_deliveries(), vec![Delivery::Body(Value::Null)]);

        let failed = ResponseFrame { message_id: "m".into(), body: Some(json!(3)), error: Some("nope".into()), completed: None };
        assert_eq!(failed.into_deliveries(), vec![Delivery::Error("nope".into())]);
    }
}
