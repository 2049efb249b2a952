//! QMP wire frames.
//!
//! The channel speaks newline-delimited JSON over a unix domain socket.
//! The server opens with a greeting, then the stream carries id-tagged
//! request/reply pairs interleaved with unsolicited events. Replies are
//! matched to requests by id; events are recognized by their `event` tag
//! and never carry an id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server greeting, sent once when the socket opens.
///
/// Parsed only to validate that the peer really speaks the protocol; the
/// announced version and capabilities are not otherwise consulted.
#[derive(Debug, Deserialize)]
pub(crate) struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GreetingBody {
    #[serde(default)]
    pub version: Value,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

/// Outgoing command frame.
#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    pub id: u64,
}

/// Error payload of a failed command.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CommandError {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

/// Timestamp attached to events, as the hypervisor reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Timestamp {
    /// Seconds since the epoch; negative when the host clock was unreadable.
    pub seconds: i64,
    /// Sub-second microseconds.
    pub microseconds: i64,
}

/// An unsolicited event broadcast by the hypervisor.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name (`SHUTDOWN`, `DEVICE_DELETED`, ...).
    pub name: String,
    /// Event payload; `Null` when the event carries none.
    pub data: Value,
    /// When the hypervisor emitted the event.
    pub timestamp: Option<Timestamp>,
}

/// Raw incoming frame before classification.
#[derive(Debug, Deserialize)]
pub(crate) struct Frame {
    pub id: Option<u64>,
    #[serde(rename = "return")]
    pub ret: Option<Value>,
    pub error: Option<CommandError>,
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: Option<Timestamp>,
}

/// A classified incoming frame.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// A reply correlated to a request by id.
    Reply {
        id: u64,
        result: std::result::Result<Value, CommandError>,
    },
    /// A broadcast event.
    Event(Event),
}

impl Frame {
    /// Sorts the frame into a reply or an event.
    ///
    /// Returns `None` for a frame matching neither shape, which the read
    /// loop treats as a terminating protocol violation.
    pub fn classify(self) -> Option<Incoming> {
        if let Some(name) = self.event {
            return Some(Incoming::Event(Event {
                name,
                data: self.data,
                timestamp: self.timestamp,
            }));
        }

        let id = self.id?;
        if let Some(error) = self.error {
            return Some(Incoming::Reply {
                id,
                result: Err(error),
            });
        }
        self.ret.map(|ret| Incoming::Reply {
            id,
            result: Ok(ret),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: &str) -> Frame {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn greeting_parses() {
        let raw = r#"{"QMP": {"version": {"qemu": {"major": 8}}, "capabilities": ["oob"]}}"#;
        let greeting: Greeting = serde_json::from_str(raw).unwrap();
        assert_eq!(greeting.qmp.capabilities.len(), 1);
        assert!(greeting.qmp.version.is_object());
    }

    #[test]
    fn request_serializes_without_empty_arguments() {
        let frame = Request {
            execute: "query-status",
            arguments: None,
            id: 7,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"execute": "query-status", "id": 7})
        );

        let frame = Request {
            execute: "balloon",
            arguments: Some(json!({"value": 1024})),
            id: 8,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"execute": "balloon", "arguments": {"value": 1024}, "id": 8})
        );
    }

    #[test]
    fn successful_reply_classifies_by_id() {
        let frame = parse(r#"{"id": 3, "return": {"status": "running"}}"#);
        match frame.classify() {
            Some(Incoming::Reply { id, result }) => {
                assert_eq!(id, 3);
                assert_eq!(result.unwrap()["status"], "running");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn error_reply_carries_class_and_desc() {
        let frame = parse(r#"{"id": 4, "error": {"class": "GenericError", "desc": "nope"}}"#);
        match frame.classify() {
            Some(Incoming::Reply { id, result }) => {
                assert_eq!(id, 4);
                let err = result.unwrap_err();
                assert_eq!(err.class, "GenericError");
                assert_eq!(err.desc, "nope");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn event_classifies_by_tag() {
        let frame = parse(
            r#"{"event": "SHUTDOWN", "data": {"guest": true},
                "timestamp": {"seconds": 100, "microseconds": 42}}"#,
        );
        match frame.classify() {
            Some(Incoming::Event(event)) => {
                assert_eq!(event.name, "SHUTDOWN");
                assert_eq!(event.data["guest"], true);
                assert_eq!(
                    event.timestamp,
                    Some(Timestamp {
                        seconds: 100,
                        microseconds: 42
                    })
                );
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn event_without_payload_classifies() {
        let frame = parse(r#"{"event": "RESUME"}"#);
        match frame.classify() {
            Some(Incoming::Event(event)) => {
                assert_eq!(event.name, "RESUME");
                assert!(event.data.is_null());
                assert_eq!(event.timestamp, None);
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn unclassifiable_frames_are_rejected() {
        // Neither an event tag nor a correlatable reply.
        assert!(parse(r#"{"hello": 1}"#).classify().is_none());
        // An id without a return or error payload.
        assert!(parse(r#"{"id": 9}"#).classify().is_none());
        // A payload without an id.
        assert!(parse(r#"{"return": {}}"#).classify().is_none());
    }
}
