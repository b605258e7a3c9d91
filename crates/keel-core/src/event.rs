//! Build event payloads.
//!
//! Events are stored as `(type, version, payload)` triples. `payload` is the
//! variant body only, so the type column can be indexed and filtered without
//! parsing JSON.

use serde::{Deserialize, Serialize};

use crate::{BuildStatus, Error, Result};

/// Schema version written alongside every event.
pub const EVENT_VERSION: &str = "1.0";

/// Where in the build plan an event came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

/// An immutable entry in a build's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A chunk of step output.
    Log {
        #[serde(default)]
        origin: Origin,
        payload: String,
    },
    /// The build changed status. `time` is Unix seconds.
    Status { status: BuildStatus, time: i64 },
    /// A human-readable failure.
    Error {
        #[serde(default)]
        origin: Origin,
        message: String,
    },
    /// A step is being prepared.
    Initialize {
        #[serde(default)]
        origin: Origin,
        time: i64,
    },
    /// A step began running.
    Start {
        #[serde(default)]
        origin: Origin,
        time: i64,
    },
    /// A step finished.
    Finish {
        #[serde(default)]
        origin: Origin,
        time: i64,
        exit_status: i32,
    },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Event {
    /// Log chunk with no origin.
    pub fn log(payload: impl Into<String>) -> Self {
        Event::Log {
            origin: Origin::default(),
            payload: payload.into(),
        }
    }

    /// Error with no origin.
    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            origin: Origin::default(),
            message: message.into(),
        }
    }

    /// Value of the `type` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Log { .. } => "log",
            Event::Status { .. } => "status",
            Event::Error { .. } => "error",
            Event::Initialize { .. } => "initialize",
            Event::Start { .. } => "start",
            Event::Finish { .. } => "finish",
        }
    }

    /// Split into the `type` column and the JSON `payload` column.
    pub fn encode(&self) -> Result<(&'static str, serde_json::Value)> {
        let value = serde_json::to_value(self).map_err(|e| Error::InvalidInput(e.to_string()))?;
        let envelope: Envelope =
            serde_json::from_value(value).map_err(|e| Error::InvalidInput(e.to_string()))?;
        Ok((self.kind(), envelope.data))
    }

    /// Rebuild an event from its stored columns.
    pub fn decode(kind: &str, version: &str, payload: serde_json::Value) -> Result<Self> {
        if version.split('.').next() != EVENT_VERSION.split('.').next() {
            return Err(Error::UnknownEvent(format!("{kind} v{version}")));
        }

        let envelope = Envelope {
            event: kind.to_string(),
            data: payload,
        };
        let value =
            serde_json::to_value(envelope).map_err(|e| Error::InvalidInput(e.to_string()))?;
        serde_json::from_value(value).map_err(|_| Error::UnknownEvent(kind.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_log_strips_envelope() {
        let (kind, payload) = Event::log("some ").encode().unwrap();
        assert_eq!(kind, "log");
        assert_eq!(payload, json!({ "origin": {}, "payload": "some " }));
    }

    #[test]
    fn test_decode_status() {
        let event = Event::decode(
            "status",
            "1.0",
            json!({ "status": "succeeded", "time": 1700000000 }),
        )
        .unwrap();
        assert_eq!(
            event,
            Event::Status {
                status: BuildStatus::Succeeded,
                time: 1_700_000_000,
            }
        );
    }

    #[test]
    fn test_decode_error_without_origin() {
        let event = Event::decode("error", "1.0", json!({ "message": "disaster" })).unwrap();
        assert_eq!(event, Event::error("disaster"));
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_version() {
        assert!(matches!(
            Event::decode("teleport", "1.0", json!({})),
            Err(Error::UnknownEvent(_))
        ));
        assert!(matches!(
            Event::decode("log", "2.0", json!({ "payload": "x" })),
            Err(Error::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_minor_version_is_compatible() {
        let event = Event::decode("log", "1.3", json!({ "payload": "x" })).unwrap();
        assert_eq!(event, Event::log("x"));
    }
}
