//! Application message type
//!
//! A message is a short subject plus a JSON object payload. Messages are
//! immutable once built; the codec produces them on receipt and engines
//! hand them to callbacks by reference.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Structured key/value payload carried by a message
pub type Payload = Map<String, Value>;

/// Subjects reserved for connection control frames
pub(crate) mod control {
    /// First frame a client sends: `{"id": <client_id>}`
    pub const NEGOTIATION: &str = "negotiation";
    /// Server accepted the handshake: `{"id": <client_id>}`
    pub const ACCEPTED: &str = "accepted";
    /// Server refused the handshake: `{"reason": <text>}`
    pub const REJECTED: &str = "rejected";
    /// Server shutting down, or client leaving cleanly
    pub const SHUTDOWN: &str = "shutdown";

    pub const RESERVED: [&str; 4] = [NEGOTIATION, ACCEPTED, REJECTED, SHUTDOWN];
}

/// An application message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    subject: String,
    payload: Payload,
}

impl Message {
    /// Build a message. The subject must be non-empty.
    pub fn new(subject: impl Into<String>, payload: Payload) -> Result<Self> {
        let subject = subject.into();
        if subject.is_empty() {
            return Err(Error::Protocol("Message subject must not be empty".into()));
        }
        Ok(Self { subject, payload })
    }

    /// Build a message from any JSON value that is an object
    pub fn from_value(subject: impl Into<String>, payload: Value) -> Result<Self> {
        match payload {
            Value::Object(map) => Self::new(subject, map),
            other => Err(Error::Protocol(format!(
                "Payload must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Build a message with an empty payload
    pub fn empty(subject: impl Into<String>) -> Result<Self> {
        Self::new(subject, Payload::new())
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Look up a string field of the payload
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Whether the subject is one of the connection control subjects
    pub fn is_control(&self) -> bool {
        control::RESERVED.contains(&self.subject.as_str())
    }

    /// Control frames are built internally and never fail validation
    pub(crate) fn control(subject: &'static str, payload: Payload) -> Self {
        Self {
            subject: subject.to_string(),
            payload,
        }
    }

    pub(crate) fn negotiation(client_id: &str) -> Self {
        Self::control(control::NEGOTIATION, single("id", client_id))
    }

    pub(crate) fn accepted(client_id: &str) -> Self {
        Self::control(control::ACCEPTED, single("id", client_id))
    }

    pub(crate) fn rejected(reason: &str) -> Self {
        Self::control(control::REJECTED, single("reason", reason))
    }

    pub(crate) fn shutdown() -> Self {
        Self::control(control::SHUTDOWN, Payload::new())
    }

    /// Refuse application traffic that would be mistaken for control frames
    pub(crate) fn ensure_application(&self) -> Result<()> {
        if self.is_control() {
            return Err(Error::Protocol(format!(
                "Subject '{}' is reserved",
                self.subject
            )));
        }
        Ok(())
    }
}

fn single(key: &str, value: &str) -> Payload {
    let mut map = Payload::new();
    map.insert(key.to_string(), Value::String(value.to_string()));
    map
}
