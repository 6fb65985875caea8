//! The routed message format.
//!
//! All routing lives in `application_properties`; the body is opaque JSON.
//! Property keys and the operation vocabulary are shared by both sides of a
//! connection, so they live here rather than in the framework crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application property keys used by the protocol.
pub mod keys {
    /// Request operation (`GET`, `PUT`, `POST`, `DELETE`, `acquire`).
    pub const OP: &str = "op";
    /// Slash-separated request path.
    pub const PATH: &str = "path";
    /// Name of the mutex an `acquire` targets.
    pub const MUTEX_NAME: &str = "mutex_name";
    /// Optional queue-wait budget for an `acquire`, in milliseconds.
    pub const WAIT_TIME: &str = "wait_time";
    /// Optional free-form label on an `acquire`.
    pub const LABEL: &str = "label";
    /// HTTP-style response status.
    pub const STATUS: &str = "status";
    /// Human-readable response status description.
    pub const STATUS_DESCRIPTION: &str = "status_description";
    /// Opaque per-grant identifier on a successful `acquire` reply.
    pub const ACQUISITION_ID: &str = "acquisition_id";
}

/// HTTP-style status codes used by the protocol.
pub mod status {
    /// Request handled.
    pub const OK: u16 = 200;
    /// No handler registered for the request's verb at its path.
    pub const NOT_PERMITTED: u16 = 400;
    /// No resource at the request's path.
    pub const NOT_FOUND: u16 = 404;
    /// A queued `acquire` exhausted its `wait_time` budget.
    pub const WAIT_EXPIRED: u16 = 408;
}

/// Request operation vocabulary.
///
/// Parsing is case-insensitive; the canonical wire spellings are the REST
/// verbs in upper case and `acquire` in lower case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read a resource.
    Get,
    /// Replace a resource.
    Put,
    /// Submit to a resource.
    Post,
    /// Remove a resource.
    Delete,
    /// Take a named mutex; the delivery's unsettled state represents the
    /// hold.
    Acquire,
}

impl Operation {
    /// Canonical wire spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "GET",
            Operation::Put => "PUT",
            Operation::Post => "POST",
            Operation::Delete => "DELETE",
            Operation::Acquire => "acquire",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`Operation`] from its wire spelling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation: {0}")]
pub struct OperationParseError(String);

impl FromStr for Operation {
    type Err = OperationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("GET") {
            Ok(Operation::Get)
        } else if s.eq_ignore_ascii_case("PUT") {
            Ok(Operation::Put)
        } else if s.eq_ignore_ascii_case("POST") {
            Ok(Operation::Post)
        } else if s.eq_ignore_ascii_case("DELETE") {
            Ok(Operation::Delete)
        } else if s.eq_ignore_ascii_case("acquire") {
            Ok(Operation::Acquire)
        } else {
            Err(OperationParseError(s.to_string()))
        }
    }
}

/// A routed message.
///
/// `to` addresses the message (used by anonymous senders), `reply_to` names
/// where responses should go, and `correlation_id` links a response back to
/// its request. Everything the protocol routes on lives in
/// `application_properties`; the body is opaque to this layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Destination address, for anonymous-sender routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Address replies should be sent to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Connection-scoped id correlating a reply to its request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<u64>,
    /// String-keyed routing properties.
    #[serde(default)]
    pub application_properties: BTreeMap<String, Value>,
    /// Opaque payload.
    #[serde(default)]
    pub body: Value,
}

impl Message {
    /// Build a request for `op` at `path`.
    pub fn request(op: Operation, path: &str) -> Self {
        let mut message = Message::default();
        message.set_property(keys::OP, Value::String(op.as_str().to_string()));
        message.set_property(keys::PATH, Value::String(path.to_string()));
        message
    }

    /// Build an `acquire` request for `mutex_name` at `path`.
    pub fn acquire(path: &str, mutex_name: &str) -> Self {
        let mut message = Message::request(Operation::Acquire, path);
        message.set_property(keys::MUTEX_NAME, Value::String(mutex_name.to_string()));
        message
    }

    /// Build a response addressed back at `request`'s reply address,
    /// carrying its correlation id.
    pub fn response_to(request: &Message) -> Self {
        Message {
            to: request.reply_to.clone(),
            correlation_id: request.correlation_id,
            ..Message::default()
        }
    }

    /// Set an application property, replacing any previous value.
    pub fn set_property(&mut self, key: &str, value: Value) {
        self.application_properties.insert(key.to_string(), value);
    }

    /// Set the body, builder-style.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    fn property_str(&self, key: &str) -> Option<&str> {
        self.application_properties.get(key).and_then(Value::as_str)
    }

    fn property_u64(&self, key: &str) -> Option<u64> {
        self.application_properties.get(key).and_then(Value::as_u64)
    }

    /// The request operation, if present and recognised.
    pub fn op(&self) -> Option<Operation> {
        self.property_str(keys::OP).and_then(|s| s.parse().ok())
    }

    /// The request path.
    pub fn path(&self) -> Option<&str> {
        self.property_str(keys::PATH)
    }

    /// The mutex name of an `acquire`.
    pub fn mutex_name(&self) -> Option<&str> {
        self.property_str(keys::MUTEX_NAME)
    }

    /// The queue-wait budget of an `acquire`.
    pub fn wait_time(&self) -> Option<Duration> {
        self.property_u64(keys::WAIT_TIME).map(Duration::from_millis)
    }

    /// The label of an `acquire`.
    pub fn label(&self) -> Option<&str> {
        self.property_str(keys::LABEL)
    }

    /// The response status.
    pub fn status(&self) -> Option<u16> {
        self.property_u64(keys::STATUS).map(|s| s as u16)
    }

    /// The response status description.
    pub fn status_description(&self) -> Option<&str> {
        self.property_str(keys::STATUS_DESCRIPTION)
    }

    /// The acquisition id of a successful `acquire` reply.
    pub fn acquisition_id(&self) -> Option<&str> {
        self.property_str(keys::ACQUISITION_ID)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_operation_parse_case_insensitive() {
        assert_eq!("get".parse::<Operation>(), Ok(Operation::Get));
        assert_eq!("GET".parse::<Operation>(), Ok(Operation::Get));
        assert_eq!("Put".parse::<Operation>(), Ok(Operation::Put));
        assert_eq!("ACQUIRE".parse::<Operation>(), Ok(Operation::Acquire));
        assert!("PATCH".parse::<Operation>().is_err());
    }

    #[test]
    fn test_operation_wire_spelling() {
        assert_eq!(Operation::Get.as_str(), "GET");
        assert_eq!(Operation::Acquire.as_str(), "acquire");
    }

    #[test]
    fn test_request_builder() {
        let message = Message::request(Operation::Put, "/variables/counter").with_body(json!(42));
        assert_eq!(message.op(), Some(Operation::Put));
        assert_eq!(message.path(), Some("/variables/counter"));
        assert_eq!(message.body, json!(42));
    }

    #[test]
    fn test_acquire_builder() {
        let mut message = Message::acquire("/locks", "counter");
        message.set_property(keys::WAIT_TIME, json!(1500));
        message.set_property(keys::LABEL, json!("worker-7"));

        assert_eq!(message.op(), Some(Operation::Acquire));
        assert_eq!(message.mutex_name(), Some("counter"));
        assert_eq!(message.wait_time(), Some(Duration::from_millis(1500)));
        assert_eq!(message.label(), Some("worker-7"));
    }

    #[test]
    fn test_response_addressing() {
        let mut request = Message::request(Operation::Get, "/names");
        request.reply_to = Some("/$dynamic/000001".to_string());
        request.correlation_id = Some(7);

        let response = Message::response_to(&request);
        assert_eq!(response.to.as_deref(), Some("/$dynamic/000001"));
        assert_eq!(response.correlation_id, Some(7));
    }

    #[test]
    fn test_status_accessors() {
        let mut response = Message::default();
        response.set_property(keys::STATUS, json!(404));
        response.set_property(keys::STATUS_DESCRIPTION, json!("Not Found"));
        assert_eq!(response.status(), Some(404));
        assert_eq!(response.status_description(), Some("Not Found"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut message = Message::acquire("/locks", "counter").with_body(json!({"k": 1}));
        message.correlation_id = Some(99);
        message.reply_to = Some("/r".to_string());

        let encoded = serde_json::to_vec(&message).expect("serialize");
        let decoded: Message = serde_json::from_slice(&encoded).expect("deserialize");
        assert_eq!(decoded.correlation_id, Some(99));
        assert_eq!(decoded.mutex_name(), Some("counter"));
        assert_eq!(decoded.body, json!({"k": 1}));
    }

    #[test]
    fn test_unrecognised_op_is_none() {
        let mut message = Message::default();
        message.set_property(keys::OP, json!("PATCH"));
        assert_eq!(message.op(), None);
    }
}
