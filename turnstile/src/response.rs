//! One-shot reply builder.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;
use turnstile_core::{keys, status, Message, MessageSender};

use crate::error::ApiError;

/// Builder for the single reply to one request.
///
/// Handlers set a status and description, then emit exactly once with
/// [`send`](Response::send) or [`end`](Response::end). Emission is the
/// one-shot gate: a second `send`/`end` on the same response (or any of its
/// clones) fails with [`ApiError::ResponseAlreadySent`].
///
/// The reply is addressed at the request's `reply_to` and carries its
/// correlation id. A request with no reply address gets no reply; emission
/// still succeeds so handlers need not care.
#[derive(Clone)]
pub struct Response {
    state: Rc<RefCell<ResponseState>>,
}

struct ResponseState {
    anon: Rc<dyn MessageSender>,
    to: Option<String>,
    correlation_id: Option<u64>,
    status: u16,
    description: Option<String>,
    properties: BTreeMap<String, Value>,
    sent: bool,
}

impl Response {
    pub(crate) fn new(anon: Rc<dyn MessageSender>, request: &Message) -> Self {
        Self {
            state: Rc::new(RefCell::new(ResponseState {
                anon,
                to: request.reply_to.clone(),
                correlation_id: request.correlation_id,
                status: status::OK,
                description: None,
                properties: BTreeMap::new(),
                sent: false,
            })),
        }
    }

    /// Set the status code. Defaults to 200.
    pub fn status(&self, code: u16) -> &Self {
        self.state.borrow_mut().status = code;
        self
    }

    /// Set the status description.
    pub fn description(&self, text: impl Into<String>) -> &Self {
        self.state.borrow_mut().description = Some(text.into());
        self
    }

    /// Set an extra application property on the reply.
    pub fn property(&self, key: &str, value: Value) -> &Self {
        self.state
            .borrow_mut()
            .properties
            .insert(key.to_string(), value);
        self
    }

    /// Emit the reply with `body`.
    pub async fn send(&self, body: Value) -> Result<(), ApiError> {
        let (message, anon) = self.take_message(body)?;
        let Some(message) = message else {
            return Ok(());
        };
        anon.sendable().await?;
        anon.send(message)?;
        Ok(())
    }

    /// Emit the reply with no body.
    pub async fn end(&self) -> Result<(), ApiError> {
        self.send(Value::Null).await
    }

    /// Whether the reply has been emitted.
    pub fn is_sent(&self) -> bool {
        self.state.borrow().sent
    }

    /// Atomically claim the one-shot emission and build the wire message.
    /// `Ok(None)` means the request had nowhere to reply to.
    #[allow(clippy::type_complexity)]
    fn take_message(
        &self,
        body: Value,
    ) -> Result<(Option<Message>, Rc<dyn MessageSender>), ApiError> {
        let mut state = self.state.borrow_mut();
        if state.sent {
            return Err(ApiError::ResponseAlreadySent);
        }
        state.sent = true;

        let anon = Rc::clone(&state.anon);
        let Some(to) = state.to.clone() else {
            tracing::trace!("request had no reply_to, discarding response");
            return Ok((None, anon));
        };

        let mut message = Message::default().with_body(body);
        message.to = Some(to);
        message.correlation_id = state.correlation_id;
        message.set_property(keys::STATUS, Value::from(state.status));
        if let Some(description) = state.description.take() {
            message.set_property(keys::STATUS_DESCRIPTION, Value::String(description));
        }
        for (key, value) in std::mem::take(&mut state.properties) {
            message.set_property(&key, value);
        }
        Ok((Some(message), anon))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use turnstile_core::{MemoryTransport, MessageReceiver, Operation, Transport};

    use super::*;

    async fn request_with_reply(transport: &MemoryTransport) -> (Message, impl MessageReceiver) {
        let (receiver, reply_address) = transport
            .open_dynamic_receiver(8)
            .await
            .expect("open reply receiver");
        let mut request = Message::request(Operation::Get, "/names");
        request.reply_to = Some(reply_address);
        request.correlation_id = Some(5);
        (request, receiver)
    }

    #[tokio::test]
    async fn test_send_addresses_reply() {
        let transport = MemoryTransport::new();
        let (request, receiver) = request_with_reply(&transport).await;
        let anon: Rc<dyn MessageSender> = Rc::new(
            transport
                .open_anonymous_sender()
                .await
                .expect("open anonymous"),
        );

        let response = Response::new(anon, &request);
        response
            .status(200)
            .description("OK")
            .send(json!({"item1": "first"}))
            .await
            .expect("send");

        let (reply, _) = receiver.recv().await.expect("reply delivered");
        assert_eq!(reply.correlation_id, Some(5));
        assert_eq!(reply.status(), Some(200));
        assert_eq!(reply.status_description(), Some("OK"));
        assert_eq!(reply.body, json!({"item1": "first"}));
    }

    #[tokio::test]
    async fn test_second_send_fails() {
        let transport = MemoryTransport::new();
        let (request, _receiver) = request_with_reply(&transport).await;
        let anon: Rc<dyn MessageSender> = Rc::new(
            transport
                .open_anonymous_sender()
                .await
                .expect("open anonymous"),
        );

        let response = Response::new(anon, &request);
        response.end().await.expect("first emission");
        assert!(matches!(
            response.send(json!(1)).await,
            Err(ApiError::ResponseAlreadySent)
        ));
        assert!(response.is_sent());
    }

    #[tokio::test]
    async fn test_clone_shares_one_shot_state() {
        let transport = MemoryTransport::new();
        let (request, _receiver) = request_with_reply(&transport).await;
        let anon: Rc<dyn MessageSender> = Rc::new(
            transport
                .open_anonymous_sender()
                .await
                .expect("open anonymous"),
        );

        let response = Response::new(anon, &request);
        let sibling = response.clone();
        response.end().await.expect("first emission");
        assert!(matches!(
            sibling.end().await,
            Err(ApiError::ResponseAlreadySent)
        ));
    }

    #[tokio::test]
    async fn test_no_reply_address_discards_quietly() {
        let transport = MemoryTransport::new();
        let anon: Rc<dyn MessageSender> = Rc::new(
            transport
                .open_anonymous_sender()
                .await
                .expect("open anonymous"),
        );
        let request = Message::request(Operation::Get, "/names");

        let response = Response::new(anon, &request);
        response.send(json!(1)).await.expect("emission succeeds");
        assert!(response.is_sent());
    }

    #[tokio::test]
    async fn test_extra_property_carried() {
        let transport = MemoryTransport::new();
        let (request, receiver) = request_with_reply(&transport).await;
        let anon: Rc<dyn MessageSender> = Rc::new(
            transport
                .open_anonymous_sender()
                .await
                .expect("open anonymous"),
        );

        let response = Response::new(anon, &request);
        response
            .property(keys::ACQUISITION_ID, json!("abc-1"))
            .end()
            .await
            .expect("send");

        let (reply, _) = receiver.recv().await.expect("reply delivered");
        assert_eq!(reply.acquisition_id(), Some("abc-1"));
    }
}
