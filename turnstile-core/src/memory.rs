//! In-process transport.
//!
//! A [`MemoryTransport`] is a handle onto a shared hub; clones talk to the
//! same hub, so two connections built from clones of one transport can
//! reach each other. Routing is by exact address. Each receiver owns a FIFO
//! queue and a credit window: sends consume credit, and consuming a message
//! replenishes it, which gives named senders real back-pressure. A named
//! sender whose address has no receiver has no credit, so its traffic
//! parks upstream — exactly the behaviour the framework's outbox layer is
//! built around.
//!
//! Delivery pairs are wired directly, so dispositions and settlement are
//! visible to the other side as soon as the observing task runs.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;

use crate::delivery::{delivery_pair, InboundDelivery, OutboundDelivery};
use crate::message::Message;
use crate::transport::{MessageReceiver, MessageSender, Transport, TransportError};

/// Default credit window for receivers whose callers do not care.
pub const DEFAULT_CREDIT: u32 = 64;

#[derive(Default)]
struct Hub {
    receivers: HashMap<String, Rc<ReceiverShared>>,
    sendable_wakers: HashMap<String, Vec<Waker>>,
    next_dynamic: u64,
}

impl Hub {
    fn wake_senders(&mut self, address: &str) {
        if let Some(wakers) = self.sendable_wakers.get_mut(address) {
            for waker in wakers.drain(..) {
                waker.wake();
            }
        }
    }
}

struct ReceiverShared {
    address: String,
    queue: RefCell<VecDeque<(Message, InboundDelivery)>>,
    credit: Cell<u32>,
    recv_wakers: RefCell<Vec<Waker>>,
    closed: Cell<bool>,
}

/// In-process loopback transport.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Rc<RefCell<Hub>>,
}

impl MemoryTransport {
    /// Create a fresh hub. Clone the handle to share it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open receivers, for tests and diagnostics.
    pub fn receiver_count(&self) -> usize {
        self.hub.borrow().receivers.len()
    }
}

#[async_trait(?Send)]
impl Transport for MemoryTransport {
    type Sender = MemorySender;
    type Receiver = MemoryReceiver;

    async fn open_anonymous_sender(&self) -> Result<Self::Sender, TransportError> {
        Ok(MemorySender {
            hub: Rc::clone(&self.hub),
            target: None,
        })
    }

    async fn open_sender(&self, address: &str) -> Result<Self::Sender, TransportError> {
        Ok(MemorySender {
            hub: Rc::clone(&self.hub),
            target: Some(address.to_string()),
        })
    }

    async fn open_receiver(
        &self,
        address: &str,
        credit: u32,
    ) -> Result<Self::Receiver, TransportError> {
        let shared = {
            let mut hub = self.hub.borrow_mut();
            if hub.receivers.contains_key(address) {
                return Err(TransportError::AddressInUse(address.to_string()));
            }
            let shared = Rc::new(ReceiverShared {
                address: address.to_string(),
                queue: RefCell::new(VecDeque::new()),
                credit: Cell::new(credit),
                recv_wakers: RefCell::new(Vec::new()),
                closed: Cell::new(false),
            });
            hub.receivers.insert(address.to_string(), Rc::clone(&shared));
            // Opening the receiving link is what makes the sender sendable.
            hub.wake_senders(address);
            shared
        };
        tracing::trace!(address, credit, "receiver opened");
        Ok(MemoryReceiver {
            hub: Rc::clone(&self.hub),
            shared,
        })
    }

    async fn open_dynamic_receiver(
        &self,
        credit: u32,
    ) -> Result<(Self::Receiver, String), TransportError> {
        let address = {
            let mut hub = self.hub.borrow_mut();
            hub.next_dynamic += 1;
            format!("/$dynamic/{:06}", hub.next_dynamic)
        };
        let receiver = self.open_receiver(&address, credit).await?;
        Ok((receiver, address))
    }
}

/// Sending half of a memory link.
#[derive(Clone)]
pub struct MemorySender {
    hub: Rc<RefCell<Hub>>,
    /// `None` for an anonymous sender routing by each message's `to` field.
    target: Option<String>,
}

impl MemorySender {
    fn deliver(
        &self,
        address: &str,
        message: Message,
        consume_credit: bool,
    ) -> Result<OutboundDelivery, TransportError> {
        let receiver = self.hub.borrow().receivers.get(address).cloned();
        let Some(receiver) = receiver else {
            if consume_credit {
                return Err(TransportError::NoRoute(address.to_string()));
            }
            tracing::trace!(address, "dropping message for absent address");
            return Ok(dropped_delivery());
        };
        if receiver.closed.get() {
            if consume_credit {
                return Err(TransportError::LinkClosed);
            }
            return Ok(dropped_delivery());
        }
        if consume_credit {
            let credit = receiver.credit.get();
            if credit == 0 {
                return Err(TransportError::InsufficientCredit);
            }
            receiver.credit.set(credit - 1);
        }

        let (outbound, inbound) = delivery_pair();
        receiver.queue.borrow_mut().push_back((message, inbound));
        for waker in receiver.recv_wakers.borrow_mut().drain(..) {
            waker.wake();
        }
        Ok(outbound)
    }
}

/// A delivery for a message nobody will ever see: finalised on creation so
/// any observer resolves immediately.
fn dropped_delivery() -> OutboundDelivery {
    let (outbound, inbound) = delivery_pair();
    inbound.terminate();
    outbound
}

#[async_trait(?Send)]
impl MessageSender for MemorySender {
    fn credit(&self) -> u32 {
        match &self.target {
            None => u32::MAX,
            Some(target) => self
                .hub
                .borrow()
                .receivers
                .get(target)
                .filter(|r| !r.closed.get())
                .map(|r| r.credit.get())
                .unwrap_or(0),
        }
    }

    async fn sendable(&self) -> Result<(), TransportError> {
        match &self.target {
            None => Ok(()),
            Some(target) => {
                Sendable {
                    hub: Rc::clone(&self.hub),
                    address: target.clone(),
                }
                .await
            }
        }
    }

    fn send(&self, message: Message) -> Result<OutboundDelivery, TransportError> {
        match &self.target {
            Some(target) => self.deliver(&target.clone(), message, true),
            None => {
                let Some(to) = message.to.clone() else {
                    tracing::trace!("anonymous send without a to address, dropping");
                    return Ok(dropped_delivery());
                };
                self.deliver(&to, message, false)
            }
        }
    }
}

struct Sendable {
    hub: Rc<RefCell<Hub>>,
    address: String,
}

impl Future for Sendable {
    type Output = Result<(), TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut hub = self.hub.borrow_mut();
        if let Some(receiver) = hub.receivers.get(&self.address) {
            if !receiver.closed.get() && receiver.credit.get() > 0 {
                return Poll::Ready(Ok(()));
            }
        }
        hub.sendable_wakers
            .entry(self.address.clone())
            .or_default()
            .push(cx.waker().clone());
        Poll::Pending
    }
}

/// Receiving half of a memory link.
pub struct MemoryReceiver {
    hub: Rc<RefCell<Hub>>,
    shared: Rc<ReceiverShared>,
}

#[async_trait(?Send)]
impl MessageReceiver for MemoryReceiver {
    fn address(&self) -> &str {
        &self.shared.address
    }

    async fn recv(&self) -> Option<(Message, InboundDelivery)> {
        Recv {
            hub: Rc::clone(&self.hub),
            shared: Rc::clone(&self.shared),
        }
        .await
    }

    fn close(&self) {
        if self.shared.closed.replace(true) {
            return;
        }
        // Undelivered messages will never be processed.
        for (_, delivery) in self.shared.queue.borrow_mut().drain(..) {
            delivery.terminate();
        }
        for waker in self.shared.recv_wakers.borrow_mut().drain(..) {
            waker.wake();
        }
        let mut hub = self.hub.borrow_mut();
        hub.receivers.remove(&self.shared.address);
        hub.wake_senders(&self.shared.address);
        tracing::trace!(address = %self.shared.address, "receiver closed");
    }
}

struct Recv {
    hub: Rc<RefCell<Hub>>,
    shared: Rc<ReceiverShared>,
}

impl Future for Recv {
    type Output = Option<(Message, InboundDelivery)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared.closed.get() {
            return Poll::Ready(None);
        }
        let popped = self.shared.queue.borrow_mut().pop_front();
        if let Some(item) = popped {
            // Consuming a message replenishes the credit window.
            self.shared.credit.set(self.shared.credit.get() + 1);
            self.hub.borrow_mut().wake_senders(&self.shared.address);
            return Poll::Ready(Some(item));
        }
        self.shared.recv_wakers.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::Operation;

    #[tokio::test]
    async fn test_send_and_recv_roundtrip() {
        let transport = MemoryTransport::new();
        let receiver = transport
            .open_receiver("/a", DEFAULT_CREDIT)
            .await
            .expect("open receiver");
        let sender = transport.open_sender("/a").await.expect("open sender");

        sender
            .send(Message::request(Operation::Get, "/x").with_body(json!(1)))
            .expect("send");

        let (message, _delivery) = receiver.recv().await.expect("receive");
        assert_eq!(message.path(), Some("/x"));
        assert_eq!(message.body, json!(1));
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let transport = MemoryTransport::new();
        let receiver = transport
            .open_receiver("/a", DEFAULT_CREDIT)
            .await
            .expect("open receiver");
        let sender = transport.open_sender("/a").await.expect("open sender");

        for i in 0..5 {
            sender
                .send(Message::default().with_body(json!(i)))
                .expect("send");
        }
        for i in 0..5 {
            let (message, _) = receiver.recv().await.expect("receive");
            assert_eq!(message.body, json!(i));
        }
    }

    #[tokio::test]
    async fn test_no_receiver_means_no_credit() {
        let transport = MemoryTransport::new();
        let sender = transport.open_sender("/nobody").await.expect("open sender");
        assert_eq!(sender.credit(), 0);
        assert!(matches!(
            sender.send(Message::default()),
            Err(TransportError::InsufficientCredit)
        ));
    }

    #[tokio::test]
    async fn test_sendable_resolves_when_receiver_opens() {
        let transport = MemoryTransport::new();
        let sender = transport.open_sender("/late").await.expect("open sender");

        // Poll the sendable wait and the receiver open concurrently; the
        // open is what unblocks the wait.
        let (sendable, receiver) = tokio::join!(sender.sendable(), async {
            transport.open_receiver("/late", 4).await.expect("open receiver")
        });
        sendable.expect("sendable after receiver open");
        assert_eq!(sender.credit(), 4);
        drop(receiver);
    }

    #[tokio::test]
    async fn test_credit_consumed_and_replenished() {
        let transport = MemoryTransport::new();
        let receiver = transport.open_receiver("/a", 2).await.expect("open receiver");
        let sender = transport.open_sender("/a").await.expect("open sender");

        assert_eq!(sender.credit(), 2);
        sender.send(Message::default()).expect("send 1");
        sender.send(Message::default()).expect("send 2");
        assert_eq!(sender.credit(), 0);
        assert!(matches!(
            sender.send(Message::default()),
            Err(TransportError::InsufficientCredit)
        ));

        receiver.recv().await.expect("receive");
        assert_eq!(sender.credit(), 1);
        sender.send(Message::default()).expect("send 3");
    }

    #[tokio::test]
    async fn test_anonymous_sender_routes_by_to() {
        let transport = MemoryTransport::new();
        let receiver = transport
            .open_receiver("/inbox", DEFAULT_CREDIT)
            .await
            .expect("open receiver");
        let anon = transport
            .open_anonymous_sender()
            .await
            .expect("open anonymous");

        let mut message = Message::default().with_body(json!("hi"));
        message.to = Some("/inbox".to_string());
        anon.send(message).expect("send");

        let (received, _) = receiver.recv().await.expect("receive");
        assert_eq!(received.body, json!("hi"));
    }

    #[tokio::test]
    async fn test_anonymous_send_to_absent_address_is_dropped() {
        let transport = MemoryTransport::new();
        let anon = transport
            .open_anonymous_sender()
            .await
            .expect("open anonymous");

        let mut message = Message::default();
        message.to = Some("/ghost".to_string());
        let delivery = anon.send(message).expect("send");
        // Finalised immediately so nobody waits on it.
        assert!(delivery.remotely_settled());
    }

    #[tokio::test]
    async fn test_duplicate_receiver_address_rejected() {
        let transport = MemoryTransport::new();
        let _first = transport.open_receiver("/a", 1).await.expect("open first");
        let second = transport.open_receiver("/a", 1).await;
        assert!(matches!(second, Err(TransportError::AddressInUse(a)) if a == "/a"));
    }

    #[tokio::test]
    async fn test_dynamic_receiver_addresses_are_unique() {
        let transport = MemoryTransport::new();
        let (_r1, a1) = transport
            .open_dynamic_receiver(DEFAULT_CREDIT)
            .await
            .expect("open dynamic 1");
        let (_r2, a2) = transport
            .open_dynamic_receiver(DEFAULT_CREDIT)
            .await
            .expect("open dynamic 2");
        assert_ne!(a1, a2);
        assert!(a1.starts_with('/'));
    }

    #[tokio::test]
    async fn test_close_terminates_undelivered() {
        let transport = MemoryTransport::new();
        let receiver = transport.open_receiver("/a", 4).await.expect("open receiver");
        let sender = transport.open_sender("/a").await.expect("open sender");

        let delivery = sender.send(Message::default()).expect("send");
        receiver.close();

        assert!(delivery.remotely_settled());
        assert!(receiver.recv().await.is_none());
        assert_eq!(sender.credit(), 0);
    }

    #[tokio::test]
    async fn test_delivery_dispositions_cross_the_link() {
        let transport = MemoryTransport::new();
        let receiver = transport.open_receiver("/a", 4).await.expect("open receiver");
        let sender = transport.open_sender("/a").await.expect("open sender");

        let outbound = sender.send(Message::default()).expect("send");
        let (_, inbound) = receiver.recv().await.expect("receive");

        inbound.accept();
        assert_eq!(
            outbound.remote_outcome(),
            Some(crate::delivery::Outcome::Accepted)
        );

        outbound.settle();
        assert!(inbound.remotely_settled());
    }
}
