//! The transport contract the framework consumes.
//!
//! The framework does not dial sockets or frame bytes; it is written
//! against these traits and works with any session/link transport that can
//! provide dynamic-source receivers, anonymous senders, per-link credit,
//! and manual accept/settle deliveries. [`crate::MemoryTransport`] is the
//! in-tree implementation; a real network binding adapts its library's
//! links to the same shape.
//!
//! All traits are `?Send`: a connection and everything attached to it run
//! on one cooperative executor.
//!
//! Authentication is the transport's concern (a network binding would
//! supply SASL-EXTERNAL identity at dial time); no credentials ever cross
//! this contract.

use async_trait::async_trait;

use crate::delivery::{InboundDelivery, OutboundDelivery};
use crate::message::Message;

/// Errors surfaced by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The link (or its peer) has been closed.
    #[error("link closed")]
    LinkClosed,

    /// A send was attempted without transmit credit.
    #[error("insufficient credit on link")]
    InsufficientCredit,

    /// A receiver already exists at the requested source address.
    #[error("address already in use: {0}")]
    AddressInUse(String),

    /// No receiver exists for the destination address.
    #[error("no route to address: {0}")]
    NoRoute(String),

    /// The underlying connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Sending half of a link.
///
/// Named senders are bound to one destination address and are subject to
/// that link's credit window. Anonymous senders route each message by its
/// `to` field and are treated as always sendable.
#[async_trait(?Send)]
pub trait MessageSender {
    /// Transmit credit currently available on this link.
    fn credit(&self) -> u32;

    /// Wait until at least one unit of credit is available.
    ///
    /// Resolving covers both the peer granting credit and the receiving
    /// link opening in the first place.
    async fn sendable(&self) -> Result<(), TransportError>;

    /// Send a message, consuming one unit of credit on a named link.
    ///
    /// The returned handle tracks the delivery's disposition; callers that
    /// do not care may simply drop it.
    fn send(&self, message: Message) -> Result<OutboundDelivery, TransportError>;
}

/// Receiving half of a link.
///
/// Deliveries are handed out with manual accept and manual settle: a
/// terminal outcome does not settle, and nothing settles implicitly. This
/// is load-bearing for the mutex protocol, where an accepted-but-unsettled
/// delivery represents a held lock.
#[async_trait(?Send)]
pub trait MessageReceiver {
    /// Source address this receiver is attached to.
    fn address(&self) -> &str;

    /// Receive the next message and its delivery.
    ///
    /// Returns `None` once the receiver is closed.
    async fn recv(&self) -> Option<(Message, InboundDelivery)>;

    /// Detach the receiver. Queued undelivered messages are finalised.
    fn close(&self);
}

/// A transport connection's container: the factory for links.
#[async_trait(?Send)]
pub trait Transport: Clone + 'static {
    /// Sender type produced by this transport.
    type Sender: MessageSender + 'static;
    /// Receiver type produced by this transport.
    type Receiver: MessageReceiver + 'static;

    /// Open a sender that routes each message by its `to` field.
    async fn open_anonymous_sender(&self) -> Result<Self::Sender, TransportError>;

    /// Open a sender bound to `address`.
    async fn open_sender(&self, address: &str) -> Result<Self::Sender, TransportError>;

    /// Open a receiver at `address` with the given credit window.
    async fn open_receiver(
        &self,
        address: &str,
        credit: u32,
    ) -> Result<Self::Receiver, TransportError>;

    /// Open a receiver on a transport-assigned (dynamic) source address,
    /// returning the receiver and the address the peer may reply to.
    async fn open_dynamic_receiver(
        &self,
        credit: u32,
    ) -> Result<(Self::Receiver, String), TransportError>;
}
