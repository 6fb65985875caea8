//! # Turnstile Core
//!
//! Wire model and transport contract for the turnstile API framework.
//!
//! This crate defines everything both halves of a turnstile connection agree
//! on, independent of any concrete transport:
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`Address`] / [`LinkClass`] | Endpoint addressing and per-class link derivation |
//! | [`Message`] | Routed message: `to`, `reply_to`, `correlation_id`, properties, body |
//! | [`OutboundDelivery`] / [`InboundDelivery`] | Two ends of one delivery's disposition state |
//! | [`Transport`] | Contract the framework consumes: senders, receivers, credit |
//! | [`MemoryTransport`] | In-process loopback implementation of the contract |
//!
//! ## Delivery semantics
//!
//! Deliveries carry meaning beyond payload transfer: the terminal state
//! (accepted, rejected, released, modified) and the two independent
//! settlement flags are protocol signals. In particular, the protocol layer
//! uses "sender settled its delivery" as the release signal for a held
//! mutex, so receivers must be able to observe remote settlement and must
//! never auto-settle on a terminal disposition.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod delivery;
mod memory;
mod message;
mod transport;

pub use address::{Address, LinkClass};
pub use delivery::{
    delivery_pair, DeliveryUpdate, InboundDelivery, Outcome, OutboundDelivery, RemoteSettled,
    Updated,
};
pub use memory::{MemoryReceiver, MemorySender, MemoryTransport, DEFAULT_CREDIT};
pub use message::{keys, status, Message, Operation, OperationParseError};
pub use transport::{MessageReceiver, MessageSender, Transport, TransportError};
