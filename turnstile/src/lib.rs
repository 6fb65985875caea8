//! # Turnstile
//!
//! A request/response and distributed-mutex API framework layered on a
//! message-oriented transport with delivery dispositions, flow credit, and
//! dynamic reply addresses.
//!
//! Two abstractions share one transport connection:
//!
//! - a client portal issuing REST-like operations to a logical server
//!   address, with per-call timeouts and reply correlation, and
//! - a distributed mutex whose hold is represented by a single delivery's
//!   unsettled state: settling the acquire delivery releases the lock, and
//!   network or peer loss releases it implicitly.
//!
//! ## Architecture
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`ApiConnection`] | Owns the transport, reply receiver, and correlator |
//! | [`ClientEndpoint`] | `fetch` and `critical_section` over two credit lanes |
//! | [`ServerEndpoint`] | Path-routed dispatch, responses, mutex grants |
//! | [`Response`] | One-shot reply builder handed to handlers |
//! | [`PathTrie`] | Slash-segmented exact-match route table |
//!
//! ## Quick start
//!
//! ```ignore
//! use serde_json::json;
//! use turnstile::{ApiConnection, FetchOptions, MemoryTransport};
//!
//! let transport = MemoryTransport::new();
//! let server = ApiConnection::open(transport.clone()).await?;
//! let endpoint = server.server_endpoint("/api").await?;
//! endpoint.get("/names", |_req, res| async move {
//!     res.send(json!({"item1": "first"})).await
//! });
//!
//! let client = ApiConnection::open(transport).await?;
//! let portal = client.client_endpoint("/api").await?;
//! let reply = portal.fetch("/names", FetchOptions::new()).await?;
//! assert_eq!(reply.status(), 200);
//! ```
//!
//! Connections are single-threaded cooperative: open them, and run
//! everything that touches them, inside a `tokio` `LocalSet`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod correlator;
mod dispositions;
mod mutex;
mod outbox;

pub mod client;
pub mod connection;
pub mod error;
pub mod response;
pub mod routing;
pub mod server;

pub use client::{ClientEndpoint, CriticalSectionOptions, FetchOptions, FetchResult};
pub use connection::{ApiConnection, ConnectionStats};
pub use error::ApiError;
pub use response::Response;
pub use routing::PathTrie;
pub use server::ServerEndpoint;

// Re-export the wire model and transport contract so most users need only
// this crate.
pub use turnstile_core::{
    keys, status, Address, InboundDelivery, LinkClass, MemoryTransport, Message, MessageReceiver,
    MessageSender, Operation, OutboundDelivery, Transport, TransportError,
};
