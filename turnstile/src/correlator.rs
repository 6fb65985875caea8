//! Reply correlation.
//!
//! The correlator is the connection's single reply-routing oracle: every
//! outstanding call owns exactly one entry, keyed by a connection-scoped
//! correlation id. Completions are one-shot channels; the reply loop
//! resolves them, timeouts cancel them, and anything arriving for an
//! unknown id is a late reply and is dropped.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use tokio::sync::oneshot;
use turnstile_core::Message;

pub(crate) struct Correlator {
    next_cid: Cell<u64>,
    in_flight: RefCell<HashMap<u64, oneshot::Sender<Message>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_cid: Cell::new(1),
            in_flight: RefCell::new(HashMap::new()),
        }
    }

    /// Allocate the next correlation id and register its completion.
    ///
    /// Ids increase monotonically and never roll over within a
    /// connection's lifetime.
    pub fn register(&self) -> (u64, oneshot::Receiver<Message>) {
        let cid = self.next_cid.get();
        self.next_cid.set(cid + 1);
        let (tx, rx) = oneshot::channel();
        self.in_flight.borrow_mut().insert(cid, tx);
        (cid, rx)
    }

    /// Remove an entry. Idempotent; returns whether it was present.
    pub fn cancel(&self, cid: u64) -> bool {
        self.in_flight.borrow_mut().remove(&cid).is_some()
    }

    /// Whether an entry is still outstanding.
    pub fn contains(&self, cid: u64) -> bool {
        self.in_flight.borrow().contains_key(&cid)
    }

    /// Route a reply to its waiting completion.
    ///
    /// Returns whether a completion was resolved; replies for unknown or
    /// abandoned ids are dropped.
    pub fn dispatch(&self, cid: u64, message: Message) -> bool {
        let Some(tx) = self.in_flight.borrow_mut().remove(&cid) else {
            tracing::trace!(cid, "dropping late reply");
            return false;
        };
        if tx.send(message).is_err() {
            tracing::trace!(cid, "reply completion abandoned before dispatch");
            return false;
        }
        true
    }

    /// Number of outstanding entries.
    pub fn in_flight(&self) -> usize {
        self.in_flight.borrow().len()
    }

    /// Drop every outstanding completion, failing its waiter.
    pub fn fail_all(&self) {
        let dropped = {
            let mut in_flight = self.in_flight.borrow_mut();
            let count = in_flight.len();
            in_flight.clear();
            count
        };
        if dropped > 0 {
            tracing::debug!(dropped, "failed outstanding requests on connection loss");
        }
    }
}
