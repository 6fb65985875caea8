//! Per-link-class outgoing queue.
//!
//! Requests wait here until the link has transmit credit. Enqueue order is
//! transmit order within a class; each class has its own outbox, so a
//! credit-starved fetch lane never delays mutex traffic.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use tokio::sync::{oneshot, Notify};
use turnstile_core::{Message, OutboundDelivery};

/// An entry awaiting credit.
pub(crate) struct OutgoingMessage {
    pub message: Message,
    /// Resolved with the delivery handle once the message hits the wire.
    pub sent: Option<oneshot::Sender<OutboundDelivery>>,
}

pub(crate) struct Outbox {
    queue: RefCell<VecDeque<OutgoingMessage>>,
    notify: Notify,
    closed: Cell<bool>,
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            notify: Notify::new(),
            closed: Cell::new(false),
        }
    }

    pub fn push(&self, entry: OutgoingMessage) {
        self.queue.borrow_mut().push_back(entry);
        self.notify.notify_one();
    }

    /// Requeue an entry at the front, preserving transmit order after a
    /// credit race.
    pub fn push_front(&self, entry: OutgoingMessage) {
        self.queue.borrow_mut().push_front(entry);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<OutgoingMessage> {
        self.queue.borrow_mut().pop_front()
    }

    /// Drop a queued entry by correlation id, so a timed-out request never
    /// transmits once credit appears.
    pub fn purge(&self, cid: u64) {
        self.queue
            .borrow_mut()
            .retain(|entry| entry.message.correlation_id != Some(cid));
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Wait until there is work. Returns `false` once the outbox is closed.
    pub async fn ready(&self) -> bool {
        loop {
            if self.closed.get() {
                return false;
            }
            if !self.is_empty() {
                return true;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.set(true);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cid: u64) -> OutgoingMessage {
        let mut message = Message::default();
        message.correlation_id = Some(cid);
        OutgoingMessage {
            message,
            sent: None,
        }
    }

    #[test]
    fn test_fifo_order() {
        let outbox = Outbox::new();
        outbox.push(entry(1));
        outbox.push(entry(2));
        outbox.push(entry(3));

        assert_eq!(outbox.pop().expect("entry").message.correlation_id, Some(1));
        assert_eq!(outbox.pop().expect("entry").message.correlation_id, Some(2));
        assert_eq!(outbox.pop().expect("entry").message.correlation_id, Some(3));
        assert!(outbox.pop().is_none());
    }

    #[test]
    fn test_push_front_restores_head() {
        let outbox = Outbox::new();
        outbox.push(entry(1));
        outbox.push(entry(2));

        let head = outbox.pop().expect("entry");
        outbox.push_front(head);
        assert_eq!(outbox.pop().expect("entry").message.correlation_id, Some(1));
    }

    #[test]
    fn test_purge_removes_by_cid() {
        let outbox = Outbox::new();
        outbox.push(entry(1));
        outbox.push(entry(2));
        outbox.push(entry(3));

        outbox.purge(2);
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.pop().expect("entry").message.correlation_id, Some(1));
        assert_eq!(outbox.pop().expect("entry").message.correlation_id, Some(3));
    }

    #[tokio::test]
    async fn test_ready_returns_immediately_with_work() {
        let outbox = Outbox::new();
        outbox.push(entry(1));
        assert!(outbox.ready().await);
    }

    #[tokio::test]
    async fn test_ready_false_after_close() {
        let outbox = Outbox::new();
        outbox.close();
        assert!(!outbox.ready().await);
    }

    #[tokio::test]
    async fn test_ready_wakes_on_push() {
        let outbox = std::rc::Rc::new(Outbox::new());
        let pusher = outbox.clone();
        let (ready, ()) = tokio::join!(outbox.ready(), async move {
            pusher.push(entry(9));
        });
        assert!(ready);
    }
}
