//! Shared per-delivery disposition state.
//!
//! A delivery has two half-views over one state cell: the sender holds an
//! [`OutboundDelivery`], the receiver an [`InboundDelivery`]. The receiver
//! records the terminal outcome (accept/reject) and its own settlement; the
//! sender records its own settlement. Each side can asynchronously observe
//! the other's transitions, which is what lets settlement act as a protocol
//! signal: settling an `acquire` delivery on the sender side is the mutex
//! release, and a receiver-side settle before the sender settles is a
//! unilateral drop.
//!
//! State is `Rc<RefCell<...>>` with stored wakers, for single-threaded
//! cooperative connections.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Terminal state a receiver applies to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The receiver took responsibility for the message.
    Accepted,
    /// The receiver refused the message as invalid.
    Rejected,
    /// The message was not (and will not be) processed.
    Released,
    /// The message was not processed and should be modified on redelivery.
    Modified,
}

/// Snapshot of a delivery's state, from the sender's point of view.
///
/// `version` increases on every transition; pass the last seen version to
/// [`OutboundDelivery::updated`] to wait for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryUpdate {
    /// Transition counter, starting at zero for an untouched delivery.
    pub version: u64,
    /// Terminal outcome applied by the receiver, if any.
    pub outcome: Option<Outcome>,
    /// Whether the receiver has settled the delivery.
    pub remotely_settled: bool,
    /// Whether the sender has settled the delivery.
    pub locally_settled: bool,
}

#[derive(Debug, Default)]
struct DeliveryCell {
    outcome: Option<Outcome>,
    sender_settled: bool,
    receiver_settled: bool,
    version: u64,
    wakers: Vec<Waker>,
}

impl DeliveryCell {
    fn bump(&mut self) {
        self.version += 1;
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }
}

/// Sender-side view of a delivery.
#[derive(Debug, Clone)]
pub struct OutboundDelivery {
    cell: Rc<RefCell<DeliveryCell>>,
}

/// Receiver-side view of a delivery.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    cell: Rc<RefCell<DeliveryCell>>,
}

/// Create the two linked half-views of a fresh delivery.
pub fn delivery_pair() -> (OutboundDelivery, InboundDelivery) {
    let cell = Rc::new(RefCell::new(DeliveryCell::default()));
    (
        OutboundDelivery { cell: Rc::clone(&cell) },
        InboundDelivery { cell },
    )
}

impl OutboundDelivery {
    /// Current state snapshot.
    pub fn update(&self) -> DeliveryUpdate {
        let cell = self.cell.borrow();
        DeliveryUpdate {
            version: cell.version,
            outcome: cell.outcome,
            remotely_settled: cell.receiver_settled,
            locally_settled: cell.sender_settled,
        }
    }

    /// Settle the delivery locally. Idempotent.
    pub fn settle(&self) {
        let mut cell = self.cell.borrow_mut();
        if !cell.sender_settled {
            cell.sender_settled = true;
            cell.bump();
        }
    }

    /// Whether this side has settled.
    pub fn locally_settled(&self) -> bool {
        self.cell.borrow().sender_settled
    }

    /// Whether the receiver has settled.
    pub fn remotely_settled(&self) -> bool {
        self.cell.borrow().receiver_settled
    }

    /// Terminal outcome applied by the receiver, if any.
    pub fn remote_outcome(&self) -> Option<Outcome> {
        self.cell.borrow().outcome
    }

    /// Wait for the first transition after `seen_version`.
    ///
    /// Resolves immediately if the state has already moved past it.
    pub fn updated(&self, seen_version: u64) -> Updated {
        Updated {
            delivery: self.clone(),
            seen_version,
        }
    }
}

impl InboundDelivery {
    /// Apply the accepted outcome. The first terminal outcome wins.
    pub fn accept(&self) {
        self.apply_outcome(Outcome::Accepted);
    }

    /// Apply the rejected outcome. The first terminal outcome wins.
    pub fn reject(&self) {
        self.apply_outcome(Outcome::Rejected);
    }

    fn apply_outcome(&self, outcome: Outcome) {
        let mut cell = self.cell.borrow_mut();
        if cell.outcome.is_none() {
            cell.outcome = Some(outcome);
            cell.bump();
        }
    }

    /// Settle the delivery on the receiver side. Idempotent.
    ///
    /// Settling is deliberately separate from the terminal outcome: the
    /// protocol keeps `acquire` deliveries accepted-but-unsettled for as
    /// long as the lock is held.
    pub fn settle(&self) {
        let mut cell = self.cell.borrow_mut();
        if !cell.receiver_settled {
            cell.receiver_settled = true;
            cell.bump();
        }
    }

    /// Accept and settle in one transition.
    pub fn accept_and_settle(&self) {
        let mut cell = self.cell.borrow_mut();
        let mut changed = false;
        if cell.outcome.is_none() {
            cell.outcome = Some(Outcome::Accepted);
            changed = true;
        }
        if !cell.receiver_settled {
            cell.receiver_settled = true;
            changed = true;
        }
        if changed {
            cell.bump();
        }
    }

    /// Whether the sender has settled.
    pub fn remotely_settled(&self) -> bool {
        self.cell.borrow().sender_settled
    }

    /// Whether this side has settled.
    pub fn locally_settled(&self) -> bool {
        self.cell.borrow().receiver_settled
    }

    /// Wait until the sender settles.
    ///
    /// For an `acquire` delivery this is the release signal.
    pub fn remote_settled(&self) -> RemoteSettled {
        RemoteSettled {
            delivery: self.clone(),
        }
    }

    /// Finalise both sides, marking an undeliverable or torn-down delivery.
    ///
    /// Link termination implicitly releases whatever the delivery
    /// represented, so observers on either side resolve.
    pub(crate) fn terminate(&self) {
        let mut cell = self.cell.borrow_mut();
        if cell.outcome.is_none() {
            cell.outcome = Some(Outcome::Released);
        }
        if !cell.sender_settled || !cell.receiver_settled {
            cell.sender_settled = true;
            cell.receiver_settled = true;
            cell.bump();
        }
    }
}

/// Future returned by [`OutboundDelivery::updated`].
pub struct Updated {
    delivery: OutboundDelivery,
    seen_version: u64,
}

impl Future for Updated {
    type Output = DeliveryUpdate;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.delivery.cell.borrow_mut();
        if cell.version > self.seen_version {
            return Poll::Ready(DeliveryUpdate {
                version: cell.version,
                outcome: cell.outcome,
                remotely_settled: cell.receiver_settled,
                locally_settled: cell.sender_settled,
            });
        }
        cell.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

/// Future returned by [`InboundDelivery::remote_settled`].
pub struct RemoteSettled {
    delivery: InboundDelivery,
}

impl Future for RemoteSettled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.delivery.cell.borrow_mut();
        if cell.sender_settled {
            return Poll::Ready(());
        }
        cell.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_delivery_is_untouched() {
        let (outbound, inbound) = delivery_pair();
        let update = outbound.update();
        assert_eq!(update.version, 0);
        assert_eq!(update.outcome, None);
        assert!(!update.remotely_settled);
        assert!(!update.locally_settled);
        assert!(!inbound.remotely_settled());
    }

    #[test]
    fn test_accept_visible_to_sender() {
        let (outbound, inbound) = delivery_pair();
        inbound.accept();
        assert_eq!(outbound.remote_outcome(), Some(Outcome::Accepted));
        assert!(!outbound.remotely_settled());
    }

    #[test]
    fn test_first_outcome_wins() {
        let (outbound, inbound) = delivery_pair();
        inbound.accept();
        inbound.reject();
        assert_eq!(outbound.remote_outcome(), Some(Outcome::Accepted));
    }

    #[test]
    fn test_settlement_sides_are_independent() {
        let (outbound, inbound) = delivery_pair();
        inbound.accept();
        inbound.settle();
        assert!(outbound.remotely_settled());
        assert!(!outbound.locally_settled());

        outbound.settle();
        assert!(inbound.remotely_settled());
    }

    #[test]
    fn test_settle_is_idempotent() {
        let (outbound, _inbound) = delivery_pair();
        outbound.settle();
        let version = outbound.update().version;
        outbound.settle();
        assert_eq!(outbound.update().version, version);
    }

    #[test]
    fn test_version_advances_per_transition() {
        let (outbound, inbound) = delivery_pair();
        inbound.accept();
        let after_accept = outbound.update().version;
        inbound.settle();
        let after_settle = outbound.update().version;
        assert!(after_settle > after_accept);
    }

    #[test]
    fn test_terminate_settles_both_sides() {
        let (outbound, inbound) = delivery_pair();
        inbound.terminate();
        let update = outbound.update();
        assert!(update.remotely_settled);
        assert!(update.locally_settled);
        assert_eq!(update.outcome, Some(Outcome::Released));
    }

    #[tokio::test]
    async fn test_updated_resolves_on_transition() {
        let (outbound, inbound) = delivery_pair();
        let waiting = outbound.updated(0);
        inbound.accept();
        let update = waiting.await;
        assert_eq!(update.outcome, Some(Outcome::Accepted));
    }

    #[tokio::test]
    async fn test_updated_resolves_immediately_when_behind() {
        let (outbound, inbound) = delivery_pair();
        inbound.accept();
        let update = outbound.updated(0).await;
        assert!(update.version > 0);
    }

    #[tokio::test]
    async fn test_remote_settled_resolves_on_sender_settle() {
        let (outbound, inbound) = delivery_pair();
        let waiting = inbound.remote_settled();
        outbound.settle();
        waiting.await;
    }
}
