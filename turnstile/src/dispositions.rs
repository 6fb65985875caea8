//! Delivery disposition routing.
//!
//! Sender-side delivery state events (accepted, rejected, released,
//! modified, settled) are folded into per-delivery hooks. Each watched
//! delivery gets a task that waits for state transitions and feeds every
//! snapshot to its hook until the hook is done or the delivery is fully
//! settled on both sides.

use turnstile_core::{DeliveryUpdate, OutboundDelivery};

/// Hook verdict after observing one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Watch {
    Continue,
    Done,
}

pub(crate) struct DispositionRouter;

impl DispositionRouter {
    /// Route `delivery`'s state transitions to `hook`.
    ///
    /// Must be called from within a `LocalSet`.
    pub fn watch<H>(delivery: OutboundDelivery, mut hook: H)
    where
        H: FnMut(&DeliveryUpdate) -> Watch + 'static,
    {
        tokio::task::spawn_local(async move {
            let mut seen_version = 0;
            loop {
                let update = delivery.updated(seen_version).await;
                seen_version = update.version;
                if hook(&update) == Watch::Done {
                    break;
                }
                if update.remotely_settled && update.locally_settled {
                    // Terminal on both sides; nothing further can happen.
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use turnstile_core::{delivery_pair, Outcome};

    use super::*;

    #[tokio::test]
    async fn test_hook_sees_each_transition() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (outbound, inbound) = delivery_pair();
                let seen: Rc<RefCell<Vec<Option<Outcome>>>> = Rc::new(RefCell::new(Vec::new()));
                let sink = seen.clone();

                DispositionRouter::watch(outbound.clone(), move |update| {
                    sink.borrow_mut().push(update.outcome);
                    Watch::Continue
                });

                inbound.accept();
                tokio::task::yield_now().await;
                inbound.settle();
                outbound.settle();
                tokio::task::yield_now().await;

                let seen = seen.borrow();
                assert!(!seen.is_empty());
                assert!(seen.contains(&Some(Outcome::Accepted)));
            })
            .await;
    }

    #[tokio::test]
    async fn test_watch_stops_when_hook_done() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (outbound, inbound) = delivery_pair();
                let calls = Rc::new(RefCell::new(0));
                let counter = calls.clone();

                DispositionRouter::watch(outbound, move |_| {
                    *counter.borrow_mut() += 1;
                    Watch::Done
                });

                inbound.accept();
                tokio::task::yield_now().await;
                inbound.settle();
                tokio::task::yield_now().await;

                assert_eq!(*calls.borrow(), 1);
            })
            .await;
    }
}
