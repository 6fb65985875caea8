//! Server-side distributed mutex.
//!
//! One [`MutexInstance`] is the wait-queue state machine for one named
//! lock. The queue head is the current holder; everyone behind it is a
//! waiter in FIFO accept order. Holding is represented entirely by
//! delivery state: granting accepts the head's delivery and replies 200,
//! and the client settling that delivery is the release. Queue transitions
//! never cross an await point, so "settle, pop, grant next" is atomic with
//! respect to the event loop.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use turnstile_core::{keys, status, InboundDelivery, Message, MessageSender};

/// Generator of per-grant acquisition ids, unique for an endpoint's
/// lifetime: a random endpoint prefix plus a monotonic counter.
pub(crate) struct AcquisitionIds {
    prefix: u64,
    next: Cell<u64>,
}

impl AcquisitionIds {
    pub fn new() -> Self {
        Self {
            prefix: rand::thread_rng().gen(),
            next: Cell::new(1),
        }
    }

    pub fn mint(&self) -> String {
        let n = self.next.get();
        self.next.set(n + 1);
        format!("{:016x}-{n}", self.prefix)
    }
}

/// Shared server-endpoint context the mutex machinery replies through.
pub(crate) struct MutexContext {
    pub anon: Rc<dyn MessageSender>,
    pub ids: AcquisitionIds,
}

/// Named mutexes of one handler node, created lazily on first acquire.
pub(crate) struct MutexSet {
    instances: RefCell<HashMap<String, Rc<MutexInstance>>>,
}

impl MutexSet {
    pub fn new() -> Self {
        Self {
            instances: RefCell::new(HashMap::new()),
        }
    }

    /// Route an acquire to its named instance, creating it on first use.
    pub fn acquire(
        &self,
        ctx: &Rc<MutexContext>,
        name: &str,
        message: Message,
        delivery: InboundDelivery,
    ) {
        let instance = Rc::clone(
            self.instances
                .borrow_mut()
                .entry(name.to_string())
                .or_insert_with(|| Rc::new(MutexInstance::new(name, Rc::clone(ctx)))),
        );
        MutexInstance::enqueue(&instance, message, delivery);
    }

    pub fn get(&self, name: &str) -> Option<Rc<MutexInstance>> {
        self.instances.borrow().get(name).cloned()
    }
}

struct AcquireEntry {
    id: u64,
    message: Message,
    delivery: InboundDelivery,
}

/// FIFO wait-queue state machine for one named lock.
pub(crate) struct MutexInstance {
    name: String,
    ctx: Rc<MutexContext>,
    queue: RefCell<VecDeque<AcquireEntry>>,
    next_entry: Cell<u64>,
}

impl MutexInstance {
    fn new(name: &str, ctx: Rc<MutexContext>) -> Self {
        Self {
            name: name.to_string(),
            ctx,
            queue: RefCell::new(VecDeque::new()),
            next_entry: Cell::new(1),
        }
    }

    /// Append an acquire. If the queue was empty it becomes the holder and
    /// is granted immediately; otherwise a `wait_time` budget (if any)
    /// starts counting.
    fn enqueue(this: &Rc<Self>, message: Message, delivery: InboundDelivery) {
        let entry_id = this.next_entry.get();
        this.next_entry.set(entry_id + 1);
        let wait_time = message.wait_time();
        tracing::debug!(
            mutex = %this.name,
            label = message.label().unwrap_or_default(),
            "acquire received"
        );

        let was_empty = {
            let mut queue = this.queue.borrow_mut();
            let was_empty = queue.is_empty();
            queue.push_back(AcquireEntry {
                id: entry_id,
                message,
                delivery,
            });
            was_empty
        };

        if was_empty {
            Self::grant_head(this);
        } else if let Some(wait_time) = wait_time {
            // The head never waits, so only queued entries arm a timer.
            let this = Rc::clone(this);
            tokio::task::spawn_local(async move {
                tokio::time::sleep(wait_time).await;
                Self::expire(&this, entry_id, wait_time).await;
            });
        }
    }

    /// Grant the queue head: watch its delivery for the release signal,
    /// accept it (informing the client it holds the queue slot), and reply
    /// 200 with a fresh acquisition id.
    fn grant_head(this: &Rc<Self>) {
        let (entry_id, message, delivery) = {
            let queue = this.queue.borrow();
            let Some(head) = queue.front() else {
                return;
            };
            (head.id, head.message.clone(), head.delivery.clone())
        };

        // The client settling (or the link terminating) releases the lock.
        {
            let this = Rc::clone(this);
            let delivery = delivery.clone();
            tokio::task::spawn_local(async move {
                delivery.remote_settled().await;
                Self::release(&this, entry_id);
            });
        }

        delivery.accept();

        let acquisition_id = this.ctx.ids.mint();
        tracing::debug!(
            mutex = %this.name,
            acquisition_id = %acquisition_id,
            "mutex granted"
        );

        let mut reply = Message::response_to(&message);
        reply.set_property(keys::STATUS, Value::from(status::OK));
        reply.set_property(keys::STATUS_DESCRIPTION, Value::from("OK"));
        reply.set_property(keys::ACQUISITION_ID, Value::String(acquisition_id));

        let anon = Rc::clone(&this.ctx.anon);
        let name = this.name.clone();
        tokio::task::spawn_local(async move {
            if anon.sendable().await.is_ok() {
                if let Err(error) = anon.send(reply) {
                    tracing::warn!(mutex = %name, %error, "failed to send grant reply");
                }
            }
        });
    }

    /// The holder released (or the link died): settle, pop, grant the next
    /// head if any.
    fn release(this: &Rc<Self>, entry_id: u64) {
        let grant_next = {
            let mut queue = this.queue.borrow_mut();
            match queue.front() {
                Some(head) if head.id == entry_id => {
                    head.delivery.settle();
                    queue.pop_front();
                    !queue.is_empty()
                }
                // Stale watcher: the entry already left the queue.
                _ => false,
            }
        };
        if grant_next {
            tracing::trace!(mutex = %this.name, "holder released, granting next waiter");
            Self::grant_head(this);
        } else {
            tracing::trace!(mutex = %this.name, "holder released");
        }
    }

    /// A queued waiter's `wait_time` budget ran out. If it is still queued
    /// and not the holder, answer 408 and retire its delivery.
    async fn expire(this: &Rc<Self>, entry_id: u64, wait_time: Duration) {
        let expired = {
            let mut queue = this.queue.borrow_mut();
            match queue.iter().position(|entry| entry.id == entry_id) {
                // Position zero is the holder; its timer is void.
                Some(0) | None => None,
                Some(position) => queue.remove(position),
            }
        };
        let Some(entry) = expired else {
            return;
        };

        tracing::debug!(mutex = %this.name, ?wait_time, "queued acquire expired");
        let mut reply = Message::response_to(&entry.message);
        reply.set_property(keys::STATUS, Value::from(status::WAIT_EXPIRED));
        reply.set_property(
            keys::STATUS_DESCRIPTION,
            Value::from("Timed out waiting for the mutex"),
        );

        // Reply before settling so the waiter learns the verdict ahead of
        // the disposition change.
        let anon = Rc::clone(&this.ctx.anon);
        if anon.sendable().await.is_ok() {
            if let Err(error) = anon.send(reply) {
                tracing::warn!(mutex = %this.name, %error, "failed to send expiry reply");
            }
        }
        entry.delivery.accept_and_settle();
    }

    /// Forcibly release the current holder. Not part of normal operation;
    /// the holder observes this as a premature drop.
    pub fn drop_head(this: &Rc<Self>) -> bool {
        let entry_id = {
            let queue = this.queue.borrow();
            match queue.front() {
                Some(head) => head.id,
                None => return false,
            }
        };
        tracing::warn!(mutex = %this.name, "dropping current holder");
        Self::release(this, entry_id);
        true
    }

    /// Queue length, holder included.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.borrow().len()
    }
}
