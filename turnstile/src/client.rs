//! Client endpoint: `fetch` and `critical_section`.
//!
//! A [`ClientEndpoint`] owns two lanes, one per [`LinkClass`], each a FIFO
//! outbox drained by its own task as transport credit allows. Fetch bursts
//! can exhaust the fetch lane's credit without ever delaying an acquire:
//! the mutex lane has its own window.
//!
//! `critical_section` is where the delivery protocol lives. The acquire
//! delivery's unsettled state *is* the held lock: the grant reply starts
//! the critical section, settling the delivery releases it, and a remote
//! settle before the local one means the server dropped the acquisition
//! out from under us.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use turnstile_core::{
    keys, status, Address, DeliveryUpdate, LinkClass, Message, MessageSender, Operation, Outcome,
    OutboundDelivery, TransportError,
};

use crate::connection::ConnectionCore;
use crate::dispositions::{DispositionRouter, Watch};
use crate::error::ApiError;
use crate::outbox::{Outbox, OutgoingMessage};

/// Options for [`ClientEndpoint::fetch`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Request verb. Defaults to GET.
    pub op: Operation,
    /// Reply deadline. Defaults to ten seconds.
    pub timeout: Duration,
    /// Request body. Defaults to null.
    pub body: Value,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            op: Operation::Get,
            timeout: Duration::from_millis(10_000),
            body: Value::Null,
        }
    }
}

impl FetchOptions {
    /// Default options: GET, ten-second timeout, null body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request verb.
    pub fn op(mut self, op: Operation) -> Self {
        self.op = op;
        self
    }

    /// Set the reply deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// Options for [`ClientEndpoint::critical_section`].
#[derive(Debug, Clone)]
pub struct CriticalSectionOptions {
    /// Deadline for the whole operation, acquisition and critical section
    /// together. Zero means wait forever. Defaults to ten seconds.
    pub timeout: Duration,
    /// Free-form label carried on the acquire, for server-side diagnostics.
    pub label: Option<String>,
    /// Acquire body. Defaults to null.
    pub body: Value,
    /// Server-side queue-wait budget: how long the acquire may sit queued
    /// behind other holders before the server answers 408.
    pub wait_time: Option<Duration>,
}

impl Default for CriticalSectionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            label: None,
            body: Value::Null,
            wait_time: None,
        }
    }
}

impl CriticalSectionOptions {
    /// Default options: ten-second timeout, no label, null body, no queue
    /// budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the whole-operation deadline. Zero waits forever.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the acquire label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the acquire body.
    pub fn body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Set the server-side queue-wait budget.
    pub fn wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = Some(wait_time);
        self
    }
}

/// A completed fetch.
#[derive(Debug)]
pub struct FetchResult {
    message: Message,
}

impl FetchResult {
    /// The reply's status code, zero if the reply carried none.
    pub fn status(&self) -> u16 {
        self.message.status().unwrap_or_default()
    }

    /// The reply's status description, empty if it carried none.
    pub fn description(&self) -> &str {
        self.message.status_description().unwrap_or_default()
    }

    /// The reply body.
    pub fn data(&self) -> &Value {
        &self.message.body
    }

    /// The full reply message.
    pub fn message(&self) -> &Message {
        &self.message
    }
}

struct Lane {
    outbox: Rc<Outbox>,
}

/// Client side of a logical endpoint address.
pub struct ClientEndpoint {
    core: Rc<ConnectionCore>,
    address: Address,
    fetch_lane: Lane,
    mutex_lane: Lane,
}

impl ClientEndpoint {
    pub(crate) fn start(
        core: Rc<ConnectionCore>,
        address: Address,
        fetch_sender: Rc<dyn MessageSender>,
        mutex_sender: Rc<dyn MessageSender>,
    ) -> Self {
        tracing::debug!(address = %address, "client endpoint open");
        let fetch_lane = Lane {
            outbox: Rc::new(Outbox::new()),
        };
        let mutex_lane = Lane {
            outbox: Rc::new(Outbox::new()),
        };
        for (sender, outbox, class) in [
            (fetch_sender, Rc::clone(&fetch_lane.outbox), LinkClass::Fetch),
            (mutex_sender, Rc::clone(&mutex_lane.outbox), LinkClass::Mutex),
        ] {
            tokio::task::spawn_local(drain(Rc::clone(&core), sender, outbox, class));
        }
        Self {
            core,
            address,
            fetch_lane,
            mutex_lane,
        }
    }

    /// The endpoint's logical address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Issue a request and wait for its reply.
    ///
    /// Replies resolve to a [`FetchResult`] whatever their status; only a
    /// missing reply is an error. On timeout the in-flight entry is
    /// removed, any still-queued copy of the request is purged, and a late
    /// reply will be dropped silently.
    pub async fn fetch(
        &self,
        path: &str,
        options: FetchOptions,
    ) -> Result<FetchResult, ApiError> {
        self.core.check_open()?;
        let (cid, reply) = self.core.correlator.register();
        let mut message = Message::request(options.op, path).with_body(options.body);
        message.correlation_id = Some(cid);
        tracing::trace!(cid, path, op = %options.op, "fetch issued");
        self.fetch_lane.outbox.push(OutgoingMessage {
            message,
            sent: None,
        });

        match tokio::time::timeout(options.timeout, reply).await {
            Ok(Ok(reply)) => Ok(FetchResult { message: reply }),
            Ok(Err(_)) => Err(ApiError::ConnectionLost),
            Err(_) => {
                self.core.correlator.cancel(cid);
                self.fetch_lane.outbox.purge(cid);
                tracing::debug!(cid, path, "fetch timed out");
                Err(ApiError::FetchTimeout(options.timeout))
            }
        }
    }

    /// Acquire `mutex_name` at `path`, run `inner` while holding it, then
    /// release.
    ///
    /// The protocol, in order: the acquire goes out on the mutex lane; the
    /// server accepting the delivery confirms the queue slot; a 200 reply
    /// with an acquisition id starts `inner`; and when `inner` finishes,
    /// settling the acquire delivery is the release signal. A non-200
    /// reply fails with [`ApiError::Mutex`]. If the server settles first —
    /// it dropped the acquisition unilaterally — `on_cancel` runs so the
    /// application can abort whatever the critical section started, and
    /// the call fails with [`ApiError::MutexDropped`] even if `inner` is
    /// still executing.
    ///
    /// `options.timeout` bounds the whole operation; zero waits forever.
    /// An operation abandoned by timeout settles its delivery as soon as
    /// the handle is known, so a posthumous grant is released immediately
    /// and the server side just sees a grant with an instant release.
    pub async fn critical_section<F, Fut, R>(
        &self,
        path: &str,
        mutex_name: &str,
        inner: F,
        on_cancel: impl FnOnce() + 'static,
        options: CriticalSectionOptions,
    ) -> Result<R, ApiError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = R>,
    {
        self.core.check_open()?;
        let (cid, reply) = self.core.correlator.register();

        let mut message = Message::acquire(path, mutex_name).with_body(options.body);
        message.correlation_id = Some(cid);
        if let Some(wait_time) = options.wait_time {
            message.set_property(keys::WAIT_TIME, Value::from(wait_time.as_millis() as u64));
        }
        if let Some(label) = &options.label {
            message.set_property(keys::LABEL, Value::String(label.clone()));
        }

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let (sent_tx, sent_rx) = oneshot::channel::<OutboundDelivery>();
        let state = Rc::new(RefCell::new(SectionState {
            delivery: None,
            granted: false,
            inner_completed: false,
            abandoned: false,
            dropped: false,
            on_cancel: Some(Box::new(on_cancel)),
            cancel_tx: Some(cancel_tx),
        }));

        tracing::trace!(cid, path, mutex_name, "acquire issued");
        self.mutex_lane.outbox.push(OutgoingMessage {
            message,
            sent: Some(sent_tx),
        });

        // Bind the delivery to the disposition router once the drainer has
        // put it on the wire.
        {
            let state = Rc::clone(&state);
            let core = Rc::clone(&self.core);
            tokio::task::spawn_local(async move {
                let Ok(delivery) = sent_rx.await else {
                    // Purged or dropped before transmission.
                    return;
                };
                {
                    let mut section = state.borrow_mut();
                    if section.abandoned || section.inner_completed {
                        drop(section);
                        delivery.settle();
                        return;
                    }
                    section.delivery = Some(delivery.clone());
                }
                let hook_state = Rc::clone(&state);
                let hook_delivery = delivery.clone();
                DispositionRouter::watch(delivery, move |update| {
                    section_hook(&core, cid, &hook_state, &hook_delivery, update)
                });
            });
        }

        let run_state = Rc::clone(&state);
        let run = async move {
            let grant = reply.await.map_err(|_| ApiError::ConnectionLost)?;
            let status_code = grant.status().unwrap_or_default();
            if status_code != status::OK {
                return Err(ApiError::Mutex {
                    status: status_code,
                    description: grant.status_description().unwrap_or_default().to_string(),
                });
            }

            // The grant may have been revoked between the reply being
            // dispatched and us observing it.
            let dropped = {
                let mut section = run_state.borrow_mut();
                if section.dropped {
                    Some(section.on_cancel.take())
                } else {
                    section.granted = true;
                    None
                }
            };
            if let Some(callback) = dropped {
                if let Some(callback) = callback {
                    callback();
                }
                return Err(ApiError::MutexDropped);
            }

            let acquisition_id = grant.acquisition_id().unwrap_or_default().to_string();
            tracing::trace!(cid, acquisition_id = %acquisition_id, "entering critical section");
            let result = inner(acquisition_id).await;

            let delivery = {
                let mut section = run_state.borrow_mut();
                section.inner_completed = true;
                section.on_cancel = None;
                section.cancel_tx = None;
                section.delivery.clone()
            };
            if let Some(delivery) = delivery {
                if !delivery.locally_settled() {
                    // The release signal.
                    delivery.settle();
                }
            }
            Ok(result)
        };
        tokio::pin!(run);

        let guarded = async {
            tokio::select! {
                biased;
                result = &mut run => result,
                _ = cancel_rx => Err(ApiError::MutexDropped),
            }
        };

        let outcome = if options.timeout.is_zero() {
            guarded.await
        } else {
            match tokio::time::timeout(options.timeout, guarded).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::MutexAcquireTimeout),
            }
        };

        if outcome.is_err() {
            self.core.correlator.cancel(cid);
            self.mutex_lane.outbox.purge(cid);
            let delivery = {
                let mut section = state.borrow_mut();
                section.abandoned = true;
                section.on_cancel = None;
                section.cancel_tx = None;
                section.delivery.clone()
            };
            if let Some(delivery) = delivery {
                if !delivery.locally_settled() {
                    delivery.settle();
                }
            }
        }
        outcome
    }

    /// Queued requests not yet transmitted on `class`'s lane.
    pub fn outbox_depth(&self, class: LinkClass) -> usize {
        match class {
            LinkClass::Fetch => self.fetch_lane.outbox.len(),
            LinkClass::Mutex => self.mutex_lane.outbox.len(),
        }
    }
}

impl Drop for ClientEndpoint {
    fn drop(&mut self) {
        self.fetch_lane.outbox.close();
        self.mutex_lane.outbox.close();
    }
}

struct SectionState {
    delivery: Option<OutboundDelivery>,
    granted: bool,
    inner_completed: bool,
    abandoned: bool,
    dropped: bool,
    on_cancel: Option<Box<dyn FnOnce()>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Disposition hook for one acquire delivery.
///
/// A remote settle before the local one is the server releasing the
/// acquisition out from under us. That is a real cancellation when the
/// grant is live (the section is running, or the acquire is still
/// unanswered); if an error reply already resolved the call, the settle is
/// just the server retiring the delivery and nobody needs waking.
fn section_hook(
    core: &Rc<ConnectionCore>,
    cid: u64,
    state: &Rc<RefCell<SectionState>>,
    delivery: &OutboundDelivery,
    update: &DeliveryUpdate,
) -> Watch {
    if update.remotely_settled && !update.locally_settled {
        delivery.settle();
        let (callback, cancel) = {
            let mut section = state.borrow_mut();
            section.dropped = true;
            if section.granted || core.correlator.contains(cid) {
                (section.on_cancel.take(), section.cancel_tx.take())
            } else {
                (None, None)
            }
        };
        if callback.is_some() || cancel.is_some() {
            tracing::debug!(cid, "acquire dropped by peer");
        }
        if let Some(callback) = callback {
            callback();
        }
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
        return Watch::Done;
    }

    if update.locally_settled {
        return Watch::Done;
    }

    if update.outcome == Some(Outcome::Accepted) {
        // Queued at the server. If the section already finished (or was
        // abandoned) before we learned that, release on the spot.
        let settle_now = {
            let section = state.borrow();
            section.inner_completed || section.abandoned
        };
        if settle_now {
            delivery.settle();
            return Watch::Done;
        }
    }
    Watch::Continue
}

async fn drain(
    core: Rc<ConnectionCore>,
    sender: Rc<dyn MessageSender>,
    outbox: Rc<Outbox>,
    class: LinkClass,
) {
    let shutdown = core.shutdown.notified();
    tokio::pin!(shutdown);
    loop {
        let has_work = tokio::select! {
            _ = &mut shutdown => false,
            ready = outbox.ready() => ready,
        };
        if !has_work || core.closed.get() {
            break;
        }

        let sendable = tokio::select! {
            _ = &mut shutdown => false,
            result = sender.sendable() => result.is_ok(),
        };
        if !sendable || core.closed.get() {
            break;
        }

        let Some(entry) = outbox.pop() else {
            continue;
        };
        let mut message = entry.message.clone();
        message.reply_to = Some(core.reply_address.clone());
        match sender.send(message) {
            Ok(delivery) => {
                tracing::trace!(
                    class = %class,
                    cid = entry.message.correlation_id.unwrap_or_default(),
                    "request transmitted"
                );
                if let Some(sent) = entry.sent {
                    let _ = sent.send(delivery);
                }
            }
            Err(TransportError::InsufficientCredit) => {
                // Lost the credit race; keep transmit order and retry.
                outbox.push_front(entry);
            }
            Err(error) => {
                tracing::warn!(class = %class, %error, "dropping request, send failed");
            }
        }
    }
    tracing::trace!(class = %class, "outbox drainer stopped");
}
