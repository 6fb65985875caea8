//! Server endpoint: routing and dispatch.
//!
//! A [`ServerEndpoint`] listens on the two class links derived from its
//! address. Every incoming delivery is received with manual accept and
//! manual settle and dispatched on its own task, so a slow handler never
//! blocks the receive loop; the receiver's credit window is the
//! back-pressure. Requests are routed through a [`PathTrie`] of
//! [`HandlerNode`]s: REST verbs run the node's registered handlers in
//! registration order, `acquire` is handed to the node's mutex set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use serde_json::Value;
use turnstile_core::{
    status, Address, InboundDelivery, LinkClass, Message, MessageReceiver, Operation,
};

use crate::connection::ConnectionCore;
use crate::error::ApiError;
use crate::mutex::{AcquisitionIds, MutexContext, MutexInstance, MutexSet};
use crate::response::Response;
use crate::routing::PathTrie;

/// Credit window granted on each server receive link.
pub(crate) const RECEIVE_CREDIT: u32 = 64;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), ApiError>>>>;
type HandlerFn = dyn Fn(Message, Response) -> HandlerFuture;

/// Per-path registration: handlers by verb, plus the path's named mutexes.
struct HandlerNode {
    handlers: RefCell<HashMap<Operation, Vec<Rc<HandlerFn>>>>,
    mutexes: MutexSet,
}

impl HandlerNode {
    fn new() -> Self {
        Self {
            handlers: RefCell::new(HashMap::new()),
            mutexes: MutexSet::new(),
        }
    }

    fn add(&self, op: Operation, handler: Rc<HandlerFn>) {
        self.handlers.borrow_mut().entry(op).or_default().push(handler);
    }

    fn handlers_for(&self, op: Operation) -> Vec<Rc<HandlerFn>> {
        self.handlers
            .borrow()
            .get(&op)
            .map(|handlers| handlers.to_vec())
            .unwrap_or_default()
    }
}

struct ServerInner {
    address: Address,
    core: Rc<ConnectionCore>,
    routes: RefCell<PathTrie<Rc<HandlerNode>>>,
    mutex_ctx: Rc<MutexContext>,
}

/// Server side of a logical endpoint address.
///
/// Dropping the endpoint (or calling [`stop`](Self::stop)) detaches its
/// receivers and ends its accept loops.
pub struct ServerEndpoint {
    inner: Rc<ServerInner>,
    receivers: Vec<Rc<dyn MessageReceiver>>,
}

impl ServerEndpoint {
    pub(crate) fn start(
        core: Rc<ConnectionCore>,
        address: Address,
        fetch_receiver: Rc<dyn MessageReceiver>,
        mutex_receiver: Rc<dyn MessageReceiver>,
    ) -> Self {
        let inner = Rc::new(ServerInner {
            address,
            mutex_ctx: Rc::new(MutexContext {
                anon: Rc::clone(&core.anon),
                ids: AcquisitionIds::new(),
            }),
            core,
            routes: RefCell::new(PathTrie::new()),
        });
        tracing::debug!(address = %inner.address, "server endpoint open");

        for (receiver, class) in [
            (Rc::clone(&fetch_receiver), LinkClass::Fetch),
            (Rc::clone(&mutex_receiver), LinkClass::Mutex),
        ] {
            tokio::task::spawn_local(accept_loop(Rc::clone(&inner), receiver, class));
        }

        Self {
            inner,
            receivers: vec![fetch_receiver, mutex_receiver],
        }
    }

    /// Register `handler` for `op` at `path`.
    ///
    /// Registrations merge: handlers for different verbs share the path's
    /// node, and a second handler for the same verb runs after the first,
    /// in registration order. `Operation::Acquire` cannot be routed to a
    /// handler; acquires always go to the path's mutex set.
    pub fn route<F, Fut>(&self, path: &str, op: Operation, handler: F) -> &Self
    where
        F: Fn(Message, Response) -> Fut + 'static,
        Fut: Future<Output = Result<(), ApiError>> + 'static,
    {
        if op == Operation::Acquire {
            tracing::warn!(path, "acquire cannot be routed to a handler, ignoring");
            return self;
        }
        let handler: Rc<HandlerFn> = Rc::new(move |request, response| {
            let future: HandlerFuture = Box::pin(handler(request, response));
            future
        });
        let mut routes = self.inner.routes.borrow_mut();
        let node = routes.get_or_insert_with(path, || Rc::new(HandlerNode::new()));
        node.add(op, handler);
        self
    }

    /// Register a GET handler at `path`.
    pub fn get<F, Fut>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(Message, Response) -> Fut + 'static,
        Fut: Future<Output = Result<(), ApiError>> + 'static,
    {
        self.route(path, Operation::Get, handler)
    }

    /// Register a PUT handler at `path`.
    pub fn put<F, Fut>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(Message, Response) -> Fut + 'static,
        Fut: Future<Output = Result<(), ApiError>> + 'static,
    {
        self.route(path, Operation::Put, handler)
    }

    /// Register a POST handler at `path`.
    pub fn post<F, Fut>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(Message, Response) -> Fut + 'static,
        Fut: Future<Output = Result<(), ApiError>> + 'static,
    {
        self.route(path, Operation::Post, handler)
    }

    /// Register a DELETE handler at `path`.
    pub fn delete<F, Fut>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(Message, Response) -> Fut + 'static,
        Fut: Future<Output = Result<(), ApiError>> + 'static,
    {
        self.route(path, Operation::Delete, handler)
    }

    /// Ensure a node exists at `path` so clients can acquire mutexes there
    /// without any verb handler being registered.
    pub fn mutex_path(&self, path: &str) -> &Self {
        let mut routes = self.inner.routes.borrow_mut();
        routes.get_or_insert_with(path, || Rc::new(HandlerNode::new()));
        self
    }

    /// Forcibly release the current holder of `mutex_name` at `path`.
    ///
    /// Not part of normal operation: the holder observes a premature drop.
    /// Returns whether a holder existed.
    pub fn drop_mutex_holder(&self, path: &str, mutex_name: &str) -> bool {
        let node = self.inner.routes.borrow().lookup(path).cloned();
        let Some(node) = node else {
            return false;
        };
        let Some(instance) = node.mutexes.get(mutex_name) else {
            return false;
        };
        MutexInstance::drop_head(&instance)
    }

    /// The endpoint's logical address.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Number of registered paths.
    pub fn route_count(&self) -> usize {
        self.inner.routes.borrow().len()
    }

    /// Detach the endpoint's receivers, ending its accept loops.
    /// Idempotent.
    pub fn stop(&self) {
        for receiver in &self.receivers {
            receiver.close();
        }
    }
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    inner: Rc<ServerInner>,
    receiver: Rc<dyn MessageReceiver>,
    class: LinkClass,
) {
    while let Some((message, delivery)) = receiver.recv().await {
        let inner = Rc::clone(&inner);
        tokio::task::spawn_local(async move {
            if let Err(error) = dispatch(&inner, message, delivery.clone()).await {
                tracing::error!(address = %inner.address, %error, "dispatch failed");
                delivery.reject();
                delivery.settle();
            }
        });
    }
    tracing::debug!(address = %inner.address, class = %class, "server receiver closed");
}

async fn dispatch(
    inner: &Rc<ServerInner>,
    message: Message,
    delivery: InboundDelivery,
) -> Result<(), ApiError> {
    let path = message.path().unwrap_or_default().to_string();
    let node = inner.routes.borrow().lookup(&path).cloned();
    let response = Response::new(Rc::clone(&inner.core.anon), &message);

    let Some(node) = node else {
        tracing::debug!(path = %path, "no resource at path");
        response
            .status(status::NOT_FOUND)
            .description("Not Found")
            .send(Value::from("No resource found at path"))
            .await?;
        delivery.accept_and_settle();
        return Ok(());
    };

    let op = match message.op() {
        Some(op) => op,
        None => {
            response
                .status(status::NOT_PERMITTED)
                .description("Not Permitted")
                .end()
                .await?;
            delivery.accept_and_settle();
            return Ok(());
        }
    };

    if op == Operation::Acquire {
        let Some(name) = message.mutex_name().map(str::to_string) else {
            response
                .status(status::NOT_PERMITTED)
                .description("Not Permitted")
                .end()
                .await?;
            delivery.accept_and_settle();
            return Ok(());
        };
        // The mutex machinery owns the delivery from here; it stays
        // unsettled while the acquisition is queued or held.
        node.mutexes.acquire(&inner.mutex_ctx, &name, message, delivery);
        return Ok(());
    }

    let handlers = node.handlers_for(op);
    if handlers.is_empty() {
        tracing::debug!(path = %path, op = %op, "no handler for verb");
        response
            .status(status::NOT_PERMITTED)
            .description("Not Permitted")
            .end()
            .await?;
        delivery.accept_and_settle();
        return Ok(());
    }

    for handler in handlers {
        handler(message.clone(), response.clone()).await?;
    }
    delivery.accept_and_settle();
    Ok(())
}
