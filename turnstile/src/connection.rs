//! The API connection.
//!
//! An [`ApiConnection`] owns one transport connection end to end: the
//! anonymous sender used for addressed replies, the dynamic-source receiver
//! whose transport-assigned address is the connection's `reply_to`, the
//! reply dispatch loop, and the correlator. Client and server endpoints are
//! created from it and share its transport.
//!
//! Everything attached to a connection runs on one cooperative executor;
//! constructors must be called from within a `tokio` `LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use tokio::sync::Notify;
use turnstile_core::{Address, LinkClass, MessageReceiver, MessageSender, Transport};

use crate::client::ClientEndpoint;
use crate::correlator::Correlator;
use crate::error::ApiError;
use crate::server::ServerEndpoint;

/// Credit window for the connection's reply receiver.
const REPLY_CREDIT: u32 = 256;

/// Point-in-time connection counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Server endpoints created on this connection.
    pub server_endpoint_count: usize,
    /// Client endpoints created on this connection.
    pub client_endpoint_count: usize,
    /// Requests awaiting a reply.
    pub in_flight_count: usize,
}

#[derive(Default)]
struct Registry {
    servers: HashSet<String>,
    clients: HashSet<String>,
}

pub(crate) struct ConnectionCore {
    pub anon: Rc<dyn MessageSender>,
    pub reply_address: String,
    pub correlator: Correlator,
    pub closed: Cell<bool>,
    pub shutdown: Notify,
    registry: RefCell<Registry>,
}

impl ConnectionCore {
    pub fn check_open(&self) -> Result<(), ApiError> {
        if self.closed.get() {
            Err(ApiError::ConnectionLost)
        } else {
            Ok(())
        }
    }
}

/// One end of an API conversation over a transport connection.
pub struct ApiConnection<T: Transport> {
    transport: T,
    core: Rc<ConnectionCore>,
    reply_receiver: Rc<dyn MessageReceiver>,
}

impl<T: Transport> ApiConnection<T> {
    /// Open a connection: attach the anonymous sender, open the dynamic
    /// reply receiver, and start dispatching replies.
    ///
    /// Must be called from within a `LocalSet`.
    pub async fn open(transport: T) -> Result<Self, ApiError> {
        let anon: Rc<dyn MessageSender> = Rc::new(transport.open_anonymous_sender().await?);
        let (receiver, reply_address) = transport.open_dynamic_receiver(REPLY_CREDIT).await?;
        let reply_receiver: Rc<dyn MessageReceiver> = Rc::new(receiver);
        tracing::debug!(reply_address = %reply_address, "connection open");

        let core = Rc::new(ConnectionCore {
            anon,
            reply_address,
            correlator: Correlator::new(),
            closed: Cell::new(false),
            shutdown: Notify::new(),
            registry: RefCell::new(Registry::default()),
        });

        tokio::task::spawn_local(reply_loop(Rc::clone(&core), Rc::clone(&reply_receiver)));

        Ok(Self {
            transport,
            core,
            reply_receiver,
        })
    }

    /// Create a client endpoint talking to the logical address `address`.
    ///
    /// Fails if this connection already has a client endpoint there.
    pub async fn client_endpoint(&self, address: &str) -> Result<ClientEndpoint, ApiError> {
        self.core.check_open()?;
        let address = Address::new(address);
        {
            let mut registry = self.core.registry.borrow_mut();
            if !registry.clients.insert(address.as_str().to_string()) {
                return Err(ApiError::DuplicateEndpoint {
                    address: address.as_str().to_string(),
                });
            }
        }

        let opened = async {
            let fetch = self
                .transport
                .open_sender(&address.link_address(LinkClass::Fetch))
                .await?;
            let mutex = self
                .transport
                .open_sender(&address.link_address(LinkClass::Mutex))
                .await?;
            Ok::<_, ApiError>((fetch, mutex))
        }
        .await;

        match opened {
            Ok((fetch, mutex)) => Ok(ClientEndpoint::start(
                Rc::clone(&self.core),
                address,
                Rc::new(fetch),
                Rc::new(mutex),
            )),
            Err(error) => {
                self.core
                    .registry
                    .borrow_mut()
                    .clients
                    .remove(address.as_str());
                Err(error)
            }
        }
    }

    /// Create a server endpoint serving the logical address `address`.
    ///
    /// Fails if this connection already has a server endpoint there.
    pub async fn server_endpoint(&self, address: &str) -> Result<ServerEndpoint, ApiError> {
        self.core.check_open()?;
        let address = Address::new(address);
        {
            let mut registry = self.core.registry.borrow_mut();
            if !registry.servers.insert(address.as_str().to_string()) {
                return Err(ApiError::DuplicateEndpoint {
                    address: address.as_str().to_string(),
                });
            }
        }

        let opened = async {
            let fetch = self
                .transport
                .open_receiver(
                    &address.link_address(LinkClass::Fetch),
                    crate::server::RECEIVE_CREDIT,
                )
                .await?;
            let mutex = self
                .transport
                .open_receiver(
                    &address.link_address(LinkClass::Mutex),
                    crate::server::RECEIVE_CREDIT,
                )
                .await?;
            Ok::<_, ApiError>((fetch, mutex))
        }
        .await;

        match opened {
            Ok((fetch, mutex)) => Ok(ServerEndpoint::start(
                Rc::clone(&self.core),
                address,
                Rc::new(fetch),
                Rc::new(mutex),
            )),
            Err(error) => {
                self.core
                    .registry
                    .borrow_mut()
                    .servers
                    .remove(address.as_str());
                Err(error)
            }
        }
    }

    /// Current endpoint and in-flight counters.
    pub fn stats(&self) -> ConnectionStats {
        let registry = self.core.registry.borrow();
        ConnectionStats {
            server_endpoint_count: registry.servers.len(),
            client_endpoint_count: registry.clients.len(),
            in_flight_count: self.core.correlator.in_flight(),
        }
    }

    /// The transport-assigned address replies to this connection arrive on.
    pub fn reply_address(&self) -> &str {
        &self.core.reply_address
    }

    /// The underlying transport handle.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Close the connection: stop dispatching, detach the reply receiver,
    /// and fail every outstanding request with
    /// [`ApiError::ConnectionLost`].
    pub fn close(&self) {
        if self.core.closed.replace(true) {
            return;
        }
        tracing::debug!("closing connection");
        self.core.shutdown.notify_waiters();
        self.reply_receiver.close();
        self.core.correlator.fail_all();
    }
}

impl<T: Transport> Drop for ApiConnection<T> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn reply_loop(core: Rc<ConnectionCore>, receiver: Rc<dyn MessageReceiver>) {
    while let Some((message, delivery)) = receiver.recv().await {
        // Replies carry no disposition semantics; retire them on arrival.
        delivery.accept_and_settle();
        match message.correlation_id {
            Some(cid) => {
                core.correlator.dispatch(cid, message);
            }
            None => tracing::trace!("reply without correlation id, dropping"),
        }
    }
    tracing::debug!("reply loop finished");
}
