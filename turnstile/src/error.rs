//! Error types for the API layer.

use std::time::Duration;

use turnstile_core::TransportError;

/// Errors surfaced to callers of the API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A `fetch` received no reply within its timeout.
    #[error("fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    /// Timed out waiting for the mutex; the critical section did not run
    /// (or was abandoned mid-flight if the grant arrived late).
    #[error("timed out waiting for the mutex, critical section did not run")]
    MutexAcquireTimeout,

    /// The server answered an `acquire` with a non-200 status.
    #[error("mutex error: ({status}) {description}")]
    Mutex {
        /// Status from the server's reply.
        status: u16,
        /// Status description from the server's reply.
        description: String,
    },

    /// The server (or the network) released the acquisition unilaterally.
    #[error("mutex was dropped prematurely")]
    MutexDropped,

    /// An endpoint of the same kind is already open at this address.
    #[error("an endpoint is already open at {address}")]
    DuplicateEndpoint {
        /// The contended address.
        address: String,
    },

    /// A one-shot response was used a second time.
    #[error("response already sent")]
    ResponseAlreadySent,

    /// The connection closed while the operation was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// An error from the underlying transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
