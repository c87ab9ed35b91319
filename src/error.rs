use crate::transport::TransportError;
use std::{error::Error as StdError, sync::Arc};

/// Errors reported by the connection lifecycle and the sessions it starts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("the operation requires an active connection")]
    RequireActiveConnection,

    #[error("the operation timed out")]
    Timeout,

    #[error("connection has been closed")]
    ConnectionClosed,

    #[error("the operation has been cancelled")]
    Cancelled,

    #[error("unknown connection failure")]
    Unknown,

    #[error("errored in underlying transport")]
    Transport(
        #[from]
        #[source]
        TransportError,
    ),

    #[error("session failed to start: {}", _0)]
    SessionStart(#[source] Arc<dyn StdError + Send + Sync>),
}

impl ConnectionError {
    pub(crate) fn session_start<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ConnectionError::SessionStart(Arc::new(err))
    }
}

// Session start failures carry an opaque source and compare by identity.
impl PartialEq for ConnectionError {
    fn eq(&self, other: &Self) -> bool {
        use ConnectionError::*;
        match (self, other) {
            (RequireActiveConnection, RequireActiveConnection)
            | (Timeout, Timeout)
            | (ConnectionClosed, ConnectionClosed)
            | (Cancelled, Cancelled)
            | (Unknown, Unknown) => true,
            (Transport(a), Transport(b)) => a == b,
            (SessionStart(a), SessionStart(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for ConnectionError {}
