//! Transport error types

use thiserror::Error;

use crate::port::PortState;

/// Errors returned by transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bad parameter: {0}")]
    BadParameter(&'static str),

    #[error("Port '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Outbound mailbox is busy")]
    MailboxBusy,

    #[error("Destination queue is full")]
    MailboxFull,

    #[error("No message queued")]
    MailboxEmpty,

    #[error("Timed out waiting for a connection")]
    ConnectTimeout,

    #[error("Timed out")]
    Timeout,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Port is not connected (state: {state:?})")]
    NotConnected { state: PortState },

    #[error("Operation not permitted in state {state:?}")]
    InvalidState { state: PortState },

    #[error("Port is closed")]
    Closed,

    #[error("Connection attempt aborted")]
    ConnectionFailed,

    #[error("Receive buffer too small (message: {needed} bytes, buffer: {available} bytes)")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Queue still holds {pending} unread messages")]
    QueueNotEmpty { pending: usize },

    #[error("Insufficient memory (requested: {requested} bytes)")]
    InsufficientMemory { requested: usize },

    #[error("Platform error: {0}")]
    Platform(String),
}

impl From<avp_xpc::XpcError> for TransportError {
    fn from(err: avp_xpc::XpcError) -> Self {
        match err {
            avp_xpc::XpcError::OutOfMemory { requested } => {
                TransportError::InsufficientMemory { requested }
            }
            other => TransportError::Platform(other.to_string()),
        }
    }
}

pub type Result<T> = core::result::Result<T, TransportError>;
