//! RPC error types

use avp_transport::TransportError;
use thiserror::Error;

/// Errors returned by RPC sessions
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Message encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Encoded message is {len} bytes (limit: {max} bytes)")]
    MessageTooLarge { len: usize, max: usize },

    #[error("{0} is never answered")]
    NoResponse(&'static str),

    #[error("Unexpected {response} in answer to {request}")]
    UnexpectedResponse {
        request: &'static str,
        response: &'static str,
    },

    #[error("Session is shutting down")]
    ShutDown,
}

impl RpcError {
    /// Whether the far side should be treated as unavailable
    ///
    /// Services disable whatever depends on the remote processor instead of
    /// failing hard when this holds.
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(
                TransportError::Timeout
                    | TransportError::ConnectTimeout
                    | TransportError::Disconnected
            )
        )
    }
}

pub type Result<T> = core::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_unavailable() {
        assert!(RpcError::from(TransportError::Timeout).is_remote_unavailable());
        assert!(RpcError::from(TransportError::Disconnected).is_remote_unavailable());
        assert!(!RpcError::from(TransportError::MailboxEmpty).is_remote_unavailable());
        assert!(!RpcError::ShutDown.is_remote_unavailable());
    }
}
