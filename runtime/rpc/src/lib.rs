//! AVP RPC - request/response sessions over the port transport
//!
//! # Purpose
//! Gives CPU and AVP services a call interface on top of a transport port:
//! fire-and-forget posts, paired request/response calls and a receive loop
//! for the serving side.
//!
//! # Integration Points
//! - Depends on: `avp-transport` (ports, timeouts, record size)
//! - Provides to: memory, power, module-loader and printf services
//! - Encoding: [`RpcMessage`] via `bincode`, one message per record
//!
//! # Testing Strategy
//! - Unit tests: message layout, size limits, error classification
//! - Integration tests: local and loopback-remote calls, shutdown, watchdog
//!   delivery (`tests/`)

pub mod config;
pub mod error;
pub mod message;
pub mod session;

pub use config::RpcConfig;
pub use error::{Result, RpcError};
pub use message::{RpcMessage, STATUS_OK};
pub use session::{MessageHandler, RpcSession, Service};
