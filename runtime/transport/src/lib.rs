//! AVP Transport - named ports between the CPU and the AVP co-processor
//!
//! # Purpose
//! Moves small control messages between the two processors of the SoC over
//! one shared mailbox and a doorbell, and between threads of one processor
//! through locally linked ports.
//!
//! # Integration Points
//! - Depends on: `avp-xpc` (doorbell, shared memory, image loader)
//! - Provides to: `avp-rpc` and services that talk to the AVP directly
//! - Wire format: see [`wire`]
//!
//! # Architecture
//! Each [`Port`] owns a lock-free SPSC [`MessageQueue`]. The interrupt path
//! (remote traffic) or the sending thread (local traffic) is the producer;
//! the `recv` caller is the consumer. The [`Transport`] owns the port arena
//! and serializes handshakes and mailbox writes.
//!
//! ```text
//!   CPU                                  AVP
//!   open("svc") ─ connect ──Connect──▶  ISR: Waiting "svc"? ─▶ Response
//!   send ──────────────────Message──▶  ISR: queue.insert ─▶ notify
//!   recv ◀─ queue ◀─ ISR ◀──Message──  send
//! ```
//!
//! # Testing Strategy
//! - Unit tests: queue ordering and capacity, wire layout, port naming,
//!   arena identities, timeouts
//! - Integration tests: local and loopback-remote handshakes, backpressure
//!   replay, watchdog reset, close/wait races (`tests/`)
//! - Benchmarks: queue throughput (`benches/`)

pub mod config;
pub mod error;
pub mod port;
pub mod queue;
pub mod sync;
pub mod wire;

mod registry;
mod transport;

pub use config::{TransportConfig, DEFAULT_QUEUE_DEPTH, RPC_AVP_PORT, RPC_CPU_PORT};
pub use error::{Result, TransportError};
pub use port::{Port, PortFlags, PortHandle, PortId, PortName, PortState};
pub use queue::{MessageQueue, QueueError};
pub use sync::{Semaphore, Timeout};
pub use transport::Transport;
pub use wire::{MAX_MESSAGE_LEN, MAX_PORT_NAME_LEN, RESET_NOTIFICATION};

pub use avp_xpc::Processor;
