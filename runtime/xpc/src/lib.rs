//! # Cross-Processor Signaling (XPC)
//!
//! The mailbox primitive shared by the CPU and the AVP co-processor:
//! - **Doorbell**: a hardware line that raises an interrupt on the far side
//!   and delivers one opaque 32-bit value (normally a physical address)
//! - **Physical memory**: uncached shared regions both processors can address
//! - **Image loader**: brings the AVP out of reset before any mailbox traffic
//!
//! The transport consumes these through traits so that board integrations and
//! the in-process loopback backend look identical to it.
//!
//! ## Build Modes
//!
//! ```bash
//! # Loopback (default - host development and tests)
//! cargo build
//!
//! # Board integration (bring your own Doorbell/PhysicalMemory)
//! cargo build --no-default-features
//! ```

use std::sync::Arc;

use thiserror::Error;

mod region;

#[cfg(feature = "loopback")]
pub mod loopback;

pub use region::{SharedRegion, WORD_SIZE};

/// Physical address as carried by the doorbell
pub type PhysAddr = u32;

/// Errors reported by the mailbox primitive
#[derive(Debug, Error)]
pub enum XpcError {
    #[error("Interrupt handler already registered on {line}")]
    HandlerRegistered { line: &'static str },

    #[error("Out of shared memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("No shared region mapped at {phys:#010x}")]
    NotMapped { phys: PhysAddr },

    #[error("Remote image '{image}' failed to load: {reason}")]
    LoadFailed { image: String, reason: String },
}

pub type Result<T> = core::result::Result<T, XpcError>;

/// Handler invoked in interrupt context when the doorbell rings.
///
/// Must not block and must not allocate.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// Hardware doorbell between the two processors
pub trait Doorbell: Send + Sync {
    /// Ring the far side's doorbell with `value`. Never blocks.
    fn signal(&self, value: u32);

    /// Value delivered by the most recent inbound ring
    fn last_delivered_value(&self) -> u32;

    /// Install the inbound interrupt handler
    ///
    /// # Errors
    /// Returns `HandlerRegistered` if a handler is already installed.
    fn register_interrupt(&self, handler: InterruptHandler) -> Result<()>;

    /// Remove the inbound interrupt handler. Pending rings are dropped.
    fn unregister_interrupt(&self);
}

/// Platform physical memory used for the mailbox pair
pub trait PhysicalMemory: Send + Sync {
    /// Allocate, pin and map an uncached region of at least `size` bytes
    fn allocate(&self, size: usize) -> Result<(PhysAddr, Arc<SharedRegion>)>;

    /// Map a region the far side allocated
    fn map(&self, phys: PhysAddr) -> Result<Arc<SharedRegion>>;

    /// Release a region returned by `allocate`
    fn free(&self, phys: PhysAddr);
}

/// Loads and relocates an executable image into AVP memory
pub trait ImageLoader {
    /// Returns the image entry point
    fn load_and_relocate(&self, image_name: &str) -> Result<u32>;
}

/// Everything the transport needs from the board
#[derive(Clone)]
pub struct Platform {
    pub doorbell: Arc<dyn Doorbell>,
    pub memory: Arc<dyn PhysicalMemory>,
}

impl Platform {
    pub fn new(doorbell: Arc<dyn Doorbell>, memory: Arc<dyn PhysicalMemory>) -> Self {
        Self { doorbell, memory }
    }
}

/// Which end of the link this processor is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    /// Main CPU: allocates the mailbox pair and boots the AVP
    Cpu,
    /// Co-processor: learns the mailbox address from its first interrupt
    Avp,
}

impl Processor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Processor::Cpu => "cpu",
            Processor::Avp => "avp",
        }
    }
}

impl core::fmt::Display for Processor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_names() {
        assert_eq!(Processor::Cpu.to_string(), "cpu");
        assert_eq!(Processor::Avp.as_str(), "avp");
    }

    #[test]
    fn test_error_messages() {
        let err = XpcError::NotMapped { phys: 0x8000_0000 };
        assert_eq!(err.to_string(), "No shared region mapped at 0x80000000");
    }
}
