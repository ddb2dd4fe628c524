//! Transport configuration
//!
//! Every polling interval and timeout the protocol depends on lives here
//! rather than as a literal in the code paths. Defaults match the values the
//! AVP firmware was tuned against.

use std::time::Duration;

use serde::Deserialize;

/// Default receive queue depth for a newly opened port
pub const DEFAULT_QUEUE_DEPTH: usize = 30;

/// Well-known port the CPU opens to reach the AVP's RPC service
pub const RPC_AVP_PORT: &str = "RPC_AVP_PORT";

/// Well-known port the AVP opens to reach the CPU's RPC service
pub const RPC_CPU_PORT: &str = "RPC_CPU_PORT";

/// Transport tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Queue depth given to ports at open time
    pub default_queue_depth: usize,

    /// Time spent polling (yielding) before a retry loop starts sleeping
    pub poll_time_ms: u64,

    /// Sleep between retries once the poll quantum is used up
    pub sleep_step_ms: u64,

    /// Pause between connect attempts that found no listener
    pub connect_retry_ms: u64,

    /// Lower bound on how long a connect request waits for its response
    pub min_response_wait_ms: u64,

    /// How long Close keeps retrying to deliver a Disconnect
    pub disconnect_timeout_ms: u64,

    /// Ports whose queue is fixed at open time and exempt from resizing
    pub fixed_depth_ports: Vec<String>,

    /// Port that receives the watchdog reset notification
    pub reset_port: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_queue_depth: DEFAULT_QUEUE_DEPTH,
            poll_time_ms: 10,
            sleep_step_ms: 1,
            connect_retry_ms: 10,
            min_response_wait_ms: 1000,
            disconnect_timeout_ms: 500,
            fixed_depth_ports: vec![RPC_AVP_PORT.to_string(), RPC_CPU_PORT.to_string()],
            reset_port: RPC_CPU_PORT.to_string(),
        }
    }
}

impl TransportConfig {
    pub fn poll_time(&self) -> Duration {
        Duration::from_millis(self.poll_time_ms)
    }

    pub fn sleep_step(&self) -> Duration {
        Duration::from_millis(self.sleep_step_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn min_response_wait(&self) -> Duration {
        Duration::from_millis(self.min_response_wait_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Whether `name` is one of the statically sized ports
    pub fn is_fixed_depth(&self, name: &str) -> bool {
        self.fixed_depth_ports.iter().any(|p| p == name)
    }
}
