//! RPC session timeouts

use avp_transport::Timeout;
use serde::Deserialize;

/// Session tunables; `None` waits forever
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Connect budget; generous because the AVP may still be booting
    pub connect_timeout_ms: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Some(20_000),
            send_timeout_ms: None,
            response_timeout_ms: None,
        }
    }
}

fn to_timeout(ms: Option<u64>) -> Timeout {
    ms.map_or(Timeout::Infinite, Timeout::millis)
}

impl RpcConfig {
    pub fn connect_timeout(&self) -> Timeout {
        to_timeout(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Timeout {
        to_timeout(self.send_timeout_ms)
    }

    pub fn response_timeout(&self) -> Timeout {
        to_timeout(self.response_timeout_ms)
    }
}
