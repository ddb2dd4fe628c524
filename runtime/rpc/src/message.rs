//! RPC message set
//!
//! Requests and their responses travel as one bincode-encoded [`RpcMessage`]
//! per transport record: a little-endian `u32` variant index followed by the
//! fields in order.

use avp_transport::MAX_MESSAGE_LEN;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Status value meaning success in response messages
pub const STATUS_OK: u32 = 0;

/// Every message the CPU and the AVP exchange over RPC
///
/// Variant order is part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMessage {
    /// Raised by the transport when the AVP watchdog fires. Encodes to the
    /// transport's reset notification, so it must remain variant 0.
    WatchdogReset,

    MemHandleCreate { size: u32 },
    MemHandleCreateResponse { status: u32, handle: u32 },
    MemHandleFree { handle: u32 },
    MemHandlePin { handle: u32 },
    MemHandlePinResponse { address: u32 },
    MemHandleUnpin { handle: u32 },
    MemGetAddress { handle: u32, offset: u32 },
    MemGetAddressResponse { address: u32 },

    PowerRegister { client_id: u32 },
    PowerRegisterResponse { status: u32, client_id: u32 },
    PowerUnregister { client_id: u32 },
    /// A client is starved of clock on the given domain (or no longer is)
    PowerStarvationHint { client_id: u32, domain: u32, starving: bool },

    ModuleClockControl { module: u32, client_id: u32, enable: bool },
    ModuleClockControlResponse { status: u32 },
    ModuleReset { module: u32 },

    /// Text printed on the far side's console
    RemotePrintf { text: String },

    /// Start a module loaded into AVP memory
    AttachModule { entry_address: u32, args: Vec<u8> },
    AttachModuleResponse { status: u32 },
    /// Stop a module before its memory is released
    DetachModule { entry_address: u32 },
    DetachModuleResponse { status: u32 },
}

impl RpcMessage {
    /// Encode into a record for the transport
    ///
    /// # Errors
    /// `MessageTooLarge` if the encoding does not fit one record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_MESSAGE_LEN {
            return Err(RpcError::MessageTooLarge {
                len: bytes.len(),
                max: MAX_MESSAGE_LEN,
            });
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Kind of the message that answers this request, if any
    pub fn response_kind(&self) -> Option<&'static str> {
        match self {
            RpcMessage::MemHandleCreate { .. } => Some("MemHandleCreateResponse"),
            RpcMessage::MemHandlePin { .. } => Some("MemHandlePinResponse"),
            RpcMessage::MemGetAddress { .. } => Some("MemGetAddressResponse"),
            RpcMessage::PowerRegister { .. } => Some("PowerRegisterResponse"),
            RpcMessage::ModuleClockControl { .. } => Some("ModuleClockControlResponse"),
            RpcMessage::AttachModule { .. } => Some("AttachModuleResponse"),
            RpcMessage::DetachModule { .. } => Some("DetachModuleResponse"),
            _ => None,
        }
    }

    /// Short kind name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            RpcMessage::WatchdogReset => "WatchdogReset",
            RpcMessage::MemHandleCreate { .. } => "MemHandleCreate",
            RpcMessage::MemHandleCreateResponse { .. } => "MemHandleCreateResponse",
            RpcMessage::MemHandleFree { .. } => "MemHandleFree",
            RpcMessage::MemHandlePin { .. } => "MemHandlePin",
            RpcMessage::MemHandlePinResponse { .. } => "MemHandlePinResponse",
            RpcMessage::MemHandleUnpin { .. } => "MemHandleUnpin",
            RpcMessage::MemGetAddress { .. } => "MemGetAddress",
            RpcMessage::MemGetAddressResponse { .. } => "MemGetAddressResponse",
            RpcMessage::PowerRegister { .. } => "PowerRegister",
            RpcMessage::PowerRegisterResponse { .. } => "PowerRegisterResponse",
            RpcMessage::PowerUnregister { .. } => "PowerUnregister",
            RpcMessage::PowerStarvationHint { .. } => "PowerStarvationHint",
            RpcMessage::ModuleClockControl { .. } => "ModuleClockControl",
            RpcMessage::ModuleClockControlResponse { .. } => "ModuleClockControlResponse",
            RpcMessage::ModuleReset { .. } => "ModuleReset",
            RpcMessage::RemotePrintf { .. } => "RemotePrintf",
            RpcMessage::AttachModule { .. } => "AttachModule",
            RpcMessage::AttachModuleResponse { .. } => "AttachModuleResponse",
            RpcMessage::DetachModule { .. } => "DetachModule",
            RpcMessage::DetachModuleResponse { .. } => "DetachModuleResponse",
        }
    }
}
