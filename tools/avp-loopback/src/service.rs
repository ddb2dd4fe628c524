//! Simulated AVP-side RPC service
//!
//! Answers memory, power and module requests with bookkeeping only, enough
//! for the CPU side to see realistic responses.

use std::collections::BTreeMap;

use avp_rpc::{RpcMessage, Service, STATUS_OK};

/// Status for requests naming an unknown handle or module
pub const STATUS_BAD_HANDLE: u32 = 1;

const PAGE_SIZE: u32 = 4096;
const CARVEOUT_BASE: u32 = 0x2000_0000;

#[derive(Debug, Default)]
pub struct AvpService {
    next_handle: u32,
    next_address: u32,
    handles: BTreeMap<u32, (u32, Option<u32>)>,
    power_clients: Vec<u32>,
    modules: Vec<u32>,
    pub requests: usize,
}

impl AvpService {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            next_address: CARVEOUT_BASE,
            ..Self::default()
        }
    }

    fn pin(&mut self, handle: u32) -> u32 {
        let Some((size, pinned)) = self.handles.get_mut(&handle) else {
            return 0;
        };
        if let Some(address) = pinned {
            return *address;
        }
        let address = self.next_address;
        self.next_address += size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        *pinned = Some(address);
        address
    }
}

impl Service for AvpService {
    fn handle(&mut self, request: RpcMessage) -> Option<RpcMessage> {
        self.requests += 1;
        match request {
            RpcMessage::WatchdogReset => {
                log::warn!("avp: watchdog reset requested");
                None
            }
            RpcMessage::MemHandleCreate { size } => {
                let handle = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(handle, (size, None));
                Some(RpcMessage::MemHandleCreateResponse {
                    status: STATUS_OK,
                    handle,
                })
            }
            RpcMessage::MemHandleFree { handle } => {
                self.handles.remove(&handle);
                None
            }
            RpcMessage::MemHandlePin { handle } => Some(RpcMessage::MemHandlePinResponse {
                address: self.pin(handle),
            }),
            RpcMessage::MemHandleUnpin { handle } => {
                if let Some((_, pinned)) = self.handles.get_mut(&handle) {
                    *pinned = None;
                }
                None
            }
            RpcMessage::MemGetAddress { handle, offset } => {
                let address = match self.handles.get(&handle) {
                    Some((_, Some(base))) => base + offset,
                    _ => 0,
                };
                Some(RpcMessage::MemGetAddressResponse { address })
            }
            RpcMessage::PowerRegister { client_id } => {
                let client_id = if client_id == 0 {
                    self.power_clients.len() as u32 + 1
                } else {
                    client_id
                };
                self.power_clients.push(client_id);
                Some(RpcMessage::PowerRegisterResponse {
                    status: STATUS_OK,
                    client_id,
                })
            }
            RpcMessage::PowerUnregister { client_id } => {
                self.power_clients.retain(|c| *c != client_id);
                None
            }
            RpcMessage::PowerStarvationHint {
                client_id,
                domain,
                starving,
            } => {
                log::debug!(
                    "avp: client {} starving={} on domain {}",
                    client_id,
                    starving,
                    domain
                );
                None
            }
            RpcMessage::ModuleClockControl {
                module,
                client_id,
                enable,
            } => {
                log::debug!("avp: module {} clock {} for {}", module, enable, client_id);
                Some(RpcMessage::ModuleClockControlResponse { status: STATUS_OK })
            }
            RpcMessage::ModuleReset { module } => {
                log::debug!("avp: reset module {}", module);
                None
            }
            RpcMessage::RemotePrintf { text } => {
                log::info!("avp: {}", text.trim_end());
                None
            }
            RpcMessage::AttachModule { entry_address, .. } => {
                self.modules.push(entry_address);
                Some(RpcMessage::AttachModuleResponse { status: STATUS_OK })
            }
            RpcMessage::DetachModule { entry_address } => {
                let before = self.modules.len();
                self.modules.retain(|m| *m != entry_address);
                let status = if self.modules.len() < before {
                    STATUS_OK
                } else {
                    STATUS_BAD_HANDLE
                };
                Some(RpcMessage::DetachModuleResponse { status })
            }
            other => {
                log::warn!("avp: unexpected {} from the CPU", other.kind());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_is_stable_and_page_aligned() {
        let mut service = AvpService::new();
        let Some(RpcMessage::MemHandleCreateResponse { handle: a, .. }) =
            service.handle(RpcMessage::MemHandleCreate { size: 100 })
        else {
            panic!("create failed");
        };
        let Some(RpcMessage::MemHandleCreateResponse { handle: b, .. }) =
            service.handle(RpcMessage::MemHandleCreate { size: 100 })
        else {
            panic!("create failed");
        };

        let first = service.pin(a);
        assert_eq!(first, CARVEOUT_BASE);
        assert_eq!(service.pin(a), first);
        assert_eq!(service.pin(b), CARVEOUT_BASE + PAGE_SIZE);
        assert_eq!(
            service.handle(RpcMessage::MemGetAddress { handle: b, offset: 8 }),
            Some(RpcMessage::MemGetAddressResponse {
                address: CARVEOUT_BASE + PAGE_SIZE + 8
            })
        );
    }

    #[test]
    fn test_detach_unknown_module() {
        let mut service = AvpService::new();
        assert_eq!(
            service.handle(RpcMessage::DetachModule { entry_address: 0x40 }),
            Some(RpcMessage::DetachModuleResponse {
                status: STATUS_BAD_HANDLE
            })
        );
        service.handle(RpcMessage::AttachModule {
            entry_address: 0x40,
            args: Vec::new(),
        });
        assert_eq!(
            service.handle(RpcMessage::DetachModule { entry_address: 0x40 }),
            Some(RpcMessage::DetachModuleResponse { status: STATUS_OK })
        );
    }
}
