//! Port arena
//!
//! Ports live in generation-tagged slots. A [`PortId`] is the slot index plus
//! the slot's generation at insert time, so an identity that outlived its
//! port (for example one echoed back by the remote side after a close) no
//! longer resolves instead of aliasing the slot's next tenant.

use std::sync::Arc;

use crate::error::{Result, TransportError};
use crate::port::{Port, PortId, PortName, PortState};

/// Slots addressable by the 16-bit index half of a `PortId`
const MAX_SLOTS: usize = 1 << 16;

#[derive(Debug)]
struct Slot {
    generation: u16,
    port: Option<Arc<Port>>,
}

/// Slab of open ports
#[derive(Debug, Default)]
pub(crate) struct PortArena {
    slots: Vec<Slot>,
    free: Vec<u16>,
    open: usize,
}

impl PortArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Place a port built by `build` into a free slot
    ///
    /// # Errors
    /// `InsufficientMemory` when every slot is taken.
    pub(crate) fn insert(&mut self, build: impl FnOnce(PortId) -> Port) -> Result<Arc<Port>> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() == MAX_SLOTS {
                    return Err(TransportError::InsufficientMemory {
                        requested: core::mem::size_of::<Port>(),
                    });
                }
                self.slots.push(Slot {
                    generation: 0,
                    port: None,
                });
                (self.slots.len() - 1) as u16
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        let port = Arc::new(build(PortId::new(index, slot.generation)));
        slot.port = Some(Arc::clone(&port));
        self.open += 1;
        Ok(port)
    }

    pub(crate) fn get(&self, id: PortId) -> Option<Arc<Port>> {
        self.slots
            .get(id.slot())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.port.clone())
    }

    pub(crate) fn remove(&mut self, id: PortId) -> Option<Arc<Port>> {
        let slot = self.slots.get_mut(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        let port = slot.port.take()?;
        self.free.push(id.slot() as u16);
        self.open -= 1;
        Some(port)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Port>> {
        self.slots.iter().filter_map(|slot| slot.port.as_ref())
    }

    pub(crate) fn named<'a>(&'a self, name: &'a PortName) -> impl Iterator<Item = &'a Arc<Port>> {
        self.iter().filter(move |port| port.name() == name)
    }

    /// A port with this name blocked in `wait_for_connect` that a remote
    /// Connect may claim; ports linked to a local peer are never returned
    pub(crate) fn find_waiting(&self, name: &PortName) -> Option<Arc<Port>> {
        self.named(name)
            .find(|port| port.state() == PortState::Waiting && port.local_peer().is_none())
            .cloned()
    }

    pub(crate) fn contains_name(&self, name: &PortName) -> bool {
        self.named(name).next().is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.open
    }
}
