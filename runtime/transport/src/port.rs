//! Ports - named endpoints and their connection state
//!
//! ```text
//!            wait_for_connect            remote/local match
//!   Open ──────────────────────▶ Waiting ──────────────────▶ Connected
//!    │  ◀────────── timeout ──────┘  │                          │
//!    │                               │ close                    │ peer closed
//!    └──── connect ─────────────────┐▼                          ▼
//!                        Connected ◀┘ Destroying           Disconnected
//! ```
//!
//! `Waiting` is the only state two parties race over (the blocked waiter and
//! a closer, or the waiter timing out and a late connect). Both sides use a
//! single compare-exchange out of `Waiting`; the winner owns what follows.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bitflags::bitflags;

use crate::error::{Result, TransportError};
use crate::queue::MessageQueue;
use crate::sync::Semaphore;
use crate::wire::MAX_PORT_NAME_LEN;

/// Character reserved for generated names
pub const GENERATED_NAME_MARKER: u8 = b'+';

/// Port connection state
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Created, not linked
    Open = 1,
    /// A thread is blocked in `wait_for_connect`
    Waiting,
    /// Usable for send and receive
    Connected,
    /// Peer went away; queued messages can still be drained
    Disconnected,
    /// Closed while a waiter was blocked; the waiter finishes teardown
    Destroying,
}

impl PortState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => PortState::Open,
            2 => PortState::Waiting,
            3 => PortState::Connected,
            4 => PortState::Disconnected,
            5 => PortState::Destroying,
            other => unreachable!("corrupt port state {}", other),
        }
    }
}

/// Port state shared between threads and the interrupt path
#[derive(Debug)]
pub struct AtomicPortState(AtomicU32);

impl AtomicPortState {
    pub fn new(state: PortState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    pub fn load(&self) -> PortState {
        PortState::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: PortState) {
        self.0.store(state as u32, Ordering::Release);
    }

    /// Move from `current` to `new`; returns whether this call won
    pub fn transition(&self, current: PortState, new: PortState) -> bool {
        self.0
            .compare_exchange(
                current as u32,
                new as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

bitflags! {
    /// Static properties fixed at open time
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u8 {
        /// Queue size is fixed; `set_queue_depth` is a no-op within bounds
        const FIXED_DEPTH = 0x01;
        /// Name was generated by the transport
        const GENERATED_NAME = 0x02;
        /// Receives the watchdog reset notification
        const RESET_SINK = 0x04;
    }
}

/// Bounded port name (at most 16 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortName {
    bytes: [u8; MAX_PORT_NAME_LEN],
    len: u8,
}

impl PortName {
    /// Validate a caller-supplied name
    ///
    /// # Errors
    /// `BadParameter` if the name is empty, longer than 16 bytes, or contains
    /// NUL or the reserved `+`.
    pub fn new(name: &str) -> Result<Self> {
        let raw = name.as_bytes();
        if raw.is_empty() {
            return Err(TransportError::BadParameter("empty port name"));
        }
        if raw.len() > MAX_PORT_NAME_LEN {
            return Err(TransportError::BadParameter("port name longer than 16 bytes"));
        }
        if raw.iter().any(|&b| b == 0 || b == GENERATED_NAME_MARKER) {
            return Err(TransportError::BadParameter("port name contains a reserved character"));
        }
        Ok(Self::from_bytes(raw))
    }

    fn from_bytes(raw: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_PORT_NAME_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Self {
            bytes,
            len: raw.len() as u8,
        }
    }

    /// Decode a NUL-padded wire name
    pub fn from_wire(raw: &[u8; MAX_PORT_NAME_LEN]) -> Option<Self> {
        let len = raw.iter().position(|&b| b == 0).unwrap_or(MAX_PORT_NAME_LEN);
        if len == 0 {
            return None;
        }
        core::str::from_utf8(&raw[..len]).ok()?;
        Some(Self::from_bytes(&raw[..len]))
    }

    /// NUL-padded wire form
    pub fn to_wire(&self) -> [u8; MAX_PORT_NAME_LEN] {
        self.bytes
    }

    pub fn as_str(&self) -> &str {
        // constructors only accept UTF-8
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_generated(&self) -> bool {
        self.as_str().as_bytes().last() == Some(&GENERATED_NAME_MARKER)
    }
}

impl core::fmt::Debug for PortName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl core::fmt::Display for PortName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolling generator for anonymous port names
///
/// Produces `baaaaaaa+`, `caaaaaaa+`, … carrying into the next letter after
/// `y`. The trailing `+` keeps generated names disjoint from supplied ones.
#[derive(Debug)]
pub(crate) struct UniqueNames {
    letters: [u8; 8],
}

impl UniqueNames {
    pub(crate) fn new() -> Self {
        Self { letters: [b'a'; 8] }
    }

    pub(crate) fn next_name(&mut self) -> PortName {
        for letter in self.letters.iter_mut() {
            *letter += 1;
            if *letter != b'z' {
                break;
            }
            *letter = b'a';
        }
        let mut raw = [0u8; 9];
        raw[..8].copy_from_slice(&self.letters);
        raw[8] = GENERATED_NAME_MARKER;
        PortName::from_bytes(&raw)
    }
}

/// Opaque port identity: generation in the high half, arena slot in the low.
///
/// Also the value carried on the wire, so it is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u32);

impl PortId {
    pub(crate) fn new(slot: u16, generation: u16) -> Self {
        debug_assert!(generation != 0);
        Self(((generation as u32) << 16) | slot as u32)
    }

    /// Parse a wire value; zero means "no port"
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw >> 16 == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub(crate) fn slot(&self) -> usize {
        (self.0 & 0xffff) as usize
    }

    pub(crate) fn generation(&self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl core::fmt::Display for PortId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Caller-facing handle to an open port
pub type PortHandle = PortId;

/// A named endpoint
pub struct Port {
    id: PortId,
    name: PortName,
    flags: PortFlags,
    state: AtomicPortState,
    queue: RwLock<Arc<MessageQueue>>,
    /// Same-process partner (by id); never owns the partner
    local_peer: AtomicU32,
    /// Partner on the other processor; zero when none
    remote_id: AtomicU32,
    notify: Semaphore,
    connect_wait: Mutex<Option<Arc<Semaphore>>>,
}

impl Port {
    pub(crate) fn new(id: PortId, name: PortName, flags: PortFlags, queue: MessageQueue) -> Self {
        Self {
            id,
            name,
            flags,
            state: AtomicPortState::new(PortState::Open),
            queue: RwLock::new(Arc::new(queue)),
            local_peer: AtomicU32::new(0),
            remote_id: AtomicU32::new(0),
            notify: Semaphore::new(0),
            connect_wait: Mutex::new(None),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &PortName {
        &self.name
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn state(&self) -> PortState {
        self.state.load()
    }

    pub(crate) fn state_cell(&self) -> &AtomicPortState {
        &self.state
    }

    /// Current receive queue
    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn replace_queue(&self, queue: MessageQueue) {
        *self.queue.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(queue);
    }

    pub fn local_peer(&self) -> Option<PortId> {
        PortId::from_raw(self.local_peer.load(Ordering::Acquire))
    }

    pub(crate) fn set_local_peer(&self, peer: Option<PortId>) {
        self.local_peer
            .store(peer.map_or(0, |p| p.raw()), Ordering::Release);
    }

    /// Remote identity, or 0 when not remotely connected
    pub fn remote_id(&self) -> u32 {
        self.remote_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_remote_id(&self, remote: u32) {
        self.remote_id.store(remote, Ordering::Release);
    }

    /// Semaphore signaled per queued message and on connect
    pub fn notify(&self) -> &Semaphore {
        &self.notify
    }

    pub(crate) fn publish_connect_wait(&self, sem: Option<Arc<Semaphore>>) {
        *self
            .connect_wait
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = sem;
    }

    /// Wake the thread blocked in `wait_for_connect`, if any
    pub(crate) fn wake_connect_waiter(&self) {
        let waiter = self
            .connect_wait
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sem) = waiter {
            sem.signal();
        }
    }
}

impl core::fmt::Debug for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local_peer", &self.local_peer())
            .field("remote_id", &format_args!("{:#x}", self.remote_id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(PortName::new("RPC_AVP_PORT").is_ok());
        assert!(PortName::new("exactly16bytes!!").is_ok());
        assert!(PortName::new("seventeen_bytes!!").is_err());
        assert!(PortName::new("").is_err());
        assert!(PortName::new("bad+name").is_err());
        assert!(PortName::new("nul\0name").is_err());
    }

    #[test]
    fn test_wire_name_roundtrip_at_max_length() {
        let name = PortName::new("exactly16bytes!!").expect("name");
        assert_eq!(PortName::from_wire(&name.to_wire()), Some(name));
        assert_eq!(PortName::from_wire(&[0u8; MAX_PORT_NAME_LEN]), None);
    }

    #[test]
    fn test_generated_names_roll() {
        let mut names = UniqueNames::new();
        assert_eq!(names.next_name().as_str(), "baaaaaaa+");
        assert_eq!(names.next_name().as_str(), "caaaaaaa+");
        for _ in 0..22 {
            names.next_name();
        }
        // 'y' carries into the next letter
        assert_eq!(names.next_name().as_str(), "abaaaaaa+");
        assert!(names.next_name().is_generated());
    }

    #[test]
    fn test_port_id_encoding() {
        let id = PortId::new(3, 7);
        assert_eq!(id.raw(), 0x0007_0003);
        assert_eq!(id.slot(), 3);
        assert_eq!(id.generation(), 7);
        assert_eq!(PortId::from_raw(id.raw()), Some(id));
        assert_eq!(PortId::from_raw(0), None);
        assert_eq!(PortId::from_raw(0x0000_0005), None);
    }

    #[test]
    fn test_state_transition_single_winner() {
        let state = AtomicPortState::new(PortState::Waiting);
        assert!(state.transition(PortState::Waiting, PortState::Destroying));
        assert!(!state.transition(PortState::Waiting, PortState::Open));
        assert_eq!(state.load(), PortState::Destroying);
    }
}
