//! Transport - port coordinator for one processor
//!
//! # Purpose
//! Owns the port arena, the shared mailbox and the interrupt handler, and
//! implements open/close/connect/send/recv on top of them.
//!
//! # Integration Points
//! - Depends on: `avp-xpc` doorbell and physical memory
//! - Provides to: `avp-rpc` sessions and any direct transport client
//!
//! # Architecture
//! One `Transport` exists per processor, constructed at start-up and shared
//! as `Arc<Transport>`. Two locks cover the shared state:
//! - `registry` serializes port creation/removal, handshakes and every write
//!   to the outbound mailbox half
//! - `ports` is a read-mostly lock on the arena, held only long enough to
//!   clone a port out; the interrupt path uses it instead of `registry`
//!
//! Queue producers (the interrupt path, local senders and the backpressure
//! replay in `recv`) additionally pass through `producer_gate`, which stands
//! in for masking the mailbox interrupt.

mod interrupt;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Instant;

use avp_xpc::{ImageLoader, Platform, Processor};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::port::{Port, PortFlags, PortHandle, PortName, PortState, UniqueNames};
use crate::queue::{MessageQueue, QueueError};
use crate::registry::PortArena;
use crate::sync::{Pacer, Semaphore, Timeout};
use crate::wire::{
    Command, MailboxPair, MailboxRecord, MAILBOX_SIZE, MAX_MESSAGE_LEN, THROTTLE_WORD,
};

/// State guarded by the registry mutex
#[derive(Debug)]
struct Registry {
    names: UniqueNames,
}

/// Port transport for one side of the CPU/AVP link
pub struct Transport {
    config: TransportConfig,
    processor: Processor,
    platform: Option<Platform>,
    registry: Mutex<Registry>,
    ports: RwLock<PortArena>,
    producer_gate: Mutex<()>,
    mailbox: OnceLock<MailboxPair>,
    reset_port: PortName,
    /// A Connect is in flight and its Response belongs to a waiting thread
    awaiting_response: AtomicBool,
    /// Bumped by the interrupt path when it parks a message on a full queue
    backpressure_on: AtomicU32,
    /// Bumped by `recv` when it replays the parked message
    backpressure_off: AtomicU32,
    irq_registered: AtomicBool,
}

impl Transport {
    /// Create the transport for `processor`
    ///
    /// Without a platform the transport only supports local connections.
    ///
    /// # Errors
    /// - `BadParameter` for an unusable configuration
    /// - `Platform` if the interrupt handler cannot be registered
    pub fn init(
        config: TransportConfig,
        processor: Processor,
        platform: Option<Platform>,
    ) -> Result<Arc<Self>> {
        if config.default_queue_depth == 0 {
            return Err(TransportError::BadParameter("default queue depth must be nonzero"));
        }
        let reset_port = PortName::new(&config.reset_port)?;

        let transport = Arc::new(Self {
            config,
            processor,
            platform,
            registry: Mutex::new(Registry {
                names: UniqueNames::new(),
            }),
            ports: RwLock::new(PortArena::new()),
            producer_gate: Mutex::new(()),
            mailbox: OnceLock::new(),
            reset_port,
            awaiting_response: AtomicBool::new(false),
            backpressure_on: AtomicU32::new(0),
            backpressure_off: AtomicU32::new(0),
            irq_registered: AtomicBool::new(false),
        });

        if let Some(platform) = &transport.platform {
            let weak = Arc::downgrade(&transport);
            platform.doorbell.register_interrupt(Arc::new(move || {
                if let Some(transport) = weak.upgrade() {
                    transport.handle_interrupt();
                }
            }))?;
            transport.irq_registered.store(true, Ordering::Release);
        }

        log::info!(
            "{}: transport up (queue depth {}, {})",
            processor,
            transport.config.default_queue_depth,
            if transport.platform.is_some() { "mailbox attached" } else { "local only" }
        );
        Ok(transport)
    }

    /// Load the remote image and hand the remote processor its mailbox
    ///
    /// Allocates the mailbox pair, throttles the outbound half until the
    /// remote side acknowledges the address, then rings the doorbell with
    /// the mailbox base.
    ///
    /// # Returns
    /// The entry point reported by the loader
    ///
    /// # Errors
    /// - `BadParameter` if called on the AVP, without a platform, or twice
    /// - `Platform`/`InsufficientMemory` from the loader or allocator
    pub fn boot_remote(&self, loader: &dyn ImageLoader, image: &str) -> Result<u32> {
        if self.processor != Processor::Cpu {
            return Err(TransportError::BadParameter("only the CPU boots the remote processor"));
        }
        let platform = self
            .platform
            .as_ref()
            .ok_or(TransportError::BadParameter("no platform attached"))?;
        if self.mailbox.get().is_some() {
            return Err(TransportError::BadParameter("remote processor already booted"));
        }

        let entry = loader.load_and_relocate(image)?;
        let (phys, region) = platform.memory.allocate(MAILBOX_SIZE)?;
        let mailbox = MailboxPair::for_cpu(phys, region);
        mailbox.outbound.set_command_word(THROTTLE_WORD);
        mailbox.inbound.set_command(Command::None);
        if self.mailbox.set(mailbox).is_err() {
            platform.memory.free(phys);
            return Err(TransportError::BadParameter("remote processor already booted"));
        }

        platform.doorbell.signal(phys);
        log::info!(
            "cpu: booted '{}' (entry {:#x}), mailbox at {:#x}",
            image,
            entry,
            phys
        );
        Ok(entry)
    }

    /// Whether the mailbox is latched on both sides and free of the throttle
    pub fn is_mailbox_ready(&self) -> bool {
        self.mailbox
            .get()
            .is_some_and(|m| m.outbound.command_word() != THROTTLE_WORD)
    }

    /// Create a port
    ///
    /// With `None` a unique name is generated. Opening a name that is
    /// already open links the two ports as local peers.
    ///
    /// # Errors
    /// - `BadParameter` for an invalid name
    /// - `AlreadyExists` if the name already has a linked pair or a
    ///   connected port
    /// - `InsufficientMemory` if the queue or slot cannot be allocated
    pub fn open(&self, name: Option<&str>) -> Result<PortHandle> {
        let mut registry = self.lock_registry();

        let (name, mut flags) = match name {
            Some(name) => (PortName::new(name)?, PortFlags::empty()),
            None => {
                let mut name = registry.names.next_name();
                while self.ports().contains_name(&name) {
                    name = registry.names.next_name();
                }
                (name, PortFlags::GENERATED_NAME)
            }
        };
        if self.config.is_fixed_depth(name.as_str()) {
            flags |= PortFlags::FIXED_DEPTH;
        }
        if name == self.reset_port {
            flags |= PortFlags::RESET_SINK;
        }

        let mut ports = self.ports_mut();
        let partner = {
            let mut existing = ports.named(&name);
            match (existing.next(), existing.next()) {
                (None, _) => None,
                (Some(first), None)
                    if first.local_peer().is_none()
                        && first.remote_id() == 0
                        && matches!(first.state(), PortState::Open | PortState::Waiting) =>
                {
                    Some(Arc::clone(first))
                }
                _ => {
                    return Err(TransportError::AlreadyExists {
                        name: name.to_string(),
                    })
                }
            }
        };

        let queue = MessageQueue::with_depth(self.config.default_queue_depth, MAX_MESSAGE_LEN)?;
        let port = ports.insert(|id| Port::new(id, name, flags, queue))?;
        if let Some(partner) = partner {
            partner.set_local_peer(Some(port.id()));
            port.set_local_peer(Some(partner.id()));
            log::debug!("{}: '{}' linked to local peer {}", self.processor, name, partner.id());
        }
        drop(ports);
        drop(registry);

        log::debug!("{}: opened '{}' as {}", self.processor, name, port.id());
        Ok(port.id())
    }

    /// Close a port
    ///
    /// A port blocked in `wait_for_connect` is handed over to its waiter,
    /// which finishes the teardown. A connected peer is told it was
    /// disconnected.
    ///
    /// # Errors
    /// `Closed` if the handle is already closed.
    pub fn close(&self, handle: PortHandle) -> Result<()> {
        let registry = self.lock_registry();
        let port = self
            .ports_mut()
            .remove(handle)
            .ok_or(TransportError::Closed)?;

        if port.state_cell().transition(PortState::Waiting, PortState::Destroying) {
            port.wake_connect_waiter();
            log::debug!("{}: '{}' closed while waiting", self.processor, port.name());
            return Ok(());
        }

        self.teardown(&port, registry);
        Ok(())
    }

    /// Unlink a removed port from its peers
    fn teardown(&self, port: &Port, registry: MutexGuard<'_, Registry>) {
        if let Some(peer_id) = port.local_peer() {
            if let Some(peer) = self.ports().get(peer_id) {
                peer.set_local_peer(None);
                if peer
                    .state_cell()
                    .transition(PortState::Connected, PortState::Disconnected)
                {
                    peer.notify().signal();
                }
            }
            port.set_local_peer(None);
        }
        drop(registry);

        let remote = port.remote_id();
        if remote != 0 {
            port.set_remote_id(0);
            self.send_disconnect(remote);
        }

        // wake anyone still blocked on the port
        port.notify().signal();
        log::debug!("{}: closed '{}' ({})", self.processor, port.name(), port.id());
    }

    fn send_disconnect(&self, remote: u32) {
        let record = MailboxRecord::Disconnect { remote };
        let timeout = Timeout::After(self.config.disconnect_timeout());
        if let Err(e) = self.transmit(&record, timeout) {
            log::warn!(
                "{}: could not deliver disconnect for remote port {:#x}: {}",
                self.processor,
                remote,
                e
            );
        }
    }

    /// Connect an open port to its partner
    ///
    /// A local peer blocked in `wait_for_connect` is connected directly.
    /// Otherwise a Connect request goes over the mailbox; a missing listener
    /// or an unanswered request is retried until `timeout`.
    ///
    /// # Errors
    /// - `InvalidState` unless the port is `Open`
    /// - `ConnectTimeout` if no partner showed up in time
    /// - `Closed` if the port was closed during the handshake
    pub fn connect(&self, handle: PortHandle, timeout: Timeout) -> Result<()> {
        let port = self.port(handle)?;
        let state = port.state();
        if state != PortState::Open {
            return Err(TransportError::InvalidState { state });
        }

        let start = Instant::now();
        loop {
            if self.try_connect(&port, timeout)? {
                return Ok(());
            }
            match timeout.remaining(start) {
                Some(left) if left.is_zero() => {
                    log::debug!("{}: connect '{}' timed out", self.processor, port.name());
                    return Err(TransportError::ConnectTimeout);
                }
                Some(left) => thread::sleep(left.min(self.config.connect_retry())),
                None => thread::sleep(self.config.connect_retry()),
            }
        }
    }

    /// One connect attempt; `Ok(false)` means try again later
    fn try_connect(&self, port: &Port, timeout: Timeout) -> Result<bool> {
        let registry = self.lock_registry();

        if let Some(peer_id) = port.local_peer() {
            let Some(peer) = self.ports().get(peer_id) else {
                return Ok(false);
            };
            if !peer
                .state_cell()
                .transition(PortState::Waiting, PortState::Connected)
            {
                return Ok(false);
            }
            port.state_cell().store(PortState::Connected);
            peer.notify().signal();
            peer.wake_connect_waiter();
            log::debug!("{}: '{}' connected locally", self.processor, port.name());
            return Ok(true);
        }

        let Some(mailbox) = self.mailbox.get() else {
            return Ok(false);
        };
        let record = MailboxRecord::Connect {
            requester: port.id().raw(),
            name: port.name(),
        };
        if !self.try_transmit(mailbox, &record) {
            return Ok(false);
        }
        self.awaiting_response.store(true, Ordering::Release);
        drop(registry);

        let responder =
            self.await_response(mailbox, timeout.at_least(self.config.min_response_wait()));
        self.awaiting_response.store(false, Ordering::Release);

        match responder {
            None => {
                log::warn!("{}: no response to connect '{}'", self.processor, port.name());
                Ok(false)
            }
            Some(0) => {
                log::trace!("{}: no listener for '{}' yet", self.processor, port.name());
                Ok(false)
            }
            Some(remote) => {
                port.set_remote_id(remote);
                let still_open = self.ports().get(port.id()).is_some();
                if !still_open
                    || !port
                        .state_cell()
                        .transition(PortState::Open, PortState::Connected)
                {
                    port.set_remote_id(0);
                    self.send_disconnect(remote);
                    return Err(TransportError::Closed);
                }
                log::debug!(
                    "{}: '{}' connected to remote port {:#x}",
                    self.processor,
                    port.name(),
                    remote
                );
                Ok(true)
            }
        }
    }

    /// Poll the outbound half for the Response to our Connect
    fn await_response(&self, mailbox: &MailboxPair, wait: Timeout) -> Option<u32> {
        let pacer = Pacer::new(self.config.poll_time(), self.config.sleep_step());
        loop {
            if mailbox.outbound.command() == Ok(Command::Response) {
                let responder = mailbox.outbound.operand(0);
                mailbox.outbound.set_command(Command::None);
                return Some(responder);
            }
            if wait.expired(pacer.start()) {
                mailbox.outbound.set_command(Command::None);
                return None;
            }
            pacer.pause();
        }
    }

    /// Block until a partner connects to this port
    ///
    /// # Errors
    /// - `InvalidState` unless the port is `Open`
    /// - `ConnectTimeout` on timeout; the port is `Open` again
    /// - `ConnectionFailed` if the port was closed while waiting
    pub fn wait_for_connect(&self, handle: PortHandle, timeout: Timeout) -> Result<()> {
        let port = self.port(handle)?;
        let connected = Arc::new(Semaphore::new(0));
        {
            let _registry = self.lock_registry();
            let state = port.state();
            if state != PortState::Open {
                return Err(TransportError::InvalidState { state });
            }
            port.publish_connect_wait(Some(Arc::clone(&connected)));
            port.state_cell().store(PortState::Waiting);
        }

        if !connected.wait(timeout) {
            // a connect may still land between the timeout and this exchange
            port
                .state_cell()
                .transition(PortState::Waiting, PortState::Open);
        }
        port.publish_connect_wait(None);

        match port.state() {
            PortState::Connected | PortState::Disconnected => Ok(()),
            PortState::Open => Err(TransportError::ConnectTimeout),
            PortState::Destroying => {
                let registry = self.lock_registry();
                self.teardown(&port, registry);
                Err(TransportError::ConnectionFailed)
            }
            state => Err(TransportError::InvalidState { state }),
        }
    }

    /// Send a message to the port's partner
    ///
    /// # Errors
    /// - `BadParameter` if the payload exceeds the wire maximum
    /// - `Disconnected`/`NotConnected` unless the port is connected
    /// - `MailboxFull` when a local partner's queue stays full
    /// - `MailboxBusy`/`Timeout` when the mailbox stays busy
    pub fn send(&self, handle: PortHandle, payload: &[u8], timeout: Timeout) -> Result<()> {
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(TransportError::BadParameter("message exceeds the wire maximum"));
        }
        let port = self.port(handle)?;
        match port.state() {
            PortState::Connected => {}
            PortState::Disconnected => return Err(TransportError::Disconnected),
            state => return Err(TransportError::NotConnected { state }),
        }

        let remote = port.remote_id();
        if remote != 0 {
            let record = MailboxRecord::Message {
                destination: remote,
                payload,
            };
            return self.transmit(&record, timeout);
        }
        match port.local_peer() {
            Some(peer) => self.send_local(peer, payload, timeout),
            None => Err(TransportError::Disconnected),
        }
    }

    fn send_local(&self, peer_id: PortHandle, payload: &[u8], timeout: Timeout) -> Result<()> {
        let pacer = Pacer::new(self.config.poll_time(), self.config.sleep_step());
        loop {
            {
                let _registry = self.lock_registry();
                let peer = self
                    .ports()
                    .get(peer_id)
                    .ok_or(TransportError::Disconnected)?;
                let inserted = {
                    let _gate = self.producer_gate();
                    peer.queue().insert(payload)
                };
                match inserted {
                    Ok(()) => {
                        peer.notify().signal();
                        return Ok(());
                    }
                    Err(QueueError::QueueFull { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if timeout.expired(pacer.start()) {
                return Err(TransportError::MailboxFull);
            }
            pacer.pause();
        }
    }

    /// Write `record` to the outbound half, retrying while it is busy
    fn transmit(&self, record: &MailboxRecord<'_>, timeout: Timeout) -> Result<()> {
        let mailbox = self.mailbox.get().ok_or(TransportError::ConnectionFailed)?;
        let pacer = Pacer::new(self.config.poll_time(), self.config.sleep_step());
        loop {
            let sent = {
                let _registry = self.lock_registry();
                self.try_transmit(mailbox, record)
            };
            if sent {
                return Ok(());
            }
            if timeout.expired(pacer.start()) {
                return Err(if timeout.is_zero() {
                    TransportError::MailboxBusy
                } else {
                    TransportError::Timeout
                });
            }
            pacer.pause();
        }
    }

    /// One transmit attempt; caller holds the registry mutex
    fn try_transmit(&self, mailbox: &MailboxPair, record: &MailboxRecord<'_>) -> bool {
        if !mailbox.outbound.is_clear() {
            let late_response = mailbox.outbound.command() == Ok(Command::Response)
                && !self.awaiting_response.load(Ordering::Acquire);
            if !late_response {
                return false;
            }
            log::warn!("{}: discarding late connect response", self.processor);
            mailbox.outbound.set_command(Command::None);
        }
        mailbox.outbound.write_record(record);
        if let Some(platform) = &self.platform {
            platform.doorbell.signal(mailbox.outbound_addr());
        }
        true
    }

    /// Take the oldest message queued on the port
    ///
    /// # Returns
    /// Number of bytes written to `out`
    ///
    /// # Errors
    /// - `MailboxEmpty` if nothing is queued
    /// - `Disconnected` once a disconnected port is drained
    /// - `BufferTooSmall` leaves the message queued
    pub fn recv(&self, handle: PortHandle, out: &mut [u8]) -> Result<usize> {
        let port = self.port(handle)?;
        let state = port.state();
        if !matches!(state, PortState::Connected | PortState::Disconnected) {
            return Err(TransportError::NotConnected { state });
        }

        let _registry = self.lock_registry();
        match port.queue().extract(out) {
            Ok(len) => {
                self.replay_parked_message();
                Ok(len)
            }
            Err(QueueError::QueueEmpty) if port.state() == PortState::Disconnected => {
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resize an open port's queue
    ///
    /// Fixed-depth ports accept any request their current queue satisfies
    /// and are left untouched.
    ///
    /// # Errors
    /// - `BadParameter` for a zero or oversized request
    /// - `InvalidState` unless the port is `Open`
    /// - `QueueNotEmpty` if unread messages are queued
    /// - `InsufficientMemory` if the new queue cannot be allocated
    pub fn set_queue_depth(
        &self,
        handle: PortHandle,
        depth: usize,
        max_message_size: usize,
    ) -> Result<()> {
        if depth == 0 || max_message_size == 0 || max_message_size > MAX_MESSAGE_LEN {
            return Err(TransportError::BadParameter("queue depth or message size out of range"));
        }
        let port = self.port(handle)?;
        let _registry = self.lock_registry();

        let state = port.state();
        if state != PortState::Open {
            return Err(TransportError::InvalidState { state });
        }

        let current = port.queue();
        if port.flags().contains(PortFlags::FIXED_DEPTH) {
            if depth <= current.depth() && max_message_size <= current.max_message_size() {
                return Ok(());
            }
            return Err(TransportError::BadParameter("request exceeds a fixed-depth port"));
        }

        let _gate = self.producer_gate();
        let pending = current.len();
        if pending > 0 {
            return Err(TransportError::QueueNotEmpty { pending });
        }
        port.replace_queue(MessageQueue::with_depth(depth, max_message_size)?);
        log::debug!(
            "{}: '{}' queue now {} x {} bytes",
            self.processor,
            port.name(),
            depth,
            max_message_size
        );
        Ok(())
    }

    /// Block until a message is queued on the port (or it is signaled)
    ///
    /// # Errors
    /// `Timeout` if nothing arrived in time, `Closed` for a closed handle.
    pub fn wait_message(&self, handle: PortHandle, timeout: Timeout) -> Result<()> {
        let port = self.port(handle)?;
        if port.notify().wait(timeout) {
            Ok(())
        } else {
            Err(TransportError::Timeout)
        }
    }

    /// Wake one waiter on the port without queueing anything
    pub fn signal_port(&self, handle: PortHandle) -> Result<()> {
        self.port(handle)?.notify().signal();
        Ok(())
    }

    /// The port's name, generated or supplied
    pub fn port_name(&self, handle: PortHandle) -> Result<PortName> {
        Ok(*self.port(handle)?.name())
    }

    pub fn port_state(&self, handle: PortHandle) -> Result<PortState> {
        Ok(self.port(handle)?.state())
    }

    /// Messages queued and not yet received on the port
    pub fn pending(&self, handle: PortHandle) -> Result<usize> {
        Ok(self.port(handle)?.queue().len())
    }

    /// Ports currently open
    pub fn open_ports(&self) -> usize {
        self.ports().len()
    }

    /// Times the interrupt path parked a message on a full queue
    pub fn backpressure_events(&self) -> u32 {
        self.backpressure_on.load(Ordering::Acquire)
    }

    pub fn processor(&self) -> Processor {
        self.processor
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn port(&self, handle: PortHandle) -> Result<Arc<Port>> {
        self.ports().get(handle).ok_or(TransportError::Closed)
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ports(&self) -> RwLockReadGuard<'_, PortArena> {
        self.ports.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn ports_mut(&self) -> RwLockWriteGuard<'_, PortArena> {
        self.ports.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn producer_gate(&self) -> MutexGuard<'_, ()> {
        self.producer_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let Some(platform) = &self.platform else {
            return;
        };
        if self.irq_registered.load(Ordering::Acquire) {
            platform.doorbell.unregister_interrupt();
        }
        if self.processor == Processor::Cpu {
            if let Some(mailbox) = self.mailbox.get() {
                platform.memory.free(mailbox.phys);
            }
        }
        log::debug!("{}: transport down", self.processor);
    }
}

impl core::fmt::Debug for Transport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transport")
            .field("processor", &self.processor)
            .field("open_ports", &self.open_ports())
            .field("mailbox", &self.mailbox.get().map(|m| m.phys))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local() -> Arc<Transport> {
        Transport::init(TransportConfig::default(), Processor::Cpu, None).expect("transport")
    }

    #[test]
    fn test_open_generates_names() {
        let transport = local();
        let a = transport.open(None).expect("open");
        let b = transport.open(None).expect("open");
        assert_eq!(transport.port_name(a).expect("name").as_str(), "baaaaaaa+");
        assert_eq!(transport.port_name(b).expect("name").as_str(), "caaaaaaa+");
        assert_eq!(transport.port_state(a), Ok(PortState::Open));
    }

    #[test]
    fn test_third_open_of_a_name_is_rejected() {
        let transport = local();
        transport.open(Some("svc")).expect("first");
        transport.open(Some("svc")).expect("second");
        assert!(matches!(
            transport.open(Some("svc")),
            Err(TransportError::AlreadyExists { .. })
        ));
        assert!(matches!(
            transport.open(Some("bad+name")),
            Err(TransportError::BadParameter(_))
        ));
    }

    #[test]
    fn test_connect_without_partner_times_out() {
        let transport = local();
        let port = transport.open(Some("lonely")).expect("open");
        let start = Instant::now();
        assert_eq!(
            transport.connect(port, Timeout::millis(50)),
            Err(TransportError::ConnectTimeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(transport.port_state(port), Ok(PortState::Open));
    }

    #[test]
    fn test_send_and_recv_require_connection() {
        let transport = local();
        let port = transport.open(Some("idle")).expect("open");
        assert_eq!(
            transport.send(port, b"x", Timeout::ZERO),
            Err(TransportError::NotConnected { state: PortState::Open })
        );
        let mut buf = [0u8; 8];
        assert_eq!(
            transport.recv(port, &mut buf),
            Err(TransportError::NotConnected { state: PortState::Open })
        );
        assert!(matches!(
            transport.send(port, &[0u8; MAX_MESSAGE_LEN + 1], Timeout::ZERO),
            Err(TransportError::BadParameter(_))
        ));
    }

    #[test]
    fn test_set_queue_depth() {
        let transport = local();
        let port = transport.open(Some("resize")).expect("open");
        transport.set_queue_depth(port, 4, 64).expect("resize");
        assert!(matches!(
            transport.set_queue_depth(port, 0, 64),
            Err(TransportError::BadParameter(_))
        ));

        let fixed = transport.open(Some("RPC_AVP_PORT")).expect("open");
        assert_eq!(transport.set_queue_depth(fixed, 10, 128), Ok(()));
        assert!(matches!(
            transport.set_queue_depth(fixed, 100, 128),
            Err(TransportError::BadParameter(_))
        ));
    }

    #[test]
    fn test_boot_remote_needs_platform() {
        let transport = local();
        let loader = avp_xpc::loopback::LoopbackLoader::new(0x1000);
        assert!(matches!(
            transport.boot_remote(&loader, "avp.axf"),
            Err(TransportError::BadParameter(_))
        ));
        assert!(!transport.is_mailbox_ready());
    }
}
