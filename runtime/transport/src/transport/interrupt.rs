//! Mailbox interrupt dispatch
//!
//! Runs on the doorbell's interrupt path. It never takes the registry mutex
//! and never blocks beyond the producer gate; records are staged in a stack
//! buffer and ports are found through a short read lock on the arena.

use std::sync::atomic::Ordering;

use avp_xpc::{PhysAddr, Platform, Processor};

use super::Transport;
use crate::port::{PortFlags, PortId, PortState};
use crate::queue::QueueError;
use crate::wire::{
    Command, MailboxBuffer, MailboxPair, MAX_MESSAGE_LEN, RESET_NOTIFICATION,
    WATCHDOG_RESET_SENTINEL,
};

impl Transport {
    pub(super) fn handle_interrupt(&self) {
        let Some(platform) = self.platform.as_ref() else {
            return;
        };
        let delivered = platform.doorbell.last_delivered_value();
        if delivered == WATCHDOG_RESET_SENTINEL {
            self.deliver_reset_notification();
            return;
        }

        match self.mailbox.get() {
            Some(mailbox) => self.dispatch(&mailbox.inbound),
            None if self.processor == Processor::Avp => self.latch_mailbox(platform, delivered),
            None => log::warn!(
                "{}: interrupt {:#x} before the mailbox was allocated",
                self.processor,
                delivered
            ),
        }
    }

    /// First interrupt on the AVP: the delivered value is the mailbox base
    fn latch_mailbox(&self, platform: &Platform, phys: PhysAddr) {
        let region = match platform.memory.map(phys) {
            Ok(region) => region,
            Err(e) => {
                log::error!("{}: cannot map mailbox at {:#x}: {}", self.processor, phys, e);
                return;
            }
        };
        if self.mailbox.set(MailboxPair::for_avp(phys, region)).is_err() {
            log::warn!("{}: mailbox already latched", self.processor);
            return;
        }
        // acknowledge: lifts the CPU's throttle word
        if let Some(mailbox) = self.mailbox.get() {
            mailbox.inbound.set_command(Command::None);
        }
        log::info!("{}: mailbox latched at {:#x}", self.processor, phys);
    }

    fn dispatch(&self, inbound: &MailboxBuffer) {
        match inbound.command() {
            Ok(Command::Connect) => self.on_connect(inbound),
            Ok(Command::Disconnect) => self.on_disconnect(inbound),
            Ok(Command::Message) => {
                let _gate = self.producer_gate();
                self.on_message(inbound);
            }
            // polled by the requester on its own side
            Ok(Command::Response) => {}
            Ok(Command::None) => log::trace!("{}: spurious mailbox interrupt", self.processor),
            Ok(Command::SetBufferInfo) => {
                log::debug!("{}: ignoring SetBufferInfo", self.processor);
                inbound.set_command(Command::None);
            }
            Err(raw) => {
                log::error!("{}: unknown mailbox command {:#x}", self.processor, raw);
                inbound.set_command(Command::None);
            }
        }
    }

    /// Answer a remote Connect in place with our port identity, or 0
    fn on_connect(&self, inbound: &MailboxBuffer) {
        let requester = inbound.operand(0);
        let responder = match inbound.read_name() {
            Some(name) => {
                let waiting = self.ports().find_waiting(&name);
                waiting.and_then(|port| {
                    port.set_remote_id(requester);
                    if port
                        .state_cell()
                        .transition(PortState::Waiting, PortState::Connected)
                    {
                        port.notify().signal();
                        port.wake_connect_waiter();
                        log::debug!(
                            "{}: '{}' accepted remote port {:#x}",
                            self.processor,
                            name,
                            requester
                        );
                        Some(port.id().raw())
                    } else {
                        port.set_remote_id(0);
                        None
                    }
                })
            }
            None => {
                log::warn!("{}: connect request without a port name", self.processor);
                None
            }
        };

        inbound.set_operand(0, responder.unwrap_or(0));
        inbound.set_command(Command::Response);
    }

    fn on_disconnect(&self, inbound: &MailboxBuffer) {
        let target = inbound.operand(0);
        match PortId::from_raw(target).and_then(|id| self.ports().get(id)) {
            Some(port) => {
                if port
                    .state_cell()
                    .transition(PortState::Connected, PortState::Disconnected)
                {
                    port.set_remote_id(0);
                    port.notify().signal();
                    log::debug!("{}: '{}' disconnected by peer", self.processor, port.name());
                }
            }
            None => log::warn!(
                "{}: disconnect for unknown port {:#x}",
                self.processor,
                target
            ),
        }
        inbound.set_operand(0, 0);
        inbound.set_command(Command::None);
    }

    /// Queue an inbound Message; caller holds the producer gate
    ///
    /// A full destination queue leaves the record in the mailbox and bumps
    /// the backpressure counter so the next `recv` can replay it.
    fn on_message(&self, inbound: &MailboxBuffer) {
        let destination = inbound.operand(0);
        let len = inbound.operand(1) as usize;
        assert!(
            len <= MAX_MESSAGE_LEN,
            "mailbox record of {} bytes exceeds the wire maximum",
            len
        );

        let Some(port) = PortId::from_raw(destination).and_then(|id| self.ports().get(id)) else {
            log::warn!(
                "{}: dropping message for unknown port {:#x}",
                self.processor,
                destination
            );
            inbound.set_command(Command::None);
            return;
        };

        // Open is accepted: a message can overtake the connect response
        let state = port.state();
        if !matches!(state, PortState::Connected | PortState::Open) {
            log::warn!(
                "{}: dropping message for '{}' in state {:?}",
                self.processor,
                port.name(),
                state
            );
            inbound.set_command(Command::None);
            return;
        }

        let mut record = [0u8; MAX_MESSAGE_LEN];
        inbound.read_payload(&mut record[..len]);
        match port.queue().insert(&record[..len]) {
            Ok(()) => {
                port.notify().signal();
                inbound.set_command(Command::None);
            }
            Err(QueueError::QueueFull { .. }) => {
                self.backpressure_on.fetch_add(1, Ordering::AcqRel);
                log::debug!(
                    "{}: '{}' is full, parking inbound message",
                    self.processor,
                    port.name()
                );
            }
            Err(e) => {
                log::warn!(
                    "{}: dropping message for '{}': {:?}",
                    self.processor,
                    port.name(),
                    e
                );
                inbound.set_command(Command::None);
            }
        }
    }

    /// Retry the message parked by backpressure, once per parked event
    pub(super) fn replay_parked_message(&self) {
        let Some(mailbox) = self.mailbox.get() else {
            return;
        };
        let _gate = self.producer_gate();
        let on = self.backpressure_on.load(Ordering::Acquire);
        let off = self.backpressure_off.load(Ordering::Acquire);
        if on == off {
            return;
        }
        debug_assert_eq!(on, off.wrapping_add(1), "more than one parked message");
        self.backpressure_off
            .store(off.wrapping_add(1), Ordering::Release);

        if mailbox.inbound.command() == Ok(Command::Message) {
            log::trace!("{}: replaying parked message", self.processor);
            self.on_message(&mailbox.inbound);
        }
    }

    fn deliver_reset_notification(&self) {
        let sink = self
            .ports()
            .iter()
            .find(|port| {
                port.flags().contains(PortFlags::RESET_SINK)
                    && matches!(port.state(), PortState::Connected | PortState::Open)
            })
            .cloned();
        let Some(port) = sink else {
            log::error!(
                "{}: remote watchdog reset, but '{}' is not open",
                self.processor,
                self.reset_port
            );
            return;
        };

        let inserted = {
            let _gate = self.producer_gate();
            port.queue().insert(&RESET_NOTIFICATION)
        };
        match inserted {
            Ok(()) => {
                port.notify().signal();
                log::warn!(
                    "{}: remote watchdog reset, notified '{}'",
                    self.processor,
                    port.name()
                );
            }
            Err(e) => log::error!(
                "{}: remote watchdog reset notification lost: {:?}",
                self.processor,
                e
            ),
        }
    }
}
