//! Mailbox wire format
//!
//! The mailbox is one shared allocation split into two halves, one per
//! direction. Each half carries a single record:
//!
//! ```text
//! word 0   command
//! word 1   operand0
//! word 2   operand1
//! word 3.. payload (up to MAX_MESSAGE_LEN bytes)
//! ```
//!
//! | Command    | operand0              | operand1       | payload   |
//! |------------|-----------------------|----------------|-----------|
//! | Connect    | requester port id     | -              | port name |
//! | Disconnect | remote port id        | -              | -         |
//! | Message    | destination port id   | payload length | bytes     |
//! | Response   | responder port id / 0 | -              | -         |
//!
//! The CPU allocates the mailbox and transmits through the first half; the
//! AVP transmits through the second. A command word of `None` means the half
//! is free: the receiver clears it once it has consumed the record.

use std::sync::Arc;

use avp_xpc::{PhysAddr, SharedRegion, WORD_SIZE};
use static_assertions::const_assert;

use crate::port::PortName;

/// Largest payload one record can carry
pub const MAX_MESSAGE_LEN: usize = 256;

/// Longest port name, in bytes
pub const MAX_PORT_NAME_LEN: usize = 16;

/// Bytes reserved for the record header
pub const MAX_COMMAND_SIZE: usize = 16;

/// Bytes in one direction of the mailbox
pub const MAILBOX_HALF_SIZE: usize = MAX_COMMAND_SIZE + MAX_MESSAGE_LEN;

/// Bytes in the whole mailbox allocation
pub const MAILBOX_SIZE: usize = 2 * MAILBOX_HALF_SIZE;

/// Written into the CPU's outbound command slot until the AVP latches the
/// mailbox address, so nothing is transmitted before the AVP can read it.
pub const THROTTLE_WORD: u32 = 0xdead_f00d;

/// Doorbell value the AVP's watchdog raises instead of an address
pub const WATCHDOG_RESET_SENTINEL: u32 = 0xdead_0001;

/// Message queued on the reset port when the watchdog sentinel arrives
pub const RESET_NOTIFICATION: [u8; 4] = 0u32.to_le_bytes();

const HEADER_WORDS: usize = 3;
const HALF_WORDS: usize = MAILBOX_HALF_SIZE / WORD_SIZE;

const_assert!(MAX_COMMAND_SIZE >= HEADER_WORDS * WORD_SIZE);
const_assert!(HEADER_WORDS * WORD_SIZE + MAX_MESSAGE_LEN <= MAILBOX_HALF_SIZE);
const_assert!(MAILBOX_HALF_SIZE % WORD_SIZE == 0);
const_assert!(MAX_PORT_NAME_LEN % WORD_SIZE == 0);
const_assert!(MAX_PORT_NAME_LEN <= MAX_MESSAGE_LEN);
// sentinel must not look like an aligned mailbox address
const_assert!(WATCHDOG_RESET_SENTINEL % (WORD_SIZE as u32) != 0);

/// Mailbox command word
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None = 0,
    SetBufferInfo = 1,
    Connect = 2,
    Disconnect = 3,
    Message = 4,
    Response = 5,
}

impl TryFrom<u32> for Command {
    type Error = u32;

    fn try_from(raw: u32) -> core::result::Result<Self, u32> {
        Ok(match raw {
            0 => Command::None,
            1 => Command::SetBufferInfo,
            2 => Command::Connect,
            3 => Command::Disconnect,
            4 => Command::Message,
            5 => Command::Response,
            other => return Err(other),
        })
    }
}

/// An outbound record
#[derive(Debug, Clone, Copy)]
pub enum MailboxRecord<'a> {
    Connect { requester: u32, name: &'a PortName },
    Disconnect { remote: u32 },
    Message { destination: u32, payload: &'a [u8] },
}

impl MailboxRecord<'_> {
    pub fn command(&self) -> Command {
        match self {
            MailboxRecord::Connect { .. } => Command::Connect,
            MailboxRecord::Disconnect { .. } => Command::Disconnect,
            MailboxRecord::Message { .. } => Command::Message,
        }
    }
}

/// One direction of the mailbox
#[derive(Clone)]
pub struct MailboxBuffer {
    region: Arc<SharedRegion>,
    base: usize,
}

impl MailboxBuffer {
    fn new(region: Arc<SharedRegion>, base: usize) -> Self {
        Self { region, base }
    }

    /// Raw command word
    pub fn command_word(&self) -> u32 {
        self.region.read_word(self.base)
    }

    /// Decoded command word; `Err` carries an unknown raw value
    pub fn command(&self) -> core::result::Result<Command, u32> {
        Command::try_from(self.command_word())
    }

    pub fn set_command(&self, command: Command) {
        self.region.write_word(self.base, command as u32);
    }

    pub(crate) fn set_command_word(&self, raw: u32) {
        self.region.write_word(self.base, raw);
    }

    /// Whether the half is free for a new record
    pub fn is_clear(&self) -> bool {
        self.command_word() == Command::None as u32
    }

    pub fn operand(&self, index: usize) -> u32 {
        debug_assert!(index < HEADER_WORDS - 1);
        self.region.read_word(self.base + 1 + index)
    }

    pub fn set_operand(&self, index: usize, value: u32) {
        debug_assert!(index < HEADER_WORDS - 1);
        self.region.write_word(self.base + 1 + index, value);
    }

    /// Copy `out.len()` payload bytes out of the record
    ///
    /// # Panics
    /// Panics if `out` is longer than the wire maximum.
    pub fn read_payload(&self, out: &mut [u8]) {
        assert!(out.len() <= MAX_MESSAGE_LEN, "payload read past the mailbox");
        self.region.read_bytes(self.base + HEADER_WORDS, out);
    }

    /// Port name carried by a Connect record
    pub fn read_name(&self) -> Option<PortName> {
        let mut raw = [0u8; MAX_PORT_NAME_LEN];
        self.read_payload(&mut raw);
        PortName::from_wire(&raw)
    }

    /// Lay `record` into the half, command word last, then drain store
    /// buffers by touching the first and last word written.
    ///
    /// # Panics
    /// Panics if a Message payload exceeds the wire maximum.
    pub fn write_record(&self, record: &MailboxRecord<'_>) {
        let payload_len = match *record {
            MailboxRecord::Connect { requester, name } => {
                self.set_operand(0, requester);
                self.set_operand(1, 0);
                let wire = name.to_wire();
                self.region.write_bytes(self.base + HEADER_WORDS, &wire);
                wire.len()
            }
            MailboxRecord::Disconnect { remote } => {
                self.set_operand(0, remote);
                self.set_operand(1, 0);
                0
            }
            MailboxRecord::Message {
                destination,
                payload,
            } => {
                assert!(payload.len() <= MAX_MESSAGE_LEN, "message exceeds the wire maximum");
                self.set_operand(0, destination);
                self.set_operand(1, payload.len() as u32);
                self.region.write_bytes(self.base + HEADER_WORDS, payload);
                payload.len()
            }
        };
        self.set_command(record.command());

        let words = HEADER_WORDS + payload_len.div_ceil(WORD_SIZE);
        self.region.touch(self.base, self.base + words - 1);
    }
}

impl core::fmt::Debug for MailboxBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MailboxBuffer")
            .field("base", &self.base)
            .field("command", &self.command())
            .finish()
    }
}

/// Both directions of a latched mailbox
#[derive(Debug, Clone)]
pub struct MailboxPair {
    pub phys: PhysAddr,
    pub outbound: MailboxBuffer,
    pub inbound: MailboxBuffer,
}

impl MailboxPair {
    /// CPU view: transmit through the first half
    pub fn for_cpu(phys: PhysAddr, region: Arc<SharedRegion>) -> Self {
        Self {
            phys,
            outbound: MailboxBuffer::new(Arc::clone(&region), 0),
            inbound: MailboxBuffer::new(region, HALF_WORDS),
        }
    }

    /// AVP view: transmit through the second half
    pub fn for_avp(phys: PhysAddr, region: Arc<SharedRegion>) -> Self {
        Self {
            phys,
            inbound: MailboxBuffer::new(Arc::clone(&region), 0),
            outbound: MailboxBuffer::new(region, HALF_WORDS),
        }
    }

    /// Address rung on the doorbell after filling the outbound half
    pub fn outbound_addr(&self) -> PhysAddr {
        self.phys + (self.outbound.base * WORD_SIZE) as PhysAddr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_pair() -> (MailboxPair, MailboxPair) {
        let region = Arc::new(SharedRegion::new(MAILBOX_SIZE));
        (
            MailboxPair::for_cpu(0x8000_0000, Arc::clone(&region)),
            MailboxPair::for_avp(0x8000_0000, region),
        )
    }

    #[test]
    fn test_command_decoding() {
        assert_eq!(Command::try_from(4), Ok(Command::Message));
        assert_eq!(Command::try_from(0), Ok(Command::None));
        assert_eq!(Command::try_from(THROTTLE_WORD), Err(THROTTLE_WORD));
    }

    #[test]
    fn test_halves_cross_over() {
        let (cpu, avp) = shared_pair();
        assert!(cpu.outbound.is_clear());

        cpu.outbound.write_record(&MailboxRecord::Disconnect { remote: 0x0001_0002 });
        assert_eq!(avp.inbound.command(), Ok(Command::Disconnect));
        assert_eq!(avp.inbound.operand(0), 0x0001_0002);
        assert!(avp.outbound.is_clear());

        avp.inbound.set_command(Command::None);
        assert!(cpu.outbound.is_clear());

        assert_eq!(cpu.outbound_addr(), 0x8000_0000);
        assert_eq!(avp.outbound_addr(), 0x8000_0000 + MAILBOX_HALF_SIZE as u32);
    }

    #[test]
    fn test_message_record_layout() {
        let (cpu, avp) = shared_pair();
        let payload = b"hello avp";
        avp.outbound.write_record(&MailboxRecord::Message {
            destination: 0x0003_0001,
            payload,
        });

        assert_eq!(cpu.inbound.command(), Ok(Command::Message));
        assert_eq!(cpu.inbound.operand(0), 0x0003_0001);
        assert_eq!(cpu.inbound.operand(1), payload.len() as u32);
        let mut out = [0u8; 9];
        cpu.inbound.read_payload(&mut out);
        assert_eq!(&out, payload);
    }

    #[test]
    fn test_connect_record_carries_name() {
        let (cpu, avp) = shared_pair();
        let name = PortName::new("RPC_AVP_PORT").expect("name");
        cpu.outbound.write_record(&MailboxRecord::Connect {
            requester: 0x0001_0000,
            name: &name,
        });

        assert_eq!(avp.inbound.command(), Ok(Command::Connect));
        assert_eq!(avp.inbound.operand(0), 0x0001_0000);
        assert_eq!(avp.inbound.read_name(), Some(name));
    }

    #[test]
    fn test_full_size_message_fits() {
        let (cpu, avp) = shared_pair();
        let payload = [0xa5u8; MAX_MESSAGE_LEN];
        cpu.outbound.write_record(&MailboxRecord::Message {
            destination: 1,
            payload: &payload,
        });
        let mut out = [0u8; MAX_MESSAGE_LEN];
        avp.inbound.read_payload(&mut out);
        assert_eq!(out, payload);
        // the AVP's own outbound half is untouched
        assert!(avp.outbound.is_clear());
    }
}
