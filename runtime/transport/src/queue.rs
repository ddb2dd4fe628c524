//! Message Queue - per-port receive ring
//!
//! Lock-free single-producer/single-consumer ring of fixed-size records. The
//! ring holds one more slot than the requested depth, so `write + 1 == read`
//! means full and `write == read` means empty without a separate counter.
//!
//! # Lock-Free Guarantees
//! - The producer (interrupt path or local sender) only moves `write`
//! - The consumer (the `recv` caller) only moves `read`
//! - Records are copied in and out by value; nothing references a slot after
//!   the index moves past it

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Result, TransportError};
use crate::wire::MAX_MESSAGE_LEN;

/// Queue-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// No free slot
    QueueFull { capacity: usize },
    /// Nothing to extract
    QueueEmpty,
    /// The stored record does not fit the caller's buffer; nothing consumed
    BufferTooSmall { needed: usize, available: usize },
    /// Record exceeds this queue's configured message size
    MessageTooLarge { len: usize, max: usize },
}

impl From<QueueError> for TransportError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull { .. } => TransportError::MailboxFull,
            QueueError::QueueEmpty => TransportError::MailboxEmpty,
            QueueError::BufferTooSmall { needed, available } => {
                TransportError::BufferTooSmall { needed, available }
            }
            QueueError::MessageTooLarge { .. } => {
                TransportError::BadParameter("message larger than the port's message size")
            }
        }
    }
}

#[derive(Clone, Copy)]
struct MessageRecord {
    len: usize,
    data: [u8; MAX_MESSAGE_LEN],
}

impl MessageRecord {
    const EMPTY: MessageRecord = MessageRecord {
        len: 0,
        data: [0; MAX_MESSAGE_LEN],
    };
}

/// Marks one side of the ring as busy for the duration of an operation.
///
/// Two producers (or two consumers) overlapping is a broken caller contract,
/// not a recoverable condition.
struct SideGuard<'a>(&'a AtomicBool);

impl<'a> SideGuard<'a> {
    fn enter(flag: &'a AtomicBool, side: &str) -> Self {
        assert!(
            !flag.swap(true, Ordering::Acquire),
            "concurrent {} on a single-{} queue",
            side,
            side
        );
        SideGuard(flag)
    }
}

impl Drop for SideGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fixed-capacity SPSC ring of message records
pub struct MessageQueue {
    slots: Box<[UnsafeCell<MessageRecord>]>,
    /// Next slot to read (consumer writes here)
    read: AtomicUsize,
    /// Next slot to fill (producer writes here)
    write: AtomicUsize,
    max_message_size: usize,
    producing: AtomicBool,
    consuming: AtomicBool,
}

// SAFETY: a slot is written only by the producer while it lies outside
// [read, write), and read only by the consumer while it lies inside. The
// Release store of an index publishes the slot contents to the other side's
// Acquire load. SideGuard rules out a second producer or consumer.
unsafe impl Sync for MessageQueue {}

impl MessageQueue {
    /// Allocate a queue holding up to `depth` records of `max_message_size`
    ///
    /// # Errors
    /// - `BadParameter` if `depth` is zero or the message size is zero or
    ///   larger than the wire maximum
    /// - `InsufficientMemory` if the slots cannot be allocated
    pub fn with_depth(depth: usize, max_message_size: usize) -> Result<Self> {
        if depth == 0 {
            return Err(TransportError::BadParameter("queue depth must be nonzero"));
        }
        if max_message_size == 0 || max_message_size > MAX_MESSAGE_LEN {
            return Err(TransportError::BadParameter("message size out of range"));
        }

        let capacity = depth
            .checked_add(1)
            .ok_or(TransportError::BadParameter("queue depth out of range"))?;
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|_| {
            TransportError::InsufficientMemory {
                requested: capacity.saturating_mul(core::mem::size_of::<MessageRecord>()),
            }
        })?;
        slots.extend((0..capacity).map(|_| UnsafeCell::new(MessageRecord::EMPTY)));

        Ok(Self {
            slots: slots.into_boxed_slice(),
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            max_message_size,
            producing: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
        })
    }

    fn next(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slots.len() {
            0
        } else {
            next
        }
    }

    /// Copy `payload` into the next free slot (producer side)
    ///
    /// Never blocks; safe to call from the interrupt path.
    ///
    /// # Panics
    /// Panics if `payload` exceeds the wire maximum: such a record can only
    /// come from a corrupted mailbox.
    pub fn insert(&self, payload: &[u8]) -> core::result::Result<(), QueueError> {
        assert!(
            payload.len() <= MAX_MESSAGE_LEN,
            "record of {} bytes exceeds the wire maximum",
            payload.len()
        );
        if payload.len() > self.max_message_size {
            return Err(QueueError::MessageTooLarge {
                len: payload.len(),
                max: self.max_message_size,
            });
        }

        let _producer = SideGuard::enter(&self.producing, "producer");
        let write = self.write.load(Ordering::Relaxed);
        let next = self.next(write);
        if next == self.read.load(Ordering::Acquire) {
            return Err(QueueError::QueueFull {
                capacity: self.slots.len(),
            });
        }

        // SAFETY: `write` is outside [read, write) so the consumer is not
        // looking at it, and SideGuard makes us the only producer.
        let slot = unsafe { &mut *self.slots[write].get() };
        slot.data[..payload.len()].copy_from_slice(payload);
        slot.len = payload.len();

        self.write.store(next, Ordering::Release);
        Ok(())
    }

    /// Copy the oldest record into `out` (consumer side)
    ///
    /// # Returns
    /// Number of bytes copied
    ///
    /// # Errors
    /// `BufferTooSmall` leaves the record queued.
    pub fn extract(&self, out: &mut [u8]) -> core::result::Result<usize, QueueError> {
        let _consumer = SideGuard::enter(&self.consuming, "consumer");
        let read = self.read.load(Ordering::Relaxed);
        if read == self.write.load(Ordering::Acquire) {
            return Err(QueueError::QueueEmpty);
        }

        // SAFETY: `read` is inside [read, write), published by the producer's
        // Release store, and we are the only consumer.
        let slot = unsafe { &*self.slots[read].get() };
        if slot.len > out.len() {
            return Err(QueueError::BufferTooSmall {
                needed: slot.len,
                available: out.len(),
            });
        }
        out[..slot.len].copy_from_slice(&slot.data[..slot.len]);
        let len = slot.len;

        self.read.store(self.next(read), Ordering::Release);
        Ok(len)
    }

    /// Records currently queued
    pub fn len(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.slots.len() - read + write
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read.load(Ordering::Acquire) == self.write.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.next(self.write.load(Ordering::Acquire)) == self.read.load(Ordering::Acquire)
    }

    /// Slots in the ring (depth + 1)
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Records the ring can hold at once
    pub fn depth(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl core::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("depth", &self.depth())
            .field("len", &self.len())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}
