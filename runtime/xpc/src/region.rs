//! Shared Region - word-granular view of memory visible to both processors
//!
//! The region is stored as 32-bit atomic words so that every access is an
//! explicit load or store with a chosen ordering; nothing relies on the
//! compiler keeping plain memory accesses in program order.

use core::sync::atomic::{fence, AtomicU32, Ordering};

/// Bytes per shared word
pub const WORD_SIZE: usize = 4;

/// Fixed-size shared memory region
pub struct SharedRegion {
    words: Box<[AtomicU32]>,
}

impl SharedRegion {
    /// Create a zeroed region of at least `len` bytes
    pub fn new(len: usize) -> Self {
        let count = len.div_ceil(WORD_SIZE);
        let words = (0..count).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Read the word at `index`
    ///
    /// # Panics
    /// Panics if `index` is outside the region.
    pub fn read_word(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Acquire)
    }

    /// Write the word at `index`
    ///
    /// # Panics
    /// Panics if `index` is outside the region.
    pub fn write_word(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Release);
    }

    /// Copy bytes out of the region starting at word `first_word`
    ///
    /// Bytes are packed little-endian within each word.
    pub fn read_bytes(&self, first_word: usize, out: &mut [u8]) {
        for (i, chunk) in out.chunks_mut(WORD_SIZE).enumerate() {
            let bytes = self.read_word(first_word + i).to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    /// Copy bytes into the region starting at word `first_word`
    ///
    /// A trailing partial word is zero-padded.
    pub fn write_bytes(&self, first_word: usize, data: &[u8]) {
        for (i, chunk) in data.chunks(WORD_SIZE).enumerate() {
            let mut bytes = [0u8; WORD_SIZE];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.write_word(first_word + i, u32::from_le_bytes(bytes));
        }
    }

    /// Read back the first and last word of a just-written record.
    ///
    /// Store buffers must drain before the far side is signaled, otherwise it
    /// can observe stale memory while the new data still sits in the writer's
    /// buffers.
    pub fn touch(&self, first_word: usize, last_word: usize) {
        let _ = self.words[first_word].load(Ordering::SeqCst);
        let _ = self.words[last_word].load(Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion").field("len", &self.len()).finish()
    }
}
