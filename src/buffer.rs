//! Growable byte accumulator with lazy compaction.
//!
//! A [`ByteBuffer`] keeps two cursors over a contiguous `Vec<u8>`:
//!
//! ```text
//!  0          read_pos             write_pos        capacity
//!  ├──────────────┼─────────────────────┼───────────────┤
//!  │  consumed    │     unconsumed      │     spare     │
//! ```
//!
//! Appends land at `write_pos`, consumption advances `read_pos`. Consumed
//! space is reclaimed in two ways: a fully drained buffer resets both cursors
//! in O(1), and a partially drained one moves its unconsumed bytes to the
//! front once `read_pos` reaches the pack threshold. Buffers that are filled
//! in large reads but drained a line at a time therefore pay for a memory
//! move at most once per threshold's worth of consumed data.

use std::io;

use crate::error::{NetError, Result};

/// Capacity growth granularity.
pub const BLOCK_SIZE: usize = 8 * 1024;

/// Consumed bytes tolerated before the buffer is packed.
pub const DEFAULT_PACK_THRESHOLD: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct ByteBuffer {
    // `data.len()` is the write cursor.
    data: Vec<u8>,
    read_pos: usize,
    pack_threshold: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            read_pos: 0,
            pack_threshold: DEFAULT_PACK_THRESHOLD,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(round_up(capacity)),
            read_pos: 0,
            pack_threshold: DEFAULT_PACK_THRESHOLD,
        }
    }

    /// Sets the pack threshold; `0` restores [`DEFAULT_PACK_THRESHOLD`].
    pub fn set_pack_threshold(&mut self, threshold: usize) {
        self.pack_threshold = if threshold > 0 {
            threshold
        } else {
            DEFAULT_PACK_THRESHOLD
        };
    }

    pub fn pack_threshold(&self) -> usize {
        self.pack_threshold
    }

    /// Number of unconsumed bytes.
    pub fn size(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn len(&self) -> usize {
        self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.data.len()
    }

    /// The unconsumed region. Valid until the next mutating call.
    pub fn data(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    pub fn peek(&self) -> &[u8] {
        self.data()
    }

    /// Copies `bytes` to the tail, growing capacity in whole blocks.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.reserve(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Ensures room for `additional` bytes past the write cursor.
    pub fn reserve(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if needed <= self.data.capacity() {
            return;
        }
        let target = round_up(needed.max(self.data.capacity() * 2));
        self.data.reserve_exact(target - self.data.len());
    }

    /// Advances the read cursor past `n` bytes.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        let available = self.size();
        if n > available {
            return Err(NetError::InsufficientData {
                requested: n,
                available,
            });
        }
        if n == available {
            self.clear();
            return Ok(());
        }
        self.read_pos += n;
        if self.read_pos >= self.pack_threshold {
            self.pack();
        }
        Ok(())
    }

    /// Copies `out.len()` bytes from the head into `out` and consumes them.
    pub fn extract(&mut self, out: &mut [u8]) -> Result<usize> {
        let n = out.len();
        if n > self.size() {
            return Err(NetError::InsufficientData {
                requested: n,
                available: self.size(),
            });
        }
        out.copy_from_slice(&self.data()[..n]);
        self.consume(n)?;
        Ok(n)
    }

    /// Like [`extract`](Self::extract) but allocates the output.
    pub fn extract_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0; n];
        self.extract(&mut out)?;
        Ok(out)
    }

    /// Drops all content and resets both cursors.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    /// Moves the unconsumed bytes to offset 0.
    pub fn pack(&mut self) {
        if self.read_pos > 0 {
            self.data.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }

    /// Position of `byte` in the unconsumed region, searching from `from`.
    pub fn find(&self, byte: u8, from: usize) -> Option<usize> {
        let data = self.data();
        if from >= data.len() {
            return None;
        }
        data[from..]
            .iter()
            .position(|&b| b == byte)
            .map(|pos| pos + from)
    }

    /// Lets `fill` write up to `max` bytes into the tail.
    ///
    /// `fill` receives a writable slice of exactly `max` bytes and returns how
    /// many it produced; only those become part of the buffer. Errors from
    /// `fill` leave the buffer unchanged.
    pub fn fill_with<F>(&mut self, max: usize, fill: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        self.reserve(max);
        let start = self.data.len();
        self.data.resize(start + max, 0);
        match fill(&mut self.data[start..]) {
            Ok(n) => {
                self.data.truncate(start + n.min(max));
                Ok(n.min(max))
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }
}

impl io::Write for ByteBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(bytes: &[u8]) -> Self {
        let mut buffer = ByteBuffer::with_capacity(bytes.len());
        buffer.append(bytes);
        buffer
    }
}

fn round_up(n: usize) -> usize {
    n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}
