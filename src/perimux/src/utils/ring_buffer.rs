//! Fixed-capacity circular byte buffer with explicit overflow
//! accounting.
//!
//! `head` is the next write position and `tail` the next read
//! position; `head == tail` means empty, so the usable capacity is one
//! byte less than the backing storage. When a write catches up with
//! `tail`, the oldest byte is sacrificed and the caller is told how
//! many bytes were lost. Overflow is reported, never silent.
use alloc::{boxed::Box, vec};

pub struct RingBuffer {
    buffer: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl RingBuffer {
    /// Create a ring backed by `capacity` bytes. The usable capacity is
    /// `capacity - 1`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring buffer capacity must be at least 2");
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// The number of buffered bytes.
    pub fn len(&self) -> usize {
        (self.head + self.buffer.len() - self.tail) % self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// The number of bytes that can be written without overwriting
    /// buffered data.
    pub fn free(&self) -> usize {
        self.buffer.len() - 1 - self.len()
    }

    /// Append `bytes`, overwriting the oldest data when full. Returns
    /// the number of bytes that were overwritten.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let mut dropped = 0;
        for &b in bytes {
            self.buffer[self.head] = b;
            self.head = (self.head + 1) % self.buffer.len();
            if self.head == self.tail {
                dropped += 1;
                self.tail = (self.tail + 1) % self.buffer.len();
            }
        }
        dropped
    }

    /// Remove and return the oldest byte.
    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let b = self.buffer[self.tail];
        self.tail = (self.tail + 1) % self.buffer.len();
        Some(b)
    }

    /// Drain up to `out.len()` bytes in arrival order. Returns the
    /// number of bytes stored into `out`.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.pop() {
                Some(b) => {
                    out[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}
