//! The ring of receive buffers of a connection.
//!
//! Bytes are read into the buffer at the write position, and handed out either by copying (for
//!  headers, which are small) or by splitting them off as `Bytes` that share the buffer's
//!  storage (for sample data). A buffer's storage is only freed once the last such `Bytes` is
//!  dropped, so data handed out is never overwritten.
//!
//! A buffer whose unread bytes are all consumed is retired once its remaining free space drops
//!  below the low-water mark, and a fresh buffer is appended to keep the ring at its configured
//!  size.

use std::collections::VecDeque;
use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;
use crate::byte_sink::ByteSource;
use crate::config::TransportConfig;
use crate::error::ReceiveError;

struct RingBuffer {
    /// bytes that were read but not consumed yet
    unread: BytesMut,
    /// free space directly following `unread`
    space: BytesMut,
}

impl RingBuffer {
    fn new(size: usize) -> RingBuffer {
        let mut space = BytesMut::zeroed(size);
        let unread = space.split_to(0);
        RingBuffer { unread, space }
    }
}

pub struct ReceiveRing {
    buffers: VecDeque<RingBuffer>,
    write_idx: usize,
    buffer_size: usize,
    low_water: usize,
}

impl ReceiveRing {
    pub fn new(config: &TransportConfig) -> ReceiveRing {
        ReceiveRing::with_buffers(config.receive_buffer_count, config.receive_buffer_size, config.receive_buffer_low_water)
    }

    fn with_buffers(count: usize, buffer_size: usize, low_water: usize) -> ReceiveRing {
        ReceiveRing {
            buffers: (0..count).map(|_| RingBuffer::new(buffer_size)).collect(),
            write_idx: 0,
            buffer_size,
            low_water: low_water.max(1),
        }
    }

    fn retire_consumed(&mut self) {
        while let Some(front) = self.buffers.front() {
            if !front.unread.is_empty() {
                break;
            }
            if self.write_idx == 0 && front.space.len() >= self.low_water {
                break;
            }

            trace!("retiring receive buffer");
            self.buffers.pop_front();
            self.buffers.push_back(RingBuffer::new(self.buffer_size));
            self.write_idx = self.write_idx.saturating_sub(1);
        }
    }

    fn writable_buffer(&mut self) -> Result<&mut RingBuffer, ReceiveError> {
        while self.buffers[self.write_idx].space.len() < self.low_water {
            if self.write_idx + 1 >= self.buffers.len() {
                return Err(ReceiveError::Corrupted("no free receive buffer"));
            }
            self.write_idx += 1;
        }
        Ok(&mut self.buffers[self.write_idx])
    }

    /// Reads from `source` into the ring, returning the number of bytes read. `Ok(0)` means the
    ///  peer closed the connection, and backpressure is reported as `WouldBlock`.
    pub fn read_from(&mut self, source: &dyn ByteSource) -> Result<usize, ReceiveError> {
        self.retire_consumed();
        let buffer = self.writable_buffer()?;

        let n = source.try_read(&mut buffer.space[..])?;

        let filled = buffer.space.split_to(n);
        buffer.unread.unsplit(filled);
        Ok(n)
    }

    pub fn unread_len(&self) -> usize {
        self.buffers.iter().map(|b| b.unread.len()).sum()
    }

    /// Copies up to `max_len` unread bytes without consuming them
    pub fn peek(&self, max_len: usize) -> Vec<u8> {
        let mut result = Vec::with_capacity(max_len);
        for buffer in &self.buffers {
            let n = buffer.unread.len().min(max_len - result.len());
            result.extend_from_slice(&buffer.unread[..n]);
            if result.len() == max_len {
                break;
            }
        }
        result
    }

    /// Discards `n` unread bytes
    pub fn advance(&mut self, mut n: usize) {
        for buffer in &mut self.buffers {
            if n == 0 {
                break;
            }
            let consumed = buffer.unread.len().min(n);
            buffer.unread.advance(consumed);
            n -= consumed;
        }
        debug_assert_eq!(n, 0, "advancing beyond unread bytes");
    }

    /// Hands out up to `max_len` unread bytes without copying them. The result is contiguous,
    ///  so it may be shorter than the number of unread bytes if they span buffers.
    pub fn take(&mut self, max_len: usize) -> Option<Bytes> {
        let buffer = self.buffers.iter_mut()
            .find(|b| !b.unread.is_empty())?;
        let n = buffer.unread.len().min(max_len);
        Some(buffer.unread.split_to(n).freeze())
    }
}
