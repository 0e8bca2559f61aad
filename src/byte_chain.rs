//! A chain of reference-counted byte segments. This is the unit of data ownership on both the
//!  send and the receive path:
//!
//! * cloning a chain duplicates segment handles, never the bytes themselves
//! * implements `Buf` so that headers can be decoded across segment boundaries
//! * segments are kept as they are, so that a chain maps directly to an iovec for vectored I/O
//!

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::io::IoSlice;
use bytes::{Buf, Bytes};

#[derive(Clone, Default)]
pub struct ByteChain {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl ByteChain {
    pub fn new() -> ByteChain {
        Default::default()
    }

    pub fn from_segment(segment: Bytes) -> ByteChain {
        let mut result = ByteChain::new();
        result.push(segment);
        result
    }

    /// Appends a segment. Empty segments are skipped.
    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    pub fn append(&mut self, other: ByteChain) {
        for segment in other.segments {
            self.push(segment);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Returns a chain with the same content that does not share storage with this chain. This is
    ///  for handing bytes to a place that outlives the owner's interest in the original buffers.
    pub fn deep_copy(&self) -> ByteChain {
        let mut result = ByteChain::new();
        for segment in &self.segments {
            result.push(Bytes::copy_from_slice(segment));
        }
        result
    }

    /// copies the chain's content into a contiguous buffer
    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len);
        for segment in &self.segments {
            result.extend_from_slice(segment);
        }
        result
    }
}

impl Debug for ByteChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteChain{{len: {}, segments: {}}}", self.len, self.segments.len())
    }
}

impl PartialEq for ByteChain {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.to_vec() == other.to_vec()
    }
}

impl From<Bytes> for ByteChain {
    fn from(value: Bytes) -> Self {
        ByteChain::from_segment(value)
    }
}

impl Buf for ByteChain {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        match self.segments.front() {
            Some(segment) => segment.as_ref(),
            None => &[],
        }
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut n = 0;
        for (segment, slot) in self.segments.iter().zip(dst.iter_mut()) {
            *slot = IoSlice::new(segment);
            n += 1;
        }
        n
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.len, "advancing {} bytes beyond the chain's end ({} bytes)", cnt, self.len);

        self.len -= cnt;
        while cnt > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= cnt {
                cnt -= front.len();
                self.segments.pop_front();
            }
            else {
                front.advance(cnt);
                cnt = 0;
            }
        }
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        // zero copy if the requested range lies in the first segment
        if let Some(front) = self.segments.front_mut() {
            if len <= front.len() {
                let result = front.split_to(len);
                if front.is_empty() {
                    self.segments.pop_front();
                }
                self.len -= len;
                return result;
            }
        }

        assert!(len <= self.len, "copying {} bytes beyond the chain's end ({} bytes)", len, self.len);
        let mut result = bytes::BytesMut::with_capacity(len);
        while result.len() < len {
            let n = self.chunk().len().min(len - result.len());
            result.extend_from_slice(&self.chunk()[..n]);
            self.advance(n);
        }
        result.freeze()
    }
}
