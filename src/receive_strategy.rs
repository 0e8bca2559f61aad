//! Reassembles samples from the byte stream of a single connection.
//!
//! The byte stream is a sequence of packets, each consisting of a packet header and a payload of
//!  zero or more samples. Bytes arrive in arbitrary chunks, so every step can find that it needs
//!  more input - in that case processing stops and resumes on the next call to `handle_input`.
//!
//! Sample data is handed to the delivery sink without copying: the sample's `ByteChain` shares
//!  storage with the receive ring's buffers.

use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace};
use crate::byte_chain::ByteChain;
use crate::byte_sink::{is_backpressure, ByteSource};
use crate::config::TransportConfig;
use crate::error::{CodecError, ReceiveError};
use crate::packet_header::PacketHeader;
use crate::receive_ring::ReceiveRing;
use crate::safe_converter::SafeCast;
use crate::sample_header::SampleHeader;

/// Receives completely reassembled samples, in the order in which they arrived on the wire
#[cfg_attr(test, automock)]
pub trait DeliverySink: Send + Sync {
    fn on_sample_received(&self, header: SampleHeader, data: ByteChain);
}

struct InFlightSample {
    header: SampleHeader,
    data: ByteChain,
    remaining: usize,
}

pub struct ReceiveStrategy {
    ring: ReceiveRing,
    max_packet_size: usize,
    /// payload bytes of the current packet that were not processed yet
    packet_remaining: usize,
    sample: Option<InFlightSample>,
}

impl ReceiveStrategy {
    pub fn new(config: &TransportConfig) -> ReceiveStrategy {
        ReceiveStrategy {
            ring: ReceiveRing::new(config),
            max_packet_size: config.max_packet_size.safe_cast(),
            packet_remaining: 0,
            sample: None,
        }
    }

    /// Reads whatever is available from `source` and delivers all samples that are complete
    ///  after that. Returns the number of bytes read, with 0 meaning that nothing is available
    ///  right now. This never blocks.
    ///
    /// Any `Err` is fatal for the connection.
    pub fn handle_input(&mut self, source: &dyn ByteSource, sink: &dyn DeliverySink) -> Result<usize, ReceiveError> {
        let num_read = match self.ring.read_from(source) {
            Ok(0) => {
                debug!("peer closed the connection");
                return Err(ReceiveError::PeerClosed);
            }
            Ok(n) => n,
            Err(ReceiveError::Io(e)) if is_backpressure(&e) => return Ok(0),
            Err(e) => return Err(e),
        };
        trace!("read {} bytes", num_read);

        self.process(sink)?;
        Ok(num_read)
    }

    fn process(&mut self, sink: &dyn DeliverySink) -> Result<(), ReceiveError> {
        loop {
            if self.sample.is_none() {
                if self.packet_remaining == 0 {
                    if !self.read_packet_header()? {
                        return Ok(());
                    }
                    // an empty packet is legal, and there may be another packet header
                    continue;
                }
                if !self.read_sample_header()? {
                    return Ok(());
                }
            }

            if let Some(sample) = self.sample.as_mut() {
                while sample.remaining > 0 {
                    let Some(chunk) = self.ring.take(sample.remaining) else {
                        return Ok(());
                    };
                    sample.remaining -= chunk.len();
                    self.packet_remaining -= chunk.len();
                    sample.data.push(chunk);
                }
            }

            if let Some(sample) = self.sample.take() {
                trace!("delivering sample {:?}", sample.header);
                sink.on_sample_received(sample.header, sample.data);
            }
        }
    }

    fn read_packet_header(&mut self) -> Result<bool, ReceiveError> {
        if self.ring.unread_len() < PacketHeader::SERIALIZED_LEN {
            return Ok(false);
        }

        let raw = self.ring.peek(PacketHeader::SERIALIZED_LEN);
        let header = PacketHeader::deser(&mut raw.as_slice())?;
        self.ring.advance(PacketHeader::SERIALIZED_LEN);

        let payload_len: usize = header.length.safe_cast();
        if PacketHeader::SERIALIZED_LEN + payload_len > self.max_packet_size {
            return Err(CodecError::Malformed(format!("packet length {} exceeds the max packet size {}", payload_len, self.max_packet_size)).into());
        }

        trace!("received packet header {:?}", header);
        self.packet_remaining = payload_len;
        Ok(true)
    }

    fn read_sample_header(&mut self) -> Result<bool, ReceiveError> {
        let raw = self.ring.peek(SampleHeader::MAX_SERIALIZED_LEN.min(self.packet_remaining));

        let mut parse_buf = raw.as_slice();
        match SampleHeader::deser(&mut parse_buf) {
            Ok(header) => {
                //NB: this can exceed serialized_len() if the publication id has leading zero groups
                let header_len = raw.len() - parse_buf.len();
                self.ring.advance(header_len);
                self.packet_remaining -= header_len;

                let message_length: usize = header.message_length.safe_cast();
                if message_length > self.packet_remaining {
                    return Err(CodecError::Malformed(format!("sample length {} exceeds the packet's remaining {} bytes", message_length, self.packet_remaining)).into());
                }

                self.sample = Some(InFlightSample {
                    header,
                    data: ByteChain::new(),
                    remaining: message_length,
                });
                Ok(true)
            }
            Err(CodecError::Truncated) if raw.len() == self.packet_remaining => {
                Err(CodecError::Malformed("packet ends inside a sample header".to_string()).into())
            }
            Err(CodecError::Truncated) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Processes input as it becomes available until the connection fails, returning the reason.
    pub async fn run(mut self, source: Arc<dyn ByteSource>, sink: Arc<dyn DeliverySink>) -> ReceiveError {
        loop {
            if let Err(e) = source.readable().await {
                return ReceiveError::Io(e);
            }

            loop {
                match self.handle_input(source.as_ref(), sink.as_ref()) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => return e,
                }
            }
        }
    }
}
