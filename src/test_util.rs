//! Fakes and helpers for testing code that sits on top of the transport.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use crate::byte_chain::ByteChain;
use crate::byte_sink::{ByteSink, ByteSource};
use crate::ids::{PublicationId, SampleKey};
use crate::packet_header::{ByteOrder, PacketHeader};
use crate::queue_element::{sample_element, SendListener};
use crate::receive_strategy::DeliverySink;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::sample_header::{MessageId, SampleHeader};
use crate::send_strategy::SendStrategy;

pub fn key(publication_id: u64, sequence: u32) -> SampleKey {
    SampleKey {
        publication_id: PublicationId::from_raw(publication_id),
        sequence,
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SendEvent {
    Delivered(SampleKey),
    Dropped(SampleKey, bool),
}

pub fn delivered(publication_id: u64, sequence: u32) -> SendEvent {
    SendEvent::Delivered(key(publication_id, sequence))
}

pub fn dropped(publication_id: u64, sequence: u32, by_transport: bool) -> SendEvent {
    SendEvent::Dropped(key(publication_id, sequence), by_transport)
}

#[derive(Default)]
pub struct RecordingSendListener {
    events: Mutex<Vec<SendEvent>>,
}

impl RecordingSendListener {
    pub fn events(&self) -> Vec<SendEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl SendListener for RecordingSendListener {
    fn data_delivered(&self, key: SampleKey) {
        self.events.lock().unwrap().push(SendEvent::Delivered(key));
    }

    fn data_dropped(&self, key: SampleKey, dropped_by_transport: bool) {
        self.events.lock().unwrap().push(SendEvent::Dropped(key, dropped_by_transport));
    }
}

/// Sends a follow-up sample (sequence + 1000) from inside the delivery callback
pub struct ReentrantSendListener {
    strategy: SendStrategy,
}

impl ReentrantSendListener {
    pub fn new(strategy: SendStrategy) -> ReentrantSendListener {
        ReentrantSendListener { strategy }
    }
}

impl SendListener for ReentrantSendListener {
    fn data_delivered(&self, key: SampleKey) {
        if key.sequence < 1000 {
            self.strategy.send(sample_element(MessageId::SampleData, key.publication_id, key.sequence + 1000, b"again", ByteOrder::native(), None));
        }
    }

    fn data_dropped(&self, _key: SampleKey, _dropped_by_transport: bool) {}
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SinkResponse {
    AcceptAll,
    AcceptUpTo(usize),
    WouldBlock,
    PeerClosed,
    Fail,
}

/// A `ByteSink` that responds to writes from a script, accepting everything once the script is
///  exhausted. Accepted bytes are recorded.
pub struct ScriptedSink {
    script: Mutex<VecDeque<SinkResponse>>,
    written: Mutex<Vec<u8>>,
}

impl ScriptedSink {
    pub fn new(script: Vec<SinkResponse>) -> ScriptedSink {
        ScriptedSink {
            script: Mutex::new(script.into()),
            written: Default::default(),
        }
    }

    pub fn push_response(&self, response: SinkResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl ByteSink for ScriptedSink {
    fn send_vectored(&self, bufs: &[Bytes]) -> io::Result<usize> {
        let response = self.script.lock().unwrap().pop_front()
            .unwrap_or(SinkResponse::AcceptAll);

        let limit = match response {
            SinkResponse::AcceptAll => usize::MAX,
            SinkResponse::AcceptUpTo(n) => n,
            SinkResponse::WouldBlock => return Err(io::ErrorKind::WouldBlock.into()),
            SinkResponse::PeerClosed => return Ok(0),
            SinkResponse::Fail => return Err(io::ErrorKind::ConnectionReset.into()),
        };

        let mut written = self.written.lock().unwrap();
        let mut num_written = 0;
        for buf in bufs {
            let n = buf.len().min(limit - num_written);
            written.extend_from_slice(&buf[..n]);
            num_written += n;
        }
        Ok(num_written)
    }

    async fn writable(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FakeRead {
    Data(Vec<u8>),
    WouldBlock,
    Closed,
    Fail,
}

/// A `ByteSource` replaying a script of reads. A `Data` entry is delivered across several reads
///  if the reader's buffer is too small. Once the script is exhausted, reads report `WouldBlock`
///  and `readable()` never completes.
#[derive(Default)]
pub struct FakeSource {
    script: Mutex<VecDeque<FakeRead>>,
}

impl FakeSource {
    pub fn new() -> FakeSource {
        Default::default()
    }

    pub fn with_reads(reads: Vec<FakeRead>) -> FakeSource {
        FakeSource {
            script: Mutex::new(reads.into()),
        }
    }

    pub fn push(&self, read: FakeRead) {
        self.script.lock().unwrap().push_back(read);
    }
}

#[async_trait]
impl ByteSource for FakeSource {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            None | Some(FakeRead::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(FakeRead::Closed) => Ok(0),
            Some(FakeRead::Fail) => Err(io::ErrorKind::ConnectionReset.into()),
            Some(FakeRead::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    script.push_front(FakeRead::Data(data[n..].to_vec()));
                }
                Ok(n)
            }
        }
    }

    async fn readable(&self) -> io::Result<()> {
        let exhausted = self.script.lock().unwrap().is_empty();
        if exhausted {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DecodedPacket {
    pub header: PacketHeader,
    pub samples: Vec<(SampleHeader, Vec<u8>)>,
}

/// Splits a byte stream into packets and samples, panicking if it is not well-formed
pub fn decode_packets(mut buf: &[u8]) -> Vec<DecodedPacket> {
    let mut result = Vec::new();
    while !buf.is_empty() {
        let header = PacketHeader::deser(&mut buf).unwrap();
        let packet_len: usize = header.length.safe_cast();
        let (mut payload, rest) = buf.split_at(packet_len);
        buf = rest;

        let mut samples = Vec::new();
        while !payload.is_empty() {
            let sample_header = SampleHeader::deser(&mut payload).unwrap();
            let sample_len: usize = sample_header.message_length.safe_cast();
            let (data, rest) = payload.split_at(sample_len);
            payload = rest;
            samples.push((sample_header, data.to_vec()));
        }
        result.push(DecodedPacket { header, samples });
    }
    result
}

pub fn sample_header(message_id: MessageId, publication_id: u64, sequence: u32) -> SampleHeader {
    SampleHeader::new(message_id, PublicationId::from_raw(publication_id), sequence, 0, ByteOrder::native())
}

/// Marshals a single packet. The samples' `message_length` is taken from their data.
pub fn encode_packet(sequence: u32, samples: &[(SampleHeader, Vec<u8>)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (header, data) in samples {
        let mut header = header.clone();
        header.message_length = data.len().prechecked_cast();
        header.ser(&mut payload);
        payload.extend_from_slice(data);
    }

    let mut header = PacketHeader::new(ByteOrder::native(), 0);
    header.sequence = sequence;
    header.length = payload.len().prechecked_cast();

    let mut result = Vec::with_capacity(PacketHeader::SERIALIZED_LEN + payload.len());
    header.ser(&mut result);
    result.extend_from_slice(&payload);
    result
}

#[derive(Default)]
pub struct RecordingDeliverySink {
    samples: Mutex<Vec<(SampleHeader, Vec<u8>)>>,
}

impl RecordingDeliverySink {
    pub fn samples(&self) -> Vec<(SampleHeader, Vec<u8>)> {
        self.samples.lock().unwrap().clone()
    }
}

impl DeliverySink for RecordingDeliverySink {
    fn on_sample_received(&self, header: SampleHeader, data: ByteChain) {
        self.samples.lock().unwrap().push((header, data.to_vec()));
    }
}
