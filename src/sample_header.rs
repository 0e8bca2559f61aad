use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::error::CodecError;
use crate::ids::PublicationId;
use crate::packet_header::ByteOrder;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageId {
    SampleData = 0,
    DataWriterLiveliness = 1,
    InstanceRegistration = 2,
    UnregisterInstance = 3,
    DisposeInstance = 4,
    GracefulDisconnect = 5,
    FullyAssociated = 6,
    RequestAck = 7,
    SampleAck = 8,
    EndCoherentChanges = 9,
    TransportControl = 10,
    DisposeUnregisterInstance = 11,
    EndHistoricSamples = 12,
}

impl MessageId {
    /// Control messages are never batched with other samples
    pub fn requires_exclusive_packet(self) -> bool {
        !matches!(self, MessageId::SampleData | MessageId::DataWriterLiveliness)
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SampleFlags: u8 {
        /// set for little endian, cleared for big endian
        const BYTE_ORDER = 0x01;
        const LAST_SAMPLE = 0x02;
    }
}

/// The header preceding each sample inside a packet:
///
/// ```ascii
///  0: message id (u8)
///  1: flags (u8): bit 0 byte order (1 = little endian), bit 1 last sample, bits 2-7 reserved
///  2: message length (u32) - payload bytes following this header
///  6: sequence (u32)
/// 10: source timestamp seconds (u32)
/// 14: source timestamp nanoseconds (u32)
/// 18: coherency group (u32)
/// 22: publication id (1-10 bytes), see below
/// ```
///
/// The publication id is written as 7-bit groups, most significant group first, with the high
///  bit of each byte set if more groups follow. Encoding uses the minimal number of groups.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SampleHeader {
    pub message_id: MessageId,
    pub byte_order: ByteOrder,
    pub last_sample: bool,
    pub message_length: u32,
    pub sequence: u32,
    pub source_timestamp_sec: u32,
    pub source_timestamp_nanosec: u32,
    pub coherency_group: u32,
    pub publication_id: PublicationId,
}

const MAX_VARINT_LEN: usize = (u64::BITS as usize).div_ceil(7);

impl SampleHeader {
    pub const FIXED_LEN: usize = 2 + 5*std::mem::size_of::<u32>();
    pub const MAX_SERIALIZED_LEN: usize = Self::FIXED_LEN + MAX_VARINT_LEN;

    pub fn new(message_id: MessageId, publication_id: PublicationId, sequence: u32, message_length: u32, byte_order: ByteOrder) -> SampleHeader {
        SampleHeader {
            message_id,
            byte_order,
            last_sample: false,
            message_length,
            sequence,
            source_timestamp_sec: 0,
            source_timestamp_nanosec: 0,
            coherency_group: 0,
            publication_id,
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_LEN + varint_len(self.publication_id.to_raw())
    }

    fn flags(&self) -> SampleFlags {
        let mut flags = SampleFlags::empty();
        flags.set(SampleFlags::BYTE_ORDER, self.byte_order == ByteOrder::Little);
        flags.set(SampleFlags::LAST_SAMPLE, self.last_sample);
        flags
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_id.into());
        buf.put_u8(self.flags().bits());
        self.byte_order.put_u32(buf, self.message_length);
        self.byte_order.put_u32(buf, self.sequence);
        self.byte_order.put_u32(buf, self.source_timestamp_sec);
        self.byte_order.put_u32(buf, self.source_timestamp_nanosec);
        self.byte_order.put_u32(buf, self.coherency_group);
        put_varint(buf, self.publication_id.to_raw());
    }

    /// Decodes a sample header. On `Truncated`, the buffer may be partially consumed, so callers
    ///  that want to retry with more bytes should decode from a copy.
    pub fn deser(buf: &mut impl Buf) -> Result<SampleHeader, CodecError> {
        if buf.remaining() < Self::FIXED_LEN {
            return Err(CodecError::Truncated);
        }

        let raw_message_id = buf.get_u8();
        let message_id = MessageId::try_from(raw_message_id)
            .map_err(|_| CodecError::Malformed(format!("unknown message id {}", raw_message_id)))?;

        let flags = SampleFlags::from_bits_truncate(buf.get_u8());
        let byte_order = if flags.contains(SampleFlags::BYTE_ORDER) { ByteOrder::Little } else { ByteOrder::Big };

        let message_length = byte_order.get_u32(buf);
        let sequence = byte_order.get_u32(buf);
        let source_timestamp_sec = byte_order.get_u32(buf);
        let source_timestamp_nanosec = byte_order.get_u32(buf);
        let coherency_group = byte_order.get_u32(buf);
        let publication_id = PublicationId::from_raw(get_varint(buf)?);

        Ok(SampleHeader {
            message_id,
            byte_order,
            last_sample: flags.contains(SampleFlags::LAST_SAMPLE),
            message_length,
            sequence,
            source_timestamp_sec,
            source_timestamp_nanosec,
            coherency_group,
            publication_id,
        })
    }
}

fn varint_len(value: u64) -> usize {
    let significant_bits = (u64::BITS - value.leading_zeros()).max(1) as usize;
    significant_bits.div_ceil(7)
}

fn put_varint(buf: &mut impl BufMut, value: u64) {
    let num_groups = varint_len(value);
    for i in (0..num_groups).rev() {
        let group = ((value >> (7*i)) & 0x7f) as u8;
        if i > 0 {
            buf.put_u8(group | 0x80);
        }
        else {
            buf.put_u8(group);
        }
    }
}

fn get_varint(buf: &mut impl Buf) -> Result<u64, CodecError> {
    let mut result: u64 = 0;
    for _ in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated);
        }
        let b = buf.get_u8();

        if result > (u64::MAX >> 7) {
            return Err(CodecError::Malformed("publication id exceeds 64 bits".to_string()));
        }
        result = (result << 7) | (b & 0x7f) as u64;

        if b & 0x80 == 0 {
            return Ok(result);
        }
    }
    // leading zero groups are tolerated, but not beyond the longest encoding of a u64
    Err(CodecError::Malformed(format!("publication id has more than {} groups", MAX_VARINT_LEN)))
}
