use bitflags::bitflags;
use bytes::{Buf, BufMut};
use crate::error::CodecError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    pub fn native() -> ByteOrder {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        }
        else {
            ByteOrder::Big
        }
    }

    fn from_flag(is_little: bool) -> ByteOrder {
        if is_little { ByteOrder::Little } else { ByteOrder::Big }
    }

    pub(crate) fn put_u32(self, buf: &mut impl BufMut, value: u32) {
        match self {
            ByteOrder::Big => buf.put_u32(value),
            ByteOrder::Little => buf.put_u32_le(value),
        }
    }

    pub(crate) fn get_u32(self, buf: &mut impl Buf) -> u32 {
        match self {
            ByteOrder::Big => buf.get_u32(),
            ByteOrder::Little => buf.get_u32_le(),
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PacketFlags: u8 {
        /// set for little endian, cleared for big endian
        const BYTE_ORDER = 0x01;
        const LAST_FRAGMENT = 0x02;
    }
}

/// The header preceding every transport packet. All multi-byte fields are in the byte order
///  declared in the flags byte:
///
/// ```ascii
///  0: protocol id (6 bytes): 'D' 'C' 'P' 'S' major minor
///  6: flags (u8): bit 0 byte order (1 = little endian), bit 1 last fragment, bits 2-7 reserved
///  7: reserved (u8)
///  8: length (u32) - payload bytes following the header
/// 12: sequence (u32) - packet sequence number, incremented per packet on a link
/// 16: source (u32) - originating endpoint
/// ```
///
/// On the send side, `length` doubles as the number of payload bytes of the current packet that
///  are not sent yet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub byte_order: ByteOrder,
    pub last_fragment: bool,
    pub length: u32,
    pub sequence: u32,
    pub source: u32,
}

impl PacketHeader {
    pub const PROTOCOL_ID: [u8; 6] = [b'D', b'C', b'P', b'S', 2, 0];
    pub const SERIALIZED_LEN: usize = Self::PROTOCOL_ID.len() + 2 + 3*std::mem::size_of::<u32>();

    pub fn new(byte_order: ByteOrder, source: u32) -> PacketHeader {
        PacketHeader {
            byte_order,
            last_fragment: false,
            length: 0,
            sequence: 0,
            source,
        }
    }

    fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::BYTE_ORDER, self.byte_order == ByteOrder::Little);
        flags.set(PacketFlags::LAST_FRAGMENT, self.last_fragment);
        flags
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&Self::PROTOCOL_ID);
        buf.put_u8(self.flags().bits());
        buf.put_u8(0);
        self.byte_order.put_u32(buf, self.length);
        self.byte_order.put_u32(buf, self.sequence);
        self.byte_order.put_u32(buf, self.source);
    }

    /// Decodes a packet header, consuming exactly `SERIALIZED_LEN` bytes on success. Nothing is
    ///  consumed if the buffer holds less than a full header.
    pub fn deser(buf: &mut impl Buf) -> Result<PacketHeader, CodecError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(CodecError::Truncated);
        }

        let mut protocol_id = [0u8; 6];
        buf.copy_to_slice(&mut protocol_id);
        if protocol_id != Self::PROTOCOL_ID {
            return Err(CodecError::Malformed(format!("unsupported protocol id {:?}", protocol_id)));
        }

        // reserved bits are ignored
        let flags = PacketFlags::from_bits_truncate(buf.get_u8());
        let _reserved = buf.get_u8();

        let byte_order = ByteOrder::from_flag(flags.contains(PacketFlags::BYTE_ORDER));
        let length = byte_order.get_u32(buf);
        let sequence = byte_order.get_u32(buf);
        let source = byte_order.get_u32(buf);

        Ok(PacketHeader {
            byte_order,
            last_fragment: flags.contains(PacketFlags::LAST_FRAGMENT),
            length,
            sequence,
            source,
        })
    }
}
