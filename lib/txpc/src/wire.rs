use crate::support::{ErrorType, RelayError, RelayResult};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

/// Fixed wire size of a message header.
pub const HEADER_SIZE: usize = 5;

/// Channel reserved for the negotiation sub-protocol.
pub const NEGOTIATION_CHANNEL: u8 = 0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MsgType {
    Reset = 1,
    SetEndianness = 2,
    SetCrc = 3,
    Disconnect = 4,
    Data = 5,
}

impl MsgType {
    #[inline]
    pub fn from_wire(raw: u8) -> RelayResult<MsgType> {
        Ok(match raw {
            1 => MsgType::Reset,
            2 => MsgType::SetEndianness,
            3 => MsgType::SetCrc,
            4 => MsgType::Disconnect,
            5 => MsgType::Data,
            _ => return Err(RelayError::Fatal(ErrorType::IncorrectMsgType)),
        })
    }
}

impl From<MsgType> for u8 {
    #[inline]
    fn from(kind: MsgType) -> Self {
        kind as u8
    }
}

/// Message header as it travels on the wire: `size (2) | type (1) | to (1) |
/// from (1)`. The size field is encoded in the negotiated endianness, all
/// other fields are single bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MsgHeader {
    pub size: u16,
    pub kind: MsgType,
    pub to: u8,
    pub from: u8,
}

impl MsgHeader {
    #[inline]
    pub fn data(size: u16, to: u8, from: u8) -> MsgHeader {
        MsgHeader {
            size,
            kind: MsgType::Data,
            to,
            from,
        }
    }

    /// The reset frame is fully fixed: no payload, negotiation channel only.
    #[inline]
    pub fn reset() -> MsgHeader {
        MsgHeader {
            size: 0,
            kind: MsgType::Reset,
            to: NEGOTIATION_CHANNEL,
            from: NEGOTIATION_CHANNEL,
        }
    }

    #[inline]
    pub fn disconnect() -> MsgHeader {
        MsgHeader {
            size: 0,
            kind: MsgType::Disconnect,
            to: NEGOTIATION_CHANNEL,
            from: NEGOTIATION_CHANNEL,
        }
    }

    #[inline]
    pub fn negotiation(kind: MsgType, size: u16) -> MsgHeader {
        MsgHeader {
            size,
            kind,
            to: NEGOTIATION_CHANNEL,
            from: NEGOTIATION_CHANNEL,
        }
    }

    /// Negotiation traffic is addressed `to = from = 0` and is never routed.
    #[inline]
    pub fn is_negotiation(&self) -> bool {
        self.to == NEGOTIATION_CHANNEL && self.from == NEGOTIATION_CHANNEL
    }

    #[inline]
    pub fn is_reset_frame(&self) -> bool {
        *self == MsgHeader::reset()
    }

    #[inline]
    pub fn is_disconnect_frame(&self) -> bool {
        *self == MsgHeader::disconnect()
    }

    pub fn encode(&self, buf: &mut [u8; HEADER_SIZE], big_endian: bool) {
        let mut stream = &mut buf[..];

        if big_endian {
            stream
                .write_u16::<BigEndian>(self.size)
                .expect("Error writing header size");
        } else {
            stream
                .write_u16::<LittleEndian>(self.size)
                .expect("Error writing header size");
        }
        stream
            .write_all(&[self.kind.into(), self.to, self.from])
            .expect("Error writing header fields");
    }

    pub fn decode(buf: &[u8; HEADER_SIZE], big_endian: bool) -> RelayResult<MsgHeader> {
        let mut stream = Cursor::new(&buf[..]);

        let size = if big_endian {
            stream.read_u16::<BigEndian>()?
        } else {
            stream.read_u16::<LittleEndian>()?
        };
        let kind = MsgType::from_wire(stream.read_u8()?)?;
        let to = stream.read_u8()?;
        let from = stream.read_u8()?;

        Ok(MsgHeader { size, kind, to, from })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout_little_endian() {
        let hdr = MsgHeader::data(0x0102, 3, 4);
        let mut buf = [0u8; HEADER_SIZE];

        hdr.encode(&mut buf, false);

        assert_eq!(buf, [0x02, 0x01, 5, 3, 4]);
    }

    #[test]
    fn test_encode_layout_big_endian() {
        let hdr = MsgHeader::data(0x0102, 3, 4);
        let mut buf = [0u8; HEADER_SIZE];

        hdr.encode(&mut buf, true);

        assert_eq!(buf, [0x01, 0x02, 5, 3, 4]);
    }

    #[test]
    fn test_roundtrip_both_endiannesses() {
        let hdr = MsgHeader::data(512, 7, 9);
        let mut buf = [0u8; HEADER_SIZE];

        for &big_endian in &[false, true] {
            hdr.encode(&mut buf, big_endian);
            assert_eq!(MsgHeader::decode(&buf, big_endian).unwrap(), hdr);
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let buf = [0u8, 0, 9, 0, 0];

        let result = MsgHeader::decode(&buf, false);

        assert_eq!(
            result.unwrap_err(),
            RelayError::Fatal(ErrorType::IncorrectMsgType)
        );
    }

    #[test]
    fn test_reset_frame_shape() {
        let hdr = MsgHeader::reset();

        assert!(hdr.is_reset_frame());
        assert!(hdr.is_negotiation());
        assert_eq!(hdr.size, 0);
    }

    #[test]
    fn test_data_frame_not_negotiation() {
        assert!(!MsgHeader::data(1, 1, 1).is_negotiation());
        // from = 0 alone does not make a frame negotiation traffic
        assert!(!MsgHeader::data(1, 1, 0).is_negotiation());
    }
}
