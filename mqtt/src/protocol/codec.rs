//! MQTT packet encoding/decoding primitives.
//!
//! Low-level readers and writers for the fixed header, the remaining-length
//! variable integer, big-endian u16 and length-prefixed strings/binary data.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Largest value the remaining-length encoding can carry (4 bytes).
pub const MAX_VARIABLE_INT: u32 = 268_435_455;

/// Decoding/encoding failure at the byte level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// More bytes are needed before the packet can be parsed.
    #[error("incomplete packet, need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Bytes violate the MQTT 3.1.1 format.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Packet exceeds the configured maximum size.
    #[error("packet too large: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },
}

impl CodecError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        CodecError::Malformed(msg.into())
    }
}

/// Control packet type (high nibble of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            _ => return None,
        })
    }

    /// Flags the fixed header must carry for this type. PUBLISH is free-form.
    fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
    /// Bytes taken by the fixed header itself (type byte + length varint).
    pub header_length: usize,
}

impl FixedHeader {
    /// Total size of the packet this header introduces.
    pub fn packet_length(&self) -> usize {
        self.header_length + self.remaining_length as usize
    }
}

/// Read a variable-length integer (remaining length encoding).
///
/// Returns `(value, bytes_consumed)`.
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), CodecError> {
    let mut multiplier = 1u32;
    let mut value = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(CodecError::malformed("remaining length exceeds 4 bytes"));
        }

        value += (byte & 0x7F) as u32 * multiplier;

        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(CodecError::malformed("remaining length exceeds 4 bytes"));
    }
    Err(CodecError::Incomplete { needed: 1 })
}

/// Write a variable-length integer.
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize, CodecError> {
    if value > MAX_VARIABLE_INT {
        return Err(CodecError::PacketTooLarge {
            size: value as usize,
            max: MAX_VARIABLE_INT as usize,
        });
    }

    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        written += 1;
        if value == 0 {
            return Ok(written);
        }
    }
}

/// Number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Parse a fixed header from the start of `buf`.
pub fn read_fixed_header(buf: &[u8]) -> Result<FixedHeader, CodecError> {
    let Some(&first_byte) = buf.first() else {
        return Err(CodecError::Incomplete { needed: 2 });
    };

    let type_nibble = first_byte >> 4;
    let flags = first_byte & 0x0F;

    let packet_type = PacketType::from_u8(type_nibble)
        .ok_or_else(|| CodecError::malformed(format!("invalid packet type {}", type_nibble)))?;

    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(CodecError::malformed(format!(
                "invalid flags {:#04x} for {:?}",
                flags, packet_type
            )));
        }
    }

    let (remaining_length, var_len) = read_variable_int(&buf[1..])?;

    Ok(FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_length: 1 + var_len,
    })
}

/// Write a fixed header.
pub fn write_fixed_header(
    buf: &mut BytesMut,
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
) -> Result<usize, CodecError> {
    let remaining = u32::try_from(remaining_length).map_err(|_| CodecError::PacketTooLarge {
        size: remaining_length,
        max: MAX_VARIABLE_INT as usize,
    })?;
    buf.put_u8(((packet_type as u8) << 4) | (flags & 0x0F));
    Ok(1 + write_variable_int(buf, remaining)?)
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<usize, CodecError> {
    write_binary(buf, s.as_bytes())
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<usize, CodecError> {
    let len = u16::try_from(data.len())
        .map_err(|_| CodecError::malformed(format!("field of {} bytes exceeds 65535", data.len())))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(2 + data.len())
}

/// Cursor over the variable header and payload of one packet.
///
/// The slice is always a complete packet body, so running out of bytes
/// here means the remaining length lied: that is malformed, not incomplete.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::malformed(format!("truncated {}", what)));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self, what: &str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16(&mut self, what: &str) -> Result<u16, CodecError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn binary(&mut self, what: &str) -> Result<&'a [u8], CodecError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }

    pub fn string(&mut self, what: &str) -> Result<&'a str, CodecError> {
        let raw = self.binary(what)?;
        std::str::from_utf8(raw).map_err(|_| CodecError::malformed(format!("{} is not UTF-8", what)))
    }

    /// Everything that has not been consumed yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_int() {
        for value in [0, 1, 127, 128, 16383, 16384, 2097151, 2097152, MAX_VARIABLE_INT] {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            let (decoded, consumed) = read_variable_int(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(written, consumed);
            assert_eq!(written, variable_int_len(value));
        }
    }

    #[test]
    fn test_variable_int_incomplete_and_malformed() {
        assert_eq!(
            read_variable_int(&[0x80]),
            Err(CodecError::Incomplete { needed: 1 })
        );
        assert!(matches!(
            read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(CodecError::Malformed(_))
        ));

        let mut buf = BytesMut::new();
        assert!(write_variable_int(&mut buf, MAX_VARIABLE_INT + 1).is_err());
    }

    #[test]
    fn test_fixed_header_flags() {
        // SUBSCRIBE must carry 0x2
        assert!(read_fixed_header(&[0x82, 0x00]).is_ok());
        assert!(matches!(
            read_fixed_header(&[0x80, 0x00]),
            Err(CodecError::Malformed(_))
        ));
        // PINGRESP with stray flag
        assert!(read_fixed_header(&[0xD1, 0x00]).is_err());
        // Type 0 and 15 are reserved
        assert!(read_fixed_header(&[0x00, 0x00]).is_err());
        assert!(read_fixed_header(&[0xF0, 0x00]).is_err());
    }

    #[test]
    fn test_string_reader() {
        let mut buf = BytesMut::new();
        assert_eq!(write_string(&mut buf, "hello").unwrap(), 7);
        buf.put_u8(0xAB);

        let mut r = Reader::new(&buf);
        assert_eq!(r.string("topic").unwrap(), "hello");
        assert_eq!(r.u8("tail").unwrap(), 0xAB);
        assert!(r.is_empty());
        assert!(r.u8("past end").is_err());
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let raw = [0x00, 0x02, 0xFF, 0xFE];
        let mut r = Reader::new(&raw);
        assert!(matches!(r.string("topic"), Err(CodecError::Malformed(_))));
    }
}
