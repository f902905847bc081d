//! MQTT 3.1.1 control packets.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    CodecError, FixedHeader, PacketType, Reader, read_fixed_header, variable_int_len,
    write_binary, write_fixed_header, write_string,
};
use super::{PROTOCOL_LEVEL, PROTOCOL_NAME};
use crate::types::{ConnectReturnCode, QoS};

/// MQTT 3.1.1 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Packet identifier; zero and absent on the wire for QoS 0.
    pub pkid: u16,
}

/// PUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// One topic filter in a SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// Per-filter SUBACK result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(SubscribeReturnCode::Success(QoS::AtMostOnce)),
            1 => Ok(SubscribeReturnCode::Success(QoS::AtLeastOnce)),
            0x80 => Ok(SubscribeReturnCode::Failure),
            other => Err(CodecError::malformed(format!(
                "unsupported suback return code {:#04x}",
                other
            ))),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filters: Vec<String>,
}

/// UNSUBACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

// ============================================================================
// Packet parsing
// ============================================================================

impl Packet {
    /// Parse one packet from the start of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied, or
    /// [`CodecError::Incomplete`] if `buf` does not hold a whole packet yet.
    pub fn read(buf: &[u8], max_size: usize) -> Result<(Packet, usize), CodecError> {
        let header = read_fixed_header(buf)?;
        let total_len = header.packet_length();

        if total_len > max_size {
            return Err(CodecError::PacketTooLarge {
                size: total_len,
                max: max_size,
            });
        }

        if buf.len() < total_len {
            return Err(CodecError::Incomplete {
                needed: total_len - buf.len(),
            });
        }

        let body = &buf[header.header_length..total_len];
        let packet = Self::read_body(&header, body)?;
        Ok((packet, total_len))
    }

    fn read_body(header: &FixedHeader, body: &[u8]) -> Result<Packet, CodecError> {
        let mut r = Reader::new(body);
        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(&mut r)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(&mut r)?),
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, &mut r)?),
            PacketType::PubAck => Packet::PubAck(PubAck {
                pkid: read_pkid(&mut r)?,
            }),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(&mut r)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(&mut r)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(&mut r)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck {
                pkid: read_pkid(&mut r)?,
            }),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
            PacketType::PubRec | PacketType::PubRel | PacketType::PubComp => {
                return Err(CodecError::malformed(format!(
                    "{:?} belongs to QoS 2, which is not supported",
                    header.packet_type
                )));
            }
        };

        if !r.is_empty() {
            return Err(CodecError::malformed(format!(
                "{} trailing bytes after {:?}",
                r.remaining(),
                header.packet_type
            )));
        }
        Ok(packet)
    }

    /// Append the encoded packet to `buf`, returning the bytes written.
    pub fn write(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        buf.reserve(self.size());
        match self {
            Packet::Connect(p) => p.write(buf),
            Packet::ConnAck(p) => p.write(buf),
            Packet::Publish(p) => p.write(buf),
            Packet::PubAck(p) => write_pkid_packet(buf, PacketType::PubAck, p.pkid),
            Packet::Subscribe(p) => p.write(buf),
            Packet::SubAck(p) => p.write(buf),
            Packet::Unsubscribe(p) => p.write(buf),
            Packet::UnsubAck(p) => write_pkid_packet(buf, PacketType::UnsubAck, p.pkid),
            Packet::PingReq => write_fixed_header(buf, PacketType::PingReq, 0, 0),
            Packet::PingResp => write_fixed_header(buf, PacketType::PingResp, 0, 0),
            Packet::Disconnect => write_fixed_header(buf, PacketType::Disconnect, 0, 0),
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.write(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        let remaining = match self {
            Packet::Connect(p) => p.remaining_length(),
            Packet::ConnAck(_) | Packet::PubAck(_) | Packet::UnsubAck(_) => 2,
            Packet::Publish(p) => p.remaining_length(),
            Packet::Subscribe(p) => p.remaining_length(),
            Packet::SubAck(p) => 2 + p.return_codes.len(),
            Packet::Unsubscribe(p) => p.remaining_length(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        };
        1 + variable_int_len(remaining as u32) + remaining
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

fn read_pkid(r: &mut Reader<'_>) -> Result<u16, CodecError> {
    let pkid = r.u16("packet identifier")?;
    if pkid == 0 {
        return Err(CodecError::malformed("packet identifier 0"));
    }
    Ok(pkid)
}

fn write_pkid_packet(buf: &mut BytesMut, packet_type: PacketType, pkid: u16) -> Result<usize, CodecError> {
    let n = write_fixed_header(buf, packet_type, 0, 2)?;
    buf.put_u16(pkid);
    Ok(n + 2)
}

// ============================================================================
// Individual packet implementations
// ============================================================================

const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_USERNAME: u8 = 0x80;

impl Connect {
    fn read(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let name = r.string("protocol name")?;
        if name.as_bytes() != PROTOCOL_NAME {
            return Err(CodecError::malformed(format!("unknown protocol name {:?}", name)));
        }

        let level = r.u8("protocol level")?;
        if level != PROTOCOL_LEVEL {
            return Err(CodecError::malformed(format!("unsupported protocol level {}", level)));
        }

        let flags = r.u8("connect flags")?;
        if flags & 0x01 != 0 {
            return Err(CodecError::malformed("reserved connect flag set"));
        }
        if flags & CONNECT_FLAG_WILL != 0 {
            return Err(CodecError::malformed("will messages are not supported"));
        }

        let keep_alive = r.u16("keep alive")?;
        let client_id = r.string("client id")?.to_string();

        let username = if flags & CONNECT_FLAG_USERNAME != 0 {
            Some(r.string("username")?.to_string())
        } else {
            None
        };

        let password = if flags & CONNECT_FLAG_PASSWORD != 0 {
            Some(Bytes::copy_from_slice(r.binary("password")?))
        } else {
            None
        };

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session: flags & CONNECT_FLAG_CLEAN_SESSION != 0,
            username,
            password,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        let remaining_len = self.remaining_length();
        let mut pos = write_fixed_header(buf, PacketType::Connect, 0, remaining_len)?;

        pos += write_binary(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);

        let mut flags = 0u8;
        if self.clean_session {
            flags |= CONNECT_FLAG_CLEAN_SESSION;
        }
        if self.username.is_some() {
            flags |= CONNECT_FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= CONNECT_FLAG_PASSWORD;
        }
        buf.put_u8(flags);
        buf.put_u16(self.keep_alive);
        pos += 4;

        pos += write_string(buf, &self.client_id)?;
        if let Some(ref username) = self.username {
            pos += write_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            pos += write_binary(buf, password)?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        // protocol name + level + flags + keep alive
        let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
        len += 2 + self.client_id.len();
        if let Some(ref username) = self.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = self.password {
            len += 2 + password.len();
        }
        len
    }
}

impl ConnAck {
    fn read(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let ack_flags = r.u8("connack flags")?;
        if ack_flags & 0xFE != 0 {
            return Err(CodecError::malformed("reserved connack flags set"));
        }
        let raw = r.u8("return code")?;
        let code = ConnectReturnCode::from_u8(raw)
            .ok_or_else(|| CodecError::malformed(format!("unknown connack return code {}", raw)))?;

        Ok(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            code,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        let n = write_fixed_header(buf, PacketType::ConnAck, 0, 2)?;
        buf.put_u8(self.session_present as u8);
        buf.put_u8(self.code.to_u8());
        Ok(n + 2)
    }
}

impl Publish {
    fn read(flags: u8, r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let dup = flags & 0x08 != 0;
        let raw_qos = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(raw_qos)
            .ok_or_else(|| CodecError::malformed(format!("unsupported publish qos {}", raw_qos)))?;
        let retain = flags & 0x01 != 0;

        if qos == QoS::AtMostOnce && dup {
            return Err(CodecError::malformed("dup flag set on qos 0 publish"));
        }

        let topic = r.string("topic")?.to_string();
        if topic.contains(['+', '#']) {
            return Err(CodecError::malformed(format!("wildcard in topic name {:?}", topic)));
        }

        let pkid = match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => read_pkid(r)?,
        };

        let payload = Bytes::copy_from_slice(r.rest());

        Ok(Publish {
            topic,
            payload,
            qos,
            retain,
            dup,
            pkid,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }

        let mut pos = write_fixed_header(buf, PacketType::Publish, flags, self.remaining_length())?;
        pos += write_string(buf, &self.topic)?;

        if self.qos != QoS::AtMostOnce {
            if self.pkid == 0 {
                return Err(CodecError::malformed("qos 1 publish without packet identifier"));
            }
            buf.put_u16(self.pkid);
            pos += 2;
        }

        buf.put_slice(&self.payload);
        pos += self.payload.len();

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }
}

impl Subscribe {
    fn read(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let pkid = read_pkid(r)?;

        let mut filters = Vec::new();
        while !r.is_empty() {
            let path = r.string("topic filter")?.to_string();
            let raw = r.u8("requested qos")?;
            if raw & 0xFC != 0 {
                return Err(CodecError::malformed("reserved subscribe option bits set"));
            }
            let qos = QoS::from_u8(raw)
                .ok_or_else(|| CodecError::malformed(format!("unsupported requested qos {}", raw)))?;
            filters.push(SubscribeFilter { path, qos });
        }

        if filters.is_empty() {
            return Err(CodecError::malformed("subscribe without topic filters"));
        }

        Ok(Subscribe { pkid, filters })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        if self.filters.is_empty() {
            return Err(CodecError::malformed("subscribe without topic filters"));
        }

        let mut pos = write_fixed_header(buf, PacketType::Subscribe, 0x02, self.remaining_length())?;
        buf.put_u16(self.pkid);
        pos += 2;

        for filter in &self.filters {
            pos += write_string(buf, &filter.path)?;
            buf.put_u8(filter.qos as u8);
            pos += 1;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        2 + self
            .filters
            .iter()
            .map(|f| 2 + f.path.len() + 1)
            .sum::<usize>()
    }
}

impl SubAck {
    fn read(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let pkid = read_pkid(r)?;
        let return_codes = r
            .rest()
            .iter()
            .map(|&b| SubscribeReturnCode::from_u8(b))
            .collect::<Result<Vec<_>, _>>()?;

        if return_codes.is_empty() {
            return Err(CodecError::malformed("suback without return codes"));
        }

        Ok(SubAck { pkid, return_codes })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        let remaining_len = 2 + self.return_codes.len();
        let mut pos = write_fixed_header(buf, PacketType::SubAck, 0, remaining_len)?;

        buf.put_u16(self.pkid);
        pos += 2;

        for code in &self.return_codes {
            buf.put_u8(code.to_u8());
            pos += 1;
        }

        Ok(pos)
    }
}

impl Unsubscribe {
    fn read(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let pkid = read_pkid(r)?;

        let mut filters = Vec::new();
        while !r.is_empty() {
            filters.push(r.string("topic filter")?.to_string());
        }

        if filters.is_empty() {
            return Err(CodecError::malformed("unsubscribe without topic filters"));
        }

        Ok(Unsubscribe { pkid, filters })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        if self.filters.is_empty() {
            return Err(CodecError::malformed("unsubscribe without topic filters"));
        }

        let mut pos = write_fixed_header(buf, PacketType::Unsubscribe, 0x02, self.remaining_length())?;
        buf.put_u16(self.pkid);
        pos += 2;

        for filter in &self.filters {
            pos += write_string(buf, filter)?;
        }

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        2 + self.filters.iter().map(|f| 2 + f.len()).sum::<usize>()
    }
}
