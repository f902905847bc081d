//! MQTT 3.1.1 protocol encoding and decoding.
//!
//! [`codec`] holds the byte-level primitives, [`packet`] the control packets,
//! and this module the async framing helpers used by the session.

pub mod codec;
pub mod packet;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use codec::{CodecError, PacketType};
pub use packet::*;

use crate::error::{Error, Result};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Protocol name for MQTT.
pub const PROTOCOL_NAME: &[u8] = b"MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Read a single packet from an async reader.
///
/// Bytes beyond the returned packet stay in `buf` for the next call. Only
/// `reader.read` is awaited and received bytes are moved into `buf` before the
/// next suspension point, so dropping this future inside `select!` loses no
/// data as long as the caller keeps `buf`.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(&buf[..], max_size) {
                Ok((packet, consumed)) => {
                    buf.advance(consumed);
                    return Ok(packet);
                }
                Err(CodecError::Incomplete { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut tmp = [0u8; 4096];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Write a single packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let buf = packet.to_bytes()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_read_packet_across_chunks() {
        let publish = Packet::Publish(Publish {
            topic: "test/topic".into(),
            payload: Bytes::from_static(b"hello"),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            pkid: 1,
        });
        let bytes = publish.to_bytes().unwrap();
        let ping = Packet::PingResp.to_bytes().unwrap();

        // Split the first packet mid-header and glue the second onto its tail.
        let mut tail = bytes[1..].to_vec();
        tail.extend_from_slice(&ping);
        let mut reader = tokio_test::io::Builder::new()
            .read(&bytes[..1])
            .read(&tail)
            .build();

        let mut buf = BytesMut::new();
        let first = read_packet(&mut reader, &mut buf, MAX_PACKET_SIZE).await.unwrap();
        assert_eq!(first, publish);
        let second = read_packet(&mut reader, &mut buf, MAX_PACKET_SIZE).await.unwrap();
        assert_eq!(second, Packet::PingResp);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_read_packet_eof() {
        let mut reader = tokio_test::io::Builder::new().read(&[0x30]).build();
        let mut buf = BytesMut::new();
        let err = read_packet(&mut reader, &mut buf, MAX_PACKET_SIZE).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_read_packet_malformed_is_protocol_error() {
        let mut reader = tokio_test::io::Builder::new().read(&[0xF0, 0x00]).build();
        let mut buf = BytesMut::new();
        let err = read_packet(&mut reader, &mut buf, MAX_PACKET_SIZE).await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_write_packet() {
        let mut writer = tokio_test::io::Builder::new().write(&[0xC0, 0x00]).build();
        write_packet(&mut writer, &Packet::PingReq).await.unwrap();
    }
}
