//! Length-prefixed frame codec.
//!
//! Wire format: `[4-byte length as u32 big-endian] + [payload]`. A length of
//! zero is a keepalive ping and carries no payload. Frames larger than the
//! configured maximum are a protocol error; transports close the connection
//! when they see one.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

/// Default maximum payload size (64 KiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

const SIZE_LEN: usize = 4;

/// One decoded frame off the wire.
#[derive(Debug, PartialEq)]
pub enum Frame {
    /// Zero-length keepalive
    Ping,
    /// A payload frame
    Payload(Vec<u8>),
}

/// Reads one frame from an async stream.
///
/// Returns [`Frame::Ping`] for zero-length frames; the caller is expected to
/// refresh its read/write clock and keep reading. Over-sized frames fail
/// with [`ProtoError::PayloadTooLarge`].
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut size_frame = [0u8; SIZE_LEN];
    reader.read_exact(&mut size_frame).await?;

    let size = u32::from_be_bytes(size_frame) as usize;
    if size == 0 {
        return Ok(Frame::Ping);
    }
    if size > max_payload {
        return Err(ProtoError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Frame::Payload(payload))
}

/// Writes one payload frame to an async stream.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a keepalive ping.
pub async fn write_ping<W>(writer: &mut W) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&0u32.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Decodes one frame from an in-memory buffer.
///
/// Used by message-oriented transports (WebSocket) where the peer delivers a
/// whole frame per message.
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Result<Frame, ProtoError> {
    if buf.len() < SIZE_LEN {
        return Err(ProtoError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "frame header truncated",
        )));
    }

    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size == 0 {
        return Ok(Frame::Ping);
    }
    if size > max_payload {
        return Err(ProtoError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }
    if buf.len() - SIZE_LEN < size {
        return Err(ProtoError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "frame payload truncated",
        )));
    }

    Ok(Frame::Payload(buf[SIZE_LEN..SIZE_LEN + size].to_vec()))
}

/// Encodes one frame into an in-memory buffer.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SIZE_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encodes a message to its wire payload.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    Ok(postcard::to_allocvec(value)?)
}

/// Decodes a message from its wire payload.
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtoError> {
    Ok(postcard::from_bytes(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Reply, Request};

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let req = Request {
            id: 1,
            service_code: 7,
            method: "Echo".to_string(),
            ..Default::default()
        };
        let payload = to_payload(&req).unwrap();

        let mut wire = Vec::new();
        write_frame(&mut wire, &payload).await.unwrap();

        let mut reader = wire.as_slice();
        match read_frame(&mut reader, DEFAULT_MAX_PAYLOAD).await.unwrap() {
            Frame::Payload(p) => {
                let decoded: Request = from_payload(&p).unwrap();
                assert_eq!(decoded, req);
            }
            Frame::Ping => panic!("expected payload frame"),
        }
    }

    #[tokio::test]
    async fn test_ping_frame() {
        let mut wire = Vec::new();
        write_ping(&mut wire).await.unwrap();
        assert_eq!(wire, vec![0, 0, 0, 0]);

        let mut reader = wire.as_slice();
        assert_eq!(
            read_frame(&mut reader, DEFAULT_MAX_PAYLOAD).await.unwrap(),
            Frame::Ping
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(1024u32).to_be_bytes());
        wire.extend_from_slice(&[0u8; 1024]);

        let mut reader = wire.as_slice();
        let err = read_frame(&mut reader, 512).await.unwrap_err();
        assert!(matches!(
            err,
            ProtoError::PayloadTooLarge { size: 1024, max: 512 }
        ));
    }

    #[test]
    fn test_buffer_frame_roundtrip() {
        let reply = Reply {
            request_id: 3,
            from_service: 7,
            code: 0,
            data: vec![5, 5, 5],
        };
        let buf = encode_frame(&to_payload(&reply).unwrap());

        match decode_frame(&buf, DEFAULT_MAX_PAYLOAD).unwrap() {
            Frame::Payload(p) => {
                let decoded: Reply = from_payload(&p).unwrap();
                assert_eq!(decoded, reply);
            }
            Frame::Ping => panic!("expected payload frame"),
        }
    }

    #[test]
    fn test_buffer_ping() {
        assert_eq!(
            decode_frame(&[0, 0, 0, 0], DEFAULT_MAX_PAYLOAD).unwrap(),
            Frame::Ping
        );
    }

    #[test]
    fn test_buffer_truncated_payload() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(16u32).to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);

        assert!(decode_frame(&buf, DEFAULT_MAX_PAYLOAD).is_err());
    }
}
