//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [4-byte big-endian length][payload]
//! Message frames carry JSON and are capped at 64MB, enough for a snapshot
//! of a library with several hundred thousand tracks. Blob frames carry raw
//! track bytes and are capped at 512MB.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::Message;

/// Maximum allowed message frame size (64MB)
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum allowed blob frame size (512MB)
pub const MAX_BLOB_SIZE: u32 = 512 * 1024 * 1024;

fn closed_or_io(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

async fn read_len<R: AsyncRead + Unpin>(reader: &mut R, max: u32) -> Result<usize> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(closed_or_io)?;
    let len = u32::from_be_bytes(len_buf);

    if len > max {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            len, max
        )));
    }
    Ok(len as usize)
}

/// Read a length-prefixed message frame from a stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let len = read_len(reader, MAX_FRAME_SIZE).await?;
    if len == 0 {
        return Err(Error::Protocol("Empty frame".into()));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(closed_or_io)?;

    Message::from_bytes(&payload).map_err(|e| Error::Protocol(format!("Invalid JSON: {}", e)))
}

/// Serialize a message into a complete frame, prefix included
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>> {
    let payload = msg
        .to_bytes()
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;

    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::Protocol(format!(
            "Message too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write a length-prefixed message frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let frame = encode_frame(msg)?;
    write_encoded(writer, &frame).await
}

/// Write a frame produced by [`encode_frame`]
pub async fn write_encoded<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a raw blob frame
pub async fn read_blob<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_len(reader, MAX_BLOB_SIZE).await?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await.map_err(closed_or_io)?;
    Ok(bytes)
}

/// Write a raw blob frame
pub async fn write_blob<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_BLOB_SIZE as usize {
        return Err(Error::Protocol(format!(
            "Blob too large: {} bytes (max {})",
            bytes.len(),
            MAX_BLOB_SIZE
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Op, Outcome};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_reply_then_blob() {
        let reply = Message::Reply {
            id: 1,
            outcome: Outcome::TrackFollows {
                track: "t1".into(),
                len: 3,
            },
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &reply).await.unwrap();
        write_blob(&mut buf, &[7, 8, 9]).await.unwrap();
        write_frame(
            &mut buf,
            &Message::Request {
                id: 2,
                op: Op::Time,
            },
        )
        .await
        .unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), reply);
        assert_eq!(read_blob(&mut cursor).await.unwrap(), vec![7, 8, 9]);
        assert!(matches!(
            read_frame(&mut cursor).await.unwrap(),
            Message::Request { id: 2, op: Op::Time }
        ));
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 0]);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(len.to_vec());
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_empty_blob_allowed() {
        let mut buf = Vec::new();
        write_blob(&mut buf, &[]).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(read_blob(&mut cursor).await.unwrap().is_empty());
    }
}
