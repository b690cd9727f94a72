//! Length-prefixed JSON framing for comm streams.
//!
//! The framed stream binding (see `socket.rs`) speaks frames of the form:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [payload bytes]
//! ```
//!
//! Comm traffic is small JSON, so a single 1 MiB frame cap bounds what a
//! misbehaving peer can make us allocate.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size: 1 MiB.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Send a length-prefixed frame.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed frame.
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Send a value as a JSON-encoded length-prefixed frame.
pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> anyhow::Result<()> {
    let data = serde_json::to_vec(value)?;
    send_frame(writer, &data).await?;
    Ok(())
}

/// Receive and deserialize a JSON-encoded length-prefixed frame.
/// Returns `None` on clean disconnect (EOF).
pub async fn recv_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> anyhow::Result<Option<T>> {
    match recv_frame(reader).await? {
        Some(data) => {
            let value = serde_json::from_slice(&data)?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireFrame;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        send_frame(&mut client, b"hello frontend").await.unwrap();
        let frame = recv_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(frame, b"hello frontend");
    }

    #[tokio::test]
    async fn test_json_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let sent = WireFrame::CommMsg {
            comm_id: "config.tag#1".to_string(),
            data: json!({"paths": {}, "shim": {}}),
        };
        send_json_frame(&mut client, &sent).await.unwrap();

        let received: WireFrame = recv_json_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_eof_is_clean_disconnect() {
        let (client, mut server) = tokio::io::duplex(4096);
        drop(client);

        assert!(recv_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        // Header declaring a frame far beyond the cap.
        let len = (8 * 1024 * 1024u32).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let err = recv_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
