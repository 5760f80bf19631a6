//! Length-prefixed message framing
//!
//! Each envelope travels as one frame:
//!
//! ```text
//! [length: u32 LE] [reserved: 4 zero bytes] [payload: length bytes]
//! ```
//!
//! Zero-length frames carry nothing and are skipped by the reader.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use peerpost_core::{PeerpostError, Result, TransportError};

pub const HEADER_LEN: usize = 8;

/// Encode the header for a payload of `len` bytes
pub fn encode_header(len: usize) -> Result<[u8; HEADER_LEN]> {
    let len = u32::try_from(len).map_err(|_| TransportError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })?;
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&len.to_le_bytes());
    Ok(header)
}

/// Decode a header into the payload length
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<usize> {
    if header[4..] != [0u8; 4] {
        return Err(TransportError::MalformedHeader {
            reason: format!("reserved bytes set: {:02x?}", &header[4..]),
        }
        .into());
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[..4]);
    Ok(u32::from_le_bytes(len) as usize)
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_len {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: max_len,
        }
        .into());
    }
    let header = encode_header(payload.len())?;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next non-empty frame
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(PeerpostError::from(e)),
        }
        let len = decode_header(&header)?;
        if len == 0 {
            continue;
        }
        if len > max_len {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: max_len,
            }
            .into());
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        return Ok(Some(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = encode_header(0x0102_0304).unwrap();
        assert_eq!(header, [0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
        assert_eq!(decode_header(&header).unwrap(), 0x0102_0304);
    }

    #[test]
    fn test_reserved_bytes_rejected() {
        let header = [1, 0, 0, 0, 0, 0, 1, 0];
        assert!(matches!(
            decode_header(&header),
            Err(PeerpostError::Transport(TransportError::MalformedHeader { .. }))
        ));
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"first", 64).await.unwrap();
        // An empty frame is skipped by the reader.
        client.write_all(&[0u8; HEADER_LEN]).await.unwrap();
        write_frame(&mut client, b"second", 64).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"second");
        assert!(read_frame(&mut server, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_frames_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        assert!(write_frame(&mut client, &[7u8; 65], 64).await.is_err());

        client.write_all(&encode_header(65).unwrap()).await.unwrap();
        assert!(matches!(
            read_frame(&mut server, 64).await,
            Err(PeerpostError::Transport(TransportError::FrameTooLarge { size: 65, max: 64 }))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&encode_header(10).unwrap()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(read_frame(&mut server, 64).await.is_err());
    }
}
