use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{Result, RpcError};

/// Maximum frame size (1 MB). Anything larger is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Writes one `[4-byte big-endian length] + [data]` frame.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(RpcError::Transport(format!(
            "frame too large: {} bytes (max {} bytes)",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// A clean end-of-stream before the length prefix surfaces as
/// `RpcError::Io(UnexpectedEof)`; callers that loop over frames treat that as
/// the peer hanging up.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::Transport(format!(
            "frame too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, b"hello frames").await.unwrap();
        let data = read_frame(&mut server).await.unwrap();
        assert_eq!(data, b"hello frames");
    }

    #[tokio::test]
    async fn empty_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"").await.unwrap();
        let data = read_frame(&mut server).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bogus = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bogus)
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn eof_surfaces_as_io_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        match err {
            RpcError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected io error, got {other}"),
        }
    }
}
