//! Framing codec (spec.md §4.1): fixed-width `int32` headers and
//! length-prefixed byte payloads over an async byte stream.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FramingError;

/// Reads one big-endian `int32`. Short reads are accumulated by
/// `read_exact`; EOF before four bytes arrive raises [`FramingError::Io`].
pub async fn recv_int32<R>(r: &mut R) -> Result<i32, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).await?;
    Ok(i32::from_be_bytes(buf))
}

/// Reads an `int32` count `n` followed by `n` payload bytes.
pub async fn recv_with_length<R>(r: &mut R) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin,
{
    let n = recv_int32(r).await?;
    if n < 0 {
        return Err(FramingError::NegativeLength);
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Writes one big-endian `int32`.
pub async fn send_int32<W>(w: &mut W, value: i32) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&value.to_be_bytes()).await?;
    Ok(())
}

/// Writes an `int32` length prefix followed by `payload`.
pub async fn send_with_length<W>(w: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    send_int32(w, payload.len() as i32).await?;
    w.write_all(payload).await?;
    Ok(())
}

/// Performs a single ordered write of all `chunks`, flushing once at the
/// end. Callers hold the remote lock for the whole call (INV-SEND-EXCLUSIVE),
/// so no payload from a concurrent sender can interleave.
pub async fn send_many<W>(w: &mut W, chunks: &[&[u8]]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    for chunk in chunks {
        w.write_all(chunk).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Flattens `chunks` into one length-prefixed blob: an `int32` total length
/// followed by the concatenated bytes (spec.md §4.1, chunk boundaries are
/// not preserved on the wire).
pub async fn send_message<W>(w: &mut W, chunks: &[Bytes]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = chunks.iter().map(|c| c.len()).sum();
    send_int32(w, total as i32).await?;
    let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_ref()).collect();
    for chunk in refs {
        w.write_all(chunk).await?;
    }
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_an_int32() {
        let mut buf = Vec::new();
        send_int32(&mut buf, -17).await.unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(recv_int32(&mut cur).await.unwrap(), -17);
    }

    #[tokio::test]
    async fn round_trips_length_prefixed_bytes() {
        let mut buf = Vec::new();
        send_with_length(&mut buf, b"hello").await.unwrap();
        let mut cur = Cursor::new(buf);
        let payload = recv_with_length(&mut cur).await.unwrap();
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn rejects_a_negative_length_prefix() {
        let mut buf = Vec::new();
        send_int32(&mut buf, -1).await.unwrap();
        let mut cur = Cursor::new(buf);
        assert!(matches!(
            recv_with_length(&mut cur).await,
            Err(FramingError::NegativeLength)
        ));
    }

    #[tokio::test]
    async fn flattens_multiple_chunks_into_one_length_prefixed_blob() {
        let mut buf = Vec::new();
        send_message(&mut buf, &[Bytes::from_static(b"ab"), Bytes::from_static(b"cd")])
            .await
            .unwrap();
        let mut cur = Cursor::new(buf);
        let payload = recv_with_length(&mut cur).await.unwrap();
        assert_eq!(&payload[..], b"abcd");
    }

    #[tokio::test]
    async fn eof_before_a_frame_completes_is_a_framing_error() {
        let mut cur = Cursor::new(vec![0u8, 0u8]);
        assert!(matches!(
            recv_int32(&mut cur).await,
            Err(FramingError::Io(_))
        ));
    }
}
