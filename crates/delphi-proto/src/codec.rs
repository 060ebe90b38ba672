//! Async frame I/O for 9P messages.
//!
//! A frame is `size[4] type[1] tag[2] payload`, where `size` counts its own
//! four bytes. [`read_frame`] enforces the size bounds before touching the
//! payload so a malformed peer cannot make the server allocate past the
//! negotiated maximum.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ProtoError, ProtoResult};

/// Bytes of frame overhead before the payload: size, type, tag.
pub const HEADER_SIZE: u32 = 7;

/// Frame overhead of an Rread reply: header plus the 4-byte count.
/// Read requests are clamped to `msize - RREAD_OVERHEAD`.
pub const RREAD_OVERHEAD: u32 = HEADER_SIZE + 4;

/// Read one complete frame, returning `(type, tag, payload)`.
///
/// Fails with [`ProtoError::MessageTooSmall`] / [`ProtoError::MessageTooLarge`]
/// when the size field is out of bounds for `max_size`. A clean EOF at a
/// frame boundary surfaces as an [`ProtoError::Io`] with
/// `ErrorKind::UnexpectedEof`.
pub async fn read_frame<R>(r: &mut R, max_size: u32) -> ProtoResult<(u8, u16, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut size_buf = [0u8; 4];
    r.read_exact(&mut size_buf).await?;
    let size = u32::from_le_bytes(size_buf);

    if size < HEADER_SIZE {
        return Err(ProtoError::MessageTooSmall(size));
    }
    if size > max_size {
        return Err(ProtoError::MessageTooLarge(size));
    }

    let mut rest = vec![0u8; (size - 4) as usize];
    r.read_exact(&mut rest).await?;

    let mtype = rest[0];
    let tag = u16::from_le_bytes([rest[1], rest[2]]);
    let payload = rest.split_off(3);

    Ok((mtype, tag, payload))
}

/// Write one complete frame.
pub async fn write_frame<W>(
    w: &mut W,
    mtype: u8,
    tag: u16,
    payload: &[u8],
    max_size: u32,
) -> ProtoResult<()>
where
    W: AsyncWrite + Unpin,
{
    let size = HEADER_SIZE + payload.len() as u32;
    if size > max_size {
        return Err(ProtoError::MessageTooLarge(size));
    }

    let mut frame = Vec::with_capacity(size as usize);
    frame.extend_from_slice(&size.to_le_bytes());
    frame.push(mtype);
    frame.extend_from_slice(&tag.to_le_bytes());
    frame.extend_from_slice(payload);

    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{msg_type, Tmessage, MAX_MESSAGE_SIZE};

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let msg = Tmessage::Version {
            msize: 8192,
            version: "9P2000".into(),
        };
        let payload = msg.encode();
        write_frame(
            &mut client,
            msg.type_code(),
            crate::NOTAG,
            &payload,
            MAX_MESSAGE_SIZE,
        )
        .await
        .unwrap();

        let (mtype, tag, got) = read_frame(&mut server, MAX_MESSAGE_SIZE).await.unwrap();
        assert_eq!(mtype, msg_type::TVERSION);
        assert_eq!(tag, crate::NOTAG);
        assert_eq!(Tmessage::decode(mtype, &got).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_undersized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&5u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0u8; 8]).await.unwrap();

        let err = read_frame(&mut server, MAX_MESSAGE_SIZE).await.unwrap_err();
        assert!(matches!(err, ProtoError::MessageTooSmall(5)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&100_000u32.to_le_bytes()).await.unwrap();

        let err = read_frame(&mut server, MAX_MESSAGE_SIZE).await.unwrap_err();
        assert!(matches!(err, ProtoError::MessageTooLarge(100_000)));
    }

    #[tokio::test]
    async fn test_write_respects_max_size() {
        let (mut client, _server) = tokio::io::duplex(64);
        let payload = vec![0u8; 9000];
        let err = write_frame(&mut client, msg_type::RREAD, 0, &payload, MAX_MESSAGE_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtoError::MessageTooLarge(_)));
    }
}
