//! Wire framing.
//!
//! Every message travels as a 4-byte big-endian length prefix followed by
//! the postcard encoding of a [`Message`]. The receiver answers each frame
//! with a single acknowledgment byte before decoding the next one; the
//! sender blocks on that byte, which makes every link synchronous and
//! FIFO-ordered without any further sequencing.

use cairn_protocol::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on an encoded message. Protocol messages are tiny (a few
/// vectors of labels at most); anything near this limit is corruption.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// The acknowledgment byte (ASCII ACK).
pub const ACK: u8 = 0x06;

/// Writes one framed message and flushes.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = postcard::to_allocvec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::OversizedFrame {
            len: body.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    // Exact: the guard above caps `body.len()` at `MAX_FRAME_SIZE`.
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::OversizedFrame {
            len,
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(postcard::from_bytes(&body)?)
}

/// Writes the acknowledgment byte and flushes.
pub async fn write_ack<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[ACK]).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocks until the acknowledgment byte arrives.
pub async fn read_ack<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_protocol::{NodeId, Payload};

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let message = Message::new(NodeId::new(3), Payload::Complete);

        write_frame(&mut client, &message).await.unwrap();
        let decoded = read_frame(&mut server).await.unwrap();
        assert_eq!(decoded, message);

        write_ack(&mut server).await.unwrap();
        read_ack(&mut client).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bogus = (u32::try_from(MAX_FRAME_SIZE).unwrap() + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bogus)
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::OversizedFrame { .. }));
    }
}
