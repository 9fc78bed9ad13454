/// Varint-framed protobuf helpers shared by the wire codecs.
///
/// Both the Kademlia wire protocol and bitswap frame every protobuf message
/// with an unsigned-varint length prefix.
use std::io;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use prost::Message;

/// Read one length-prefixed message payload, rejecting frames larger than
/// `max_len`.
pub async fn read_framed<T>(io: &mut T, max_len: usize) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let len = unsigned_varint::aio::read_usize(&mut *io)
        .await
        .map_err(|e| match e {
            unsigned_varint::io::ReadError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })?;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, max_len),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one message with its unsigned-varint length prefix.
pub async fn write_framed<T, M>(io: &mut T, msg: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Message,
{
    let bytes = msg.encode_to_vec();
    let mut len_buf = unsigned_varint::encode::usize_buffer();
    io.write_all(unsigned_varint::encode::usize(bytes.len(), &mut len_buf))
        .await?;
    io.write_all(&bytes).await?;
    io.flush().await
}

/// Decode a protobuf payload into `M`, mapping decode failures onto
/// `InvalidData`.
pub fn decode_message<M: Message + Default>(bytes: &[u8]) -> io::Result<M> {
    M::decode(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Probe {
        #[prost(bytes = "vec", tag = "1")]
        key: Vec<u8>,
    }

    #[tokio::test]
    async fn framed_round_trip() {
        let msg = Probe {
            key: b"roundtrip".to_vec(),
        };
        let mut buf = Vec::new();
        write_framed(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let payload = read_framed(&mut cursor, 1024).await.unwrap();
        let decoded: Probe = decode_message(&payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let msg = Probe {
            key: vec![7u8; 64],
        };
        let mut buf = Vec::new();
        write_framed(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let err = read_framed(&mut cursor, 8).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
