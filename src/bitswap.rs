/// Bitswap Wire Module
///
/// Hand-rolled subset of the bitswap 1.x message schema and the codec used
/// by the block-availability probe. The probe only ever sends a wantlist
/// with a single WANT_HAVE entry (send-dont-have set), so a peer that
/// speaks 1.2.0 answers with a block presence either way; a reply carrying
/// the block itself also counts as an affirmative.
///
/// The codec negotiates the protocol versions in priority order and stamps
/// the negotiated protocol into the response, which is how the facade's
/// stream-open operation learns what was agreed on.
use std::collections::HashSet;
use std::io;

use async_trait::async_trait;
use cid::Cid;
use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};

use crate::wire::{decode_message, read_framed, write_framed};

/// Block exchange protocols, in negotiation priority order.
pub const BITSWAP_PROTOCOLS: [StreamProtocol; 4] = [
    StreamProtocol::new("/ipfs/bitswap/1.2.0"),
    StreamProtocol::new("/ipfs/bitswap/1.1.0"),
    StreamProtocol::new("/ipfs/bitswap/1.0.0"),
    StreamProtocol::new("/ipfs/bitswap"),
];

/// Presence responses are tiny; block payloads are bounded by the overlay's
/// block size limit.
const MAX_BITSWAP_FRAME: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum WantType {
    Block = 0,
    Have = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum BlockPresenceType {
    Have = 0,
    DontHave = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WantlistEntry {
    /// CID bytes of the wanted block.
    #[prost(bytes = "vec", tag = "1")]
    pub block: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub priority: i32,
    #[prost(bool, tag = "3")]
    pub cancel: bool,
    #[prost(enumeration = "WantType", tag = "4")]
    pub want_type: i32,
    #[prost(bool, tag = "5")]
    pub send_dont_have: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Wantlist {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<WantlistEntry>,
    #[prost(bool, tag = "2")]
    pub full: bool,
}

/// A block together with its CID prefix (1.1.0+ payload form).
#[derive(Clone, PartialEq, prost::Message)]
pub struct PayloadBlock {
    #[prost(bytes = "vec", tag = "1")]
    pub prefix: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockPresence {
    #[prost(bytes = "vec", tag = "1")]
    pub cid: Vec<u8>,
    #[prost(enumeration = "BlockPresenceType", tag = "2")]
    pub presence: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BitswapMessage {
    #[prost(message, optional, tag = "1")]
    pub wantlist: Option<Wantlist>,
    /// Raw blocks (1.0.0 form).
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub blocks: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "3")]
    pub payload: Vec<PayloadBlock>,
    #[prost(message, repeated, tag = "4")]
    pub block_presences: Vec<BlockPresence>,
    #[prost(int32, tag = "5")]
    pub pending_bytes: i32,
}

impl BitswapMessage {
    /// An empty message. Used by the stream-open probe, which only cares
    /// about protocol negotiation.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single-entry WANT_HAVE request for `cid` with send-dont-have set,
    /// so a conforming peer replies whether it holds the block or not.
    pub fn want_have(cid: &Cid) -> Self {
        Self {
            wantlist: Some(Wantlist {
                entries: vec![WantlistEntry {
                    block: cid.to_bytes(),
                    priority: i32::MAX,
                    cancel: false,
                    want_type: WantType::Have as i32,
                    send_dont_have: true,
                }],
                full: false,
            }),
            ..Self::default()
        }
    }

    /// Answer a wantlist from a set of held CIDs: HAVE for every entry in
    /// the set, DONT_HAVE for entries that asked for a negative.
    pub fn presence_reply(request: &BitswapMessage, held: &HashSet<Vec<u8>>) -> Self {
        let mut reply = Self::default();
        let Some(wantlist) = &request.wantlist else {
            return reply;
        };
        for entry in &wantlist.entries {
            if entry.cancel {
                continue;
            }
            if held.contains(&entry.block) {
                reply.block_presences.push(BlockPresence {
                    cid: entry.block.clone(),
                    presence: BlockPresenceType::Have as i32,
                });
            } else if entry.send_dont_have {
                reply.block_presences.push(BlockPresence {
                    cid: entry.block.clone(),
                    presence: BlockPresenceType::DontHave as i32,
                });
            }
        }
        reply
    }

    /// Whether this message affirms that the sender holds `cid`: a HAVE
    /// presence for it, or block data in any of the payload forms.
    pub fn affirms(&self, cid: &Cid) -> bool {
        let cid_bytes = cid.to_bytes();
        let have = self.block_presences.iter().any(|p| {
            p.cid == cid_bytes && p.presence == BlockPresenceType::Have as i32
        });
        have || !self.payload.is_empty() || !self.blocks.is_empty()
    }
}

/// The codec's response side, carrying the message together with the
/// protocol that was negotiated for the stream.
#[derive(Debug, Clone)]
pub struct BitswapResponse {
    pub protocol: String,
    pub message: BitswapMessage,
}

impl BitswapResponse {
    pub fn new(message: BitswapMessage) -> Self {
        Self {
            protocol: String::new(),
            message,
        }
    }
}

/// One varint-framed bitswap message per direction.
#[derive(Debug, Clone, Default)]
pub struct BitswapCodec;

#[async_trait]
impl request_response::Codec for BitswapCodec {
    type Protocol = StreamProtocol;
    type Request = BitswapMessage;
    type Response = BitswapResponse;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let payload = read_framed(io, MAX_BITSWAP_FRAME).await?;
        decode_message(&payload)
    }

    async fn read_response<T>(
        &mut self,
        protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let payload = read_framed(io, MAX_BITSWAP_FRAME).await?;
        let message = decode_message(&payload)?;
        Ok(BitswapResponse {
            protocol: protocol.as_ref().to_string(),
            message,
        })
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req).await?;
        io.close().await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &res.message).await?;
        io.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn test_cid() -> Cid {
        Cid::try_from("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi").unwrap()
    }

    #[test]
    fn want_have_carries_one_entry() {
        let cid = test_cid();
        let msg = BitswapMessage::want_have(&cid);
        let wantlist = msg.wantlist.unwrap();
        assert_eq!(wantlist.entries.len(), 1);
        let entry = &wantlist.entries[0];
        assert_eq!(entry.block, cid.to_bytes());
        assert_eq!(entry.want_type, WantType::Have as i32);
        assert!(entry.send_dont_have);
        assert!(!entry.cancel);
    }

    #[test]
    fn presence_reply_affirms_held_blocks() {
        let cid = test_cid();
        let mut held = HashSet::new();
        held.insert(cid.to_bytes());

        let reply = BitswapMessage::presence_reply(&BitswapMessage::want_have(&cid), &held);
        assert!(reply.affirms(&cid));
    }

    #[test]
    fn presence_reply_denies_missing_blocks() {
        let cid = test_cid();
        let reply =
            BitswapMessage::presence_reply(&BitswapMessage::want_have(&cid), &HashSet::new());
        assert_eq!(reply.block_presences.len(), 1);
        assert_eq!(
            reply.block_presences[0].presence,
            BlockPresenceType::DontHave as i32
        );
        assert!(!reply.affirms(&cid));
    }

    #[test]
    fn empty_request_gets_empty_reply() {
        let reply = BitswapMessage::presence_reply(&BitswapMessage::empty(), &HashSet::new());
        assert!(reply.block_presences.is_empty());
        assert!(reply.wantlist.is_none());
    }

    #[test]
    fn payload_counts_as_affirmative() {
        let cid = test_cid();
        let msg = BitswapMessage {
            payload: vec![PayloadBlock {
                prefix: vec![1, 85, 18, 32],
                data: b"block data".to_vec(),
            }],
            ..BitswapMessage::default()
        };
        assert!(msg.affirms(&cid));
    }

    #[test]
    fn message_round_trip() {
        let cid = test_cid();
        let msg = BitswapMessage::want_have(&cid);
        let decoded = BitswapMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }
}
