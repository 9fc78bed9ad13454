/// Kademlia Wire Protocol Module
///
/// The libp2p Kademlia behaviour only exposes iterative queries, but the
/// peer-address lookup needs to ask one specific DHT server at a time for
/// its view of a peer (the per-server corroboration count is the point of
/// that lookup). This module speaks the kad wire protocol directly: a
/// hand-rolled subset of the DHT protobuf schema plus a request/response
/// codec that sends a single FIND_NODE and reads the single reply. Fields
/// of the schema the probe never touches (records, provider payloads) are
/// left out; protobuf skips unknown fields on both sides.
use std::io;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, Multiaddr, PeerId, StreamProtocol};

use crate::wire::{decode_message, read_framed, write_framed};

pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/ipfs/kad/1.0.0");

/// DHT messages can carry many closer peers with several addresses each.
const MAX_KAD_FRAME: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum KadMessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum KadConnectionType {
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}

/// One peer entry in a FIND_NODE reply.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KadWirePeer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    #[prost(enumeration = "KadConnectionType", tag = "3")]
    pub connection: i32,
}

impl KadWirePeer {
    /// The entry's peer identity, if the id bytes are well-formed.
    pub fn peer_id(&self) -> Option<PeerId> {
        PeerId::from_bytes(&self.id).ok()
    }

    /// The entry's addresses, silently skipping malformed ones.
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .filter_map(|bytes| Multiaddr::try_from(bytes.clone()).ok())
            .collect()
    }
}

/// The subset of the DHT message schema the probe reads and writes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KadWireMessage {
    #[prost(enumeration = "KadMessageType", tag = "1")]
    pub msg_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(message, repeated, tag = "8")]
    pub closer_peers: Vec<KadWirePeer>,
}

impl KadWireMessage {
    /// A FIND_NODE request for the given peer key.
    pub fn find_node(target: &PeerId) -> Self {
        Self {
            msg_type: KadMessageType::FindNode as i32,
            key: target.to_bytes(),
            closer_peers: Vec::new(),
        }
    }
}

/// Codec carrying one varint-framed DHT message in each direction.
#[derive(Debug, Clone, Default)]
pub struct FindNodeCodec;

#[async_trait]
impl request_response::Codec for FindNodeCodec {
    type Protocol = StreamProtocol;
    type Request = KadWireMessage;
    type Response = KadWireMessage;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let payload = read_framed(io, MAX_KAD_FRAME).await?;
        decode_message(&payload)
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let payload = read_framed(io, MAX_KAD_FRAME).await?;
        decode_message(&payload)
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
        write_framed(io, &res).await?;
        io.close().await
    }
}
