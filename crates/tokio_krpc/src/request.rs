use crate::errors::{ErrorKind, Result};
use crate::response_future::ResponseFuture;
use crate::socket::KrpcSocket;
use crate::transaction::ActiveTransactions;
use chrono::Utc;
use krpc_encoding::{Envelope, MessageType, Query, Response, U160};
use std::net::SocketAddr;

/// Whether the querying peer's port should be taken from the UDP source
/// port (`Implied`) or stated explicitly, per `announce_peer`'s
/// `implied_port` flag.
#[derive(Debug, Clone, Copy)]
pub enum PortType {
    Implied,
    Port(u16),
}

/// Sends queries and waits for their responses, opening a transaction for
/// each one through `create_query` and routing the reply back through a
/// `ResponseFuture` (spec.md §4.5 "Send path").
pub struct RequestTransport {
    self_id: U160,
    socket: KrpcSocket,
}

impl RequestTransport {
    pub fn new(self_id: U160, socket: KrpcSocket) -> RequestTransport {
        RequestTransport { socket, self_id }
    }

    pub fn self_id(&self) -> U160 {
        self.self_id
    }

    pub fn transactions(&self) -> ActiveTransactions {
        self.socket.transactions()
    }

    /// Opens a transaction for `query`, stamps the envelope's `t` field,
    /// and returns the encoded datagram plus a future resolving to the
    /// matching response.
    fn create_query(&self, query: Query) -> Result<(Vec<u8>, ResponseFuture)> {
        let transactions = self.socket.transactions();
        let id = transactions.start(query.method_name(), Utc::now());
        let envelope = Envelope {
            ip: None,
            transaction_id: crate::transaction::encode_transaction_id(id),
            version: Some(serde_bytes::ByteBuf::from(b"RS00".to_vec())),
            message_type: MessageType::Query { query },
            read_only: false,
        };
        let encoded = envelope.encode()?;
        Ok((encoded, ResponseFuture::new(id, transactions)))
    }

    async fn request(&self, address: SocketAddr, query: Query) -> Result<Response> {
        let (encoded, response_future) = self.create_query(query)?;
        self.socket.send_to(&encoded, address).await?;
        let envelope = response_future.await?;
        match envelope.message_type {
            MessageType::Response { response } => Ok(response),
            MessageType::Error { error } => Err(ErrorKind::RemoteError {
                message: error.to_string(),
            }
            .into()),
            MessageType::Query { .. } => Err(ErrorKind::InvalidMessage.into()),
        }
    }

    pub async fn ping(&self, address: SocketAddr) -> Result<U160> {
        let response = self
            .request(address, Query::Ping { id: self.self_id })
            .await?;
        Ok(response.sender_id())
    }

    pub async fn find_node(&self, address: SocketAddr, target: U160) -> Result<Response> {
        self.find_node_as(address, self.self_id, target).await
    }

    /// Like `find_node`, but stamps the query with `sender_id` instead of
    /// this node's real id. Used for the `fake_id` spoofing option
    /// (spec.md §4.5).
    pub async fn find_node_as(
        &self,
        address: SocketAddr,
        sender_id: U160,
        target: U160,
    ) -> Result<Response> {
        self.request(
            address,
            Query::FindNode {
                id: sender_id,
                target,
            },
        )
        .await
    }

    pub async fn get_peers(&self, address: SocketAddr, info_hash: U160) -> Result<Response> {
        self.get_peers_as(address, self.self_id, info_hash).await
    }

    /// Like `get_peers`, but stamps the query with `sender_id` instead of
    /// this node's real id. Used for the `fake_id` spoofing option
    /// (spec.md §4.5).
    pub async fn get_peers_as(
        &self,
        address: SocketAddr,
        sender_id: U160,
        info_hash: U160,
    ) -> Result<Response> {
        self.request(
            address,
            Query::GetPeers {
                id: sender_id,
                info_hash,
            },
        )
        .await
    }

    pub async fn announce_peer(
        &self,
        address: SocketAddr,
        info_hash: U160,
        token: Vec<u8>,
        port_type: PortType,
    ) -> Result<U160> {
        let (port, implied_port) = match port_type {
            PortType::Implied => (None, true),
            PortType::Port(port) => (Some(port), false),
        };
        let response = self
            .request(
                address,
                Query::AnnouncePeer {
                    id: self.self_id,
                    implied_port,
                    port,
                    info_hash,
                    token,
                },
            )
            .await?;
        Ok(response.sender_id())
    }

    pub async fn sample_infohashes(&self, address: SocketAddr, target: U160) -> Result<Response> {
        self.request(
            address,
            Query::SampleInfoHashes {
                id: self.self_id,
                target,
            },
        )
        .await
    }

    pub fn socket(&self) -> &KrpcSocket {
        &self.socket
    }
}
