use crate::errors::{ErrorKind, Result};
use crate::transaction::{decode_transaction_id, ActiveTransactions};
use chrono::Utc;
use krpc_encoding::{Envelope, MessageType};
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Maximum size of a single KRPC datagram (spec.md §6).
pub const MAX_DATAGRAM_LEN: usize = 65535;

/// A decoded inbound message the caller (the DHT engine) needs to act on:
/// every inbound datagram is either a response that this socket has
/// already correlated and delivered to its waiting transaction, a query
/// the caller must dispatch itself, or a datagram that failed the
/// typed KRPC decode and is handed back raw for the unknown-message
/// heuristic (spec.md §4.2).
pub enum Inbound {
    Query { envelope: Envelope, from: SocketAddr },
    Unrecognized { bytes: Vec<u8>, from: SocketAddr },
}

/// Thin wrapper around a `tokio::net::UdpSocket` that understands KRPC
/// framing: decoding, response correlation via the transaction manager,
/// and encoding outgoing queries.
pub struct KrpcSocket {
    socket: Arc<UdpSocket>,
    transactions: ActiveTransactions,
}

impl KrpcSocket {
    pub async fn bind(addr: SocketAddr) -> Result<KrpcSocket> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|_| ErrorKind::BindError)?;
        Ok(KrpcSocket {
            socket: Arc::new(socket),
            transactions: ActiveTransactions::new(),
        })
    }

    pub fn from_parts(socket: UdpSocket, transactions: ActiveTransactions) -> KrpcSocket {
        KrpcSocket {
            socket: Arc::new(socket),
            transactions,
        }
    }

    pub fn transactions(&self) -> ActiveTransactions {
        self.transactions.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket
            .send_to(bytes, addr)
            .await
            .map_err(crate::errors::Error::from)?;
        Ok(())
    }

    pub fn socket_handle(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Waits for the next datagram, decodes it, and if it is a response,
    /// correlates and delivers it to the matching transaction in-place
    /// (returning `None`). Datagrams that fail the typed decode come back
    /// as `Inbound::Unrecognized` for the caller's heuristic; late/foreign
    /// responses are dropped and logged, per spec.md §4.2/§4.5.
    pub async fn recv(&self) -> Result<Option<Inbound>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok(self.handle_datagram(&buf, from))
    }

    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> Option<Inbound> {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(
                    "datagram from {} did not decode as krpc ({}), handing back raw",
                    from, e
                );
                return Some(Inbound::Unrecognized {
                    bytes: bytes.to_vec(),
                    from,
                });
            }
        };

        match &envelope.message_type {
            MessageType::Query { .. } => Some(Inbound::Query { envelope, from }),
            MessageType::Response { .. } | MessageType::Error { .. } => {
                self.deliver_response(envelope, from)
            }
        }
    }

    /// Responses and errors are both correlated by transaction id and
    /// handed to the waiting `ResponseFuture`; `RequestTransport` is the
    /// one that turns a delivered `MessageType::Error` into an `Err`.
    fn deliver_response(&self, envelope: Envelope, from: SocketAddr) -> Option<Inbound> {
        let id = match decode_transaction_id(&envelope.transaction_id) {
            Some(id) => id,
            None => {
                debug!("dropping response from {}: malformed transaction id", from);
                return None;
            }
        };

        match self.transactions.deliver(id, envelope) {
            Ok(()) => None,
            Err(_) => {
                // Late reply, or traffic from a transaction we never
                // opened (foreign/forged). Both are common and non-fatal.
                debug!(
                    "dropping response from {}: no open transaction {:?}",
                    from, id
                );
                None
            }
        }
    }

    pub fn now() -> chrono::DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unparseable_datagram_comes_back_as_unrecognized() {
        let socket = KrpcSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let from: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let inbound = socket.handle_datagram(b"not bencoding", from);
        assert!(matches!(inbound, Some(Inbound::Unrecognized { .. })));
    }

    #[tokio::test]
    async fn well_formed_query_comes_back_as_query() {
        let socket = KrpcSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let from: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let envelope = krpc_encoding::Envelope {
            ip: None,
            transaction_id: vec![1],
            version: None,
            message_type: krpc_encoding::MessageType::Query {
                query: krpc_encoding::Query::Ping {
                    id: krpc_encoding::U160::random(),
                },
            },
            read_only: false,
        };
        let bytes = envelope.encode().unwrap();
        let inbound = socket.handle_datagram(&bytes, from);
        assert!(matches!(inbound, Some(Inbound::Query { .. })));
    }
}
