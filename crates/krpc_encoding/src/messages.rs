use crate::{
    booleans,
    node_info::{node_info, Addr, NodeInfo},
    errors::{ErrorKind, Result},
    id::U160,
};
use serde_bytes::ByteBuf;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Envelope holding the fields common to every KRPC query, response and
/// error: transaction id, message kind, optional client version and
/// read-only flag.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Public IP address of the requester, sent only by peers supporting
    /// BEP-0042.
    pub ip: Option<Addr>,

    /// Transaction id generated by the querying node and echoed back by
    /// the response; used to correlate requests and responses.
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    /// Client version string.
    #[serde(rename = "v")]
    pub version: Option<ByteBuf>,

    #[serde(flatten)]
    pub message_type: MessageType,

    /// Sent by read-only DHT nodes (BEP-0043).
    #[serde(
        rename = "ro",
        default,
        skip_serializing_if = "booleans::is_false",
        deserialize_with = "booleans::deserialize"
    )]
    pub read_only: bool,
}

impl Envelope {
    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        serde_bencode::de::from_bytes(bytes).map_err(|_| ErrorKind::InvalidBencoding.into())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_bencode::ser::to_bytes(self).map_err(|_| ErrorKind::InvalidMessage.into())
    }
}

/// The `y`-tagged body of a KRPC message.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "y")]
pub enum MessageType {
    #[serde(rename = "q")]
    Query {
        #[serde(flatten)]
        query: Query,
    },

    #[serde(rename = "r")]
    Response {
        #[serde(rename = "r")]
        response: Response,
    },

    #[serde(rename = "e")]
    Error {
        #[serde(rename = "e")]
        error: KrpcError,
    },
}

/// Error sent when a query cannot be fulfilled: `(code, message)`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct KrpcError(pub u32, pub String);

impl KrpcError {
    pub fn new(code: u32, message: impl Into<String>) -> KrpcError {
        KrpcError(code, message.into())
    }

    pub fn generic(message: impl Into<String>) -> KrpcError {
        KrpcError::new(201, message)
    }
}

impl fmt::Display for KrpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "krpc error {}: {}", self.0, self.1)
    }
}

/// Queries a node may issue (BEP-5, BEP-51).
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "q", content = "a")]
pub enum Query {
    #[serde(rename = "ping")]
    Ping { id: U160 },

    #[serde(rename = "find_node")]
    FindNode { id: U160, target: U160 },

    #[serde(rename = "get_peers")]
    GetPeers {
        id: U160,
        info_hash: U160,
    },

    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        id: U160,
        #[serde(
            default,
            deserialize_with = "booleans::deserialize",
            skip_serializing_if = "booleans::is_false"
        )]
        implied_port: bool,
        port: Option<u16>,
        info_hash: U160,
        #[serde(with = "serde_bytes")]
        token: Vec<u8>,
    },

    #[serde(rename = "sample_infohashes")]
    SampleInfoHashes { id: U160, target: U160 },
}

impl Query {
    pub fn method_name(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
            Query::SampleInfoHashes { .. } => "sample_infohashes",
        }
    }

    pub fn sender_id(&self) -> U160 {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. }
            | Query::SampleInfoHashes { id, .. } => *id,
        }
    }
}

/// Responses to the queries above. Untagged: the shape alone (plus the
/// transaction-manager's method lookup) disambiguates which query a
/// response answers.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum Response {
    Samples {
        id: U160,
        interval: Option<u16>,
        #[serde(with = "node_info")]
        nodes: Vec<NodeInfo>,
        num: Option<u32>,
        samples: Vec<U160>,
    },

    GetPeers {
        id: U160,
        token: Option<ByteBuf>,
        #[serde(rename = "values")]
        peers: Vec<Addr>,
    },

    NextHop {
        id: U160,
        token: Option<ByteBuf>,
        #[serde(with = "node_info")]
        nodes: Vec<NodeInfo>,
    },

    OnlyId { id: U160 },
}

impl Response {
    pub fn sender_id(&self) -> U160 {
        match self {
            Response::Samples { id, .. }
            | Response::GetPeers { id, .. }
            | Response::NextHop { id, .. }
            | Response::OnlyId { id } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn envelope(transaction_id: &[u8], message_type: MessageType) -> Envelope {
        Envelope {
            ip: None,
            transaction_id: transaction_id.to_vec(),
            version: None,
            message_type,
            read_only: false,
        }
    }

    #[test]
    fn ping_query_round_trip() {
        let id = U160::from_raw_bytes(&[1u8; 20]).unwrap();
        let msg = envelope(
            b"aa",
            MessageType::Query {
                query: Query::Ping { id },
            },
        );
        let encoded = msg.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn ping_response_round_trip() {
        let id = U160::from_raw_bytes(&[2u8; 20]).unwrap();
        let msg = envelope(
            b"aa",
            MessageType::Response {
                response: Response::OnlyId { id },
            },
        );
        let encoded = msg.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        match decoded.message_type {
            MessageType::Response {
                response: Response::OnlyId { id: got },
            } => assert_eq!(got, id),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn find_node_query_round_trip() {
        let id = U160::random();
        let target = U160::random();
        let msg = envelope(
            b"fn",
            MessageType::Query {
                query: Query::FindNode { id, target },
            },
        );
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn get_peers_query_round_trip() {
        let id = U160::random();
        let info_hash = U160::random();
        let msg = envelope(
            b"gp",
            MessageType::Query {
                query: Query::GetPeers { id, info_hash },
            },
        );
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn announce_peer_query_round_trip() {
        let id = U160::random();
        let info_hash = U160::random();
        let msg = envelope(
            b"ap",
            MessageType::Query {
                query: Query::AnnouncePeer {
                    id,
                    implied_port: false,
                    port: Some(6881),
                    info_hash,
                    token: vec![1, 2, 3, 4],
                },
            },
        );
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn get_peers_response_with_nodes_round_trip() {
        let id = U160::random();
        let nodes = vec![NodeInfo::new(
            U160::random(),
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881),
        )];
        let msg = envelope(
            b"gp",
            MessageType::Response {
                response: Response::NextHop {
                    id,
                    token: Some(ByteBuf::from(vec![9, 9])),
                    nodes,
                },
            },
        );
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn get_peers_response_with_values_round_trip() {
        let id = U160::random();
        let peers = vec![Addr(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881))];
        let msg = envelope(
            b"gp",
            MessageType::Response {
                response: Response::GetPeers {
                    id,
                    token: Some(ByteBuf::from(vec![1])),
                    peers,
                },
            },
        );
        let decoded = Envelope::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn invalid_bencoding_is_rejected() {
        assert!(Envelope::decode(b"not bencoding").is_err());
    }
}
