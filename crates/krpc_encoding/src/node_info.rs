use crate::errors::{ErrorKind, Result};
use crate::id::{U160, ID_LEN};
use byteorder::{BigEndian, ByteOrder};
use serde::{de, ser};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// `(id, ip, port)` triple identifying a DHT node.
///
/// Compact wire form is 26 bytes: 20-byte id, 4-byte big-endian IPv4
/// address, 2-byte big-endian port.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct NodeInfo {
    pub id: U160,
    pub addr: SocketAddrV4,
}

pub const COMPACT_LEN: usize = ID_LEN + 6;

impl NodeInfo {
    pub fn new(id: U160, addr: SocketAddrV4) -> NodeInfo {
        NodeInfo { id, addr }
    }

    /// A `NodeInfo` is valid iff its port is nonzero.
    pub fn is_valid(&self) -> bool {
        self.addr.port() != 0
    }

    pub fn decode_compact(bytes: &[u8]) -> Result<NodeInfo> {
        if bytes.len() != COMPACT_LEN {
            return Err(ErrorKind::InvalidNodeInfo.into());
        }
        let id = U160::from_raw_bytes(&bytes[0..ID_LEN])?;
        let ip = Ipv4Addr::new(bytes[20], bytes[21], bytes[22], bytes[23]);
        let port = BigEndian::read_u16(&bytes[24..26]);
        Ok(NodeInfo {
            id,
            addr: SocketAddrV4::new(ip, port),
        })
    }

    pub fn encode_compact(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&self.addr.ip().octets());
        let mut port_bytes = [0u8; 2];
        BigEndian::write_u16(&mut port_bytes, self.addr.port());
        out.extend_from_slice(&port_bytes);
    }

    pub fn decode_many_compact(bytes: &[u8]) -> Result<Vec<NodeInfo>> {
        if bytes.len() % COMPACT_LEN != 0 {
            return Err(ErrorKind::InvalidNodeInfo.into());
        }
        bytes
            .chunks(COMPACT_LEN)
            .map(NodeInfo::decode_compact)
            .collect()
    }

    pub fn encode_many_compact(nodes: &[NodeInfo]) -> Vec<u8> {
        let mut out = Vec::with_capacity(nodes.len() * COMPACT_LEN);
        for node in nodes {
            node.encode_compact(&mut out);
        }
        out
    }
}

/// `serde(with = "node_info")` helper: (de)serializes `Vec<NodeInfo>` as a
/// single bencoded byte string of concatenated 26-byte compact nodes.
pub mod node_info {
    use super::*;
    use serde_bytes::ByteBuf;
    use de::Deserialize;
    use ser::Serialize;

    pub fn serialize<S>(nodes: &[NodeInfo], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        let bytes = NodeInfo::encode_many_compact(nodes);
        serde_bytes::Bytes::new(&bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<NodeInfo>, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let buf = ByteBuf::deserialize(deserializer)?;
        NodeInfo::decode_many_compact(buf.as_ref()).map_err(de::Error::custom)
    }
}

/// A bare `(ip, port)` peer endpoint, used in `get_peers` responses'
/// `values` list. Compact wire form is 6 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct Addr(pub SocketAddrV4);

pub const COMPACT_PEER_LEN: usize = 6;

impl Addr {
    pub fn decode_compact(bytes: &[u8]) -> Result<Addr> {
        if bytes.len() != COMPACT_PEER_LEN {
            return Err(ErrorKind::InvalidCompactPeer.into());
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = BigEndian::read_u16(&bytes[4..6]);
        Ok(Addr(SocketAddrV4::new(ip, port)))
    }

    pub fn encode_compact(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.ip().octets());
        let mut port_bytes = [0u8; 2];
        BigEndian::write_u16(&mut port_bytes, self.0.port());
        out.extend_from_slice(&port_bytes);
    }
}

impl From<SocketAddrV4> for Addr {
    fn from(addr: SocketAddrV4) -> Addr {
        Addr(addr)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ser::Serialize for Addr {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        let mut bytes = Vec::with_capacity(COMPACT_PEER_LEN);
        self.encode_compact(&mut bytes);
        serde_bytes::Bytes::new(&bytes).serialize(serializer)
    }
}

impl<'de> de::Deserialize<'de> for Addr {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Addr, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Addr::decode_compact(buf.as_ref()).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_node_round_trip() {
        let node = NodeInfo::new(
            U160::random(),
            SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881),
        );
        let mut bytes = Vec::new();
        node.encode_compact(&mut bytes);
        assert_eq!(bytes.len(), COMPACT_LEN);
        assert_eq!(NodeInfo::decode_compact(&bytes).unwrap(), node);
    }

    #[test]
    fn node_info_validity_requires_nonzero_port() {
        let zero_port = NodeInfo::new(
            U160::random(),
            SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 0),
        );
        assert!(!zero_port.is_valid());
    }

    #[test]
    fn compact_peer_round_trip() {
        let addr = Addr(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 51413));
        let mut bytes = Vec::new();
        addr.encode_compact(&mut bytes);
        assert_eq!(bytes.len(), COMPACT_PEER_LEN);
        assert_eq!(Addr::decode_compact(&bytes).unwrap(), addr);
    }
}
