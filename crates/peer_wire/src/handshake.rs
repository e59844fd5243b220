use crate::errors::{ErrorKind, Result};
use krpc_encoding::U160;

pub const HANDSHAKE_LEN: usize = 68;
const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/// Bit 0x10 of reserved byte 5: we speak the extension protocol (BEP-10).
const RESERVED_EXTENSION_BIT: (usize, u8) = (5, 0x10);
/// Bit 0x01 of reserved byte 7: we speak the DHT (BEP-5).
const RESERVED_DHT_BIT: (usize, u8) = (7, 0x01);

/// The fixed 68-byte record exchanged before any length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: U160,
    pub peer_id: U160,
}

impl Handshake {
    pub fn new(info_hash: U160, peer_id: U160) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = 19;
        out[1..20].copy_from_slice(PROTOCOL_NAME);
        out[RESERVED_EXTENSION_BIT.0 + 20] |= RESERVED_EXTENSION_BIT.1;
        out[RESERVED_DHT_BIT.0 + 20] |= RESERVED_DHT_BIT.1;
        out[28..48].copy_from_slice(self.info_hash.as_bytes());
        out[48..68].copy_from_slice(self.peer_id.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Handshake> {
        if bytes.len() != HANDSHAKE_LEN || bytes[0] != 19 || &bytes[1..20] != PROTOCOL_NAME {
            return Err(ErrorKind::InvalidPeerMessage.into());
        }
        let info_hash =
            U160::from_raw_bytes(&bytes[28..48]).map_err(|_| ErrorKind::InvalidPeerMessage)?;
        let peer_id =
            U160::from_raw_bytes(&bytes[48..68]).map_err(|_| ErrorKind::InvalidPeerMessage)?;
        Ok(Handshake { info_hash, peer_id })
    }

    pub fn supports_extensions(bytes: &[u8]) -> bool {
        bytes.len() == HANDSHAKE_LEN
            && bytes[RESERVED_EXTENSION_BIT.0] & RESERVED_EXTENSION_BIT.1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let hs = Handshake::new(U160::random(), U160::random());
        let encoded = hs.encode();
        assert_eq!(encoded.len(), HANDSHAKE_LEN);
        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(hs, decoded);
    }

    #[test]
    fn sets_extension_and_dht_bits() {
        let hs = Handshake::new(U160::random(), U160::random());
        let encoded = hs.encode();
        assert_eq!(encoded[5] & 0x10, 0x10);
        assert_eq!(encoded[7] & 0x01, 0x01);
        assert!(Handshake::supports_extensions(&encoded));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Handshake::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn rejects_wrong_protocol_name() {
        let mut encoded = Handshake::new(U160::random(), U160::random()).encode();
        encoded[1] = b'X';
        assert!(Handshake::decode(&encoded).is_err());
    }
}
