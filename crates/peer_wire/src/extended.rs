use crate::errors::{ErrorKind, Result};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;

/// Our outgoing extended-message id for `ut_metadata`; the peer's id for
/// the same extension is whatever it advertises in its own handshake `m`
/// dict and is looked up per-connection.
pub const UT_METADATA_LOCAL_ID: u8 = 2;
pub const METADATA_PIECE_LEN: u64 = 16 * 1024;

/// Extended id 0: the BEP-10 handshake, sent/received once per connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtendedHandshake {
    pub m: HashMap<String, u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    pub metadata_size: Option<u64>,
}

impl ExtendedHandshake {
    pub fn ours(listen_port: u16) -> ExtendedHandshake {
        let mut m = HashMap::new();
        m.insert("ut_metadata".to_string(), UT_METADATA_LOCAL_ID);
        ExtendedHandshake {
            m,
            p: Some(listen_port),
            reqq: Some(500),
            v: Some("peer_wire/0.1.0".to_string()),
            metadata_size: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_bencode::ser::to_bytes(self).map_err(|_| ErrorKind::InvalidPeerMessage.into())
    }

    pub fn decode(bytes: &[u8]) -> Result<ExtendedHandshake> {
        serde_bencode::de::from_bytes(bytes).map_err(|_| ErrorKind::InvalidPeerMessage.into())
    }

    pub fn piece_count(&self) -> u32 {
        match self.metadata_size {
            Some(size) if size > 0 => ((size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN) as u32,
            _ => 0,
        }
    }
}

/// A `ut_metadata` sub-message (BEP-9 §6). The dict is followed, for
/// `Data`, by the raw piece bytes outside the bencoded region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "msg_type")]
pub enum UtMetadataMessage {
    #[serde(rename = "0")]
    Request { piece: u32 },

    #[serde(rename = "1")]
    Data { piece: u32, total_size: u64 },

    #[serde(rename = "2")]
    Reject { piece: u32 },
}

impl UtMetadataMessage {
    pub fn encode_dict(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Wire {
            msg_type: u8,
            piece: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            total_size: Option<u64>,
        }

        let wire = match self {
            UtMetadataMessage::Request { piece } => Wire {
                msg_type: 0,
                piece: *piece,
                total_size: None,
            },
            UtMetadataMessage::Data { piece, total_size } => Wire {
                msg_type: 1,
                piece: *piece,
                total_size: Some(*total_size),
            },
            UtMetadataMessage::Reject { piece } => Wire {
                msg_type: 2,
                piece: *piece,
                total_size: None,
            },
        };
        serde_bencode::ser::to_bytes(&wire).map_err(|_| ErrorKind::InvalidPeerMessage.into())
    }

    /// Decodes the leading bencoded dict out of an extended `ut_metadata`
    /// payload, returning it along with any trailing bytes (the piece's
    /// raw data, present only for `Data`).
    pub fn decode<'a>(payload: &'a [u8]) -> Result<(UtMetadataMessage, &'a [u8])> {
        #[derive(Deserialize)]
        struct Wire {
            msg_type: u8,
            piece: u32,
            total_size: Option<u64>,
        }

        let consumed = bencode_value_len(payload)?;
        let (dict, trailing) = payload.split_at(consumed);
        let wire: Wire =
            serde_bencode::de::from_bytes(dict).map_err(|_| ErrorKind::InvalidPeerMessage)?;

        let msg = match wire.msg_type {
            0 => UtMetadataMessage::Request { piece: wire.piece },
            1 => UtMetadataMessage::Data {
                piece: wire.piece,
                total_size: wire.total_size.ok_or(ErrorKind::InvalidPeerMessage)?,
            },
            2 => UtMetadataMessage::Reject { piece: wire.piece },
            _ => return Err(ErrorKind::InvalidPeerMessage.into()),
        };
        Ok((msg, trailing))
    }
}

/// Scans a single bencoded value (int, bytestring, list or dict) starting
/// at `bytes[0]` and returns its length in bytes, without building a
/// `Value`. Used to find where the `ut_metadata` dict ends so the raw
/// piece bytes that follow it can be sliced off untouched.
fn bencode_value_len(bytes: &[u8]) -> Result<usize> {
    if bytes.is_empty() {
        return Err(ErrorKind::InvalidPeerMessage.into());
    }
    match bytes[0] {
        b'i' => {
            let end = find(bytes, b'e', 1)?;
            Ok(end + 1)
        }
        b'l' | b'd' => {
            let mut pos = 1;
            while bytes.get(pos) != Some(&b'e') {
                if bytes[0] == b'd' {
                    pos += bencode_value_len(&bytes[pos..])?; // key
                }
                pos += bencode_value_len(&bytes[pos..])?; // value (or list item)
                if pos >= bytes.len() {
                    return Err(ErrorKind::InvalidPeerMessage.into());
                }
            }
            Ok(pos + 1)
        }
        b'0'..=b'9' => {
            let colon = find(bytes, b':', 0)?;
            let len: usize = std::str::from_utf8(&bytes[0..colon])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(ErrorKind::InvalidPeerMessage)?;
            let end = colon + 1 + len;
            if end > bytes.len() {
                return Err(ErrorKind::InvalidPeerMessage.into());
            }
            Ok(end)
        }
        _ => Err(ErrorKind::InvalidPeerMessage.into()),
    }
}

fn find(bytes: &[u8], needle: u8, from: usize) -> Result<usize> {
    bytes[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| i + from)
        .ok_or_else(|| ErrorKind::InvalidPeerMessage.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_advertises_ut_metadata() {
        let hs = ExtendedHandshake::ours(6881);
        assert_eq!(hs.m.get("ut_metadata"), Some(&UT_METADATA_LOCAL_ID));
    }

    #[test]
    fn handshake_round_trips() {
        let hs = ExtendedHandshake::ours(6881);
        let encoded = hs.encode().unwrap();
        let decoded = ExtendedHandshake::decode(&encoded).unwrap();
        assert_eq!(hs, decoded);
    }

    #[test]
    fn piece_count_rounds_up() {
        let mut hs = ExtendedHandshake::ours(6881);
        hs.metadata_size = Some(48 * 1024);
        assert_eq!(hs.piece_count(), 3);

        hs.metadata_size = Some(48 * 1024 + 1);
        assert_eq!(hs.piece_count(), 4);
    }

    #[test]
    fn piece_count_zero_when_missing() {
        let hs = ExtendedHandshake::ours(6881);
        assert_eq!(hs.piece_count(), 0);
    }

    #[test]
    fn request_round_trips() {
        let msg = UtMetadataMessage::Request { piece: 2 };
        let encoded = msg.encode_dict().unwrap();
        let (decoded, trailing) = UtMetadataMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert!(trailing.is_empty());
    }

    #[test]
    fn data_message_exposes_trailing_block() {
        let dict = UtMetadataMessage::Data {
            piece: 0,
            total_size: 16384,
        }
        .encode_dict()
        .unwrap();
        let mut payload = dict.clone();
        payload.extend_from_slice(b"raw piece bytes");

        let (decoded, trailing) = UtMetadataMessage::decode(&payload).unwrap();
        assert_eq!(
            decoded,
            UtMetadataMessage::Data {
                piece: 0,
                total_size: 16384,
            }
        );
        assert_eq!(trailing, b"raw piece bytes");
    }
}
