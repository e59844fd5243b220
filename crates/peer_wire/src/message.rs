use crate::errors::{ErrorKind, Result};
use byteorder::{BigEndian, ByteOrder};

pub const LENGTH_PREFIX_LEN: usize = 4;

/// One peer wire message, post length-prefix framing (spec.md §4.9, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Extended { id: u8, payload: Vec<u8> },
}

impl PeerMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => body.push(0),
            PeerMessage::Unchoke => body.push(1),
            PeerMessage::Interested => body.push(2),
            PeerMessage::NotInterested => body.push(3),
            PeerMessage::Have { piece } => {
                body.push(4);
                push_u32(&mut body, *piece);
            }
            PeerMessage::Bitfield(bits) => {
                body.push(5);
                body.extend_from_slice(bits);
            }
            PeerMessage::Request { index, begin, length } => {
                body.push(6);
                push_u32(&mut body, *index);
                push_u32(&mut body, *begin);
                push_u32(&mut body, *length);
            }
            PeerMessage::Piece { index, begin, block } => {
                body.push(7);
                push_u32(&mut body, *index);
                push_u32(&mut body, *begin);
                body.extend_from_slice(block);
            }
            PeerMessage::Cancel { index, begin, length } => {
                body.push(8);
                push_u32(&mut body, *index);
                push_u32(&mut body, *begin);
                push_u32(&mut body, *length);
            }
            PeerMessage::Port(port) => {
                body.push(9);
                let mut buf = [0u8; 2];
                BigEndian::write_u16(&mut buf, *port);
                body.extend_from_slice(&buf);
            }
            PeerMessage::Extended { id, payload } => {
                body.push(20);
                body.push(*id);
                body.extend_from_slice(payload);
            }
        }

        let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
        push_u32(&mut out, body.len() as u32);
        out.extend_from_slice(&body);
        out
    }

    /// Decodes a message body (without its length prefix, which the
    /// caller already stripped off while framing).
    pub fn decode_body(body: &[u8]) -> Result<PeerMessage> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let kind = body[0];
        let rest = &body[1..];
        match kind {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => Ok(PeerMessage::Have {
                piece: read_u32(rest)?,
            }),
            5 => Ok(PeerMessage::Bitfield(rest.to_vec())),
            6 => Ok(PeerMessage::Request {
                index: read_u32_at(rest, 0)?,
                begin: read_u32_at(rest, 4)?,
                length: read_u32_at(rest, 8)?,
            }),
            7 => {
                if rest.len() < 8 {
                    return Err(ErrorKind::InvalidPeerMessage.into());
                }
                Ok(PeerMessage::Piece {
                    index: BigEndian::read_u32(&rest[0..4]),
                    begin: BigEndian::read_u32(&rest[4..8]),
                    block: rest[8..].to_vec(),
                })
            }
            8 => Ok(PeerMessage::Cancel {
                index: read_u32_at(rest, 0)?,
                begin: read_u32_at(rest, 4)?,
                length: read_u32_at(rest, 8)?,
            }),
            9 => {
                if rest.len() != 2 {
                    return Err(ErrorKind::InvalidPeerMessage.into());
                }
                Ok(PeerMessage::Port(BigEndian::read_u16(rest)))
            }
            20 => {
                if rest.is_empty() {
                    return Err(ErrorKind::InvalidPeerMessage.into());
                }
                Ok(PeerMessage::Extended {
                    id: rest[0],
                    payload: rest[1..].to_vec(),
                })
            }
            _ => Err(ErrorKind::InvalidPeerMessage.into()),
        }
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn read_u32(bytes: &[u8]) -> Result<u32> {
    if bytes.len() < 4 {
        return Err(ErrorKind::InvalidPeerMessage.into());
    }
    Ok(BigEndian::read_u32(&bytes[0..4]))
}

fn read_u32_at(bytes: &[u8], offset: usize) -> Result<u32> {
    if bytes.len() < offset + 4 {
        return Err(ErrorKind::InvalidPeerMessage.into());
    }
    Ok(BigEndian::read_u32(&bytes[offset..offset + 4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: PeerMessage) {
        let encoded = msg.encode();
        let len = BigEndian::read_u32(&encoded[0..4]) as usize;
        assert_eq!(len, encoded.len() - LENGTH_PREFIX_LEN);
        let decoded = PeerMessage::decode_body(&encoded[LENGTH_PREFIX_LEN..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn keep_alive_has_zero_length() {
        let encoded = PeerMessage::KeepAlive.encode();
        assert_eq!(encoded, vec![0, 0, 0, 0]);
    }

    #[test]
    fn choke_family_round_trips() {
        round_trip(PeerMessage::Choke);
        round_trip(PeerMessage::Unchoke);
        round_trip(PeerMessage::Interested);
        round_trip(PeerMessage::NotInterested);
    }

    #[test]
    fn have_round_trips() {
        round_trip(PeerMessage::Have { piece: 42 });
    }

    #[test]
    fn bitfield_round_trips() {
        round_trip(PeerMessage::Bitfield(vec![0xff, 0x00, 0x81]));
    }

    #[test]
    fn request_and_cancel_round_trip() {
        round_trip(PeerMessage::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        });
        round_trip(PeerMessage::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        });
    }

    #[test]
    fn piece_round_trips() {
        round_trip(PeerMessage::Piece {
            index: 3,
            begin: 0,
            block: vec![1, 2, 3, 4, 5],
        });
    }

    #[test]
    fn port_round_trips() {
        round_trip(PeerMessage::Port(6881));
    }

    #[test]
    fn extended_round_trips() {
        round_trip(PeerMessage::Extended {
            id: 2,
            payload: vec![9, 9, 9],
        });
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(PeerMessage::decode_body(&[255]).is_err());
    }
}
