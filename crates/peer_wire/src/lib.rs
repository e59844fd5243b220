//! The BitTorrent peer wire protocol: handshake, extension negotiation
//! (BEP-10), and the `ut_metadata` (BEP-9) metadata exchange driven over
//! a length-prefixed message stream reassembled through a zero-copy ring
//! buffer.

pub mod connection;
pub mod errors;
pub mod extended;
pub mod handshake;
pub mod message;
pub mod ring;
pub mod transport;

pub use connection::{ConnectionState, PeerConnection};
pub use errors::{Error, ErrorKind, Result};
pub use extended::{ExtendedHandshake, UtMetadataMessage, METADATA_PIECE_LEN, UT_METADATA_LOCAL_ID};
pub use handshake::{Handshake, HANDSHAKE_LEN};
pub use message::PeerMessage;
pub use ring::RingBuffer;
pub use transport::{PeerTransport, TcpPeerTransport};
