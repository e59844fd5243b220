//! Wire types shared by the DHT transport and the routing table: the
//! 160-bit node identity, compact node/peer encodings, and the KRPC
//! message envelope. The B-encoding codec itself is not implemented here;
//! `serde_bencode` does that job.

pub mod booleans;
pub mod errors;
pub mod id;
pub mod messages;
pub mod node_info;

pub use errors::{Error, ErrorKind, Result};
pub use id::U160;
pub use messages::{Envelope, KrpcError, MessageType, Query, Response};
pub use node_info::{Addr, NodeInfo};
