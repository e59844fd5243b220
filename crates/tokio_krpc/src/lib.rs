//! The KRPC transport layer: a UDP socket that understands KRPC framing,
//! a transaction manager correlating queries with responses, and a typed
//! request façade (`RequestTransport`) used by the DHT engine.

pub mod errors;
pub mod request;
pub mod response_future;
pub mod socket;
pub mod transaction;

pub use errors::{Error, ErrorKind, Result};
pub use request::{PortType, RequestTransport};
pub use response_future::ResponseFuture;
pub use socket::{Inbound, KrpcSocket};
pub use transaction::{ActiveTransactions, TransactionId};
