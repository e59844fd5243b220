//! The Kademlia k-bucket routing table: a prefix trie over 160-bit node
//! ids with liveness tracking, split/merge, k-nearest retrieval and
//! text-file persistence.

pub mod bucket;
pub mod entry;
pub mod errors;
pub mod table;

pub use bucket::{Bucket, BUCKET_MAX, K};
pub use entry::{Liveness, RoutingEntry, GOOD_WINDOW_SECS, KRPC_TIMEOUT_SECS};
pub use errors::{Error, ErrorKind, Result};
pub use table::{AddOutcome, ExpandTarget, RoutingTable};
