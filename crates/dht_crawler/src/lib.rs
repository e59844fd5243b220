//! The DHT crawler: a mainline-DHT (BEP-5) crawler that bootstraps a
//! routing table, runs iterative `get_peers` lookups, answers queries
//! from other nodes, and resolves any info-hash it observes down to a
//! verified torrent `info` dict over the peer wire protocol.

pub mod blacklist;
pub mod config;
pub mod engine;
pub mod errors;
pub mod get_peers;
pub mod heuristic;
pub mod observer;
pub mod resolver;

pub use blacklist::Blacklist;
pub use config::Config;
pub use engine::DhtEngine;
pub use errors::{Error, ErrorKind, Result};
pub use get_peers::GetPeersCoordinator;
pub use observer::{FileInfoHashLog, InfoHashObserver, NullObserver};
pub use resolver::TorrentResolver;
