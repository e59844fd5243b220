use chrono::{DateTime, Duration, Utc};
use krpc_encoding::U160;
use log::{debug, warn};
use peer_wire::{ConnectionState, PeerConnection, PeerTransport, TcpPeerTransport};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

/// Metadata assembly state shared across every peer connection this
/// resolver has open. The first peer to complete its extended handshake
/// sets `piece_count`/`metadata_size` authoritatively; later peers must
/// agree or are dropped (spec.md §4.10).
struct SharedMetadata {
    piece_count: Option<u32>,
    metadata_size: Option<u64>,
    pieces: Vec<Vec<u8>>,
    data_got: u64,
    completed: bool,
}

impl SharedMetadata {
    fn new() -> SharedMetadata {
        SharedMetadata {
            piece_count: None,
            metadata_size: None,
            pieces: Vec::new(),
            data_got: 0,
            completed: false,
        }
    }
}

/// How often the background prune loop drops `Disconnected` peer
/// connections (spec.md §4.10).
const PRUNE_INTERVAL: StdDuration = StdDuration::from_millis(300);

/// Drives the metadata exchange for one info-hash: accepts candidate
/// peer endpoints, opens a TCP connection to each, and races them to
/// assemble and verify the torrent's `info` dict (spec.md §4.10). `uTP`
/// is requested via `use_utp` but not implemented by this crate (spec.md
/// §1 treats the uTP transport as an external collaborator); requesting
/// it falls back to TCP with a warning.
pub struct TorrentResolver {
    info_hash: U160,
    self_id: U160,
    listen_port: u16,
    created_at: DateTime<Utc>,
    expiration: Duration,
    shared: Arc<Mutex<SharedMetadata>>,
    peers: Arc<Mutex<HashMap<SocketAddrV4, Arc<Mutex<ConnectionState>>>>>,
    on_complete: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
}

impl TorrentResolver {
    pub fn new(
        info_hash: U160,
        self_id: U160,
        _bind_ip: Ipv4Addr,
        bind_port: u16,
        use_utp: bool,
        expiration_seconds: i64,
        on_complete: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> TorrentResolver {
        if use_utp {
            warn!("use_utp requested but this resolver only drives peers over tcp");
        }
        let peers = Arc::new(Mutex::new(HashMap::new()));

        let prune_peers = peers.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                ticker.tick().await;
                prune_peers_map(&prune_peers);
            }
        });

        TorrentResolver {
            info_hash,
            self_id,
            listen_port: bind_port,
            created_at: Utc::now(),
            expiration: Duration::seconds(expiration_seconds),
            shared: Arc::new(Mutex::new(SharedMetadata::new())),
            peers,
            on_complete: Arc::new(on_complete),
        }
    }

    pub fn info_hash(&self) -> U160 {
        self.info_hash
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peers mutex poisoned").len()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > self.expiration
    }

    /// Opens a connection to `(ip, port)` and drives it to completion on
    /// its own task, folding what it learns into this resolver's shared
    /// metadata state. A no-op if the endpoint is already known.
    pub fn add_peer(&self, ip: Ipv4Addr, port: u16) {
        let addr = SocketAddrV4::new(ip, port);
        {
            let mut peers = self.peers.lock().expect("peers mutex poisoned");
            if peers.contains_key(&addr) {
                return;
            }
            peers.insert(addr, Arc::new(Mutex::new(ConnectionState::Connecting)));
        }

        let info_hash = self.info_hash;
        let self_id = self.self_id;
        let listen_port = self.listen_port;
        let shared = self.shared.clone();
        let peers = self.peers.clone();
        let on_complete = self.on_complete.clone();

        tokio::spawn(async move {
            drive_peer(addr, info_hash, self_id, listen_port, shared, peers, on_complete).await;
        });
    }

    /// Drops any peer connection whose last observed state is
    /// `Disconnected`, bounding memory use even if a connect attempt's
    /// task is slow to unwind (spec.md §4.10, §5). Called automatically
    /// every `PRUNE_INTERVAL` by a background task spawned in `new`;
    /// exposed here too so callers can force a pass on demand.
    pub fn prune(&self) {
        prune_peers_map(&self.peers);
    }
}

type PeerMap = Arc<Mutex<HashMap<SocketAddrV4, Arc<Mutex<ConnectionState>>>>>;

fn prune_peers_map(peers: &PeerMap) {
    let mut peers = peers.lock().expect("peers mutex poisoned");
    peers.retain(|_, state| {
        *state.lock().expect("connection state mutex poisoned") != ConnectionState::Disconnected
    });
}

async fn drive_peer(
    addr: SocketAddrV4,
    info_hash: U160,
    self_id: U160,
    listen_port: u16,
    shared: Arc<Mutex<SharedMetadata>>,
    peers: PeerMap,
    on_complete: Arc<dyn Fn(Vec<u8>) + Send + Sync>,
) {
    let transport = match TcpPeerTransport::connect(SocketAddr::V4(addr)).await {
        Ok(transport) => transport,
        Err(e) => {
            debug!("connect to {} failed: {}", addr, e);
            peers.lock().expect("peers mutex poisoned").remove(&addr);
            return;
        }
    };

    let mut conn = PeerConnection::new(transport, self_id, info_hash, listen_port);

    let should_close = Arc::new(AtomicBool::new(false));
    let ready_for_transfer = Arc::new(AtomicBool::new(false));

    {
        let shared = shared.clone();
        let should_close = should_close.clone();
        let ready_for_transfer = ready_for_transfer.clone();
        conn.on_extended_handshake(move |piece_count, metadata_size| {
            let mut state = shared.lock().expect("shared metadata mutex poisoned");
            match state.piece_count {
                None => {
                    state.piece_count = Some(piece_count);
                    state.metadata_size = Some(metadata_size);
                    state.pieces = vec![Vec::new(); piece_count as usize];
                    ready_for_transfer.store(true, Ordering::SeqCst);
                }
                Some(existing)
                    if existing == piece_count && state.metadata_size == Some(metadata_size) =>
                {
                    ready_for_transfer.store(true, Ordering::SeqCst);
                }
                _ => {
                    warn!("peer {} reported mismatching metadata size, closing", addr);
                    should_close.store(true, Ordering::SeqCst);
                }
            }
        });
    }

    if conn.start().await.is_err() {
        peers.lock().expect("peers mutex poisoned").remove(&addr);
        return;
    }

    loop {
        if conn.read_once().await.is_err() {
            break;
        }
        if let Some(state_handle) = peers.lock().expect("peers mutex poisoned").get(&addr) {
            *state_handle.lock().expect("connection state mutex poisoned") = conn.state();
        }
        if conn.state() == ConnectionState::Disconnected {
            break;
        }
        if should_close.swap(false, Ordering::SeqCst) {
            conn.close();
            break;
        }
        if ready_for_transfer.swap(false, Ordering::SeqCst) {
            let shared = shared.clone();
            let on_complete = on_complete.clone();
            let _ = conn
                .start_metadata_transfer(move |piece_idx, bytes| {
                    deliver_piece(&shared, info_hash, piece_idx, bytes, &on_complete);
                })
                .await;
        }
    }

    peers.lock().expect("peers mutex poisoned").remove(&addr);
}

/// Stores one metadata piece, and on the piece that completes the
/// transfer, verifies the assembled `info` dict's SHA-1 against
/// `info_hash` before invoking `on_complete` (spec.md §4.10).
fn deliver_piece(
    shared: &Arc<Mutex<SharedMetadata>>,
    info_hash: U160,
    piece_idx: u32,
    bytes: Vec<u8>,
    on_complete: &Arc<dyn Fn(Vec<u8>) + Send + Sync>,
) {
    let concatenated = {
        let mut state = shared.lock().expect("shared metadata mutex poisoned");
        let idx = piece_idx as usize;
        if idx >= state.pieces.len() || state.completed {
            return;
        }
        if state.pieces[idx].is_empty() {
            state.data_got += bytes.len() as u64;
            state.pieces[idx] = bytes;
        }
        match state.metadata_size {
            Some(metadata_size) if state.data_got == metadata_size => {
                state.completed = true;
                Some(state.pieces.concat())
            }
            _ => None,
        }
    };

    let concatenated = match concatenated {
        Some(bytes) => bytes,
        None => return,
    };

    if U160::sha1(&concatenated) != info_hash {
        warn!("metadata hash mismatch for {}", info_hash.to_hex());
        return;
    }

    on_complete(wrap_announce_and_info(&concatenated));
}

/// Bencodes `{"announce": {}, "info": <info_bytes>}` without re-encoding
/// `info_bytes`, which already is a complete bencoded dict (spec.md
/// §4.10). Dict keys are written in the required lexicographic order.
fn wrap_announce_and_info(info_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(info_bytes.len() + 20);
    out.extend_from_slice(b"d8:announcede4:info");
    out.extend_from_slice(info_bytes);
    out.push(b'e');
    out
}
