use chrono::{DateTime, Duration, Utc};
use krpc_encoding::{NodeInfo, U160};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;

const DEFAULT_EXPIRATION_SECS: i64 = 30;

struct Candidate {
    node_info: NodeInfo,
    traversed: bool,
}

/// Per-info-hash state for one convergent lookup (spec.md §4.6).
struct GetPeersRequest {
    target: U160,
    expires_at: DateTime<Utc>,
    nodes: HashMap<U160, Candidate>,
    order: Vec<U160>,
    peers: HashSet<SocketAddrV4>,
    callbacks: Vec<Box<dyn FnMut(SocketAddrV4) + Send>>,
}

impl GetPeersRequest {
    fn new(target: U160, expires_at: DateTime<Utc>) -> GetPeersRequest {
        GetPeersRequest {
            target,
            expires_at,
            nodes: HashMap::new(),
            order: Vec::new(),
            peers: HashSet::new(),
            callbacks: Vec::new(),
        }
    }

    /// Adds `node` to the candidate pool if not already known. Returns
    /// `true` if it was newly added.
    fn add_candidate(&mut self, node: NodeInfo) -> bool {
        if self.nodes.contains_key(&node.id) {
            return false;
        }
        self.nodes.insert(
            node.id,
            Candidate {
                node_info: node,
                traversed: false,
            },
        );
        self.order.push(node.id);
        true
    }

    fn fire_callbacks(&mut self, addr: SocketAddrV4) {
        for callback in &mut self.callbacks {
            callback(addr);
        }
    }
}

/// Coordinates iterative `get_peers` lookups across any number of
/// in-flight info-hashes. Pure and synchronous: the DHT engine is
/// responsible for actually sending queries to whatever this returns.
pub struct GetPeersCoordinator {
    requests: HashMap<U160, GetPeersRequest>,
    expiration: Duration,
}

impl GetPeersCoordinator {
    pub fn new() -> GetPeersCoordinator {
        GetPeersCoordinator::with_expiration(DEFAULT_EXPIRATION_SECS)
    }

    pub fn with_expiration(expiration_secs: i64) -> GetPeersCoordinator {
        GetPeersCoordinator {
            requests: HashMap::new(),
            expiration: Duration::seconds(expiration_secs),
        }
    }

    pub fn is_active(&self, info_hash: &U160) -> bool {
        self.requests.contains_key(info_hash)
    }

    /// Registers `callback` for `info_hash`. If a request already exists
    /// it is reused and no new candidates are returned to query.
    /// Otherwise a new request is seeded from `seed` and every seeded
    /// candidate is returned for the caller to query immediately.
    pub fn get_peers(
        &mut self,
        info_hash: U160,
        callback: impl FnMut(SocketAddrV4) + Send + 'static,
        seed: Vec<NodeInfo>,
        now: DateTime<Utc>,
    ) -> Vec<NodeInfo> {
        if let Some(request) = self.requests.get_mut(&info_hash) {
            request.callbacks.push(Box::new(callback));
            return Vec::new();
        }

        let mut request = GetPeersRequest::new(info_hash, now + self.expiration);
        request.callbacks.push(Box::new(callback));

        let mut to_query = Vec::new();
        for node in seed {
            if request.add_candidate(node) {
                to_query.push(node);
            }
        }

        self.requests.insert(info_hash, request);
        to_query
    }

    /// Handles a `get_peers` response carrying `values`: every endpoint
    /// not already known fires all registered callbacks exactly once.
    pub fn on_peers_response(
        &mut self,
        info_hash: &U160,
        responder_id: &U160,
        peers: Vec<SocketAddrV4>,
    ) {
        let request = match self.requests.get_mut(info_hash) {
            Some(request) => request,
            None => return,
        };
        if let Some(candidate) = request.nodes.get_mut(responder_id) {
            candidate.traversed = true;
        }
        for addr in peers {
            if request.peers.insert(addr) {
                request.fire_callbacks(addr);
            }
        }
    }

    /// Handles a `get_peers` response carrying `nodes`: the responder is
    /// marked traversed, and every returned node that shares at least as
    /// long a prefix with the target as the responder did is enqueued
    /// (the convergence rule) and returned for the caller to query.
    pub fn on_nodes_response(
        &mut self,
        info_hash: &U160,
        responder_id: &U160,
        nodes: Vec<NodeInfo>,
    ) -> Vec<NodeInfo> {
        let request = match self.requests.get_mut(info_hash) {
            Some(request) => request,
            None => return Vec::new(),
        };

        let responder_cpl = responder_id.common_prefix_length(&request.target);
        if let Some(candidate) = request.nodes.get_mut(responder_id) {
            candidate.traversed = true;
        }

        let mut to_query = Vec::new();
        for node in nodes {
            let cpl = node.id.common_prefix_length(&request.target);
            if cpl >= responder_cpl && request.add_candidate(node) {
                to_query.push(node);
            }
        }
        to_query
    }

    /// GCs expired requests (their callbacks are simply dropped) and, for
    /// every request still live, draws up to `amplification` not-yet-
    /// traversed candidates to query.
    pub fn tick(&mut self, now: DateTime<Utc>, amplification: usize) -> Vec<(U160, Vec<NodeInfo>)> {
        self.requests.retain(|_, request| request.expires_at > now);

        let mut out = Vec::new();
        for (info_hash, request) in self.requests.iter() {
            let mut batch = Vec::new();
            for id in &request.order {
                if batch.len() >= amplification {
                    break;
                }
                if let Some(candidate) = request.nodes.get(id) {
                    if !candidate.traversed {
                        batch.push(candidate.node_info);
                    }
                }
            }
            if !batch.is_empty() {
                out.push((*info_hash, batch));
            }
        }
        out
    }

    pub fn active_count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for GetPeersCoordinator {
    fn default() -> GetPeersCoordinator {
        GetPeersCoordinator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    fn node(id: U160, port: u16) -> NodeInfo {
        NodeInfo::new(id, std::net::SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), port))
    }

    #[test]
    fn second_get_peers_call_reuses_request_and_queries_nothing() {
        let mut coordinator = GetPeersCoordinator::new();
        let info_hash = U160::random();
        let now = Utc::now();

        let seed = vec![node(U160::random(), 1)];
        let first = coordinator.get_peers(info_hash, |_| {}, seed, now);
        assert_eq!(first.len(), 1);

        let second = coordinator.get_peers(info_hash, |_| {}, vec![node(U160::random(), 2)], now);
        assert!(second.is_empty());
        assert_eq!(coordinator.active_count(), 1);
    }

    #[test]
    fn peers_response_fires_callback_once_per_new_peer() {
        let mut coordinator = GetPeersCoordinator::new();
        let info_hash = U160::random();
        let responder = U160::random();
        let now = Utc::now();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        coordinator.get_peers(
            info_hash,
            move |addr| seen_clone.lock().unwrap().push(addr),
            vec![node(responder, 1)],
            now,
        );

        let addr = SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 6881);
        coordinator.on_peers_response(&info_hash, &responder, vec![addr]);
        coordinator.on_peers_response(&info_hash, &responder, vec![addr]); // duplicate

        assert_eq!(*seen.lock().unwrap(), vec![addr]);
    }

    #[test]
    fn nodes_response_only_enqueues_non_regressing_candidates() {
        let mut coordinator = GetPeersCoordinator::new();
        let target = U160::random();
        let responder = U160::random_from_prefix(&target, 40);
        let now = Utc::now();

        coordinator.get_peers(target, |_| {}, vec![node(responder, 1)], now);

        let closer = U160::random_from_prefix(&target, 80);
        let farther = {
            // flip the top bit so the prefix match with target is minimal.
            let mut bytes = *target.as_bytes();
            bytes[0] ^= 0xff;
            U160::from_array(bytes)
        };

        let enqueued =
            coordinator.on_nodes_response(&target, &responder, vec![node(closer, 2), node(farther, 3)]);

        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].id, closer);
    }

    #[test]
    fn tick_drops_expired_requests() {
        let mut coordinator = GetPeersCoordinator::with_expiration(30);
        let info_hash = U160::random();
        let now = Utc::now();
        coordinator.get_peers(info_hash, |_| {}, vec![node(U160::random(), 1)], now);

        let later = now + Duration::seconds(31);
        let batches = coordinator.tick(later, 4);
        assert!(batches.is_empty());
        assert_eq!(coordinator.active_count(), 0);
    }

    #[test]
    fn tick_bounds_candidates_drawn_per_request() {
        let mut coordinator = GetPeersCoordinator::new();
        let info_hash = U160::random();
        let now = Utc::now();
        let seed: Vec<NodeInfo> = (0..10u16).map(|i| node(U160::random(), i)).collect();
        coordinator.get_peers(info_hash, |_| {}, seed, now);

        let batches = coordinator.tick(now, 3);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 3);
    }
}
