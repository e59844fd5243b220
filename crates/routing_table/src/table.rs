use crate::bucket::{Bucket, K};
use crate::entry::RoutingEntry;
use crate::errors::{ErrorKind, Result};
use chrono::{DateTime, Utc};
use krpc_encoding::{NodeInfo, U160};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddrV4};

/// A destination produced by `select_expand_route_targets`: a randomly
/// sampled id inside a sparse leaf's range, plus (when available) a
/// contact already in that leaf to route the `find_node` through.
pub struct ExpandTarget {
    pub target: U160,
    pub via: Option<NodeInfo>,
}

/// The Kademlia routing table: a trie of k-buckets rooted at `owner`,
/// plus a reverse `(ip,port) -> id` index used to detect an endpoint that
/// reports conflicting node ids (a cheap Sybil signal).
pub struct RoutingTable {
    owner: U160,
    root: Bucket,
    reverse: HashMap<SocketAddrV4, U160>,
    fat_mode: bool,
    delete_good: bool,
    max_known_nodes: usize,
}

/// Outcome of `add_node`, distinguishing ordinary success from the
/// Sybil-detection path so callers can blacklist appropriately.
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Refreshed,
    Rejected,
    /// The endpoint previously claimed a different id; the prior entry
    /// was marked bad and the endpoint should be blacklisted.
    ConflictingId { previous_id: U160 },
}

impl RoutingTable {
    pub fn new(owner: U160) -> RoutingTable {
        RoutingTable {
            owner,
            root: Bucket::root(),
            reverse: HashMap::new(),
            fat_mode: false,
            delete_good: true,
            max_known_nodes: 16384,
        }
    }

    pub fn with_policy(owner: U160, fat_mode: bool, delete_good: bool, max_known_nodes: usize) -> RoutingTable {
        RoutingTable {
            owner,
            root: Bucket::root(),
            reverse: HashMap::new(),
            fat_mode,
            delete_good,
            max_known_nodes,
        }
    }

    pub fn owner(&self) -> U160 {
        self.owner
    }

    pub fn len(&self) -> usize {
        let mut total = 0;
        self.root.for_each_leaf(&mut |_bucket, entries| {
            total += entries.len();
        });
        total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_known_nodes
    }

    pub fn get(&self, id: &U160) -> Option<&RoutingEntry> {
        self.root.get(id)
    }

    /// Inserts or refreshes `node`'s routing entry. See spec.md §4.3.
    pub fn add_node(&mut self, node: NodeInfo, now: DateTime<Utc>) -> AddOutcome {
        if !node.is_valid() || node.id == self.owner {
            return AddOutcome::Rejected;
        }
        if self.is_full() && self.get(&node.id).is_none() {
            return AddOutcome::Rejected;
        }

        if let Some(&existing_id) = self.reverse.get(&node.addr) {
            if existing_id != node.id {
                if let Some(prev) = self.root.get_mut(&existing_id) {
                    prev.bad = true;
                }
                self.reverse.insert(node.addr, node.id);
                return AddOutcome::ConflictingId {
                    previous_id: existing_id,
                };
            }
        }

        let already_present = self.root.get(&node.id).is_some();
        let entry = match self.root.get(&node.id) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.last_seen = now;
                updated
            }
            None => RoutingEntry::new(node, now),
        };

        let inserted = self
            .root
            .add_node(entry, &self.owner, self.fat_mode, now);
        self.reverse.insert(node.addr, node.id);

        if !already_present && inserted {
            AddOutcome::Inserted
        } else {
            AddOutcome::Refreshed
        }
    }

    /// Marks the node with `id` as having just proven liveness.
    pub fn make_good_now(&mut self, id: &U160, now: DateTime<Utc>) -> bool {
        match self.root.get_mut(id) {
            Some(entry) => {
                entry.mark_good(now);
                true
            }
            None => false,
        }
    }

    /// Marks the node at `addr` as having just proven liveness, looking it
    /// up through the reverse map.
    pub fn make_good_now_by_addr(&mut self, addr: &SocketAddrV4, now: DateTime<Utc>) -> bool {
        if let Some(entry) = self.root.get_by_addr_mut(addr) {
            entry.mark_good(now);
            return true;
        }
        false
    }

    pub fn mark_response_required(&mut self, id: &U160, now: DateTime<Utc>) -> bool {
        match self.root.get_mut(id) {
            Some(entry) => {
                entry.mark_response_required(now);
                true
            }
            None => false,
        }
    }

    /// Runs a GC pass: drops bad entries (blacklisting their endpoints via
    /// `on_blacklist`), trims excess questionable/good entries, and merges
    /// sibling leaves that have shrunk enough. Returns
    /// `(dropped_bad, dropped_questionable, dropped_good)`.
    pub fn gc(
        &mut self,
        now: DateTime<Utc>,
        mut on_blacklist: impl FnMut(SocketAddrV4),
    ) -> (usize, usize, usize) {
        let counts = self.root.gc(self.delete_good, now, &mut on_blacklist);
        let root = &self.root;
        self.reverse.retain(|_, id| root.get(id).is_some());
        counts
    }

    /// Up to `k` good entries approximately nearest to `target`.
    pub fn k_nearest_good_nodes(&self, target: &U160, k: usize, now: DateTime<Utc>) -> Vec<NodeInfo> {
        self.root
            .k_nearest_good(target, k, now)
            .into_iter()
            .map(|entry| entry.node)
            .collect()
    }

    /// Every entry currently in the questionable state, for the
    /// refresh-nodes timer to ping.
    pub fn questionable_nodes(&self, now: DateTime<Utc>) -> Vec<NodeInfo> {
        let mut out = Vec::new();
        self.root.for_each_leaf(&mut |_bucket, entries| {
            out.extend(
                entries
                    .iter()
                    .filter(|e| e.is_questionable(now))
                    .map(|e| e.node),
            );
        });
        out
    }

    /// For every leaf, a random target inside its range paired with a
    /// good (else questionable) contact from that leaf, used to seed
    /// speculative `find_node` queries that fill sparse regions.
    pub fn select_expand_route_targets(&self, now: DateTime<Utc>) -> Vec<ExpandTarget> {
        let mut out = Vec::new();
        self.root.for_each_leaf(&mut |bucket, entries| {
            let via = entries
                .iter()
                .find(|e| e.is_good(now))
                .or_else(|| entries.iter().find(|e| e.is_questionable(now)))
                .map(|e| e.node);
            out.push(ExpandTarget {
                target: bucket.random_target(),
                via,
            });
        });
        out
    }

    /// Writes one good entry per line: `<40-hex-id> <dotted-ipv4> <port>`.
    pub fn serialize(&self, now: DateTime<Utc>) -> String {
        let mut out = String::new();
        self.root.for_each_leaf(&mut |_bucket, entries| {
            for entry in entries {
                if entry.is_good(now) {
                    let _ = writeln!(
                        out,
                        "{} {} {}",
                        entry.node.id.to_hex(),
                        entry.node.addr.ip(),
                        entry.node.addr.port()
                    );
                }
            }
        });
        out
    }

    /// Reads lines produced by `serialize`, inserting each as a fresh good
    /// entry. Blank lines are skipped; any other malformed line is an
    /// error. An incomplete or missing file should simply not be passed
    /// here — callers recreate an empty table instead (spec.md §7).
    pub fn deserialize(&mut self, contents: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut count = 0;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (id_hex, ip, port) = match (parts.next(), parts.next(), parts.next()) {
                (Some(a), Some(b), Some(c)) => (a, b, c),
                _ => {
                    return Err(ErrorKind::InvalidPersistenceLine {
                        line: line.to_string(),
                    }
                    .into())
                }
            };
            let id = U160::from_hex(id_hex).map_err(|_| ErrorKind::InvalidPersistenceLine {
                line: line.to_string(),
            })?;
            let ip: Ipv4Addr = ip.parse().map_err(|_| ErrorKind::InvalidPersistenceLine {
                line: line.to_string(),
            })?;
            let port: u16 = port.parse().map_err(|_| ErrorKind::InvalidPersistenceLine {
                line: line.to_string(),
            })?;
            let node = NodeInfo::new(id, SocketAddrV4::new(ip, port));
            self.add_node(node, now);
            self.make_good_now(&id, now);
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_zero_top_bit() -> U160 {
        loop {
            let id = U160::random();
            if !id.msb(0) {
                return id;
            }
        }
    }

    #[test]
    fn k_buckets_split_after_nine_inserts_under_owner() {
        let owner = U160::ZERO;
        let mut table = RoutingTable::new(owner);
        let now = Utc::now();

        for _ in 0..9 {
            let id = random_zero_top_bit();
            let node = NodeInfo::new(id, SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), rand::thread_rng().gen_range(1, 65535)));
            table.add_node(node, now);
        }

        table.root.check_invariants();
        assert!(!table.root.is_leaf(), "root should have split after 9th insert under the owner's bucket");
        assert_eq!(table.len(), 9);
    }

    #[test]
    fn non_owning_leaf_never_splits() {
        // owner far from the inserted ids: none of them share the bucket
        // with the owner id, so fat_mode=false means no split.
        let owner = {
            let mut bytes = [0xffu8; 20];
            bytes[0] = 0xff;
            U160::from_array(bytes)
        };
        let mut table = RoutingTable::new(owner);
        let now = Utc::now();
        for i in 0..20u16 {
            let id = random_zero_top_bit();
            let node = NodeInfo::new(id, SocketAddrV4::new(Ipv4Addr::new(2, 2, 2, 2), 2000 + i));
            table.add_node(node, now);
        }
        assert!(table.root.is_leaf());
        assert_eq!(table.len(), 20);
    }

    #[test]
    fn fat_mode_allows_any_leaf_to_split() {
        let owner = {
            let mut bytes = [0xffu8; 20];
            bytes[0] = 0xff;
            U160::from_array(bytes)
        };
        let mut table = RoutingTable::with_policy(owner, true, true, 16384);
        let now = Utc::now();
        for i in 0..20u16 {
            let id = random_zero_top_bit();
            let node = NodeInfo::new(id, SocketAddrV4::new(Ipv4Addr::new(2, 2, 2, 2), 2000 + i));
            table.add_node(node, now);
        }
        assert!(!table.root.is_leaf());
    }

    #[test]
    fn conflicting_endpoint_blacklists_previous_id() {
        let owner = U160::random();
        let mut table = RoutingTable::new(owner);
        let now = Utc::now();
        let addr = SocketAddrV4::new(Ipv4Addr::new(5, 5, 5, 5), 6881);
        let first_id = U160::random();
        table.add_node(NodeInfo::new(first_id, addr), now);

        let second_id = U160::random();
        let outcome = table.add_node(NodeInfo::new(second_id, addr), now);
        assert_eq!(
            outcome,
            AddOutcome::ConflictingId {
                previous_id: first_id
            }
        );
        assert!(table.get(&first_id).unwrap().bad);
    }

    #[test]
    fn gc_drops_bad_entries_and_reports_blacklist() {
        let owner = U160::random();
        let mut table = RoutingTable::new(owner);
        let now = Utc::now();
        let addr = SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 6881);
        let id = U160::random();
        table.add_node(NodeInfo::new(id, addr), now);
        table.root.get_mut(&id).unwrap().bad = true;

        let mut blacklisted = Vec::new();
        let (dropped_bad, _, _) = table.gc(now, |addr| blacklisted.push(addr));
        assert_eq!(dropped_bad, 1);
        assert_eq!(blacklisted, vec![addr]);
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn serialize_then_deserialize_round_trips_good_entries() {
        let owner = U160::random();
        let mut table = RoutingTable::new(owner);
        let now = Utc::now();
        for i in 0..3u16 {
            let node = NodeInfo::new(
                U160::random(),
                SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 7000 + i),
            );
            table.add_node(node, now);
        }
        let text = table.serialize(now);

        let mut reloaded = RoutingTable::new(U160::random());
        let count = reloaded.deserialize(&text, now).unwrap();
        assert_eq!(count, 3);
        assert_eq!(reloaded.len(), 3);
    }

    #[test]
    fn k_nearest_good_nodes_excludes_bad() {
        let owner = U160::random();
        let mut table = RoutingTable::new(owner);
        let now = Utc::now();
        let target = U160::random();
        let node = NodeInfo::new(
            target,
            SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881),
        );
        table.add_node(node, now);
        table.root.get_mut(&target).unwrap().bad = true;
        let nearest = table.k_nearest_good_nodes(&target, K, now);
        assert!(nearest.is_empty());
    }
}
