use crate::entry::{Liveness, RoutingEntry};
use chrono::{DateTime, Utc};
use krpc_encoding::U160;

/// Soft target: a leaf tries to keep around this many good entries before
/// it bothers splitting.
pub const K: usize = 8;

/// Hard cap on entries held directly in one leaf.
pub const BUCKET_MAX: usize = 32;

/// A node in the k-bucket trie. Leaves hold entries directly; internal
/// nodes hold two children covering disjoint halves of the parent's
/// range. `prefix` and `len` describe the range `[prefix, prefix |
/// pow2m1(160-len))`: the high `len` bits of any id in range equal the
/// high `len` bits of `prefix`.
pub struct Bucket {
    pub prefix: U160,
    pub len: u32,
    node: BucketNode,
}

enum BucketNode {
    Leaf(Vec<RoutingEntry>),
    Internal(Box<Bucket>, Box<Bucket>),
}

impl Bucket {
    pub fn root() -> Bucket {
        Bucket {
            prefix: U160::ZERO,
            len: 0,
            node: BucketNode::Leaf(Vec::new()),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.node, BucketNode::Leaf(_))
    }

    pub fn contains(&self, id: &U160) -> bool {
        self.len == 0 || id.common_prefix_length(&self.prefix) >= self.len
    }

    /// Upper bound of the bucket's range (inclusive): `prefix |
    /// pow2m1(160-len)`.
    pub fn range_end(&self) -> U160 {
        self.prefix.or(&U160::pow2m1(160 - self.len))
    }

    /// A target id sampled uniformly at random from this bucket's range.
    pub fn random_target(&self) -> U160 {
        U160::random_from_prefix(&self.prefix, self.len)
    }

    fn child_bit_for(&self, id: &U160) -> bool {
        id.msb(self.len)
    }

    fn split_in_place(&mut self) {
        let entries = match &mut self.node {
            BucketNode::Leaf(entries) => std::mem::take(entries),
            BucketNode::Internal(..) => return,
        };

        let mut zero_prefix = self.prefix;
        let mut one_prefix = self.prefix;
        // set bit `self.len` to 1 on the one-side prefix.
        one_prefix = one_prefix.or(&U160::pow2(self.len));
        let _ = &mut zero_prefix; // zero side keeps prefix bit cleared (already is, by construction)

        let mut zero_child = Bucket {
            prefix: zero_prefix,
            len: self.len + 1,
            node: BucketNode::Leaf(Vec::new()),
        };
        let mut one_child = Bucket {
            prefix: one_prefix,
            len: self.len + 1,
            node: BucketNode::Leaf(Vec::new()),
        };

        for entry in entries {
            if zero_child.contains(&entry.node.id) {
                zero_child.push_leaf_entry(entry);
            } else {
                one_child.push_leaf_entry(entry);
            }
        }

        self.node = BucketNode::Internal(Box::new(zero_child), Box::new(one_child));
    }

    fn push_leaf_entry(&mut self, entry: RoutingEntry) {
        if let BucketNode::Leaf(entries) = &mut self.node {
            entries.push(entry);
        }
    }

    /// Descends to the leaf that would hold `id`, inserting or refreshing
    /// `entry` there. `owner` and `fat_mode` govern whether the leaf is
    /// allowed to split once it exceeds `K` entries (see spec.md §4.3's
    /// split rule). Returns `true` if a new entry was inserted (as opposed
    /// to an existing one being refreshed).
    pub fn add_node(
        &mut self,
        entry: RoutingEntry,
        owner: &U160,
        fat_mode: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if let BucketNode::Internal(zero, one) = &mut self.node {
            return if zero.contains(&entry.node.id) {
                zero.add_node(entry, owner, fat_mode, now)
            } else {
                one.add_node(entry, owner, fat_mode, now)
            };
        }

        let inserted = {
            let entries = match &mut self.node {
                BucketNode::Leaf(entries) => entries,
                BucketNode::Internal(..) => unreachable!(),
            };
            if let Some(existing) = entries.iter_mut().find(|e| e.node.id == entry.node.id) {
                existing.last_seen = entry.last_seen.max(existing.last_seen);
                false
            } else if entries.len() < BUCKET_MAX {
                entries.push(entry);
                true
            } else {
                false
            }
        };

        self.maybe_split(owner, fat_mode);
        inserted
    }

    fn may_split(&self, owner: &U160, fat_mode: bool) -> bool {
        if !self.is_leaf() || self.len >= 160 {
            return false;
        }
        let entries = match &self.node {
            BucketNode::Leaf(entries) => entries,
            BucketNode::Internal(..) => return false,
        };
        let owns_self = self.contains(owner);
        (owns_self || fat_mode) && entries.len() > K
    }

    fn maybe_split(&mut self, owner: &U160, fat_mode: bool) {
        while self.may_split(owner, fat_mode) {
            self.split_in_place();
            if let BucketNode::Internal(zero, one) = &mut self.node {
                zero.maybe_split(owner, fat_mode);
                one.maybe_split(owner, fat_mode);
            }
            break;
        }
    }

    pub fn get(&self, id: &U160) -> Option<&RoutingEntry> {
        match &self.node {
            BucketNode::Internal(zero, one) => {
                if zero.contains(id) {
                    zero.get(id)
                } else {
                    one.get(id)
                }
            }
            BucketNode::Leaf(entries) => entries.iter().find(|e| &e.node.id == id),
        }
    }

    pub fn get_mut(&mut self, id: &U160) -> Option<&mut RoutingEntry> {
        match &mut self.node {
            BucketNode::Internal(zero, one) => {
                if zero.contains(id) {
                    zero.get_mut(id)
                } else {
                    one.get_mut(id)
                }
            }
            BucketNode::Leaf(entries) => entries.iter_mut().find(|e| &e.node.id == id),
        }
    }

    pub fn get_by_addr_mut(
        &mut self,
        addr: &std::net::SocketAddrV4,
    ) -> Option<&mut RoutingEntry> {
        match &mut self.node {
            BucketNode::Internal(zero, one) => zero
                .get_by_addr_mut(addr)
                .or_else(move || one.get_by_addr_mut(addr)),
            BucketNode::Leaf(entries) => entries.iter_mut().find(|e| &e.node.addr == addr),
        }
    }

    /// Descends to the leaf that owns `target` and returns up to `k` of
    /// its good entries. This approximates k-nearest without
    /// materializing the whole trie.
    pub fn k_nearest_good(&self, target: &U160, k: usize, now: DateTime<Utc>) -> Vec<RoutingEntry> {
        match &self.node {
            BucketNode::Internal(zero, one) => {
                if zero.contains(target) {
                    zero.k_nearest_good(target, k, now)
                } else {
                    one.k_nearest_good(target, k, now)
                }
            }
            BucketNode::Leaf(entries) => entries
                .iter()
                .filter(|e| e.is_good(now))
                .take(k)
                .cloned()
                .collect(),
        }
    }

    /// Visits every leaf bucket.
    pub fn for_each_leaf<'a>(&'a self, f: &mut dyn FnMut(&'a Bucket, &'a [RoutingEntry])) {
        match &self.node {
            BucketNode::Internal(zero, one) => {
                zero.for_each_leaf(f);
                one.for_each_leaf(f);
            }
            BucketNode::Leaf(entries) => f(self, entries),
        }
    }

    /// GC this subtree bottom-up: partitions each leaf's entries into
    /// good/questionable/bad, drops bad entries (invoking `on_blacklist`
    /// for each), trims questionable/good excess, and merges any internal
    /// node whose two children are both (now smaller) leaves. Returns
    /// `(dropped_bad, dropped_questionable, dropped_good)`.
    pub fn gc(
        &mut self,
        delete_good: bool,
        now: DateTime<Utc>,
        on_blacklist: &mut dyn FnMut(std::net::SocketAddrV4),
    ) -> (usize, usize, usize) {
        match &mut self.node {
            BucketNode::Internal(zero, one) => {
                let zero_counts = zero.gc(delete_good, now, on_blacklist);
                let one_counts = one.gc(delete_good, now, on_blacklist);

                let should_merge = zero.is_leaf()
                    && one.is_leaf()
                    && zero.entries_len() + one.entries_len() <= K / 2;
                if should_merge {
                    let mut merged = Vec::new();
                    zero.drain_leaf(&mut merged);
                    one.drain_leaf(&mut merged);
                    self.node = BucketNode::Leaf(merged);
                }

                (
                    zero_counts.0 + one_counts.0,
                    zero_counts.1 + one_counts.1,
                    zero_counts.2 + one_counts.2,
                )
            }
            BucketNode::Leaf(entries) => {
                let mut good = Vec::new();
                let mut questionable = Vec::new();
                let mut bad = Vec::new();
                for entry in entries.drain(..) {
                    match entry.liveness(now) {
                        Liveness::Good => good.push(entry),
                        Liveness::Questionable => questionable.push(entry),
                        Liveness::Bad => bad.push(entry),
                    }
                }

                let dropped_bad = bad.len();
                for entry in &bad {
                    on_blacklist(entry.node.addr);
                }

                let non_bad = good.len() + questionable.len();
                let mut dropped_questionable = 0;
                if non_bad > K {
                    let excess = non_bad - K;
                    let keep = questionable.len().saturating_sub(excess);
                    dropped_questionable = questionable.len() - keep;
                    questionable.truncate(keep);
                }

                let mut dropped_good = 0;
                if delete_good && good.len() > K {
                    // Drop the oldest good entries (by first_seen) first.
                    good.sort_by_key(|e| e.first_seen);
                    let excess = good.len() - K;
                    dropped_good = excess;
                    good.drain(0..excess);
                }

                let mut remaining = good;
                remaining.extend(questionable);
                *entries = remaining;

                (dropped_bad, dropped_questionable, dropped_good)
            }
        }
    }

    fn entries_len(&self) -> usize {
        match &self.node {
            BucketNode::Leaf(entries) => entries.len(),
            BucketNode::Internal(..) => usize::MAX,
        }
    }

    fn drain_leaf(&mut self, into: &mut Vec<RoutingEntry>) {
        if let BucketNode::Leaf(entries) = &mut self.node {
            into.append(entries);
        }
    }

    /// Checks the trie-completeness invariant recursively: every entry
    /// lies within its leaf's range, and each child covers exactly half
    /// of its parent's range.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        match &self.node {
            BucketNode::Internal(zero, one) => {
                assert_eq!(zero.len, self.len + 1);
                assert_eq!(one.len, self.len + 1);
                assert_eq!(zero.prefix, self.prefix);
                assert_eq!(one.prefix, self.prefix.or(&U160::pow2(self.len)));
                zero.check_invariants();
                one.check_invariants();
            }
            BucketNode::Leaf(entries) => {
                for entry in entries {
                    assert!(self.contains(&entry.node.id));
                }
            }
        }
    }
}
