use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::SocketAddrV4;

/// A bounded `(ip, port) -> banned_until` map (spec.md §4.11). Endpoints
/// recorded here must never make it back into a routing table.
pub struct Blacklist {
    entries: HashMap<SocketAddrV4, DateTime<Utc>>,
    capacity: usize,
    ban_duration: Duration,
}

impl Blacklist {
    pub fn new(capacity: usize, ban_duration: Duration) -> Blacklist {
        Blacklist {
            entries: HashMap::new(),
            capacity,
            ban_duration,
        }
    }

    /// Bans `endpoint` until `now + ban_duration`. Returns `false` if the
    /// blacklist is already at capacity and `endpoint` was not already
    /// present.
    pub fn add(&mut self, endpoint: SocketAddrV4, now: DateTime<Utc>) -> bool {
        if !self.entries.contains_key(&endpoint) && self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.insert(endpoint, now + self.ban_duration);
        true
    }

    /// True only if `endpoint` is present and its ban has not expired.
    pub fn has(&self, endpoint: &SocketAddrV4, now: DateTime<Utc>) -> bool {
        match self.entries.get(endpoint) {
            Some(banned_until) => *banned_until > now,
            None => false,
        }
    }

    pub fn gc(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, banned_until| *banned_until > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), port)
    }

    #[test]
    fn add_then_has_is_true_until_expiry() {
        let mut list = Blacklist::new(10, Duration::seconds(60));
        let now = Utc::now();
        assert!(list.add(addr(1), now));
        assert!(list.has(&addr(1), now));
        assert!(!list.has(&addr(1), now + Duration::seconds(61)));
    }

    #[test]
    fn add_fails_at_capacity_for_new_entries() {
        let mut list = Blacklist::new(1, Duration::seconds(60));
        let now = Utc::now();
        assert!(list.add(addr(1), now));
        assert!(!list.add(addr(2), now));
        // Re-adding an existing entry is always allowed (it's a refresh).
        assert!(list.add(addr(1), now));
    }

    #[test]
    fn gc_removes_only_expired_entries() {
        let mut list = Blacklist::new(10, Duration::seconds(60));
        let now = Utc::now();
        list.add(addr(1), now);
        list.add(addr(2), now - Duration::seconds(120));
        let removed = list.gc(now);
        assert_eq!(removed, 1);
        assert!(list.has(&addr(1), now));
        assert!(!list.has(&addr(2), now));
    }
}
