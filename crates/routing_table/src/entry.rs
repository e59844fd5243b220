use chrono::{DateTime, Duration, Utc};
use krpc_encoding::NodeInfo;

/// Grace window within which a node that has responded is considered
/// `Good` (BEP-5 §"Routing Table").
pub const GOOD_WINDOW_SECS: i64 = 15 * 60;

/// How long a node may owe us a response before we consider it `Bad`.
pub const KRPC_TIMEOUT_SECS: i64 = 30;

/// Liveness grade of a routing-table entry, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Good,
    Questionable,
    Bad,
}

/// A node observed on the DHT, with the bookkeeping needed to grade its
/// liveness and to know when a response from it is overdue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub node: NodeInfo,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_require_response: Option<DateTime<Utc>>,
    pub response_required: bool,
    pub bad: bool,
    pub version: Option<String>,
}

impl RoutingEntry {
    pub fn new(node: NodeInfo, now: DateTime<Utc>) -> RoutingEntry {
        RoutingEntry {
            node,
            first_seen: now,
            last_seen: now,
            last_require_response: None,
            response_required: false,
            bad: false,
            version: None,
        }
    }

    /// Called when the entry responds to (or otherwise proves liveness
    /// for) a query: refreshes `last_seen`, clears the "owes us a
    /// response" state, and clears `bad`.
    pub fn mark_good(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
        self.response_required = false;
        self.bad = false;
    }

    /// Called when we send a query to this node and expect a response:
    /// starts (or refreshes) the response-required timer.
    pub fn mark_response_required(&mut self, now: DateTime<Utc>) {
        self.response_required = true;
        self.last_require_response = Some(now);
    }

    pub fn liveness(&self, now: DateTime<Utc>) -> Liveness {
        if self.bad {
            return Liveness::Bad;
        }
        if self.response_required {
            if let Some(since) = self.last_require_response {
                if now - since > Duration::seconds(KRPC_TIMEOUT_SECS) {
                    return Liveness::Bad;
                }
            }
        }
        if now - self.last_seen < Duration::seconds(GOOD_WINDOW_SECS) {
            return Liveness::Good;
        }
        Liveness::Questionable
    }

    pub fn is_good(&self, now: DateTime<Utc>) -> bool {
        self.liveness(now) == Liveness::Good
    }

    pub fn is_bad(&self, now: DateTime<Utc>) -> bool {
        self.liveness(now) == Liveness::Bad
    }

    pub fn is_questionable(&self, now: DateTime<Utc>) -> bool {
        self.liveness(now) == Liveness::Questionable
    }
}
