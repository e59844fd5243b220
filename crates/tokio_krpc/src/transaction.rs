use crate::errors::{Error, ErrorKind, Result};
use chrono::{DateTime, Duration, Utc};
use krpc_encoding::Envelope;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::Waker;

/// Default age after which an open transaction is reclaimed by `gc`.
pub const DEFAULT_TRANSACTION_EXPIRATION_SECS: i64 = 60;

/// Short opaque transaction id: a little-endian encoding of a monotonic
/// counter, kept to at most 8 bytes as spec.md §3 requires.
pub type TransactionId = u64;

pub fn encode_transaction_id(id: TransactionId) -> Vec<u8> {
    let mut bytes = id.to_le_bytes().to_vec();
    while bytes.len() > 1 && bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

pub fn decode_transaction_id(bytes: &[u8]) -> Option<TransactionId> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Some(TransactionId::from_le_bytes(buf))
}

/// A record of one in-flight query, as spec.md §3 describes.
pub struct Transaction {
    pub id: TransactionId,
    pub method_name: String,
    pub start_time: DateTime<Utc>,
    waiting: Option<Waker>,
    response: Option<Envelope>,
}

/// Correlates outgoing queries with incoming responses by transaction id,
/// and expires stale transactions (spec.md §4.4).
///
/// Guarded by a mutex per spec.md §5's note: the original design allows
/// cross-thread transaction starts, and this crate keeps that property
/// rather than assume a single-loop caller.
#[derive(Clone)]
pub struct ActiveTransactions {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    next_id: u64,
    open: HashMap<TransactionId, Transaction>,
    expiration: Duration,
}

impl ActiveTransactions {
    pub fn new() -> ActiveTransactions {
        ActiveTransactions::with_expiration(DEFAULT_TRANSACTION_EXPIRATION_SECS)
    }

    pub fn with_expiration(expiration_secs: i64) -> ActiveTransactions {
        ActiveTransactions {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                open: HashMap::new(),
                expiration: Duration::seconds(expiration_secs),
            })),
        }
    }

    /// Opens a transaction for `method_name`, returning its id. The id is
    /// allocated from a monotonic counter and is unique among currently
    /// open transactions for the lifetime of this manager.
    pub fn start(&self, method_name: impl Into<String>, now: DateTime<Utc>) -> TransactionId {
        let mut inner = self.inner.lock().expect("transaction map mutex poisoned");
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.open.insert(
            id,
            Transaction {
                id,
                method_name: method_name.into(),
                start_time: now,
                waiting: None,
                response: None,
            },
        );
        id
    }

    pub fn method_name(&self, id: TransactionId) -> Option<String> {
        let inner = self.inner.lock().expect("transaction map mutex poisoned");
        inner.open.get(&id).map(|tx| tx.method_name.clone())
    }

    /// Delivers a response to transaction `id`, waking any task polling
    /// `ResponseFuture` for it. Returns an error if no such transaction is
    /// open (spec.md §4.4: `end` on a missing id raises `TransactionError`).
    pub fn deliver(&self, id: TransactionId, response: Envelope) -> Result<()> {
        let mut inner = self.inner.lock().expect("transaction map mutex poisoned");
        match inner.open.get_mut(&id) {
            Some(tx) => {
                tx.response = Some(response);
                if let Some(waker) = tx.waiting.take() {
                    waker.wake();
                }
                Ok(())
            }
            None => Err(ErrorKind::TransactionError {
                transaction_id: encode_transaction_id(id),
            }
            .into()),
        }
    }

    /// Removes and returns the response for `id`, if one has arrived.
    /// `Ok(None)` means the transaction is still open but has not yet
    /// received a response.
    pub fn poll_response(
        &self,
        id: TransactionId,
        waker: &Waker,
    ) -> std::result::Result<Option<Envelope>, Error> {
        let mut inner = self.inner.lock().expect("transaction map mutex poisoned");
        match inner.open.get_mut(&id) {
            None => Err(ErrorKind::TransactionError {
                transaction_id: encode_transaction_id(id),
            }
            .into()),
            Some(tx) => {
                if let Some(response) = tx.response.take() {
                    inner.open.remove(&id);
                    Ok(Some(response))
                } else {
                    tx.waiting = Some(waker.clone());
                    Ok(None)
                }
            }
        }
    }

    /// Drops transaction `id` without waiting for a response (used when a
    /// `ResponseFuture` is cancelled).
    pub fn drop_transaction(&self, id: TransactionId) {
        let mut inner = self.inner.lock().expect("transaction map mutex poisoned");
        inner.open.remove(&id);
    }

    /// Deletes every transaction whose `start_time` is older than the
    /// configured expiration. Returns how many were reclaimed.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().expect("transaction map mutex poisoned");
        let expiration = inner.expiration;
        let expired: Vec<TransactionId> = inner
            .open
            .iter()
            .filter(|(_, tx)| now - tx.start_time > expiration)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(tx) = inner.open.remove(id) {
                if let Some(waker) = tx.waiting {
                    waker.wake();
                }
            }
        }
        expired.len()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().expect("transaction map mutex poisoned").open.len()
    }
}

impl Default for ActiveTransactions {
    fn default() -> ActiveTransactions {
        ActiveTransactions::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_are_unique_while_open() {
        let txs = ActiveTransactions::new();
        let now = Utc::now();
        let a = txs.start("ping", now);
        let b = txs.start("ping", now);
        assert_ne!(a, b);
    }

    #[test]
    fn gc_removes_transactions_older_than_expiration() {
        let txs = ActiveTransactions::with_expiration(60);
        let now = Utc::now();
        let id = txs.start("ping", now);
        let later = now + Duration::seconds(61);
        let removed = txs.gc(later);
        assert_eq!(removed, 1);
        assert_eq!(txs.method_name(id), None);
    }

    #[test]
    fn gc_keeps_fresh_transactions() {
        let txs = ActiveTransactions::with_expiration(60);
        let now = Utc::now();
        let id = txs.start("ping", now);
        let soon = now + Duration::seconds(10);
        let removed = txs.gc(soon);
        assert_eq!(removed, 0);
        assert_eq!(txs.method_name(id), Some("ping".to_string()));
    }

    #[test]
    fn deliver_to_missing_transaction_is_an_error() {
        let txs = ActiveTransactions::new();
        let envelope_bytes = krpc_encoding::Envelope {
            ip: None,
            transaction_id: vec![1],
            version: None,
            message_type: krpc_encoding::MessageType::Response {
                response: krpc_encoding::Response::OnlyId {
                    id: krpc_encoding::U160::random(),
                },
            },
            read_only: false,
        };
        assert!(txs.deliver(999, envelope_bytes).is_err());
    }

    #[test]
    fn transaction_id_round_trips_through_bytes() {
        for id in [0u64, 1, 255, 256, u32::MAX as u64] {
            let bytes = encode_transaction_id(id);
            assert!(bytes.len() <= 8);
            assert_eq!(decode_transaction_id(&bytes), Some(id));
        }
    }
}
