//! Mempool mirror.
//!
//! The chain server owns the real mempool; the loop keeps a mirror updated
//! through logs, so ping replies and transaction gossip never block on the
//! chain server.
use std::collections::BTreeMap;

use oryx_common::block::TxId;
use oryx_common::Height;

/// One mirrored mempool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Transaction id.
    pub txid: TxId,
    /// Height the transaction was created at, for gossip ordering.
    pub transaction_height: Height,
    /// Fee offered, for sampling priority.
    pub fee: u64,
}

/// One mempool mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Insert or replace an entry.
    Put(Entry),
    /// Remove an entry.
    Erase(TxId),
}

/// An ordered batch of mempool mutations.
pub type Log = Vec<Action>;

/// The loop's mirror of the chain server's mempool.
#[derive(Debug, Default)]
pub struct Mempool {
    entries: BTreeMap<TxId, Entry>,
}

impl Mempool {
    /// An empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a mutation log in order.
    pub fn apply_log(&mut self, log: &Log) {
        for action in log {
            match action {
                Action::Put(entry) => {
                    self.entries.insert(entry.txid, entry.clone());
                }
                Action::Erase(txid) => {
                    self.entries.remove(txid);
                }
            }
        }
    }

    /// Up to `n` transaction ids, highest fee first.
    pub fn sample(&self, n: usize) -> Vec<TxId> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| b.fee.cmp(&a.fee).then(a.txid.cmp(&b.txid)));
        entries.into_iter().take(n).map(|e| e.txid).collect()
    }

    /// The subset of `txids` we have not mirrored yet.
    pub fn filter_new(&self, txids: &[TxId]) -> Vec<TxId> {
        txids
            .iter()
            .filter(|t| !self.entries.contains_key(t))
            .copied()
            .collect()
    }

    /// Look up an entry.
    pub fn get(&self, txid: &TxId) -> Option<&Entry> {
        self.entries.get(txid)
    }

    /// Number of mirrored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mirror is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(n: u8) -> TxId {
        TxId([n; 32])
    }

    fn entry(n: u8, fee: u64) -> Entry {
        Entry {
            txid: txid(n),
            transaction_height: n as Height,
            fee,
        }
    }

    #[test]
    fn test_apply_log_in_order() {
        let mut pool = Mempool::new();
        pool.apply_log(&vec![
            Action::Put(entry(1, 10)),
            Action::Put(entry(2, 20)),
            Action::Erase(txid(1)),
        ]);

        assert_eq!(pool.len(), 1);
        assert!(pool.get(&txid(2)).is_some());
    }

    #[test]
    fn test_sample_prefers_fee() {
        let mut pool = Mempool::new();
        pool.apply_log(&vec![
            Action::Put(entry(1, 5)),
            Action::Put(entry(2, 50)),
            Action::Put(entry(3, 20)),
        ]);

        assert_eq!(pool.sample(2), vec![txid(2), txid(3)]);
    }

    #[test]
    fn test_filter_new() {
        let mut pool = Mempool::new();
        pool.apply_log(&vec![Action::Put(entry(1, 1))]);

        assert_eq!(pool.filter_new(&[txid(1), txid(9)]), vec![txid(9)]);
    }
}
