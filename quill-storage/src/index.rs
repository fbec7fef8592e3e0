use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::table::TupleSlot;
use crate::transaction::TransactionContext;

/// Opaque key-value interface over index structures. Keys are the
/// order-preserving encodings produced by [`crate::encode_sort_key`]; the
/// algorithms behind the interface are a black box. Callers are responsible
/// for registering compensating deletes (for aborted inserts) and deferred
/// physical deletes (for committed deletes) on the transaction.
pub trait Index: Send + Sync {
    fn insert(&self, txn: &TransactionContext, key: &[u8], slot: TupleSlot);

    /// Returns false when the key is already present, leaving the index
    /// unchanged.
    fn insert_unique(&self, txn: &TransactionContext, key: &[u8], slot: TupleSlot) -> bool;

    fn delete(&self, txn: &TransactionContext, key: &[u8], slot: TupleSlot);

    fn scan_key(&self, txn: &TransactionContext, key: &[u8]) -> Vec<TupleSlot>;

    /// Ordered range scan; bounds are inclusive-lo / inclusive-hi prefixes.
    fn scan_range(
        &self,
        txn: &TransactionContext,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        descending: bool,
    ) -> Vec<(Vec<u8>, TupleSlot)>;

    fn size(&self) -> usize;
}

/// In-memory ordered-map implementation of [`Index`].
pub struct BTreeIndex {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<TupleSlot>>>,
}

impl BTreeIndex {
    pub fn new() -> Self {
        BTreeIndex {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for BTreeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Index for BTreeIndex {
    fn insert(&self, _txn: &TransactionContext, key: &[u8], slot: TupleSlot) {
        self.entries
            .write()
            .unwrap()
            .entry(key.to_vec())
            .or_default()
            .push(slot);
    }

    fn insert_unique(&self, _txn: &TransactionContext, key: &[u8], slot: TupleSlot) -> bool {
        let mut entries = self.entries.write().unwrap();
        match entries.get(key) {
            Some(existing) if !existing.is_empty() => false,
            _ => {
                entries.entry(key.to_vec()).or_default().push(slot);
                true
            }
        }
    }

    fn delete(&self, _txn: &TransactionContext, key: &[u8], slot: TupleSlot) {
        let mut entries = self.entries.write().unwrap();
        if let Some(slots) = entries.get_mut(key) {
            slots.retain(|s| *s != slot);
            if slots.is_empty() {
                entries.remove(key);
            }
        }
    }

    fn scan_key(&self, _txn: &TransactionContext, key: &[u8]) -> Vec<TupleSlot> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn scan_range(
        &self,
        _txn: &TransactionContext,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        descending: bool,
    ) -> Vec<(Vec<u8>, TupleSlot)> {
        let entries = self.entries.read().unwrap();
        let lo_bound = match lo {
            Some(k) => Bound::Included(k.to_vec()),
            None => Bound::Unbounded,
        };
        let hi_bound = match hi {
            // Inclusive prefix upper bound: extend with 0xff so longer keys
            // sharing the prefix still match.
            Some(k) => {
                let mut upper = k.to_vec();
                upper.extend_from_slice(&[0xff; 8]);
                Bound::Included(upper)
            }
            None => Bound::Unbounded,
        };
        let mut result: Vec<(Vec<u8>, TupleSlot)> = entries
            .range((lo_bound, hi_bound))
            .flat_map(|(k, slots)| slots.iter().map(|s| (k.clone(), *s)))
            .collect();
        if descending {
            result.reverse();
        }
        result
    }

    fn size(&self) -> usize {
        self.entries.read().unwrap().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionManager;

    #[test]
    fn unique_insert_rejects_duplicates() {
        let mgr = TransactionManager::new();
        let txn = mgr.begin();
        let index = BTreeIndex::new();
        assert!(index.insert_unique(&txn, b"k1", TupleSlot(0)));
        assert!(!index.insert_unique(&txn, b"k1", TupleSlot(1)));
        assert_eq!(index.scan_key(&txn, b"k1"), vec![TupleSlot(0)]);
    }

    #[test]
    fn range_scan_is_ordered() {
        let mgr = TransactionManager::new();
        let txn = mgr.begin();
        let index = BTreeIndex::new();
        index.insert(&txn, b"b", TupleSlot(1));
        index.insert(&txn, b"a", TupleSlot(0));
        index.insert(&txn, b"c", TupleSlot(2));

        let asc = index.scan_range(&txn, Some(b"a"), Some(b"b"), false);
        assert_eq!(
            asc.iter().map(|(_, s)| *s).collect::<Vec<_>>(),
            vec![TupleSlot(0), TupleSlot(1)]
        );
        let desc = index.scan_range(&txn, None, None, true);
        assert_eq!(desc.first().unwrap().1, TupleSlot(2));
    }

    #[test]
    fn delete_removes_single_pair() {
        let mgr = TransactionManager::new();
        let txn = mgr.begin();
        let index = BTreeIndex::new();
        index.insert(&txn, b"k", TupleSlot(0));
        index.insert(&txn, b"k", TupleSlot(1));
        index.delete(&txn, b"k", TupleSlot(0));
        assert_eq!(index.scan_key(&txn, b"k"), vec![TupleSlot(1)]);
        assert_eq!(index.size(), 1);
    }
}
