//! Concurrent token multimap with atomic per-token union.
//!
//! Tokens are spread over a fixed number of shards. A shard's lock only
//! guards the token table (lookup and first insertion); each token's
//! document set sits behind its own mutex, taken after the shard lock has
//! been released. Unions into one token are therefore serialized and
//! all-or-nothing, while unions into different tokens never wait on each
//! other's set lock.

use crate::index::{DocId, DocSet, SortedIndex};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;

const DEFAULT_SHARDS: usize = 64;

type Slot = Arc<Mutex<DocSet>>;

pub struct TokenMultimap {
    shards: Box<[RwLock<HashMap<String, Slot>>]>,
    hasher: RandomState,
}

impl Default for TokenMultimap {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenMultimap {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// `shards` is rounded up to a power of two.
    pub fn with_shards(shards: usize) -> Self {
        let n = shards.max(1).next_power_of_two();
        Self {
            shards: (0..n).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, token: &str) -> &RwLock<HashMap<String, Slot>> {
        let h = self.hasher.hash_one(token) as usize;
        &self.shards[h & (self.shards.len() - 1)]
    }

    /// Read-or-create the slot for `token`.
    fn slot(&self, token: &str) -> Slot {
        let shard = self.shard(token);
        let existing = shard.read().get(token).cloned();
        if let Some(slot) = existing {
            return slot;
        }
        Arc::clone(shard.write().entry(token.to_owned()).or_default())
    }

    /// Add `docs` to the set of `token`, creating it if needed. Returns how
    /// many ids were new.
    pub fn union<I>(&self, token: &str, docs: I) -> usize
    where
        I: IntoIterator<Item = DocId>,
    {
        let slot = self.slot(token);
        let mut set = slot.lock();
        let before = set.len();
        set.extend(docs);
        set.len() - before
    }

    /// Snapshot of one token's documents.
    pub fn get(&self, token: &str) -> Option<DocSet> {
        let slot = self.shard(token).read().get(token).cloned()?;
        let set = slot.lock().clone();
        Some(set)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    pub fn to_sorted(&self) -> SortedIndex {
        let mut out = SortedIndex::new();
        for shard in self.shards.iter() {
            for (token, slot) in shard.read().iter() {
                out.insert(token.clone(), slot.lock().iter().cloned().collect());
            }
        }
        out
    }

    /// Drain every entry. Taking `self` guarantees no union can still be
    /// running.
    pub fn into_entries(self) -> impl Iterator<Item = (String, DocSet)> {
        self.shards.into_vec().into_iter().flat_map(|shard| {
            shard.into_inner().into_iter().map(|(token, slot)| {
                let docs = match Arc::try_unwrap(slot) {
                    Ok(set) => set.into_inner(),
                    Err(shared) => shared.lock().clone(),
                };
                (token, docs)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn union_reports_new_ids() {
        let map = TokenMultimap::new();
        assert_eq!(map.union("matrix", ["t1".to_string(), "t2".to_string()]), 2);
        assert_eq!(map.union("matrix", ["t2".to_string(), "t3".to_string()]), 1);
        assert_eq!(map.get("matrix").unwrap().len(), 3);
        assert!(map.get("room").is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn concurrent_unions_on_one_token_lose_nothing() {
        let map = Arc::new(TokenMultimap::with_shards(4));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..500 {
                        map.union("the", [format!("t{t}-{i}")]);
                        map.union(&format!("tok{}", i % 17), [format!("t{t}-{i}")]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.get("the").unwrap().len(), 8 * 500);
        assert_eq!(map.len(), 18);
        let total: usize = (0..17).map(|k| map.get(&format!("tok{k}")).unwrap().len()).sum();
        assert_eq!(total, 8 * 500);
    }

    #[test]
    fn held_token_does_not_block_other_tokens() {
        // One shard so both tokens share the table lock.
        let map = Arc::new(TokenMultimap::with_shards(1));
        map.union("a", ["t1".to_string()]);
        let slot_a = map.slot("a");
        let _held = slot_a.lock();

        let (tx, rx) = mpsc::channel();
        let other = Arc::clone(&map);
        thread::spawn(move || {
            other.union("b", ["t2".to_string()]);
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5)).expect("union into b blocked on a");
    }

    #[test]
    fn into_entries_drains_everything() {
        let map = TokenMultimap::new();
        map.union("the", ["t1".to_string(), "t3".to_string()]);
        map.union("room", ["t3".to_string()]);
        let mut entries: Vec<(String, usize)> = map.into_entries().map(|(t, d)| (t, d.len())).collect();
        entries.sort();
        assert_eq!(entries, vec![("room".to_string(), 1), ("the".to_string(), 2)]);
    }
}
