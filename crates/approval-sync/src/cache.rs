//! Time-bounded caches owned by the caller.
//!
//! Nothing here is global: every cache belongs to one [`crate::Synchronizer`]
//! (or whoever builds it) and entries disappear either when their TTL runs
//! out or when invalidated explicitly.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use approval_core::{ProjectId, RuleId};

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, (Instant, V)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live value for `key`. An expired entry is dropped and reported as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries();
        let (stored_at, value) = entries.get(key)?;
        if stored_at.elapsed() < self.ttl {
            return Some(value.clone());
        }
        entries.remove(key);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries().insert(key, (Instant::now(), value));
    }

    /// Cached value for `key`, computing and storing it on a miss.
    pub fn get_or_insert_with(&self, key: K, compute: impl FnOnce() -> V) -> V {
        if let Some(hit) = self.get(&key) {
            return hit;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    pub fn invalidate(&self, key: &K) {
        self.entries().remove(key);
    }

    /// Drop every entry whose key matches `stale`, returning how many went.
    pub fn invalidate_where(&self, mut stale: impl FnMut(&K) -> bool) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| !stale(key));
        before - entries.len()
    }

    /// Entries held, expired ones included until next touched.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key of a cached "does this rule apply to this branch" answer.
///
/// `scope` is [`approval_core::branch_scope_digest`] of the rule and the
/// project's live protected branches, so editing either misses the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchLookup {
    pub project: ProjectId,
    pub rule: RuleId,
    pub branch: String,
    pub scope: String,
}

/// Protected-branch applicability answers for saved rules.
pub type BranchCache = TtlCache<BranchLookup, bool>;

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(rule: u64, branch: &str) -> BranchLookup {
        BranchLookup {
            project: ProjectId(1),
            rule: RuleId(rule),
            branch: branch.to_string(),
            scope: "s".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache: BranchCache = TtlCache::new(Duration::from_secs(60));
        cache.insert(lookup(1, "main"), true);
        assert_eq!(cache.get(&lookup(1, "main")), Some(true));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&lookup(1, "main")), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_insert_with_computes_once_per_ttl() {
        let cache: BranchCache = TtlCache::new(Duration::from_secs(10));
        let mut calls = 0;
        for _ in 0..3 {
            cache.get_or_insert_with(lookup(1, "main"), || {
                calls += 1;
                true
            });
        }
        assert_eq!(calls, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        cache.get_or_insert_with(lookup(1, "main"), || {
            calls += 1;
            false
        });
        assert_eq!(calls, 2);
    }

    #[test]
    fn invalidate_where_drops_matching_keys() {
        let cache: BranchCache = TtlCache::new(Duration::from_secs(60));
        cache.insert(lookup(1, "main"), true);
        cache.insert(lookup(2, "main"), false);
        cache.insert(lookup(1, "stable"), true);

        assert_eq!(cache.invalidate_where(|k| k.rule == RuleId(1)), 2);
        assert_eq!(cache.len(), 1);

        cache.invalidate(&lookup(2, "main"));
        assert!(cache.is_empty());
    }
}
