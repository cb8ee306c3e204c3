//! Pool membership and the dual-hash reindex window.
//!
//! During a cluster reindex, a series may need to be checked against both
//! the new pool-count hash (`lookup`) and the previous one (`prev_lookup`)
//! so in-flight writes keep landing on whichever pool already holds the
//! series until the reindex completes.

use cluster_core::SeriesName;
use std::sync::atomic::{AtomicBool, Ordering};

use cluster_core::PoolId;

/// A consistent-hash function from a series name to a pool id, given a pool
/// count. The registry owns the actual hash choice; this crate only needs
/// the signature.
pub type HashFn = fn(&SeriesName, u16) -> PoolId;

/// The live pool count and, while a reindex is underway, the pool count it
/// is moving away from.
pub struct PoolRegistry {
    pub(crate) lookup: HashFn,
    pub(crate) prev_lookup: HashFn,
    pub(crate) pool_count: u16,
    pub(crate) prev_pool_count: u16,
    pub(crate) reindexing: AtomicBool,
}

impl PoolRegistry {
    /// A registry for a cluster that is not (and has never been) reindexing.
    pub fn single_pool(lookup: HashFn) -> Self {
        PoolRegistry {
            lookup,
            prev_lookup: lookup,
            pool_count: 1,
            prev_pool_count: 1,
            reindexing: AtomicBool::new(false),
        }
    }

    pub fn new(lookup: HashFn, pool_count: u16) -> Self {
        PoolRegistry {
            lookup,
            prev_lookup: lookup,
            pool_count,
            prev_pool_count: pool_count,
            reindexing: AtomicBool::new(false),
        }
    }

    /// Begin a reindex: the pool count changes to `new_pool_count`, but
    /// `prev_lookup` keeps resolving against the old count until
    /// [`PoolRegistry::finish_reindex`] is called.
    pub fn begin_reindex(&mut self, new_pool_count: u16) {
        self.prev_pool_count = self.pool_count;
        self.pool_count = new_pool_count;
        self.reindexing.store(true, Ordering::SeqCst);
    }

    pub fn finish_reindex(&mut self) {
        self.prev_pool_count = self.pool_count;
        self.reindexing.store(false, Ordering::SeqCst);
    }

    pub fn is_reindexing(&self) -> bool {
        self.reindexing.load(Ordering::SeqCst)
    }

    pub fn lookup(&self, name: &SeriesName) -> PoolId {
        (self.lookup)(name, self.pool_count)
    }

    pub fn prev_lookup(&self, name: &SeriesName) -> PoolId {
        (self.prev_lookup)(name, self.prev_pool_count)
    }

    pub fn pool_count(&self) -> u16 {
        self.pool_count
    }
}

/// A deterministic hash usable as a [`HashFn`] in tests: FNV-1a folded into
/// the pool count. Not the production hash — just stable and cheap.
pub fn fnv1a_lookup(name: &SeriesName, pool_count: u16) -> PoolId {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let count = pool_count.max(1) as u64;
    PoolId((hash % count) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> SeriesName {
        SeriesName::new(s.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn lookup_is_deterministic() {
        let registry = PoolRegistry::new(fnv1a_lookup, 4);
        let a = registry.lookup(&name("cpu"));
        let b = registry.lookup(&name("cpu"));
        assert_eq!(a, b);
    }

    #[test]
    fn reindex_keeps_prev_lookup_on_old_pool_count() {
        let mut registry = PoolRegistry::new(fnv1a_lookup, 4);
        let before = registry.prev_lookup(&name("cpu"));
        registry.begin_reindex(8);
        assert!(registry.is_reindexing());
        assert_eq!(registry.prev_lookup(&name("cpu")), before);
        registry.finish_reindex();
        assert!(!registry.is_reindexing());
        assert_eq!(registry.prev_lookup(&name("cpu")), registry.lookup(&name("cpu")));
    }

    #[test]
    fn single_pool_always_resolves_to_pool_zero() {
        let registry = PoolRegistry::single_pool(fnv1a_lookup);
        assert_eq!(registry.lookup(&name("anything")), PoolId(0));
    }
}
