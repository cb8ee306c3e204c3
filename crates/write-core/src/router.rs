//! Per-series pool routing, including the dual-hash reindex window.

use cluster_core::{PoolId, SeriesName};

use crate::pool_registry::PoolRegistry;
use crate::storage::Engine;

/// Resolves the pool responsible for `name`.
///
/// Outside a reindex this is just `lookup(name)`. While reindexing, a series
/// already present locally stays with this pool (it would be double work to
/// move it mid-flight); otherwise `prev_lookup` decides — unless
/// `prev_lookup` itself points back at this pool, in which case the new
/// hash (`lookup`) is authoritative, since the series is in the process of
/// moving away from here.
///
/// The containment check goes through `engine.contains`, which locks the
/// same `series_mutex` LocalApply locks — callers must not race this with a
/// concurrent `LocalApply` create under any other lock.
pub fn route(
    name: &SeriesName,
    own_pool: PoolId,
    registry: &PoolRegistry,
    engine: &dyn Engine,
) -> PoolId {
    if !registry.is_reindexing() {
        return registry.lookup(name);
    }

    if engine.contains(name) {
        return own_pool;
    }

    let prev = registry.prev_lookup(name);
    if prev == own_pool {
        registry.lookup(name)
    } else {
        prev
    }
}
