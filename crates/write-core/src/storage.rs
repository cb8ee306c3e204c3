//! The storage engine seam.
//!
//! The real storage engine (on-disk shards, WAL, compaction) lives outside
//! this crate's charter — it is an external collaborator the core only
//! consumes through [`Engine`]. This module also ships [`MemEngine`], an
//! in-memory stand-in used by the unit and integration test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use cluster_core::{Critical, SeriesName, Value, ValueType};

/// Opaque handle minted by an [`Engine`] for a single series. Stable for the
/// engine's lifetime; cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeriesHandle(u64);

/// Everything a caller may do while holding the combined `series_mutex` +
/// `shards_mutex` lock.
pub trait EngineGuard {
    fn get_or_create(
        &mut self,
        name: &SeriesName,
        first_value: &Value,
    ) -> Result<SeriesHandle, Critical>;

    fn add_point(&mut self, series: &SeriesHandle, ts: i64, value: &Value) -> Result<(), Critical>;
}

/// The storage engine trait this crate's LocalApply stage consumes.
///
/// `lock` is the *only* entry point that acquires `series_mutex` then
/// `shards_mutex` — per the locking discipline in the design notes, no other
/// method may take either lock separately. `contains` takes `series_mutex`
/// alone, which is all the Router's reindex containment check needs.
pub trait Engine: Send + Sync {
    fn lock(&self) -> Box<dyn EngineGuard + '_>;

    fn contains(&self, name: &SeriesName) -> bool;

    /// Credits `n` points to the database's cumulative counter. Called once
    /// per job, after every point in that job has landed locally or been
    /// acked by its owning peer.
    fn add_points(&self, n: u64);

    fn total_points(&self) -> u64;
}

#[derive(Debug, Clone)]
struct SeriesRecord {
    #[allow(dead_code)]
    value_type: ValueType,
}

#[derive(Default)]
struct MemEngineInner {
    by_name: HashMap<SeriesName, SeriesHandle>,
    records: HashMap<SeriesHandle, SeriesRecord>,
    /// Every point ever accepted, in arrival order, keyed by handle — lets
    /// tests assert ordering of `storage.add_point` calls.
    points: HashMap<SeriesHandle, Vec<(i64, Value)>>,
    next_id: u64,
}

/// An in-memory [`Engine`] used by the test suite and by the bundled demo
/// service. Not the production storage engine.
#[derive(Default)]
pub struct MemEngine {
    inner: Mutex<MemEngineInner>,
    total_points: AtomicU64,
}

impl MemEngine {
    pub fn new() -> Self {
        MemEngine::default()
    }

    /// The points recorded for `name`, in the order `add_point` received
    /// them. Empty if the series was never created.
    pub fn points_for(&self, name: &SeriesName) -> Vec<(i64, Value)> {
        let inner = self.inner.lock().expect("mem engine mutex poisoned");
        match inner.by_name.get(name) {
            Some(handle) => inner.points.get(handle).cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub fn series_count(&self) -> usize {
        self.inner.lock().expect("mem engine mutex poisoned").by_name.len()
    }
}

struct MemEngineGuard<'a> {
    inner: MutexGuard<'a, MemEngineInner>,
}

impl EngineGuard for MemEngineGuard<'_> {
    fn get_or_create(
        &mut self,
        name: &SeriesName,
        first_value: &Value,
    ) -> Result<SeriesHandle, Critical> {
        if let Some(handle) = self.inner.by_name.get(name) {
            return Ok(*handle);
        }
        let id = self.inner.next_id;
        self.inner.next_id += 1;
        let handle = SeriesHandle(id);
        self.inner.by_name.insert(name.clone(), handle);
        self.inner.records.insert(
            handle,
            SeriesRecord {
                value_type: first_value.type_tag(),
            },
        );
        self.inner.points.insert(handle, Vec::new());
        Ok(handle)
    }

    fn add_point(&mut self, series: &SeriesHandle, ts: i64, value: &Value) -> Result<(), Critical> {
        self.inner
            .points
            .entry(*series)
            .or_default()
            .push((ts, value.clone()));
        Ok(())
    }
}

impl Engine for MemEngine {
    fn lock(&self) -> Box<dyn EngineGuard + '_> {
        Box::new(MemEngineGuard {
            inner: self.inner.lock().expect("mem engine mutex poisoned"),
        })
    }

    fn contains(&self, name: &SeriesName) -> bool {
        self.inner
            .lock()
            .expect("mem engine mutex poisoned")
            .by_name
            .contains_key(name)
    }

    fn add_points(&self, n: u64) {
        self.total_points.fetch_add(n, Ordering::SeqCst);
    }

    fn total_points(&self) -> u64 {
        self.total_points.load(Ordering::SeqCst)
    }
}
