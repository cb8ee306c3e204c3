use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A job-scoped critical-error signal.
///
/// The original source keeps this as a module-global flag set from
/// allocators and hot paths; Design Notes forbid reintroducing a true
/// process global, so here it is cloned into each insert job at creation
/// time and shared with its `Decoder`/`LocalApply` passes. Every loop in
/// those stages checks `raised()` before advancing a step.
#[derive(Clone, Default)]
pub struct ErrorBus(Arc<AtomicBool>);

impl ErrorBus {
    pub fn new() -> Self {
        ErrorBus(Arc::new(AtomicBool::new(false)))
    }

    /// Trip the bus. Idempotent.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
