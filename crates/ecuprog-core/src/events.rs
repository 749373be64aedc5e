//! Progress events and caller-side abort
//!
//! Observers subscribe passively; the engine never waits on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// One progress notification, emitted per phase transition and per block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// 0..=100
    pub percent: u8,
    pub description: String,
}

impl ProgressEvent {
    pub fn new(percent: u8, description: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            description: description.into(),
        }
    }
}

/// Requests an abort of the running operation
///
/// The request is honoured before the next block is written. Clones share
/// the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Percentage of `done` out of `total` blocks, integer division
pub fn block_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}
