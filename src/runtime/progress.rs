use std::sync::atomic::{AtomicU64, Ordering};

const UNINITIALIZED: u64 = u64::MAX;

/// Publishes the indexer watermark: the highest height whose block, and every
/// block below it, has been fully handled. Only the manager writes it.
#[derive(Debug)]
pub struct ProgressTracker {
    last_confirmed: AtomicU64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self {
            last_confirmed: AtomicU64::new(UNINITIALIZED),
        }
    }
}

impl ProgressTracker {
    pub fn new(watermark: Option<u64>) -> Self {
        let tracker = Self::default();
        tracker.reset(watermark);
        tracker
    }

    pub fn reset(&self, watermark: Option<u64>) {
        self.last_confirmed
            .store(watermark.unwrap_or(UNINITIALIZED), Ordering::SeqCst);
    }

    pub fn mark_confirmed(&self, height: u64) {
        self.last_confirmed.store(height, Ordering::SeqCst);
    }

    pub fn last_confirmed(&self) -> Option<u64> {
        match self.last_confirmed.load(Ordering::SeqCst) {
            UNINITIALIZED => None,
            value => Some(value),
        }
    }
}
