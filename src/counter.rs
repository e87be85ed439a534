/// Word counter module
///
/// The running count is a projection of the detection event stream: it is
/// incremented exactly once per event and never mutated any other way. The
/// handle is cheap to clone so a status consumer can read the count while the
/// processing stage produces it.

use crate::debounce::DetectionEvent;
use cache_padded::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Monotonically increasing count of confirmed detections
#[derive(Debug, Clone, Default)]
pub struct WordCounter {
    count: Arc<CachePadded<AtomicU64>>,
}

impl WordCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one confirmed detection. Returns the new count.
    pub fn on_event(&self, event: &DetectionEvent) -> u64 {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("word count incremented to {} at {:?}", count, event.at);
        count
    }

    /// Read the current count without blocking producers. Remains valid
    /// after the pipeline has shut down.
    pub fn snapshot(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
