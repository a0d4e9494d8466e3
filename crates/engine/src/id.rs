use std::sync::atomic::{AtomicU64, Ordering};

/// Issues JSON-RPC request identifiers, unique across every worker.
///
/// Identifiers start at 1 and increase by one per call.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of identifiers handed out so far.
    pub fn issued(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
