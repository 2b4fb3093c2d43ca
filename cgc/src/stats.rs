use serde::Serialize;

/// Point-in-time view of a collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Tracked allocations.
    pub items: usize,
    /// Registry slots.
    pub slots: usize,
    /// Allocation count above which the next automatic collection runs.
    pub threshold: usize,
    pub paused: bool,
    /// Completed mark/sweep cycles.
    pub collections: usize,
    /// Allocations reclaimed by sweeps so far.
    pub reclaimed: usize,
    /// Allocation bodies scanned by the most recent mark phase.
    pub last_scanned: usize,
    /// Lowest address ever tracked, 0 before the first one.
    pub heap_start: usize,
    /// Upper bound of every extent ever tracked.
    pub heap_end: usize,
}
