use crate::registry::Registry;
use crate::{stack, Flags};

/// Address range covering every tracked allocation.
///
/// Both ends are stored as odd values. Tracked blocks are word aligned, so
/// neither bound can ever equal a block address, and copies of the bounds
/// lying in scanned stack frames are never taken for references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeapBounds {
    /// One below the lowest tracked address.
    floor: usize,
    /// At or past the end of the highest tracked extent.
    ceiling: usize,
}

impl HeapBounds {
    pub const EMPTY: Self = Self {
        floor: usize::MAX,
        ceiling: 0,
    };

    pub fn extend(&mut self, address: usize, size: usize) {
        debug_assert!(address % 2 == 0, "unaligned block {address:#x}");

        self.floor = self.floor.min(address.wrapping_sub(1));
        self.ceiling = self.ceiling.max(address.saturating_add(size) | 1);
    }

    #[inline]
    pub fn contains(&self, candidate: usize) -> bool {
        candidate > self.floor && candidate <= self.ceiling
    }

    /// Lowest tracked address, 0 before the first allocation.
    pub fn start(&self) -> usize {
        self.floor.wrapping_add(1)
    }

    pub fn end(&self) -> usize {
        self.ceiling
    }
}

/// Marks everything reachable from roots, the stack and pinned addresses.
///
/// Reached allocations are queued on a work list instead of being scanned
/// recursively, so the native stack does not grow with the object graph. The
/// MARK bit is set when an allocation is queued, which keeps every body from
/// being scanned more than once per cycle.
pub(crate) struct Marker<'r> {
    registry: &'r mut Registry,
    bounds: HeapBounds,
    pending: Vec<(usize, usize)>,
    scanned: usize,
}

impl<'r> Marker<'r> {
    pub fn new(registry: &'r mut Registry, bounds: HeapBounds) -> Self {
        Self {
            registry,
            bounds,
            pending: Vec::new(),
            scanned: 0,
        }
    }

    /// Number of allocation bodies scanned so far.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    pub fn mark_heap(&mut self) {
        for index in 0..self.registry.capacity() {
            let Some(record) = self.registry.slot_mut(index) else {
                continue;
            };

            if !record.is_root() || record.is_marked() {
                continue;
            }

            record.flags.insert(Flags::MARK);
            if !record.is_leaf() {
                self.pending.push((record.address, record.words()));
            }

            self.drain();
        }
    }

    /// Scans the calling thread's stack down to `bottom`.
    ///
    /// # Safety
    ///
    /// See [`stack::scan`].
    pub unsafe fn mark_stack(&mut self, bottom: usize) {
        stack::scan(bottom, &mut |word| self.mark_pointer(word));
        self.drain();
    }

    /// Treats `address` as reachable, along with everything it points to.
    pub fn mark_pinned(&mut self, address: usize) {
        self.mark_pointer(address);
        self.drain();
    }

    fn mark_pointer(&mut self, candidate: usize) {
        if !self.bounds.contains(candidate) {
            return;
        }

        let Some(record) = self.registry.get_mut(candidate) else {
            return;
        };

        if record.is_marked() {
            return;
        }

        record.flags.insert(Flags::MARK);
        if !record.is_leaf() {
            self.pending.push((record.address, record.words()));
        }
    }

    fn drain(&mut self) {
        while let Some((address, words)) = self.pending.pop() {
            self.scanned += 1;

            let body = address as *const usize;
            for index in 0..words {
                // Bodies are live RawAlloc blocks, readable for their full size.
                let candidate = unsafe { std::ptr::read_volatile(body.add(index)) };
                self.mark_pointer(candidate);
            }
        }
    }
}
