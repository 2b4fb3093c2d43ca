use std::marker::PhantomData;
use std::ptr::NonNull;

use cgc_malloc::{Malloc, RawAlloc};

use crate::mark::{HeapBounds, Marker};
use crate::record::Record;
use crate::registry::Registry;
use crate::{sweep, Destructor, Flags, GcConfig, GcError, Stats};

/// A conservative mark-and-sweep collector over blocks from `A`.
///
/// Allocations are found live if a root allocation, the stack between the
/// current frame and the stack bottom given at start, or another live
/// allocation holds a word equal to their address. Collection runs
/// synchronously inside allocation calls once the number of tracked
/// allocations passes a threshold, or explicitly through [`Collector::run`].
///
/// Memory handed out by a collector must only be released through it. A
/// collector belongs to the thread that started it.
pub struct Collector<A: RawAlloc = Malloc> {
    allocator: A,
    config: GcConfig,
    registry: Registry,
    stack_bottom: Option<usize>,
    paused: bool,
    bounds: HeapBounds,
    threshold: usize,
    collections: usize,
    reclaimed: usize,
    last_scanned: usize,
    stopped: bool,
    _thread: PhantomData<*mut ()>,
}

impl Collector<Malloc> {
    /// Starts a collector on the C heap with the default configuration.
    ///
    /// `stack_bottom` should be the address of a local in the outermost frame
    /// that will hold pointers to collected memory, usually in `main`. A null
    /// bottom turns stack scanning off, leaving only root allocations as
    /// sources of reachability.
    pub fn start(stack_bottom: *const u8) -> Self {
        Self::new(stack_bottom, GcConfig::default(), Malloc)
    }

    /// Like [`Collector::start`] with an explicit configuration, rejected with
    /// [`GcError::InvalidConfig`] if it does not validate.
    pub fn with_config(stack_bottom: *const u8, config: GcConfig) -> Result<Self, GcError> {
        Self::with_allocator(stack_bottom, config, Malloc)
    }
}

impl<A: RawAlloc> Collector<A> {
    /// Starts a collector that takes its blocks from `allocator`.
    ///
    /// Blocks must be word aligned and readable for their full size, as the
    /// [`RawAlloc`] contract requires, since marking reads them word by word.
    /// Fails with [`GcError::InvalidConfig`] if `config` does not validate.
    pub fn with_allocator(stack_bottom: *const u8, config: GcConfig, allocator: A) -> Result<Self, GcError> {
        config.validate()?;
        Ok(Self::new(stack_bottom, config, allocator))
    }

    fn new(stack_bottom: *const u8, config: GcConfig, allocator: A) -> Self {
        let stack_bottom = (!stack_bottom.is_null()).then_some(stack_bottom as usize);

        log::debug!(
            "collector started (stack bottom {:?}, load factor {}, sweep factor {})",
            stack_bottom.map(|b| format!("{b:#x}")),
            config.load_factor,
            config.sweep_factor,
        );

        Self {
            allocator,
            config,
            registry: Registry::new(),
            stack_bottom,
            paused: false,
            bounds: HeapBounds::EMPTY,
            threshold: 0,
            collections: 0,
            reclaimed: 0,
            last_scanned: 0,
            stopped: false,
            _thread: PhantomData,
        }
    }

    /// Reclaims every allocation that is not a root and releases the
    /// registry. Root allocations stay allocated.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.sweep();

        if self.registry.len() > 0 {
            log::debug!("collector stopped with {} root allocations left", self.registry.len());
        }

        self.registry.release_storage();
    }

    /// Allocates `size` bytes with no flags and no destructor. See
    /// [`Collector::allocate_with`].
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, GcError> {
        self.allocate_with(size, Flags::empty(), None)
    }

    /// Allocates `size` bytes tracked with `flags` and `destructor`.
    ///
    /// This may run a full collection before returning. The new allocation
    /// always survives the collection it triggers.
    pub fn allocate_with(
        &mut self,
        size: usize,
        flags: Flags,
        destructor: Option<Destructor>,
    ) -> Result<NonNull<u8>, GcError> {
        let ptr = self.allocator.alloc(size).ok_or(GcError::OutOfMemory { size })?;
        self.register(ptr, size, flags, destructor)
    }

    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, GcError> {
        self.allocate_zeroed_with(count, size, Flags::empty(), None)
    }

    pub fn allocate_zeroed_with(
        &mut self,
        count: usize,
        size: usize,
        flags: Flags,
        destructor: Option<Destructor>,
    ) -> Result<NonNull<u8>, GcError> {
        let bytes = count.checked_mul(size).ok_or(GcError::OutOfMemory { size: usize::MAX })?;
        let ptr = self
            .allocator
            .alloc_zeroed(count, size)
            .ok_or(GcError::OutOfMemory { size: bytes })?;
        self.register(ptr, bytes, flags, destructor)
    }

    /// Resizes a tracked allocation with C `realloc` semantics.
    ///
    /// A null `ptr` allocates, a zero `size` frees (without running the
    /// destructor) and returns `None`. Flags and destructor follow the
    /// allocation if it moves. On failure the original allocation is left
    /// as it was.
    pub fn resize(&mut self, ptr: *mut u8, size: usize) -> Result<Option<NonNull<u8>>, GcError> {
        let Some(old) = NonNull::new(ptr) else {
            if size == 0 {
                return Ok(None);
            }
            return self.allocate(size).map(Some);
        };

        let address = old.as_ptr() as usize;
        let record = *self.registry.get(address).ok_or(GcError::Untracked(address))?;

        if size == 0 {
            self.registry.remove(address);
            unsafe { self.allocator.free(old) };
            self.adjust_registry();
            return Ok(None);
        }

        let new = unsafe { self.allocator.realloc(old, size) }.ok_or(GcError::OutOfMemory { size })?;

        if new == old {
            if let Some(record) = self.registry.get_mut(address) {
                record.size = size;
            }
            self.bounds.extend(address, size);

            log::trace!("resize {:#x}: {} -> {} bytes in place", address, record.size, size);
            return Ok(Some(new));
        }

        log::trace!("resize {:#x}: moved to {:p}", address, new);

        self.registry.remove(address);
        self.register(new, size, record.flags, record.destructor).map(Some)
    }

    /// Runs the destructor and frees `ptr`. Untracked pointers are ignored.
    pub fn release(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        let address = ptr.as_ptr() as usize;
        let Some(record) = self.registry.get(address).copied() else {
            return;
        };

        if let Some(destructor) = record.destructor {
            destructor(ptr);
        }
        unsafe { self.allocator.free(ptr) };

        self.registry.remove(address);
        self.adjust_registry();

        log::trace!("release {:#x} ({} bytes)", address, record.size);
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Runs a full mark and sweep, paused or not.
    pub fn run(&mut self) {
        self.collect(None);
    }

    /// Reclaims everything that is neither marked nor a root.
    ///
    /// Outside of [`Collector::run`] nothing is marked, so this frees every
    /// allocation that is not a root.
    pub fn sweep(&mut self) {
        if self.registry.len() == 0 {
            return;
        }

        let staged = match sweep::unlink_garbage(&mut self.registry) {
            Ok(staged) => staged,
            Err(err) => {
                log::warn!("sweep skipped: {err}");
                return;
            },
        };

        self.adjust_registry();
        self.threshold = sweep::next_threshold(self.registry.len(), self.config.sweep_factor);
        self.reclaimed += staged.len();

        log::debug!(
            "sweep reclaimed {} allocations, {} live, next collection above {}",
            staged.len(),
            self.registry.len(),
            self.threshold,
        );

        unsafe { sweep::release(&self.allocator, staged) };
    }

    pub fn set_flags(&mut self, ptr: *const u8, flags: Flags) {
        if let Some(record) = self.registry.get_mut(ptr as usize) {
            record.flags = flags.difference(Flags::MARK);
        }
    }

    /// Flags of a tracked allocation, empty for anything else.
    pub fn flags(&self, ptr: *const u8) -> Flags {
        self.registry.get(ptr as usize).map(|r| r.flags).unwrap_or_default()
    }

    pub fn set_destructor(&mut self, ptr: *const u8, destructor: Option<Destructor>) {
        if let Some(record) = self.registry.get_mut(ptr as usize) {
            record.destructor = destructor;
        }
    }

    pub fn destructor(&self, ptr: *const u8) -> Option<Destructor> {
        self.registry.get(ptr as usize).and_then(|r| r.destructor)
    }

    /// Size of a tracked allocation, 0 for anything else.
    pub fn size(&self, ptr: *const u8) -> usize {
        self.registry.get(ptr as usize).map_or(0, |r| r.size)
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.registry.find(ptr as usize).is_some()
    }

    /// Number of tracked allocations.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.len() == 0
    }

    /// Number of registry slots.
    pub fn capacity(&self) -> usize {
        self.registry.capacity()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn stats(&self) -> Stats {
        Stats {
            items: self.registry.len(),
            slots: self.registry.capacity(),
            threshold: self.threshold,
            paused: self.paused,
            collections: self.collections,
            reclaimed: self.reclaimed,
            last_scanned: self.last_scanned,
            heap_start: self.bounds.start(),
            heap_end: self.bounds.end(),
        }
    }

    fn register(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
        flags: Flags,
        destructor: Option<Destructor>,
    ) -> Result<NonNull<u8>, GcError> {
        let address = ptr.as_ptr() as usize;

        self.bounds.extend(address, size);

        if let Err(err) = self.registry.adjust(self.registry.len() + 1, self.config.load_factor) {
            if !self.registry.has_free_slot() {
                unsafe { self.allocator.free(ptr) };
                return Err(err);
            }
            log::warn!("{err}, keeping {} slots", self.registry.capacity());
        }

        let record = Record::new(address, size, flags.difference(Flags::MARK), destructor);
        if !self.registry.insert(record) {
            log::warn!("{:#x} was already tracked; was it freed behind the collector's back?", address);
        }

        log::trace!("allocate {:#x} ({} bytes, {:?})", address, size, flags);

        if !self.paused && self.registry.len() > self.threshold {
            self.collect(Some(address));
        }

        Ok(ptr)
    }

    fn adjust_registry(&mut self) {
        if let Err(err) = self.registry.adjust(self.registry.len(), self.config.load_factor) {
            log::warn!("{err}, keeping {} slots", self.registry.capacity());
        }
    }

    fn collect(&mut self, pinned: Option<usize>) {
        self.mark(pinned);
        self.sweep();
        self.collections += 1;
    }

    fn mark(&mut self, pinned: Option<usize>) {
        if self.registry.len() == 0 {
            self.last_scanned = 0;
            return;
        }

        let mut marker = Marker::new(&mut self.registry, self.bounds);

        if let Some(address) = pinned {
            marker.mark_pinned(address);
        }

        marker.mark_heap();

        if let Some(bottom) = self.stack_bottom {
            // The bottom was taken from a frame that outlives this collector.
            unsafe { marker.mark_stack(bottom) };
        }

        self.last_scanned = marker.scanned();
    }
}

impl<A: RawAlloc> Drop for Collector<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
