use std::cell::{Cell, RefCell};
use std::hint::black_box;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use crate::{Collector, Flags, GcConfig, GcError, Malloc, RawAlloc};

thread_local! {
    static DESTROYED: RefCell<Vec<(usize, usize)>> = RefCell::new(Vec::new());
}

/// Records the address and the first word of every destroyed allocation.
fn record_destroy(ptr: NonNull<u8>) {
    let first = unsafe { ptr.as_ptr().cast::<usize>().read() };
    DESTROYED.with(|d| d.borrow_mut().push((ptr.as_ptr() as usize, first)));
}

fn take_destroyed() -> Vec<(usize, usize)> {
    DESTROYED.with(|d| std::mem::take(&mut *d.borrow_mut()))
}

fn destroyed() -> Vec<usize> {
    let mut addresses: Vec<usize> = take_destroyed().into_iter().map(|(a, _)| a).collect();
    addresses.sort();
    addresses
}

fn sorted(ptrs: &[NonNull<u8>]) -> Vec<usize> {
    let mut addresses: Vec<usize> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
    addresses.sort();
    addresses
}

/// A paused collector that only treats root allocations as reachable.
fn heap_only() -> Collector {
    let mut gc = Collector::start(ptr::null());
    gc.pause();
    gc
}

/// A zeroed allocation of `words` words that reports its destruction.
fn object(gc: &mut Collector, flags: Flags, words: usize) -> NonNull<u8> {
    gc.allocate_zeroed_with(words, size_of::<usize>(), flags, Some(record_destroy))
        .unwrap()
}

fn store(ptr: NonNull<u8>, index: usize, value: usize) {
    unsafe { ptr.as_ptr().cast::<usize>().add(index).write(value) }
}

fn link(from: NonNull<u8>, index: usize, to: NonNull<u8>) {
    store(from, index, to.as_ptr() as usize);
}

fn load(ptr: NonNull<u8>, index: usize) -> usize {
    unsafe { ptr.as_ptr().cast::<usize>().add(index).read() }
}

/// Hands out C heap memory until told to fail.
#[derive(Default)]
struct Flaky {
    fail: Cell<bool>,
}

unsafe impl RawAlloc for Flaky {
    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if self.fail.get() { None } else { Malloc.alloc(size) }
    }

    fn alloc_zeroed(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        if self.fail.get() { None } else { Malloc.alloc_zeroed(count, size) }
    }

    unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        if self.fail.get() { None } else { Malloc.realloc(ptr, size) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        Malloc.free(ptr)
    }
}

#[test]
fn allocate_release_round_trip() {
    let mut gc = heap_only();

    let blocks: Vec<NonNull<u8>> = (0..100).map(|i| gc.allocate(16 + i).unwrap()).collect();
    assert_eq!(gc.len(), 100);
    assert!(gc.capacity() >= 100);

    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(gc.size(block.as_ptr()), 16 + i);
        gc.release(block.as_ptr());
    }

    assert_eq!(gc.len(), 0);
    assert_eq!(gc.capacity(), 5);
}

#[test]
fn root_chain_survives_then_cascades() {
    let mut gc = heap_only();
    let a = object(&mut gc, Flags::ROOT, 2);
    let b = object(&mut gc, Flags::empty(), 2);
    let c = object(&mut gc, Flags::LEAF, 2);
    link(a, 0, b);
    link(b, 1, c);

    gc.run();

    assert_eq!(gc.len(), 3);
    assert!(destroyed().is_empty());
    assert_eq!(gc.flags(a.as_ptr()), Flags::ROOT);
    assert_eq!(gc.flags(b.as_ptr()), Flags::empty());
    assert_eq!(gc.flags(c.as_ptr()), Flags::LEAF);

    gc.set_flags(a.as_ptr(), Flags::empty());
    gc.run();

    assert_eq!(gc.len(), 0);
    assert_eq!(destroyed(), sorted(&[a, b, c]));
}

#[test]
fn unreachable_allocation_is_destroyed_once_before_free() {
    let mut gc = heap_only();
    let keep = object(&mut gc, Flags::ROOT, 1);
    let lost = object(&mut gc, Flags::empty(), 1);
    store(lost, 0, 0xfeed);

    gc.run();

    assert_eq!(take_destroyed(), vec![(lost.as_ptr() as usize, 0xfeed)]);
    assert!(!gc.contains(lost.as_ptr()));
    assert!(gc.contains(keep.as_ptr()));

    gc.run();
    assert!(take_destroyed().is_empty());

    gc.release(keep.as_ptr());
}

#[test]
fn roots_survive_until_released() {
    let mut gc = heap_only();
    let root = object(&mut gc, Flags::ROOT, 4);

    for _ in 0..10 {
        gc.run();
    }

    assert!(destroyed().is_empty());
    assert!(gc.contains(root.as_ptr()));

    gc.release(root.as_ptr());

    assert_eq!(destroyed(), sorted(&[root]));
    assert_eq!(gc.len(), 0);
}

#[test]
fn leaf_bodies_are_never_scanned() {
    let mut gc = heap_only();
    let leaf = object(&mut gc, Flags::ROOT | Flags::LEAF, 1);
    let child = object(&mut gc, Flags::empty(), 1);
    link(leaf, 0, child);

    gc.run();

    assert_eq!(destroyed(), sorted(&[child]));
    assert!(gc.contains(leaf.as_ptr()));
    assert_eq!(gc.stats().last_scanned, 0);

    gc.release(leaf.as_ptr());
}

#[test]
fn shared_allocation_is_scanned_once() {
    let mut gc = heap_only();
    let a = object(&mut gc, Flags::ROOT, 2);
    let c = object(&mut gc, Flags::ROOT, 1);
    let b = object(&mut gc, Flags::empty(), 1);
    let d = object(&mut gc, Flags::LEAF, 1);
    link(a, 0, b);
    link(a, 1, b);
    link(c, 0, b);
    link(b, 0, d);

    gc.run();

    assert_eq!(gc.len(), 4);
    assert_eq!(gc.stats().last_scanned, 3);

    gc.release(a.as_ptr());
    gc.release(c.as_ptr());
}

#[test]
fn unreachable_cycles_are_reclaimed() {
    let mut gc = heap_only();
    let a = object(&mut gc, Flags::empty(), 1);
    let b = object(&mut gc, Flags::empty(), 1);
    link(a, 0, b);
    link(b, 0, a);

    gc.run();

    assert_eq!(gc.len(), 0);
    assert_eq!(destroyed(), sorted(&[a, b]));
}

#[test]
fn deep_chains_do_not_recurse() {
    let mut gc = heap_only();
    let nodes: Vec<NonNull<u8>> = (0..50_000)
        .map(|i| object(&mut gc, if i == 0 { Flags::ROOT } else { Flags::empty() }, 1))
        .collect();
    for pair in nodes.windows(2) {
        link(pair[0], 0, pair[1]);
    }

    gc.run();
    assert_eq!(gc.len(), nodes.len());
    assert!(take_destroyed().is_empty());

    gc.set_flags(nodes[0].as_ptr(), Flags::empty());
    gc.run();
    assert_eq!(gc.len(), 0);
    assert_eq!(take_destroyed().len(), nodes.len());
}

#[test]
fn automatic_collection_follows_threshold() {
    let mut gc = Collector::start(ptr::null());
    let mut roots = Vec::new();
    let mut threshold = 0;
    let mut collections = 0;

    for n in 1..=40 {
        roots.push(gc.allocate_with(8, Flags::ROOT, None).unwrap());

        if n > threshold {
            collections += 1;
            threshold = n + n / 2 + 1;
        }

        assert_eq!(gc.stats().collections, collections, "after {n} allocations");
        assert_eq!(gc.threshold(), threshold, "after {n} allocations");
    }

    for root in roots {
        gc.release(root.as_ptr());
    }
}

#[test]
fn fresh_allocation_survives_its_own_collection() {
    let mut gc = Collector::start(ptr::null());

    let first = gc.allocate(32).unwrap();

    assert_eq!(gc.stats().collections, 1);
    assert!(gc.contains(first.as_ptr()));
}

#[test]
fn pause_only_stops_automatic_collection() {
    let mut gc = Collector::start(ptr::null());
    gc.pause();
    assert!(gc.is_paused());

    for _ in 0..50 {
        object(&mut gc, Flags::empty(), 1);
    }
    assert_eq!(gc.len(), 50);
    assert_eq!(gc.stats().collections, 0);

    gc.run();
    assert_eq!(gc.len(), 0);
    assert_eq!(gc.stats().collections, 1);
    assert_eq!(gc.stats().reclaimed, 50);
    assert_eq!(destroyed().len(), 50);

    gc.resume();
    assert!(!gc.is_paused());
}

#[test]
fn resize_rejects_untracked_addresses() {
    let mut gc = heap_only();
    let kept = gc.allocate(8).unwrap();
    let mut local = [0u8; 16];

    let err = gc.resize(local.as_mut_ptr(), 32).unwrap_err();

    assert_eq!(err, GcError::Untracked(local.as_ptr() as usize));
    assert_eq!(gc.len(), 1);
    assert!(gc.contains(kept.as_ptr()));
}

#[test]
fn resize_to_zero_frees_without_destructor() {
    let mut gc = heap_only();
    let block = object(&mut gc, Flags::ROOT, 2);

    assert_eq!(gc.resize(block.as_ptr(), 0), Ok(None));

    assert_eq!(gc.size(block.as_ptr()), 0);
    assert_eq!(gc.len(), 0);
    assert!(destroyed().is_empty());
}

#[test]
fn resize_null_allocates() {
    let mut gc = heap_only();

    assert_eq!(gc.resize(ptr::null_mut(), 0), Ok(None));
    assert_eq!(gc.len(), 0);

    let block = gc.resize(ptr::null_mut(), 48).unwrap().unwrap();
    assert_eq!(gc.size(block.as_ptr()), 48);
    assert_eq!(gc.flags(block.as_ptr()), Flags::empty());
    assert_eq!(gc.len(), 1);
}

#[test]
fn resize_keeps_contents_and_metadata() {
    let mut gc = heap_only();
    let block = object(&mut gc, Flags::ROOT, 2);
    store(block, 0, 0xabc);

    let grown = gc.resize(block.as_ptr(), 1 << 16).unwrap().unwrap();

    assert_eq!(gc.len(), 1);
    assert_eq!(gc.size(grown.as_ptr()), 1 << 16);
    assert_eq!(gc.flags(grown.as_ptr()), Flags::ROOT);
    assert!(gc.destructor(grown.as_ptr()).is_some());
    assert_eq!(load(grown, 0), 0xabc);
    if grown != block {
        assert!(!gc.contains(block.as_ptr()));
    }

    let shrunk = gc.resize(grown.as_ptr(), 8).unwrap().unwrap();
    assert_eq!(gc.size(shrunk.as_ptr()), 8);
    assert_eq!(load(shrunk, 0), 0xabc);

    gc.release(shrunk.as_ptr());
    assert_eq!(take_destroyed(), vec![(shrunk.as_ptr() as usize, 0xabc)]);
}

#[test]
fn failed_allocation_registers_nothing() {
    let flaky = Flaky::default();
    let mut gc = Collector::with_allocator(ptr::null(), GcConfig::default(), &flaky).unwrap();
    let kept = gc.allocate(8).unwrap();

    flaky.fail.set(true);

    assert_eq!(gc.allocate(64), Err(GcError::OutOfMemory { size: 64 }));
    assert_eq!(gc.allocate_zeroed(4, 16), Err(GcError::OutOfMemory { size: 64 }));
    assert_eq!(gc.len(), 1);

    flaky.fail.set(false);
    gc.release(kept.as_ptr());
}

#[test]
fn failed_resize_keeps_the_original() {
    let flaky = Flaky::default();
    let mut gc = Collector::with_allocator(ptr::null(), GcConfig::default(), &flaky).unwrap();
    gc.pause();
    let block = gc.allocate_with(16, Flags::LEAF, None).unwrap();
    store(block, 1, 77);

    flaky.fail.set(true);
    let err = gc.resize(block.as_ptr(), 1 << 20).unwrap_err();
    flaky.fail.set(false);

    assert_eq!(err, GcError::OutOfMemory { size: 1 << 20 });
    assert!(gc.contains(block.as_ptr()));
    assert_eq!(gc.size(block.as_ptr()), 16);
    assert_eq!(gc.flags(block.as_ptr()), Flags::LEAF);
    assert_eq!(load(block, 1), 77);
}

#[test]
fn zeroed_allocations() {
    let mut gc = heap_only();

    let block = gc.allocate_zeroed(16, 8).unwrap();
    assert_eq!(gc.size(block.as_ptr()), 128);
    assert!((0..16).all(|i| load(block, i) == 0));

    assert_eq!(
        gc.allocate_zeroed(usize::MAX, 2),
        Err(GcError::OutOfMemory { size: usize::MAX })
    );
    assert_eq!(gc.len(), 1);
}

#[test]
fn accessors_on_untracked_addresses() {
    let mut gc = heap_only();
    let bogus = 0x1234 as *const u8;

    assert_eq!(gc.flags(bogus), Flags::empty());
    assert!(gc.destructor(bogus).is_none());
    assert_eq!(gc.size(bogus), 0);

    gc.set_flags(bogus, Flags::ROOT);
    gc.set_destructor(bogus, Some(record_destroy));
    gc.release(bogus as *mut u8);
    gc.release(ptr::null_mut());

    let block = gc.allocate(8).unwrap();
    gc.set_flags(bogus, Flags::ROOT);
    assert_eq!(gc.len(), 1);
    assert_eq!(gc.flags(block.as_ptr()), Flags::empty());
}

#[test]
fn metadata_setters() {
    let mut gc = heap_only();
    let block = gc.allocate(8).unwrap();
    store(block, 0, 5);

    gc.set_flags(block.as_ptr(), Flags::MARK | Flags::ROOT);
    assert_eq!(gc.flags(block.as_ptr()), Flags::ROOT);

    gc.set_destructor(block.as_ptr(), Some(record_destroy));
    assert!(gc.destructor(block.as_ptr()).is_some());
    gc.set_destructor(block.as_ptr(), None);
    assert!(gc.destructor(block.as_ptr()).is_none());

    gc.set_destructor(block.as_ptr(), Some(record_destroy));
    gc.release(block.as_ptr());
    assert_eq!(take_destroyed(), vec![(block.as_ptr() as usize, 5)]);
}

#[test]
fn stop_reclaims_everything_but_roots() {
    let mut gc = heap_only();
    let root = object(&mut gc, Flags::ROOT, 1);
    let a = object(&mut gc, Flags::empty(), 1);
    let b = object(&mut gc, Flags::LEAF, 1);
    link(root, 0, a);

    gc.stop();

    assert_eq!(destroyed(), sorted(&[a, b]));
    unsafe { Malloc.free(root) };
}

#[test]
fn drop_shuts_down() {
    let lost = {
        let mut gc = heap_only();
        object(&mut gc, Flags::empty(), 1)
    };

    assert_eq!(destroyed(), sorted(&[lost]));
}

#[test]
fn invalid_config_is_rejected() {
    let config = GcConfig { load_factor: 2.0, ..GcConfig::default() };
    assert!(matches!(
        Collector::with_config(ptr::null(), config),
        Err(GcError::InvalidConfig(_))
    ));
}

#[test]
fn custom_load_factor_sizes_registry() {
    let config = GcConfig { load_factor: 0.5, ..GcConfig::default() };
    let mut gc = Collector::with_config(ptr::null(), config).unwrap();
    gc.pause();

    for _ in 0..10 {
        gc.allocate(8).unwrap();
    }

    // ceil(11 / 0.5) = 22
    assert_eq!(gc.capacity(), 23);
}

#[test]
fn stats_serialize() {
    let mut gc = heap_only();
    gc.allocate(8).unwrap();

    let json = serde_json::to_value(gc.stats()).unwrap();

    assert_eq!(json["items"], 1);
    assert_eq!(json["slots"], 5);
    assert_eq!(json["paused"], true);
}

#[inline(never)]
fn held_on_stack(gc: &mut Collector) -> bool {
    let block = gc.allocate(32).unwrap();
    let held = black_box(block);
    let pinned = black_box(&held);

    gc.run();

    let alive = gc.contains(held.as_ptr());
    black_box(pinned);
    alive
}

#[test]
fn stack_references_keep_allocations_alive() {
    let anchor = 0usize;
    let mut gc = Collector::start(black_box(&anchor) as *const usize as *const u8);
    gc.pause();

    assert!(held_on_stack(&mut gc));
}

#[test]
fn stack_scan_reaches_through_heap() {
    let anchor = 0usize;
    let mut gc = Collector::start(black_box(&anchor) as *const usize as *const u8);
    gc.pause();

    let child = gc.allocate_with(8, Flags::LEAF, None).unwrap();
    let child_address = child.as_ptr() as usize;
    let parent = gc.allocate(8).unwrap();
    store(parent, 0, child_address);
    let parent = black_box(parent);
    let pinned = black_box(&parent);

    gc.run();

    assert!(gc.contains(child_address as *const u8));
    black_box(pinned);
}

/// Keeps addresses in a form no scan can mistake for a reference.
const MASK: usize = 0x5a5a_5a5a_5a5a_5a5a;

#[inline(never)]
fn scatter_leaves(gc: &mut Collector, count: usize) -> Vec<usize> {
    (0..count)
        .map(|_| object(gc, Flags::LEAF, 2).as_ptr() as usize ^ MASK)
        .collect()
}

#[inline(never)]
fn clobber_stack() {
    let mut junk = [0usize; 4096];
    black_box(&mut junk);
}

#[test]
fn stack_scan_reclaims_unreferenced_allocations() {
    let anchor = 0usize;
    let mut gc = Collector::start(black_box(&anchor) as *const usize as *const u8);
    gc.pause();

    let masked = scatter_leaves(&mut gc, 16);
    clobber_stack();

    gc.run();

    assert_eq!(gc.len(), 0);
    let mut expected: Vec<usize> = masked.iter().map(|a| a ^ MASK).collect();
    expected.sort();
    assert_eq!(destroyed(), expected);
}
