use std::ptr::NonNull;

bitflags::bitflags! {
    /// Per-allocation collector flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u8 {
        /// Reached during the current mark phase. Cleared by every sweep.
        const MARK = 0x01;
        /// Always live, never reclaimed by a sweep.
        const ROOT = 0x02;
        /// The body holds no pointers and is never scanned.
        const LEAF = 0x04;
    }
}

/// Called with the allocation's address right before its memory is released.
///
/// A destructor must not call back into the collector that owns the
/// allocation: it runs in the middle of a sweep or a release, and reentrant
/// allocation, release or collection is not supported.
pub type Destructor = fn(NonNull<u8>);

/// Registry entry for one tracked allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Record {
    pub address: usize,
    pub size: usize,
    pub flags: Flags,
    /// Slot the address hashes to; displacement is measured from here.
    pub origin: usize,
    pub destructor: Option<Destructor>,
}

impl Record {
    pub fn new(address: usize, size: usize, flags: Flags, destructor: Option<Destructor>) -> Self {
        Self {
            address,
            size,
            flags,
            origin: 0,
            destructor,
        }
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags.contains(Flags::MARK)
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.flags.contains(Flags::ROOT)
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.flags.contains(Flags::LEAF)
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.flags.intersects(Flags::MARK | Flags::ROOT)
    }

    /// Number of whole words in the body.
    #[inline]
    pub fn words(&self) -> usize {
        self.size / std::mem::size_of::<usize>()
    }

    pub fn ptr(&self) -> NonNull<u8> {
        debug_assert!(self.address != 0);

        // Records are only ever created for addresses handed out by a RawAlloc.
        unsafe { NonNull::new_unchecked(self.address as *mut u8) }
    }
}
