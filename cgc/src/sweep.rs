use std::mem::size_of;

use cgc_malloc::RawAlloc;

use crate::record::Record;
use crate::registry::Registry;
use crate::GcError;

/// Unlinks every record that is neither marked nor a root and returns them in
/// the order they were found. MARK bits of the survivors are cleared.
///
/// If the staging list cannot be allocated nothing is unlinked and the marks
/// are still cleared.
pub(crate) fn unlink_garbage(registry: &mut Registry) -> Result<Vec<Record>, GcError> {
    let garbage = registry.iter().filter(|record| !record.is_live()).count();

    let mut staged = Vec::new();
    if staged.try_reserve_exact(garbage).is_err() {
        registry.clear_marks();
        return Err(GcError::OutOfMemory {
            size: garbage * size_of::<Record>(),
        });
    }

    let mut index = 0;
    while index < registry.capacity() {
        let dead = registry.slot(index).is_some_and(|record| !record.is_live());
        if !dead {
            index += 1;
            continue;
        }

        // The backward shift may pull an unvisited record into this slot, so
        // look at it again.
        if let Some(record) = registry.remove_at(index) {
            staged.push(record);
        }
    }

    // Survivors that wrapped around from the front were checked twice, so
    // marks can only go once everything is unlinked.
    registry.clear_marks();

    Ok(staged)
}

/// Number of tracked allocations above which the next automatic collection
/// runs, given `live` survivors.
pub(crate) fn next_threshold(live: usize, sweep_factor: f64) -> usize {
    live + (live as f64 * sweep_factor) as usize + 1
}

/// Runs destructors and returns memory for unlinked records, in order.
///
/// # Safety
///
/// Every record must describe a live block from `allocator` that nothing
/// else will free.
pub(crate) unsafe fn release<A: RawAlloc>(allocator: &A, staged: Vec<Record>) {
    for record in staged {
        let ptr = record.ptr();
        if let Some(destructor) = record.destructor {
            destructor(ptr);
        }
        allocator.free(ptr);
    }
}
