//! Conservative scanning of the native call stack.
//!
//! Everything in here reads raw stack memory as `usize` words. Callee-saved
//! registers are stored into a buffer on the scanning frame first, so pointers
//! that only live in registers are seen by the walk as well.

use std::hint::black_box;
use std::mem::size_of;

#[cfg(target_arch = "x86_64")]
const REGISTER_COUNT: usize = 8;
#[cfg(target_arch = "aarch64")]
const REGISTER_COUNT: usize = 12;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const REGISTER_COUNT: usize = 0;

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn spill_registers(registers: &mut [usize; REGISTER_COUNT]) {
    unsafe {
        std::arch::asm!(
            "mov [{0}], rbx",
            "mov [{0} + 8], rbp",
            "mov [{0} + 16], r12",
            "mov [{0} + 24], r13",
            "mov [{0} + 32], r14",
            "mov [{0} + 40], r15",
            "mov [{0} + 48], rsi",
            "mov [{0} + 56], rdi",
            in(reg) registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn spill_registers(registers: &mut [usize; REGISTER_COUNT]) {
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{0}]",
            "stp x21, x22, [{0}, #16]",
            "stp x23, x24, [{0}, #32]",
            "stp x25, x26, [{0}, #48]",
            "stp x27, x28, [{0}, #64]",
            "stp x29, x30, [{0}, #80]",
            in(reg) registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
}

// No inline assembly here; the non-inlined frames below still make the
// compiler save live callee-saved registers to the stack before calling in.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn spill_registers(_registers: &mut [usize; REGISTER_COUNT]) {}

/// Passes every word between the current top of the stack and `bottom` to
/// `visit`, after spilling callee-saved registers into this frame.
///
/// # Safety
///
/// `bottom` must be an address inside the calling thread's stack, at or
/// beyond the frame of every function whose locals should be seen.
#[inline(never)]
pub(crate) unsafe fn scan(bottom: usize, visit: &mut dyn FnMut(usize)) {
    let mut registers = [0usize; REGISTER_COUNT];
    spill_registers(&mut registers);
    black_box(&mut registers);

    walk(bottom, visit);

    black_box(&registers);
}

#[inline(never)]
unsafe fn walk(bottom: usize, visit: &mut dyn FnMut(usize)) {
    let marker = 0usize;
    let top = black_box(&marker) as *const usize as usize;

    // The stack grows down on every mainstream target, but nothing here
    // depends on it.
    let (low, high) = if top < bottom { (top, bottom) } else { (bottom, top) };

    let word = size_of::<usize>();
    let mut cursor = (low + word - 1) & !(word - 1);

    log::trace!("stack walk {:#x}..={:#x} ({} words)", low, high, (high - low) / word);

    while cursor <= high {
        visit(std::ptr::read_volatile(cursor as *const usize));
        cursor += word;
    }
}
