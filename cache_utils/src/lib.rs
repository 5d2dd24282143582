#![deny(unsafe_op_in_unsafe_fn)]

pub mod affinity;
pub mod frames;
pub mod mmap;

use core::ptr;
use static_assertions::const_assert_eq;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_LEN: usize = 1 << PAGE_SHIFT;

const_assert_eq!(PAGE_LEN, 4096);

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as arch_x86;

// rdtsc no fence
#[cfg(target_arch = "x86_64")]
pub unsafe fn rdtsc_nofence() -> u64 {
    unsafe { arch_x86::_rdtsc() }
}
// rdtsc (has mfence before and after)
#[cfg(target_arch = "x86_64")]
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe { arch_x86::_mm_mfence() };
    let tsc: u64 = unsafe { arch_x86::_rdtsc() };
    unsafe { arch_x86::_mm_mfence() };
    tsc
}

// Without a timestamp counter, fall back on the monotonic clock in nanoseconds.
#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn rdtsc_nofence() -> u64 {
    use nix::time::{clock_gettime, ClockId};
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn rdtsc_fence() -> u64 {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    let t = unsafe { rdtsc_nofence() };
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    t
}

/// # Safety
///
/// p must be a valid pointer to read.
pub unsafe fn maccess<T>(p: *const T) {
    unsafe { ptr::read_volatile(p) };
}

pub fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_LEN - 1) == 0
}
