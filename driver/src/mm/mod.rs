//! Simulated physical memory backing the core's page pool and VM RAM.

pub mod frame;

pub use peregrine::config::PAGE_SIZE;

/// Rounds `addr` down to a multiple of `align`, a power of two.
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

pub const fn align_up(addr: usize, align: usize) -> usize {
    align_down(addr + align - 1, align)
}

/// Pages needed to hold `bytes`.
pub const fn pages(bytes: usize) -> usize {
    align_up(bytes, PAGE_SIZE) / PAGE_SIZE
}
