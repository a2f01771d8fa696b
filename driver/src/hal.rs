use peregrine::{Paddr, PgHal};

use crate::mm::frame;
use crate::timer;

/// Platform layer for running the core as a host process: physical memory
/// is a host allocation and time is the host's monotonic clock.
pub struct HalImpl;

impl PgHal for HalImpl {
    fn alloc_pages(count: usize) -> Option<Paddr> {
        // Pool chunks hold concatenated root tables.
        frame::alloc_pages(count, 2)
    }

    fn dealloc_pages(paddr: Paddr, count: usize) {
        frame::dealloc_pages(paddr, count)
    }

    fn phys_to_virt(paddr: Paddr) -> *mut u8 {
        frame::phys_to_virt(paddr)
    }

    fn virt_to_phys(ptr: *const u8) -> Paddr {
        frame::virt_to_phys(ptr)
    }

    fn current_time_nanos() -> u64 {
        timer::current_time_nanos()
    }
}
