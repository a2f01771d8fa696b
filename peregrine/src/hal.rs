use crate::Paddr;

/// The interfaces which the underlying platform must implement.
pub trait PgHal: Sized + Send + Sync + 'static {
    /// Allocates `count` contiguous physical pages, returns the physical
    /// address of the first one.
    fn alloc_pages(count: usize) -> Option<Paddr>;
    /// Deallocates pages obtained from [`PgHal::alloc_pages`].
    fn dealloc_pages(paddr: Paddr, count: usize);
    /// Converts a physical address to a pointer the hypervisor can access.
    fn phys_to_virt(paddr: Paddr) -> *mut u8;
    /// Converts a pointer back to the corresponding physical address.
    fn virt_to_phys(ptr: *const u8) -> Paddr;
    /// Monotonic platform time in nanoseconds, used for vCPU timer deadlines.
    fn current_time_nanos() -> u64;
}

/// Simulated physical memory backed by one host allocation, for tests of
/// this crate and of its users.
#[cfg(any(test, feature = "test-hal"))]
pub mod test_hal {
    use std::alloc::{alloc_zeroed, Layout};
    use std::sync::OnceLock;
    use std::time::Instant;

    use super::PgHal;
    use crate::config::PAGE_SIZE;
    use crate::mm::MPool;
    use crate::Paddr;

    const ARENA_BASE: usize = 0x8000_0000;
    const ARENA_PAGES: usize = 16384;

    struct Arena {
        host: usize,
        frames: MPool,
    }

    fn arena() -> &'static Arena {
        static ARENA: OnceLock<Arena> = OnceLock::new();
        ARENA.get_or_init(|| {
            let layout = Layout::from_size_align(ARENA_PAGES * PAGE_SIZE, PAGE_SIZE)
                .unwrap_or_else(|_| panic!("bad test arena layout"));
            // SAFETY: the layout has a non-zero size.
            let host = unsafe { alloc_zeroed(layout) } as usize;
            if host == 0 {
                panic!("cannot allocate the test arena");
            }
            let frames = MPool::new();
            if !frames.add_chunk(Paddr::new(ARENA_BASE), ARENA_PAGES * PAGE_SIZE) {
                panic!("cannot seed the test arena");
            }
            Arena { host, frames }
        })
    }

    pub struct TestHal;

    impl PgHal for TestHal {
        fn alloc_pages(count: usize) -> Option<Paddr> {
            arena().frames.alloc_contiguous(count, 1)
        }

        fn dealloc_pages(paddr: Paddr, count: usize) {
            for i in 0..count {
                arena().frames.free(paddr.add(i * PAGE_SIZE));
            }
        }

        fn phys_to_virt(paddr: Paddr) -> *mut u8 {
            (paddr.addr() - ARENA_BASE + arena().host) as *mut u8
        }

        fn virt_to_phys(ptr: *const u8) -> Paddr {
            Paddr::new(ptr as usize - arena().host + ARENA_BASE)
        }

        fn current_time_nanos() -> u64 {
            static START: OnceLock<Instant> = OnceLock::new();
            START.get_or_init(Instant::now).elapsed().as_nanos() as u64
        }
    }

    /// A page pool of `pages` pages carved out of the arena. The base is
    /// aligned for concatenated root tables.
    pub fn pool(pages: usize) -> MPool {
        let pool = MPool::new();
        let added = arena()
            .frames
            .alloc_contiguous(pages, 2)
            .map_or(false, |pa| pool.add_chunk(pa, pages * PAGE_SIZE));
        if !added {
            panic!("test arena cannot hold {} more pages", pages);
        }
        pool
    }
}
