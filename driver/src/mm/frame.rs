use std::alloc::{alloc_zeroed, Layout};

use bitmap_allocator::BitAlloc;
use peregrine::Paddr;
use spin::Mutex;

use super::{align_down, align_up, pages, PAGE_SIZE};
use crate::config::{PHYS_MEMORY_BASE, PHYS_MEMORY_END};

// Support max 64K * 4096 = 256M memory.
type FrameAlloc = bitmap_allocator::BitAlloc64K;

static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::empty());

lazy_static::lazy_static! {
    /// Host memory standing in for `[PHYS_MEMORY_BASE, PHYS_MEMORY_END)`.
    static ref ARENA: Arena = Arena::new();
}

struct Arena {
    host_base: usize,
}

impl Arena {
    fn new() -> Self {
        let start = align_up(PHYS_MEMORY_BASE, PAGE_SIZE);
        let end = align_down(PHYS_MEMORY_END, PAGE_SIZE);
        let layout = Layout::from_size_align(end - start, PAGE_SIZE)
            .unwrap_or_else(|_| panic!("bad physical memory layout"));
        // SAFETY: the layout has a non-zero size.
        let host_base = unsafe { alloc_zeroed(layout) } as usize;
        if host_base == 0 {
            panic!("cannot back {:#x} bytes of physical memory", end - start);
        }
        info!(
            "Initializing frame allocator at: [{:#x?}, {:#x?}) -> host {:#x}",
            start, end, host_base
        );
        FRAME_ALLOCATOR.lock().init(start, end - start);
        Self { host_base }
    }
}

struct FrameAllocator {
    base: usize,
    pages: usize,
    inner: FrameAlloc,
}

impl FrameAllocator {
    const fn empty() -> Self {
        Self {
            base: 0,
            pages: 0,
            inner: FrameAlloc::DEFAULT,
        }
    }

    fn init(&mut self, base: usize, size: usize) {
        self.base = align_up(base, PAGE_SIZE);
        self.pages = pages(size);
        self.inner.insert(0..self.pages);
    }

    /// First fit for `count` pages whose frame number is a multiple of
    /// `align`.
    fn alloc_contiguous(&mut self, count: usize, align: usize) -> Option<usize> {
        let align = align.max(1);
        let base_pfn = self.base / PAGE_SIZE;
        let mut start = 0;
        while start + count <= self.pages {
            let first_free = self.inner.next(start)?;
            let candidate = (base_pfn + first_free).next_multiple_of(align) - base_pfn;
            if candidate + count > self.pages {
                return None;
            }
            match (candidate..candidate + count).find(|&i| !self.inner.test(i)) {
                Some(used) => start = used + 1,
                None => {
                    self.inner.remove(candidate..candidate + count);
                    let ret = candidate * PAGE_SIZE + self.base;
                    trace!("Allocate {} frames: {:#x}", count, ret);
                    return Some(ret);
                }
            }
        }
        None
    }

    fn dealloc(&mut self, target: usize, count: usize) {
        trace!("Deallocate {} frames: {:#x}", count, target);
        let first = (target - self.base) / PAGE_SIZE;
        for idx in first..first + count {
            self.inner.dealloc(idx);
        }
    }
}

pub fn alloc_pages(count: usize, align: usize) -> Option<Paddr> {
    lazy_static::initialize(&ARENA);
    FRAME_ALLOCATOR
        .lock()
        .alloc_contiguous(count, align)
        .map(Paddr::new)
}

pub fn dealloc_pages(paddr: Paddr, count: usize) {
    FRAME_ALLOCATOR.lock().dealloc(paddr.addr(), count)
}

pub fn phys_to_virt(paddr: Paddr) -> *mut u8 {
    (paddr.addr() - PHYS_MEMORY_BASE + ARENA.host_base) as *mut u8
}

pub fn virt_to_phys(vaddr: *const u8) -> Paddr {
    Paddr::new(vaddr as usize - ARENA.host_base + PHYS_MEMORY_BASE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_and_aligned() {
        let pa = alloc_pages(4, 2).unwrap();
        assert_eq!(pa.addr() / PAGE_SIZE % 2, 0);
        assert!(pa.addr() >= PHYS_MEMORY_BASE && pa.addr() + 4 * PAGE_SIZE <= PHYS_MEMORY_END);

        let ptr = phys_to_virt(pa);
        assert_eq!(virt_to_phys(ptr), pa);
        // SAFETY: the pages were just allocated.
        unsafe { ptr.add(4 * PAGE_SIZE - 1).write(0xaa) };
        dealloc_pages(pa, 4);
    }
}
