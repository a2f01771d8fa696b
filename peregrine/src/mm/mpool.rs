use alloc::vec::Vec;

use bitmap_allocator::BitAlloc;
use spin::Mutex;

use crate::addr::{align_up, Paddr};
use crate::config::PAGE_SIZE;

// Up to 4K pages (16 MiB) per chunk; larger ranges are split.
type ChunkMap = bitmap_allocator::BitAlloc4K;

struct Chunk {
    base: Paddr,
    pages: usize,
    free: usize,
    map: ChunkMap,
}

impl Chunk {
    fn new(base: Paddr, pages: usize) -> Self {
        let mut map = ChunkMap::DEFAULT;
        map.insert(0..pages);
        Self {
            base,
            pages,
            free: pages,
            map,
        }
    }

    fn index_of(&self, pa: Paddr) -> Option<usize> {
        if pa < self.base {
            return None;
        }
        let idx = pa.offset_from(self.base) / PAGE_SIZE;
        (idx < self.pages).then_some(idx)
    }

    fn alloc(&mut self) -> Option<Paddr> {
        let idx = self.map.alloc()?;
        self.free -= 1;
        Some(self.base.add(idx * PAGE_SIZE))
    }

    fn alloc_contiguous(&mut self, count: usize, align: usize) -> Option<Paddr> {
        if count > self.free {
            return None;
        }
        let base_pfn = self.base.addr() / PAGE_SIZE;
        let mut start = 0;
        while start + count <= self.pages {
            let first_free = self.map.next(start)?;
            let candidate = align_up(base_pfn + first_free, align) - base_pfn;
            if candidate + count > self.pages {
                return None;
            }
            match (candidate..candidate + count).find(|&i| !self.map.test(i)) {
                Some(used) => start = used + 1,
                None => {
                    self.map.remove(candidate..candidate + count);
                    self.free -= count;
                    return Some(self.base.add(candidate * PAGE_SIZE));
                }
            }
        }
        None
    }

    fn free(&mut self, idx: usize) {
        check!(
            !self.map.test(idx),
            "[PG] double free of page {:#x}",
            self.base.add(idx * PAGE_SIZE)
        );
        self.map.dealloc(idx);
        self.free += 1;
    }
}

/// A pool of physical pages used for page tables and other hypervisor
/// bookkeeping. Internally serialized.
pub struct MPool {
    chunks: Mutex<Vec<Chunk>>,
}

impl MPool {
    pub const fn new() -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// Hands the page-aligned part of `[begin, begin + size)` to the pool.
    /// Returns false if it does not contain a single whole page.
    pub fn add_chunk(&self, begin: Paddr, size: usize) -> bool {
        let start = begin.align_up(PAGE_SIZE);
        let end = begin.add(size).align_down(PAGE_SIZE);
        if end <= start {
            return false;
        }
        let mut pages = end.offset_from(start) / PAGE_SIZE;
        let mut base = start;
        let mut chunks = self.chunks.lock();
        while pages > 0 {
            let n = pages.min(ChunkMap::CAP);
            chunks.push(Chunk::new(base, n));
            base = base.add(n * PAGE_SIZE);
            pages -= n;
        }
        debug!("[PG] page pool chunk [{:#x}, {:#x})", start, end);
        true
    }

    /// Allocates a single page.
    pub fn alloc(&self) -> Option<Paddr> {
        let ret = self.chunks.lock().iter_mut().find_map(Chunk::alloc);
        trace!("[PG] pool alloc: {:x?}", ret);
        ret
    }

    /// Allocates `count` physically contiguous pages whose first page is
    /// aligned to `align` pages (a power of two).
    pub fn alloc_contiguous(&self, count: usize, align: usize) -> Option<Paddr> {
        debug_assert!(align.is_power_of_two());
        if count == 0 {
            return None;
        }
        let ret = self
            .chunks
            .lock()
            .iter_mut()
            .find_map(|c| c.alloc_contiguous(count, align));
        trace!("[PG] pool alloc {} pages: {:x?}", count, ret);
        ret
    }

    /// Returns a page to the pool.
    pub fn free(&self, pa: Paddr) {
        trace!("[PG] pool free: {:#x}", pa);
        let mut chunks = self.chunks.lock();
        match chunks.iter_mut().find_map(|c| c.index_of(pa).map(|i| (c, i))) {
            Some((chunk, idx)) => chunk.free(idx),
            None => halt!("[PG] freeing page {:#x} not owned by the pool", pa),
        }
    }

    /// Number of free pages.
    pub fn free_count(&self) -> usize {
        self.chunks.lock().iter().map(|c| c.free).sum()
    }
}

impl Default for MPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free() {
        let pool = MPool::new();
        assert!(pool.add_chunk(Paddr::new(0x1_0000), 4 * PAGE_SIZE));
        assert_eq!(pool.free_count(), 4);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_count(), 2);
        pool.free(a);
        pool.free(b);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhaustion() {
        let pool = MPool::new();
        assert!(pool.add_chunk(Paddr::new(0x1_0000), 2 * PAGE_SIZE));
        assert!(pool.alloc().is_some());
        assert!(pool.alloc().is_some());
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn unaligned_chunk_is_trimmed() {
        let pool = MPool::new();
        assert!(!pool.add_chunk(Paddr::new(0x1_0800), PAGE_SIZE));
        assert!(pool.add_chunk(Paddr::new(0x1_0800), 3 * PAGE_SIZE));
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.alloc(), Some(Paddr::new(0x1_1000)));
    }

    #[test]
    fn contiguous_respects_alignment() {
        let pool = MPool::new();
        assert!(pool.add_chunk(Paddr::new(0x1_1000), 8 * PAGE_SIZE));
        let pa = pool.alloc_contiguous(2, 2).unwrap();
        assert!(pa.is_aligned(2 * PAGE_SIZE));
        assert_eq!(pool.free_count(), 6);

        // Fragment the pool so only single pages stay free between holes.
        let pages: Vec<_> = core::iter::from_fn(|| pool.alloc()).collect();
        assert_eq!(pages.len(), 6);
        for p in pages.iter().step_by(2) {
            pool.free(*p);
        }
        assert!(pool.alloc_contiguous(2, 1).is_none());
        assert!(pool.alloc_contiguous(1, 1).is_some());
    }

    #[test]
    fn large_chunks_are_split() {
        let pool = MPool::new();
        assert!(pool.add_chunk(Paddr::new(0x100_0000), (ChunkMap::CAP + 3) * PAGE_SIZE));
        assert_eq!(pool.free_count(), ChunkMap::CAP + 3);
    }
}
