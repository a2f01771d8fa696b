mod mpool;
mod page_table;

use core::ops::Range;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use crate::addr::va_from_pa;
use crate::pma::Pma;
use crate::vm::{VmId, HYPERVISOR_VM_ID};
use crate::{Paddr, PgHal, PgResult, Vaddr};

pub use mpool::MPool;
pub use page_table::PageTable;

/// A raw page-table entry.
pub type Pte = u64;

bitflags::bitflags! {
    /// Access rights and ownership state of a memory range.
    pub struct Mode: u32 {
        const R             = 1 << 0;
        const W             = 1 << 1;
        const X             = 1 << 2;
        const D             = 1 << 3;
        const INVALID       = 1 << 4;
        const UNOWNED       = 1 << 5;
        const SHARED        = 1 << 6;
        /// Not mapped at all; mapping with this mode removes the range.
        const UNMAPPED_MASK = Self::INVALID.bits | Self::UNOWNED.bits;
    }
}

impl Mode {
    /// Valid memory the holder owns exclusively.
    pub fn is_valid_owned_exclusive(self) -> bool {
        !self.intersects(Mode::D | Mode::INVALID | Mode::UNOWNED | Mode::SHARED)
    }
}

bitflags::bitflags! {
    /// Flags controlling a page-table update.
    pub struct MmFlags: u32 {
        const COMMIT = 1 << 0;
        const UNMAP  = 1 << 1;
        const STAGE1 = 1 << 2;
    }
}

static STAGE2_INVALIDATE: AtomicBool = AtomicBool::new(false);

/// Use break-before-make on stage-2 tables from now on.
pub fn enable_stage2_invalidate() {
    STAGE2_INVALIDATE.store(true, Ordering::Release);
}

pub fn stage2_invalidate() -> bool {
    STAGE2_INVALIDATE.load(Ordering::Acquire)
}

/// Physical placement of the hypervisor image sections.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    pub text: Range<Paddr>,
    pub rodata: Range<Paddr>,
    pub data: Range<Paddr>,
}

impl ImageLayout {
    pub fn sections(&self) -> [&Range<Paddr>; 3] {
        [&self.text, &self.rodata, &self.data]
    }
}

/// The hypervisor's own (stage-1) address space.
pub struct MemoryManager<H: PgHal> {
    ptable: Mutex<PageTable<H>>,
}

/// Exclusive access to the stage-1 table.
pub struct MmStage1Locked<'a, H: PgHal> {
    ptable: MutexGuard<'a, PageTable<H>>,
}

impl<H: PgHal> MemoryManager<H> {
    pub fn new(ppool: &MPool) -> PgResult<Self> {
        let ptable = PageTable::init(MmFlags::STAGE1, ppool).map_err(|e| {
            error!("[PG] unable to allocate memory for the stage-1 page table");
            e
        })?;
        Ok(Self {
            ptable: Mutex::new(ptable),
        })
    }

    /// Map each image section with the rights it needs and claim it for
    /// the hypervisor.
    pub fn init(&self, layout: &ImageLayout, pma: &Pma, ppool: &MPool) -> PgResult {
        debug!("[PG] text: {:#x} - {:#x}", layout.text.start, layout.text.end);
        debug!("[PG] rodata: {:#x} - {:#x}", layout.rodata.start, layout.rodata.end);
        debug!("[PG] data: {:#x} - {:#x}", layout.data.start, layout.data.end);
        let mut mm = self.lock();
        let owner = HYPERVISOR_VM_ID;
        mm.identity_map_and_reserve(layout.text.start, layout.text.end, Mode::X, owner, pma, ppool)?;
        mm.identity_map_and_reserve(layout.rodata.start, layout.rodata.end, Mode::R, owner, pma, ppool)?;
        mm.identity_map_and_reserve(
            layout.data.start,
            layout.data.end,
            Mode::R | Mode::W,
            owner,
            pma,
            ppool,
        )?;
        Ok(())
    }

    pub fn lock(&self) -> MmStage1Locked<'_, H> {
        MmStage1Locked {
            ptable: self.ptable.lock(),
        }
    }

    pub fn fini(self, ppool: &MPool) {
        self.ptable.into_inner().fini(ppool);
    }
}

impl<H: PgHal> MmStage1Locked<'_, H> {
    /// Map `[begin, end)` 1:1 and return where the hypervisor can reach it.
    pub fn identity_map(
        &mut self,
        begin: Paddr,
        end: Paddr,
        mode: Mode,
        ppool: &MPool,
    ) -> PgResult<Vaddr> {
        self.ptable.identity_map(begin, end, mode, ppool)?;
        Ok(va_from_pa(begin))
    }

    /// As [`Self::identity_map`], also claiming the range for `owner`.
    pub fn identity_map_and_reserve(
        &mut self,
        begin: Paddr,
        end: Paddr,
        mode: Mode,
        owner: VmId,
        pma: &Pma,
        ppool: &MPool,
    ) -> PgResult<Vaddr> {
        if !pma.reserve(begin, end, owner) {
            return pg_err!(
                Denied,
                format_args!("[{:#x}, {:#x}) is owned by another partition", begin, end)
            );
        }
        self.identity_map(begin, end, mode, ppool).map_err(|e| {
            pma.release(begin, end, owner);
            e
        })
    }

    pub fn unmap(&mut self, begin: Paddr, end: Paddr, ppool: &MPool) -> PgResult {
        self.ptable.unmap(begin, end, ppool)
    }

    pub fn unmap_and_release(
        &mut self,
        begin: Paddr,
        end: Paddr,
        owner: VmId,
        pma: &Pma,
        ppool: &MPool,
    ) -> PgResult {
        if !pma.is_assigned(begin, end, owner) {
            return pg_err!(Denied);
        }
        self.unmap(begin, end, ppool)?;
        pma.release(begin, end, owner);
        Ok(())
    }

    pub fn defrag(&mut self, ppool: &MPool) {
        self.ptable.defrag(ppool);
    }

    pub fn walk(&self, va: Vaddr) -> Option<Paddr> {
        self.ptable.walk_va(va)
    }
}
