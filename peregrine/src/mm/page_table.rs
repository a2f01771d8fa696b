use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicU64, Ordering};

use super::{stage2_invalidate, MPool, MmFlags, Mode, Pte};
use crate::addr::{checked_round_up_to_page, ipa_from_pa, is_aligned, round_down_to_page};
use crate::arch::{ArchMm, ArchMmImpl};
use crate::config::{PAGE_BITS, PAGE_LEVEL_BITS, PAGE_SIZE, PTE_PER_PAGE};
use crate::{Ipaddr, Paddr, PgHal, PgResult, Vaddr};

/// Size of the range one entry at `level` maps.
const fn entry_size(level: u8) -> usize {
    1 << (PAGE_BITS + level as usize * PAGE_LEVEL_BITS)
}

const fn start_of_next_block(addr: usize, block_size: usize) -> usize {
    (addr + block_size) & !(block_size - 1)
}

/// End of the range covered by the table at `level` that contains `addr`.
const fn level_end(addr: usize, level: u8) -> usize {
    let offset = PAGE_BITS + (level as usize + 1) * PAGE_LEVEL_BITS;
    ((addr >> offset) + 1) << offset
}

const fn index(addr: usize, level: u8) -> usize {
    (addr >> (PAGE_BITS + level as usize * PAGE_LEVEL_BITS)) & (PTE_PER_PAGE - 1)
}

/// A multi-level page table, either the hypervisor's stage-1 table or the
/// stage-2 table of a VM.
///
/// Entries are published atomically so a concurrent hardware walk never
/// sees a half-built subtable. Pages are taken from and returned to the
/// [`MPool`] passed to each operation; call [`PageTable::fini`] to give them
/// all back.
pub struct PageTable<H: PgHal, A: ArchMm = ArchMmImpl> {
    root: Paddr,
    root_count: usize,
    max_level: u8,
    stage1: bool,
    _phantom: PhantomData<fn() -> (H, A)>,
}

impl<H: PgHal, A: ArchMm> PageTable<H, A> {
    /// Create an empty table. `MmFlags::STAGE1` selects the stage-1 geometry.
    pub fn init(flags: MmFlags, ppool: &MPool) -> PgResult<Self> {
        let stage1 = flags.contains(MmFlags::STAGE1);
        let (max_level, root_count) = if stage1 {
            (A::stage1_max_level(), A::stage1_root_table_count() as usize)
        } else {
            (A::stage2_max_level(), A::stage2_root_table_count() as usize)
        };
        let root = ppool
            .alloc_contiguous(root_count, root_count)
            .ok_or_else(|| pg_err_type!(NoMemory, "allocate root page table failed"))?;
        for i in 0..root_count {
            for pte in Self::table_of(root.add(i * PAGE_SIZE)) {
                pte.store(A::absent_pte(max_level), Ordering::Relaxed);
            }
        }
        A::sync_table_writes();
        debug!(
            "[PG] new {} page table at {:#x} ({} root tables, max level {})",
            if stage1 { "stage-1" } else { "stage-2" },
            root,
            root_count,
            max_level
        );
        Ok(Self {
            root,
            root_count,
            max_level,
            stage1,
            _phantom: PhantomData,
        })
    }

    /// Free every subtable and the root pages.
    pub fn fini(self, ppool: &MPool) {
        for i in 0..self.root_count {
            let table = self.root.add(i * PAGE_SIZE);
            for pte in Self::table_of(table) {
                Self::free_page_pte(pte.load(Ordering::Acquire), self.max_level, ppool);
            }
        }
        for i in 0..self.root_count {
            ppool.free(self.root.add(i * PAGE_SIZE));
        }
        debug!("[PG] freed page table at {:#x}", self.root);
    }

    /// Physical address of the first root table.
    pub fn root(&self) -> Paddr {
        self.root
    }

    /// First address past the range this table can map.
    pub fn addr_space_end(&self) -> usize {
        self.root_count * entry_size(self.max_level + 1)
    }

    /// Perform the mapping walk of `[pa_begin, pa_end)` at `ipa_begin`
    /// without committing it. All intermediate tables the commit needs are
    /// allocated here; on failure the mapped contents are unchanged.
    pub fn prepare(
        &mut self,
        pa_begin: Paddr,
        pa_end: Paddr,
        ipa_begin: Ipaddr,
        attrs: u64,
        flags: MmFlags,
        ppool: &MPool,
    ) -> PgResult {
        self.map_root(
            pa_begin,
            pa_end,
            ipa_begin.addr(),
            attrs,
            flags - MmFlags::COMMIT,
            ppool,
        )
    }

    /// Commit a mapping previously prepared with the same arguments.
    pub fn commit(
        &mut self,
        pa_begin: Paddr,
        pa_end: Paddr,
        ipa_begin: Ipaddr,
        attrs: u64,
        flags: MmFlags,
        ppool: &MPool,
    ) {
        let res = self.map_root(
            pa_begin,
            pa_end,
            ipa_begin.addr(),
            attrs,
            flags | MmFlags::COMMIT,
            ppool,
        );
        if let Err(e) = res {
            halt!(
                "[PG] page table commit of [{:#x}, {:#x}) failed: {:?}",
                pa_begin,
                pa_end,
                e
            );
        }
    }

    /// Prepare, then commit.
    pub fn update(
        &mut self,
        pa_begin: Paddr,
        pa_end: Paddr,
        ipa_begin: Ipaddr,
        attrs: u64,
        flags: MmFlags,
        ppool: &MPool,
    ) -> PgResult {
        self.prepare(pa_begin, pa_end, ipa_begin, attrs, flags, ppool)?;
        self.commit(pa_begin, pa_end, ipa_begin, attrs, flags, ppool);
        Ok(())
    }

    /// Map `[pa_begin, pa_end)` at `ipa_begin` with `mode`. A mode containing
    /// [`Mode::UNMAPPED_MASK`] removes the range instead.
    pub fn map(
        &mut self,
        pa_begin: Paddr,
        pa_end: Paddr,
        ipa_begin: Ipaddr,
        mode: Mode,
        ppool: &MPool,
    ) -> PgResult {
        let (attrs, flags) = self.mode_to_attrs(mode);
        self.update(pa_begin, pa_end, ipa_begin, attrs, flags, ppool)
    }

    /// Remove the identity-mapped range `[pa_begin, pa_end)`.
    pub fn unmap(&mut self, pa_begin: Paddr, pa_end: Paddr, ppool: &MPool) -> PgResult {
        self.identity_map(pa_begin, pa_end, Mode::UNMAPPED_MASK, ppool)
    }

    pub fn identity_map(
        &mut self,
        pa_begin: Paddr,
        pa_end: Paddr,
        mode: Mode,
        ppool: &MPool,
    ) -> PgResult {
        self.map(pa_begin, pa_end, ipa_from_pa(pa_begin), mode, ppool)
    }

    pub fn identity_prepare(
        &mut self,
        pa_begin: Paddr,
        pa_end: Paddr,
        mode: Mode,
        ppool: &MPool,
    ) -> PgResult {
        let (attrs, flags) = self.mode_to_attrs(mode);
        self.prepare(pa_begin, pa_end, ipa_from_pa(pa_begin), attrs, flags, ppool)
    }

    pub fn identity_commit(&mut self, pa_begin: Paddr, pa_end: Paddr, mode: Mode, ppool: &MPool) {
        let (attrs, flags) = self.mode_to_attrs(mode);
        self.commit(pa_begin, pa_end, ipa_from_pa(pa_begin), attrs, flags, ppool)
    }

    /// Software translation of `ipa`.
    pub fn walk(&self, ipa: Ipaddr) -> Option<Paddr> {
        self.translate(ipa.addr())
    }

    /// Software translation of a stage-1 virtual address.
    pub fn walk_va(&self, va: Vaddr) -> Option<Paddr> {
        self.translate(va.addr())
    }

    /// The stage-2 mode of `[begin, end)`, if every page in it has the same
    /// attributes.
    pub fn get_mode(&self, begin: Ipaddr, end: Ipaddr) -> Option<Mode> {
        debug_assert!(!self.stage1);
        self.get_attrs(begin.addr(), end.addr())
            .map(A::stage2_attrs_to_mode)
    }

    /// The attributes of `[begin, end)`, if every page in it has the same ones.
    pub fn get_attrs(&self, begin: usize, end: usize) -> Option<u64> {
        let begin = round_down_to_page(begin);
        let end = match checked_round_up_to_page(end) {
            Some(end) if end <= self.addr_space_end() => end,
            _ => return None,
        };
        let root_level = self.max_level + 1;
        let root_table_size = entry_size(root_level);
        let mut table_index = index(begin, root_level);
        let mut attrs = None;
        let mut begin = begin;
        while begin < end {
            let table = self.root.add(table_index * PAGE_SIZE);
            if !self.get_attrs_level(table, begin, end, self.max_level, &mut attrs) {
                return None;
            }
            begin = start_of_next_block(begin, root_table_size);
            table_index += 1;
        }
        attrs
    }

    /// Merge subtables that can be expressed by a single entry one level up.
    pub fn defrag(&mut self, ppool: &MPool) {
        let flags = self.stage_flags();
        let level = self.max_level;
        for t in 0..self.root_count {
            let table = Self::table_of(self.root.add(t * PAGE_SIZE));
            for (i, pte) in table.iter().enumerate() {
                let base_addr = (t * PTE_PER_PAGE + i) * entry_size(level);
                self.defrag_entry(base_addr, pte, level, flags, ppool);
            }
        }
        A::sync_table_writes();
    }

    /// Print the present entries for debugging, at most `limit` per table.
    pub fn dump(&self, limit: usize) {
        info!("Root: {:#x}", self.root);
        let root_size = entry_size(self.max_level + 1);
        for t in 0..self.root_count {
            self.dump_level(
                self.root.add(t * PAGE_SIZE),
                self.max_level,
                t * root_size,
                limit,
            );
        }
    }
}

impl<H: PgHal, A: ArchMm> PageTable<H, A> {
    fn table_of<'a>(pa: Paddr) -> &'a [AtomicU64] {
        let ptr = H::phys_to_virt(pa) as *const AtomicU64;
        unsafe { core::slice::from_raw_parts(ptr, PTE_PER_PAGE) }
    }

    fn stage_flags(&self) -> MmFlags {
        if self.stage1 {
            MmFlags::STAGE1
        } else {
            MmFlags::empty()
        }
    }

    fn mode_to_attrs(&self, mode: Mode) -> (u64, MmFlags) {
        if mode.contains(Mode::UNMAPPED_MASK) {
            (0, self.stage_flags() | MmFlags::UNMAP)
        } else if self.stage1 {
            (A::mode_to_stage1_attrs(mode), self.stage_flags())
        } else {
            (A::mode_to_stage2_attrs(mode), self.stage_flags())
        }
    }

    fn map_root(
        &mut self,
        pa_begin: Paddr,
        pa_end: Paddr,
        begin: usize,
        attrs: u64,
        flags: MmFlags,
        ppool: &MPool,
    ) -> PgResult {
        if pa_end < pa_begin {
            return pg_err!(
                InvalidAddress,
                format_args!("inverted range [{:#x}, {:#x})", pa_begin, pa_end)
            );
        }
        let flags = flags | self.stage_flags();
        let root_level = self.max_level + 1;
        let root_table_size = entry_size(root_level);
        let end = match begin
            .checked_add(pa_end.offset_from(pa_begin))
            .and_then(checked_round_up_to_page)
        {
            Some(end) => end,
            None => {
                return pg_err!(
                    InvalidAddress,
                    format_args!("range at {:#x} wraps the address space", begin)
                )
            }
        };
        let mut begin = round_down_to_page(begin);
        if end > self.addr_space_end() {
            return pg_err!(
                InvalidAddress,
                format_args!(
                    "[{:#x}, {:#x}) is outside the address space [0, {:#x})",
                    begin,
                    end,
                    self.addr_space_end()
                )
            );
        }

        let mut pa = A::clear_pa(pa_begin);
        let mut table_index = index(begin, root_level);
        while begin < end {
            let table = self.root.add(table_index * PAGE_SIZE);
            if !self.map_level(begin, end, pa, attrs, table, self.max_level, flags, ppool) {
                return pg_err!(NoMemory, "out of page table memory");
            }
            let next = start_of_next_block(begin, root_table_size);
            pa = pa.add(next - begin);
            begin = next;
            table_index += 1;
        }
        A::sync_table_writes();
        Ok(())
    }

    /// Returns false only if a table allocation failed.
    #[allow(clippy::too_many_arguments)]
    fn map_level(
        &self,
        mut begin: usize,
        end: usize,
        mut pa: Paddr,
        attrs: u64,
        table: Paddr,
        level: u8,
        flags: MmFlags,
        ppool: &MPool,
    ) -> bool {
        let entries = Self::table_of(table);
        let end = end.min(level_end(begin, level));
        let size = entry_size(level);
        let commit = flags.contains(MmFlags::COMMIT);
        let unmap = flags.contains(MmFlags::UNMAP);

        let mut i = index(begin, level);
        while begin < end {
            let pte = &entries[i];
            let v = pte.load(Ordering::Acquire);
            let already = if unmap {
                !A::pte_is_present(v, level)
            } else {
                A::pte_is_block(v, level)
                    && A::pte_attrs(v, level) == attrs
                    && A::block_from_pte(v, level).add(begin & (size - 1)) == pa
            };

            if already {
                // Nothing to do.
            } else if end - begin >= size
                && (unmap || A::is_block_allowed(level))
                && is_aligned(begin, size)
                && (unmap || pa.is_aligned(size))
            {
                if commit {
                    let new_pte = if unmap {
                        A::absent_pte(level)
                    } else {
                        A::block_pte(level, pa, attrs)
                    };
                    self.replace_entry(begin, pte, new_pte, level, flags, ppool);
                }
            } else {
                let nt = match self.populate_table_pte(begin, pte, level, flags, ppool) {
                    Some(nt) => nt,
                    None => return false,
                };
                if !self.map_level(begin, end, pa, attrs, nt, level - 1, flags, ppool) {
                    return false;
                }
            }

            let next = start_of_next_block(begin, size);
            pa = pa.add(next - begin);
            begin = next;
            i += 1;
        }
        true
    }

    /// Make sure `pte` points to a subtable, splitting a block into
    /// equivalent smaller blocks if needed.
    fn populate_table_pte(
        &self,
        begin: usize,
        pte: &AtomicU64,
        level: u8,
        flags: MmFlags,
        ppool: &MPool,
    ) -> Option<Paddr> {
        let v = pte.load(Ordering::Acquire);
        if A::pte_is_table(v, level) {
            return Some(A::table_from_pte(v, level));
        }

        let ntable = match ppool.alloc() {
            Some(pa) => pa,
            None => {
                warn!("[PG] failed to allocate memory for page table");
                return None;
            }
        };

        let level_below = level - 1;
        let entries = Self::table_of(ntable);
        if A::pte_is_block(v, level) {
            let inc = entry_size(level_below);
            let base = A::block_from_pte(v, level);
            let attrs = A::pte_attrs(v, level);
            for (i, e) in entries.iter().enumerate() {
                e.store(
                    A::block_pte(level_below, base.add(i * inc), attrs),
                    Ordering::Relaxed,
                );
            }
        } else {
            for e in entries {
                e.store(A::absent_pte(level_below), Ordering::Relaxed);
            }
        }

        // The entries must be visible before the table is.
        fence(Ordering::Release);
        self.replace_entry(begin, pte, A::table_pte(level, ntable), level, flags, ppool);
        Some(ntable)
    }

    /// Replace a valid entry with break-before-make, then free whatever
    /// subtable the old entry owned.
    fn replace_entry(
        &self,
        begin: usize,
        pte: &AtomicU64,
        new_pte: Pte,
        level: u8,
        flags: MmFlags,
        ppool: &MPool,
    ) {
        let v = pte.load(Ordering::Acquire);
        if (flags.contains(MmFlags::STAGE1) || stage2_invalidate()) && A::pte_is_valid(v, level) {
            let begin = begin & !(entry_size(level) - 1);
            pte.store(A::absent_pte(level), Ordering::Release);
            self.invalidate_tlb(begin, begin + entry_size(level), flags);
        }
        pte.store(new_pte, Ordering::Release);
        Self::free_page_pte(v, level, ppool);
    }

    fn invalidate_tlb(&self, begin: usize, end: usize, flags: MmFlags) {
        if flags.contains(MmFlags::STAGE1) {
            A::invalidate_stage1_range(Vaddr::new(begin), Vaddr::new(end));
        } else {
            A::invalidate_stage2_range(Ipaddr::new(begin), Ipaddr::new(end));
        }
    }

    fn free_page_pte(pte: Pte, level: u8, ppool: &MPool) {
        if !A::pte_is_table(pte, level) {
            return;
        }
        let table = A::table_from_pte(pte, level);
        for e in Self::table_of(table) {
            Self::free_page_pte(e.load(Ordering::Acquire), level - 1, ppool);
        }
        ppool.free(table);
    }

    fn translate(&self, addr: usize) -> Option<Paddr> {
        if addr >= self.addr_space_end() {
            return None;
        }
        let mut table = self
            .root
            .add(index(addr, self.max_level + 1) * PAGE_SIZE);
        let mut level = self.max_level;
        loop {
            let v = Self::table_of(table)[index(addr, level)].load(Ordering::Acquire);
            if A::pte_is_block(v, level) {
                let offset = addr & (entry_size(level) - 1);
                return Some(A::block_from_pte(v, level).add(offset));
            }
            if !A::pte_is_table(v, level) {
                return None;
            }
            table = A::table_from_pte(v, level);
            level -= 1;
        }
    }

    fn get_attrs_level(
        &self,
        table: Paddr,
        mut begin: usize,
        end: usize,
        level: u8,
        attrs: &mut Option<u64>,
    ) -> bool {
        let entries = Self::table_of(table);
        let end = end.min(level_end(begin, level));
        let size = entry_size(level);
        let mut i = index(begin, level);
        while begin < end {
            let v = entries[i].load(Ordering::Acquire);
            if A::pte_is_table(v, level) {
                let next = A::table_from_pte(v, level);
                if !self.get_attrs_level(next, begin, end, level - 1, attrs) {
                    return false;
                }
            } else {
                let a = A::pte_attrs(v, level);
                match *attrs {
                    None => *attrs = Some(a),
                    Some(prev) if prev != a => return false,
                    Some(_) => {}
                }
            }
            begin = start_of_next_block(begin, size);
            i += 1;
        }
        attrs.is_some()
    }

    fn defrag_entry(
        &self,
        base_addr: usize,
        entry: &AtomicU64,
        level: u8,
        flags: MmFlags,
        ppool: &MPool,
    ) {
        let v = entry.load(Ordering::Acquire);
        if !A::pte_is_table(v, level) {
            return;
        }
        let table = Self::table_of(A::table_from_pte(v, level));
        let below = level - 1;
        let below_size = entry_size(below);

        // The first entry is the reference the others are compared with.
        self.defrag_entry(base_addr, &table[0], below, flags, ppool);
        let base = table[0].load(Ordering::Acquire);
        let base_present = A::pte_is_present(base, below);
        let base_attrs = A::pte_attrs(base, below);
        let base_pa = A::block_from_pte(base, below);
        let mut mergeable = !base_present
            || (A::pte_is_block(base, below) && base_pa.is_aligned(entry_size(level)));

        for (i, pte) in table.iter().enumerate().skip(1) {
            self.defrag_entry(base_addr + i * below_size, pte, below, flags, ppool);
            let e = pte.load(Ordering::Acquire);
            let present = A::pte_is_present(e, below);
            if present != base_present {
                mergeable = false;
                continue;
            }
            if !present {
                continue;
            }
            if !A::pte_is_block(e, below)
                || A::pte_attrs(e, below) != base_attrs
                || A::block_from_pte(e, below) != base_pa.add(i * below_size)
            {
                mergeable = false;
            }
        }
        if !mergeable {
            return;
        }

        let new_entry = Self::merge_table_pte(v, level);
        if new_entry != v {
            trace!("[PG] defrag merged {:#x} at level {}", base_addr, level);
            self.replace_entry(base_addr, entry, new_entry, level, flags, ppool);
        }
    }

    /// The entry replacing a table whose entries are all absent or all
    /// compatible blocks.
    fn merge_table_pte(table_pte: Pte, level: u8) -> Pte {
        let table = Self::table_of(A::table_from_pte(table_pte, level));
        let first = table[0].load(Ordering::Acquire);
        if !A::pte_is_present(first, level - 1) {
            return A::absent_pte(level);
        }
        if !A::is_block_allowed(level) {
            return table_pte;
        }
        let block_attrs = A::pte_attrs(first, level - 1);
        let table_attrs = A::pte_attrs(table_pte, level);
        let attrs = A::combine_table_entry_attrs(table_attrs, block_attrs);
        A::block_pte(level, A::block_from_pte(first, level - 1), attrs)
    }

    fn dump_level(&self, table: Paddr, level: u8, start: usize, limit: usize) {
        let mut n = 0;
        for (i, pte) in Self::table_of(table).iter().enumerate() {
            let v = pte.load(Ordering::Acquire);
            if !A::pte_is_present(v, level) {
                continue;
            }
            let addr = start + i * entry_size(level);
            info!(
                "{:indent$}[{} - {:x}], {:#012x}: {:#x}",
                "",
                level,
                i,
                addr,
                v,
                indent = 2 * (self.max_level - level) as usize
            );
            if A::pte_is_table(v, level) {
                self.dump_level(A::table_from_pte(v, level), level - 1, addr, limit);
            }
            n += 1;
            if n >= limit {
                break;
            }
        }
    }

    #[cfg(test)]
    fn snapshot(&self) -> alloc::vec::Vec<Pte> {
        fn collect<H: PgHal, A: ArchMm>(table: Paddr, level: u8, out: &mut alloc::vec::Vec<Pte>) {
            for pte in PageTable::<H, A>::table_of(table) {
                let v = pte.load(Ordering::Acquire);
                out.push(v);
                if A::pte_is_table(v, level) {
                    collect::<H, A>(A::table_from_pte(v, level), level - 1, out);
                }
            }
        }
        let mut out = alloc::vec::Vec::new();
        for t in 0..self.root_count {
            collect::<H, A>(self.root.add(t * PAGE_SIZE), self.max_level, &mut out);
        }
        out
    }
}
