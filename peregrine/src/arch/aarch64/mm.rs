use core::sync::atomic::{fence, AtomicU8, Ordering};

use bit_field::BitField;

use crate::addr::{Ipaddr, Paddr, Vaddr};
use crate::arch::ArchMm;
use crate::config::{PAGE_BITS, PAGE_LEVEL_BITS};
use crate::mm::{Mode, Pte};

const PTE_VALID: u64 = 1 << 0;
const PTE_LEVEL0_BLOCK: u64 = 1 << 1;
const PTE_TABLE: u64 = 1 << 1;

/// Bits 12..48 hold the output address.
const PTE_ADDR_MASK: u64 = ((1 << 48) - 1) & !((1 << PAGE_BITS) - 1);
const PTE_ATTR_MASK: u64 = !(PTE_ADDR_MASK | (1 << 1));

const NON_SHAREABLE: u64 = 0;
const INNER_SHAREABLE: u64 = 3;

const STAGE1_XN: u64 = 1 << 54;
const STAGE1_PXN: u64 = 1 << 53;
const STAGE1_AF: u64 = 1 << 10;
const STAGE1_AP2: u64 = 1 << 7;
const STAGE1_AP1: u64 = 1 << 6;
const STAGE1_NS: u64 = 1 << 5;
const STAGE1_READONLY: u64 = 2;
const STAGE1_READWRITE: u64 = 0;
const STAGE1_DEVICEINDX: u64 = 0;
const STAGE1_NORMALINDX: u64 = 1;

const fn stage1_sh(x: u64) -> u64 {
    x << 8
}

const fn stage1_ap(x: u64) -> u64 {
    x << 6
}

const fn stage1_attrindx(x: u64) -> u64 {
    x << 2
}

const STAGE2_AF: u64 = 1 << 10;
const STAGE2_EXECUTE_ALL: u64 = 0;
const STAGE2_EXECUTE_NONE: u64 = 2;
const STAGE2_ACCESS_READ: u64 = 1;
const STAGE2_ACCESS_WRITE: u64 = 2;
const STAGE2_DEVICE_MEMORY: u64 = 0;
const STAGE2_WRITEBACK: u64 = 3;
const STAGE2_MEMATTR_DEVICE_GRE: u64 = 3;
const STAGE2_MEMATTR_TYPE_MASK: u64 = 3 << 4;

// Software-defined stage-2 bits, ignored by the hardware walker.
const STAGE2_SW_OWNED: u64 = 1 << 55;
const STAGE2_SW_EXCLUSIVE: u64 = 1 << 56;

const fn stage2_sh(x: u64) -> u64 {
    x << 8
}

const fn stage2_memattr(outer: u64, inner: u64) -> u64 {
    ((outer << 2) | inner) << 2
}

const TABLE_NSTABLE: u64 = 1 << 63;
const TABLE_APTABLE1: u64 = 1 << 62;
const TABLE_APTABLE0: u64 = 1 << 61;
const TABLE_XNTABLE: u64 = 1 << 60;
const TABLE_PXNTABLE: u64 = 1 << 59;

static S2_MAX_LEVEL: AtomicU8 = AtomicU8::new(2);
static S2_ROOT_TABLE_COUNT: AtomicU8 = AtomicU8::new(2);

/// VMSAv8-64 descriptors with a 4KiB granule.
pub struct Aarch64Mm;

impl ArchMm for Aarch64Mm {
    fn init(pa_bits: u32) -> bool {
        if ![32, 36, 40, 42, 44, 48].contains(&pa_bits) {
            error!("[PG] unsupported physical address width: {}", pa_bits);
            return false;
        }
        // Pick the shallowest tree, using concatenated root tables.
        let max_level = if pa_bits >= 44 {
            3
        } else if pa_bits >= 35 {
            2
        } else {
            1
        };
        let mut extend_bits = (pa_bits as usize - PAGE_BITS) % PAGE_LEVEL_BITS;
        if extend_bits > 4 {
            extend_bits = 0;
        }
        S2_MAX_LEVEL.store(max_level, Ordering::Relaxed);
        S2_ROOT_TABLE_COUNT.store(1 << extend_bits, Ordering::Relaxed);
        debug!(
            "[PG] stage 2 has {} page table levels with {} pages at the root",
            max_level + 1,
            1 << extend_bits
        );
        true
    }

    fn absent_pte(_level: u8) -> Pte {
        0
    }

    fn table_pte(_level: u8, pa: Paddr) -> Pte {
        pa.addr() as u64 | PTE_TABLE | PTE_VALID
    }

    fn block_pte(level: u8, pa: Paddr, attrs: u64) -> Pte {
        let pte = pa.addr() as u64 | attrs;
        if level == 0 {
            // A level 0 "block" is a page descriptor.
            pte | PTE_LEVEL0_BLOCK
        } else {
            pte
        }
    }

    fn is_block_allowed(level: u8) -> bool {
        level <= 2
    }

    fn pte_is_present(pte: Pte, level: u8) -> bool {
        Self::pte_is_valid(pte, level) || (pte & STAGE2_SW_OWNED) != 0
    }

    fn pte_is_valid(pte: Pte, _level: u8) -> bool {
        (pte & PTE_VALID) != 0
    }

    fn pte_is_block(pte: Pte, level: u8) -> bool {
        Self::is_block_allowed(level)
            && if level == 0 {
                (pte & PTE_LEVEL0_BLOCK) != 0
            } else {
                Self::pte_is_present(pte, level) && !Self::pte_is_table(pte, level)
            }
    }

    fn pte_is_table(pte: Pte, level: u8) -> bool {
        level != 0 && Self::pte_is_valid(pte, level) && (pte & PTE_TABLE) != 0
    }

    fn clear_pa(pa: Paddr) -> Paddr {
        Paddr::new((pa.addr() as u64 & PTE_ADDR_MASK) as usize)
    }

    fn block_from_pte(pte: Pte, _level: u8) -> Paddr {
        Paddr::new((pte & PTE_ADDR_MASK) as usize)
    }

    fn table_from_pte(pte: Pte, _level: u8) -> Paddr {
        Paddr::new((pte & PTE_ADDR_MASK) as usize)
    }

    fn pte_attrs(pte: Pte, _level: u8) -> u64 {
        pte & PTE_ATTR_MASK
    }

    fn combine_table_entry_attrs(table_attrs: u64, mut block_attrs: u64) -> u64 {
        // Stage-2 table descriptors keep these bits at zero.
        if table_attrs & TABLE_NSTABLE != 0 {
            block_attrs |= STAGE1_NS;
        }
        if table_attrs & TABLE_APTABLE1 != 0 {
            block_attrs |= STAGE1_AP2;
        }
        if table_attrs & TABLE_APTABLE0 != 0 {
            block_attrs &= !STAGE1_AP1;
        }
        if table_attrs & TABLE_XNTABLE != 0 {
            block_attrs |= STAGE1_XN;
        }
        if table_attrs & TABLE_PXNTABLE != 0 {
            block_attrs |= STAGE1_PXN;
        }
        block_attrs
    }

    fn invalidate_stage1_range(begin: Vaddr, end: Vaddr) {
        trace!("[PG] tlbi vae2is [{:#x}, {:#x})", begin, end);
        fence(Ordering::SeqCst);
    }

    fn invalidate_stage2_range(begin: Ipaddr, end: Ipaddr) {
        trace!("[PG] tlbi ipas2e1is [{:#x}, {:#x})", begin, end);
        fence(Ordering::SeqCst);
    }

    fn sync_table_writes() {
        fence(Ordering::SeqCst);
    }

    fn mode_to_stage1_attrs(mode: Mode) -> u64 {
        let mut attrs = STAGE1_AF | stage1_sh(INNER_SHAREABLE);
        if !mode.contains(Mode::X) {
            attrs |= STAGE1_XN;
        }
        attrs |= if mode.contains(Mode::W) {
            stage1_ap(STAGE1_READWRITE)
        } else {
            stage1_ap(STAGE1_READONLY)
        };
        attrs |= if mode.contains(Mode::D) {
            stage1_attrindx(STAGE1_DEVICEINDX)
        } else {
            stage1_attrindx(STAGE1_NORMALINDX)
        };
        if !mode.contains(Mode::INVALID) {
            attrs |= PTE_VALID;
        }
        attrs
    }

    fn mode_to_stage2_attrs(mode: Mode) -> u64 {
        let mut attrs = STAGE2_AF | stage2_sh(NON_SHAREABLE);

        let mut access = 0;
        if mode.contains(Mode::R) {
            access |= STAGE2_ACCESS_READ;
        }
        if mode.contains(Mode::W) {
            access |= STAGE2_ACCESS_WRITE;
        }
        attrs.set_bits(6..8, access);

        let xn = if mode.contains(Mode::X) {
            STAGE2_EXECUTE_ALL
        } else {
            STAGE2_EXECUTE_NONE
        };
        attrs.set_bits(53..55, xn);

        attrs |= if mode.contains(Mode::D) {
            stage2_memattr(STAGE2_DEVICE_MEMORY, STAGE2_MEMATTR_DEVICE_GRE)
        } else {
            stage2_memattr(STAGE2_WRITEBACK, STAGE2_WRITEBACK)
        };

        if !mode.contains(Mode::UNOWNED) {
            attrs |= STAGE2_SW_OWNED;
        }
        if !mode.contains(Mode::SHARED) {
            attrs |= STAGE2_SW_EXCLUSIVE;
        }
        if !mode.contains(Mode::INVALID) {
            attrs |= PTE_VALID;
        }
        attrs
    }

    fn stage2_attrs_to_mode(attrs: u64) -> Mode {
        let mut mode = Mode::empty();
        let access = attrs.get_bits(6..8);
        if access & STAGE2_ACCESS_READ != 0 {
            mode |= Mode::R;
        }
        if access & STAGE2_ACCESS_WRITE != 0 {
            mode |= Mode::W;
        }
        if attrs.get_bits(53..55) == STAGE2_EXECUTE_ALL {
            mode |= Mode::X;
        }
        if attrs & STAGE2_MEMATTR_TYPE_MASK == STAGE2_DEVICE_MEMORY {
            mode |= Mode::D;
        }
        if attrs & STAGE2_SW_OWNED == 0 {
            mode |= Mode::UNOWNED;
        }
        if attrs & STAGE2_SW_EXCLUSIVE == 0 {
            mode |= Mode::SHARED;
        }
        if attrs & PTE_VALID == 0 {
            mode |= Mode::INVALID;
        }
        mode
    }

    fn stage1_max_level() -> u8 {
        // Limits the hypervisor to 512GiB but saves one level.
        2
    }

    fn stage2_max_level() -> u8 {
        S2_MAX_LEVEL.load(Ordering::Relaxed)
    }

    fn stage1_root_table_count() -> u8 {
        1
    }

    fn stage2_root_table_count() -> u8 {
        S2_ROOT_TABLE_COUNT.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage2_mode_round_trip() {
        for mode in [
            Mode::R,
            Mode::R | Mode::W,
            Mode::R | Mode::W | Mode::X,
            Mode::R | Mode::D,
            Mode::R | Mode::UNOWNED | Mode::SHARED,
            Mode::INVALID | Mode::UNOWNED,
        ] {
            let attrs = Aarch64Mm::mode_to_stage2_attrs(mode);
            assert_eq!(Aarch64Mm::stage2_attrs_to_mode(attrs), mode);
        }
    }

    #[test]
    fn pte_kinds() {
        let pa = Paddr::new(0x4020_0000);
        let attrs = Aarch64Mm::mode_to_stage2_attrs(Mode::R | Mode::W);

        let block = Aarch64Mm::block_pte(1, pa, attrs);
        assert!(Aarch64Mm::pte_is_block(block, 1));
        assert!(!Aarch64Mm::pte_is_table(block, 1));
        assert_eq!(Aarch64Mm::block_from_pte(block, 1), pa);
        assert_eq!(Aarch64Mm::pte_attrs(block, 1), attrs);

        let page = Aarch64Mm::block_pte(0, pa, attrs);
        assert!(Aarch64Mm::pte_is_block(page, 0));
        assert!(!Aarch64Mm::pte_is_table(page, 0));

        let table = Aarch64Mm::table_pte(1, pa);
        assert!(Aarch64Mm::pte_is_table(table, 1));
        assert!(!Aarch64Mm::pte_is_block(table, 1));
        assert_eq!(Aarch64Mm::table_from_pte(table, 1), pa);

        let absent = Aarch64Mm::absent_pte(1);
        assert!(!Aarch64Mm::pte_is_present(absent, 1));
        assert!(!Aarch64Mm::is_block_allowed(3));
    }

    #[test]
    fn owned_invalid_is_present() {
        let attrs = Aarch64Mm::mode_to_stage2_attrs(Mode::INVALID);
        let pte = Aarch64Mm::block_pte(1, Paddr::new(0x20_0000), attrs);
        assert!(!Aarch64Mm::pte_is_valid(pte, 1));
        assert!(Aarch64Mm::pte_is_present(pte, 1));
        assert!(Aarch64Mm::pte_is_block(pte, 1));
    }

    #[test]
    fn stage1_attrs() {
        let ro = Aarch64Mm::mode_to_stage1_attrs(Mode::R);
        assert_ne!(ro & STAGE1_XN, 0);
        assert_eq!(ro & stage1_ap(3), stage1_ap(STAGE1_READONLY));
        let x = Aarch64Mm::mode_to_stage1_attrs(Mode::R | Mode::X);
        assert_eq!(x & STAGE1_XN, 0);
        assert_ne!(x & PTE_VALID, 0);
    }
}
