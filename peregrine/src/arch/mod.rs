//! Architecture-specific page-table encoding.

use crate::addr::{Ipaddr, Paddr, Vaddr};
use crate::mm::{Mode, Pte};

/// PTE construction and inspection, TLB maintenance, and the translation
/// between [`Mode`] and hardware attributes.
pub trait ArchMm {
    /// Sets up the stage-2 geometry for the given physical address width.
    fn init(pa_bits: u32) -> bool;

    fn absent_pte(level: u8) -> Pte;
    fn table_pte(level: u8, pa: Paddr) -> Pte;
    /// The level must allow block entries.
    fn block_pte(level: u8, pa: Paddr, attrs: u64) -> Pte;

    fn is_block_allowed(level: u8) -> bool;
    /// Valid, or invalid but still carrying ownership state.
    fn pte_is_present(pte: Pte, level: u8) -> bool;
    fn pte_is_valid(pte: Pte, level: u8) -> bool;
    fn pte_is_block(pte: Pte, level: u8) -> bool;
    fn pte_is_table(pte: Pte, level: u8) -> bool;

    /// Clears the bits of `pa` that cannot be held in a PTE.
    fn clear_pa(pa: Paddr) -> Paddr;
    fn block_from_pte(pte: Pte, level: u8) -> Paddr;
    fn table_from_pte(pte: Pte, level: u8) -> Paddr;
    fn pte_attrs(pte: Pte, level: u8) -> u64;
    /// Attributes for a block replacing a whole table, given the table's own
    /// attributes and those shared by all of its blocks.
    fn combine_table_entry_attrs(table_attrs: u64, block_attrs: u64) -> u64;

    fn invalidate_stage1_range(begin: Vaddr, end: Vaddr);
    fn invalidate_stage2_range(begin: Ipaddr, end: Ipaddr);
    /// Barrier making table writes visible to the hardware walker.
    fn sync_table_writes();

    fn mode_to_stage1_attrs(mode: Mode) -> u64;
    fn mode_to_stage2_attrs(mode: Mode) -> u64;
    fn stage2_attrs_to_mode(attrs: u64) -> Mode;

    fn stage1_max_level() -> u8;
    fn stage2_max_level() -> u8;
    fn stage1_root_table_count() -> u8;
    fn stage2_root_table_count() -> u8;

    /// Extra stage-1 attributes for the mailbox pages of VM `id`.
    fn extra_attributes_from_vm(_id: u16) -> Mode {
        Mode::empty()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "aarch64")] {
        mod aarch64;
        pub use aarch64::Aarch64Mm as ArchMmImpl;
    }
}
