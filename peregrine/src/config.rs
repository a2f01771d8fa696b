use alloc::vec::Vec;

use static_assertions::const_assert;

use crate::interrupt_desc::InterruptDescriptor;
use crate::vm::VmId;

pub const PAGE_BITS: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
pub const PAGE_LEVEL_BITS: usize = 9;
pub const PTE_PER_PAGE: usize = 1 << PAGE_LEVEL_BITS;

pub const MAX_VMS: usize = 16;
pub const MAX_CPUS: usize = 8;
/// Upper bound of secondary vCPUs the host driver is willing to drive.
pub const MAX_VCPUS: usize = 32;

pub const MAILBOX_SIZE: usize = 4096;
pub const LOG_BUFFER_SIZE: usize = 256;
pub const VM_MANIFEST_MAX_INTERRUPTS: usize = 64;

pub const NUM_INTIDS: u32 = 64;
pub const INTERRUPT_REGISTER_BITS: u32 = 32;

/// Sentinel timeout meaning "no timer".
pub const SLEEP_INDEFINITE: u64 = u64::MAX;

pub const DEFAULT_PA_BITS: u32 = 40;
pub const DEFAULT_POOL_PAGES: usize = 256;

const_assert!(MAILBOX_SIZE % PAGE_SIZE == 0);
const_assert!(NUM_INTIDS % INTERRUPT_REGISTER_BITS == 0);
const_assert!(MAX_VMS < VmId::MAX as usize);
const_assert!(MAX_CPUS <= MAX_VCPUS);

/// Static description of one partition.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub uuid: u128,
    pub vcpu_count: u16,
    /// Physical CPUs backing the vCPUs, by CPU id.
    pub cpus: Vec<u32>,
    /// Pages of RAM handed to the VM.
    pub mem_pages: usize,
    /// Where the RAM appears in the VM's address space. Ignored for the
    /// primary, which is mapped 1:1.
    pub ipa_mem_begin: usize,
    pub boot_order: u16,
    pub supports_managed_exit: bool,
    pub secondary_ep: usize,
    pub interrupts: Vec<InterruptDescriptor>,
}

impl VmConfig {
    pub fn primary(vcpu_count: u16, mem_pages: usize) -> Self {
        Self {
            uuid: 1,
            vcpu_count,
            cpus: (0..vcpu_count as u32).collect(),
            mem_pages,
            ipa_mem_begin: 0,
            boot_order: 0,
            supports_managed_exit: false,
            secondary_ep: 0,
            interrupts: Vec::new(),
        }
    }

    pub fn secondary(uuid: u128, vcpu_count: u16, mem_pages: usize) -> Self {
        Self {
            uuid,
            vcpu_count,
            cpus: (0..vcpu_count as u32).collect(),
            mem_pages,
            ipa_mem_begin: 0x4000_0000,
            boot_order: 1,
            supports_managed_exit: false,
            secondary_ep: 0x4000_0000,
            interrupts: Vec::new(),
        }
    }

    pub fn with_boot_order(mut self, boot_order: u16) -> Self {
        self.boot_order = boot_order;
        self
    }

    pub fn with_interrupts(mut self, interrupts: Vec<InterruptDescriptor>) -> Self {
        self.interrupts = interrupts;
        self
    }
}

/// Everything needed to bring up a [`Core`](crate::Core).
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub pa_bits: u32,
    /// Pages reserved for page tables.
    pub pool_pages: usize,
    pub cpu_ids: Vec<u32>,
    /// Use break-before-make on stage-2 tables as well.
    pub stage2_invalidate: bool,
    /// `vms[0]` is the primary.
    pub vms: Vec<VmConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pa_bits: DEFAULT_PA_BITS,
            pool_pages: DEFAULT_POOL_PAGES,
            cpu_ids: (0..MAX_CPUS as u32).collect(),
            stage2_invalidate: false,
            vms: alloc::vec![VmConfig::primary(1, 16)],
        }
    }
}

impl CoreConfig {
    pub fn with_secondary(mut self, vm: VmConfig) -> Self {
        self.vms.push(vm);
        self
    }
}
