use alloc::string::String;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut, Range};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use crate::config::{VmConfig, LOG_BUFFER_SIZE, MAX_CPUS, MAX_VMS};
use crate::cpu::CpuTable;
use crate::interrupt_desc::InterruptDescriptor;
use crate::mailbox::{Mailbox, WaitEntry};
use crate::mm::{ImageLayout, MPool, MmFlags, Mode, PageTable};
use crate::pma::Pma;
use crate::vcpu::{FaultInfo, Vcpu};
use crate::{Ipaddr, Paddr, PgHal, PgResult};

pub type VmId = u16;

/// Owner id of memory that belongs to the hypervisor itself.
pub const HYPERVISOR_VM_ID: VmId = 0;
/// Id of the first VM; ids below are reserved.
pub const VM_ID_OFFSET: VmId = 1;
pub const PRIMARY_VM_ID: VmId = VM_ID_OFFSET;
pub const FIRST_SECONDARY_VM_ID: VmId = VM_ID_OFFSET + 1;
pub const INVALID_VM_ID: VmId = 0x7fff;

pub const fn vm_index(id: VmId) -> usize {
    (id - VM_ID_OFFSET) as usize
}

pub const fn vm_id_from_index(index: usize) -> VmId {
    index as VmId + VM_ID_OFFSET
}

/// Mutable state of a VM, guarded by the VM lock.
pub struct VmInner<H: PgHal> {
    pub ptable: PageTable<H>,
    pub mailbox: Mailbox,
    log_buffer: Vec<u8>,
}

pub struct Vm<H: PgHal> {
    id: VmId,
    uuid: u128,
    vcpus: Vec<Vcpu>,
    /// Physical CPU indexes, one per vCPU.
    cpus: Vec<usize>,
    inner: Mutex<VmInner<H>>,
    aborting: AtomicBool,
    initialized: AtomicBool,
    boot_order: u16,
    next_boot: Option<VmId>,
    supports_managed_exit: bool,
    secondary_ep: Ipaddr,
    interrupt_desc: Vec<InterruptDescriptor>,
    /// RAM backing the VM, and where the VM sees it.
    mem: Range<Paddr>,
    ipa_mem: Range<Ipaddr>,
}

/// A locked VM.
pub struct VmLocked<'a, H: PgHal> {
    vm: &'a Vm<H>,
    inner: MutexGuard<'a, VmInner<H>>,
}

pub struct TwoVmLocked<'a, H: PgHal> {
    pub vm1: VmLocked<'a, H>,
    pub vm2: VmLocked<'a, H>,
}

impl<H: PgHal> Vm<H> {
    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn uuid(&self) -> u128 {
        self.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.id == PRIMARY_VM_ID
    }

    pub fn vcpu_count(&self) -> u16 {
        self.vcpus.len() as u16
    }

    pub fn get_vcpu(&self, index: u16) -> &Vcpu {
        check!(
            (index as usize) < self.vcpus.len(),
            "[PG] VM {} has no vCPU {}",
            self.id,
            index
        );
        &self.vcpus[index as usize]
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    pub fn lock(&self) -> VmLocked<'_, H> {
        VmLocked {
            vm: self,
            inner: self.inner.lock(),
        }
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    pub fn set_aborting(&self) {
        if !self.aborting.swap(true, Ordering::AcqRel) {
            warn!("[PG] VM {} is aborting", self.id);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn boot_order(&self) -> u16 {
        self.boot_order
    }

    pub fn next_boot(&self) -> Option<VmId> {
        self.next_boot
    }

    pub fn supports_managed_exit(&self) -> bool {
        self.supports_managed_exit
    }

    pub fn secondary_ep(&self) -> Ipaddr {
        self.secondary_ep
    }

    pub fn mem(&self) -> Range<Paddr> {
        self.mem.clone()
    }

    pub fn ipa_mem(&self) -> Range<Ipaddr> {
        self.ipa_mem.clone()
    }

    /// Physical CPU index backing each vCPU.
    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    /// vCPU index of the physical CPU `cpu_index` within this VM.
    pub fn local_cpu_index(&self, cpu_index: usize) -> Option<u16> {
        self.cpus
            .iter()
            .position(|&c| c == cpu_index)
            .map(|i| i as u16)
    }

    /// The entry this VM uses to wait for `for_vm`'s mailbox.
    pub fn get_wait_entry(&self, for_vm: VmId) -> WaitEntry {
        check!(
            for_vm >= VM_ID_OFFSET && vm_index(for_vm) < MAX_VMS,
            "[PG] no wait entry for VM {}",
            for_vm
        );
        WaitEntry {
            owner: self.id,
            for_vm,
        }
    }

    /// The VM the entry waits on.
    pub fn id_for_wait_entry(&self, entry: WaitEntry) -> VmId {
        check!(entry.owner == self.id);
        entry.for_vm
    }

    pub fn interrupt_desc(&self, intid: u32) -> Option<&InterruptDescriptor> {
        self.interrupt_desc
            .iter()
            .find(|d| d.valid && d.interrupt_id == intid)
    }

    /// Appends a character to the VM's log line.
    pub fn debug_log(&self, c: u8) {
        self.lock().debug_log(c);
    }

    /// Checks whether a stage-2 fault can be resolved by retrying the
    /// access, i.e. the mapping was changed since the fault was taken.
    pub fn handle_page_fault(&self, vcpu_index: u16, fault: &FaultInfo) -> bool {
        let mask = fault.mode | Mode::INVALID;
        let mode = fault
            .ipaddr
            .checked_add(1)
            .and_then(|end| self.lock().ptable.get_mode(fault.ipaddr, end));
        let resume = mode.map_or(false, |m| m & mask == fault.mode);
        if !resume {
            warn!(
                "[PG] stage-2 page fault: pc={:#x}, vmid={}, vcpu={}, vaddr={:#x}, ipaddr={:#x}, mode={:?}",
                fault.pc, self.id, vcpu_index, fault.vaddr, fault.ipaddr, fault.mode
            );
        }
        resume
    }
}

impl<'a, H: PgHal> VmLocked<'a, H> {
    pub fn vm(&self) -> &'a Vm<H> {
        self.vm
    }

    pub fn debug_log(&mut self, c: u8) {
        if c != b'\n' && c != 0 {
            self.inner.log_buffer.push(c);
        }
        if c == b'\n' || c == 0 || self.inner.log_buffer.len() >= LOG_BUFFER_SIZE {
            if !self.inner.log_buffer.is_empty() {
                info!(
                    "VM {}: {}",
                    self.vm.id,
                    String::from_utf8_lossy(&self.inner.log_buffer)
                );
            }
            self.inner.log_buffer.clear();
        }
    }

    /// Maps `[begin, end)` at the same address, failing without changes.
    pub fn identity_map(&mut self, begin: Paddr, end: Paddr, mode: Mode, ppool: &MPool) -> PgResult {
        trace!("[PG] VM {} identity map {:#x} - {:#x}", self.vm.id, begin, end);
        self.identity_prepare(begin, end, mode, ppool)?;
        self.identity_commit(begin, end, mode, ppool);
        Ok(())
    }

    /// Allocates what a later [`Self::identity_commit`] of the same range needs.
    pub fn identity_prepare(&mut self, begin: Paddr, end: Paddr, mode: Mode, ppool: &MPool) -> PgResult {
        self.inner.ptable.identity_prepare(begin, end, mode, ppool)
    }

    pub fn identity_commit(&mut self, begin: Paddr, end: Paddr, mode: Mode, ppool: &MPool) {
        self.inner.ptable.identity_commit(begin, end, mode, ppool)
    }

    /// Identity-maps a range and records the VM as its owner.
    pub fn identity_map_and_reserve(
        &mut self,
        begin: Paddr,
        end: Paddr,
        mode: Mode,
        pma: &Pma,
        ppool: &MPool,
    ) -> PgResult {
        self.identity_prepare(begin, end, mode, ppool)?;
        if !pma.reserve(begin, end, self.vm.id) {
            return pg_err!(
                Denied,
                format_args!("[{:#x}, {:#x}) is owned by another partition", begin, end)
            );
        }
        self.identity_commit(begin, end, mode, ppool);
        Ok(())
    }

    /// Maps `[begin, end)` at `ipa`.
    pub fn map(&mut self, begin: Paddr, end: Paddr, ipa: Ipaddr, mode: Mode, ppool: &MPool) -> PgResult {
        self.inner.ptable.map(begin, end, ipa, mode, ppool)
    }

    pub fn unmap(&mut self, begin: Paddr, end: Paddr, ppool: &MPool) -> PgResult {
        self.identity_map(begin, end, Mode::UNMAPPED_MASK, ppool)
    }

    pub fn unmap_and_release(&mut self, begin: Paddr, end: Paddr, pma: &Pma, ppool: &MPool) -> PgResult {
        if !pma.is_assigned(begin, end, self.vm.id) {
            return pg_err!(Denied, "releasing memory the VM does not own");
        }
        self.unmap(begin, end, ppool)?;
        pma.release(begin, end, self.vm.id);
        Ok(())
    }

    /// Removes the hypervisor image from the VM's address space.
    pub fn unmap_hypervisor(&mut self, layout: &ImageLayout, ppool: &MPool) -> PgResult {
        for section in layout.sections() {
            self.unmap(section.start, section.end, ppool)?;
        }
        Ok(())
    }
}

impl<H: PgHal> Deref for VmLocked<'_, H> {
    type Target = VmInner<H>;

    fn deref(&self) -> &VmInner<H> {
        &self.inner
    }
}

impl<H: PgHal> DerefMut for VmLocked<'_, H> {
    fn deref_mut(&mut self) -> &mut VmInner<H> {
        &mut self.inner
    }
}

/// Locks two distinct VMs in address order.
pub fn lock_both<'a, H: PgHal>(vm1: &'a Vm<H>, vm2: &'a Vm<H>) -> TwoVmLocked<'a, H> {
    check!(!core::ptr::eq(vm1, vm2), "[PG] locking VM {} twice", vm1.id);
    if (vm1 as *const Vm<H>) < (vm2 as *const Vm<H>) {
        let vm1 = vm1.lock();
        let vm2 = vm2.lock();
        TwoVmLocked { vm1, vm2 }
    } else {
        let vm2 = vm2.lock();
        let vm1 = vm1.lock();
        TwoVmLocked { vm1, vm2 }
    }
}

/// All VMs, indexed by `id - VM_ID_OFFSET`.
pub struct VmTable<H: PgHal> {
    vms: Vec<Vm<H>>,
    first_boot: Option<VmId>,
}

impl<H: PgHal> VmTable<H> {
    pub(crate) fn new() -> Self {
        Self {
            vms: Vec::new(),
            first_boot: None,
        }
    }

    /// Creates the next VM from its manifest entry. `mem` is the RAM already
    /// set aside for it; mapping it is up to the caller.
    pub(crate) fn init_next(
        &mut self,
        config: &VmConfig,
        mem: Range<Paddr>,
        cpus: &CpuTable,
        ppool: &MPool,
    ) -> PgResult<&Vm<H>> {
        if self.vms.len() >= MAX_VMS {
            return pg_err!(InvalidParam, "too many VMs");
        }
        let vcpu_count = config.vcpu_count as usize;
        if vcpu_count == 0 || vcpu_count > MAX_CPUS {
            return pg_err!(
                InvalidParam,
                format_args!("vCPU count {} out of range", vcpu_count)
            );
        }
        if vcpu_count > cpus.count() || config.cpus.len() < vcpu_count {
            return pg_err!(InvalidParam, "not enough physical CPUs assigned to VM");
        }
        let id = vm_id_from_index(self.vms.len());

        let mut cpu_indexes = Vec::with_capacity(vcpu_count);
        for &cpu_id in &config.cpus[..vcpu_count] {
            let cpu = match cpus.find(cpu_id) {
                Some(cpu) => cpu,
                None => {
                    return pg_err!(InvalidParam, format_args!("unable to find CPU {:#x}", cpu_id))
                }
            };
            cpu.assign();
            cpu_indexes.push(cpus.index(cpu));
            debug!(
                "[PG] assigned CPU {:#x} to VM {} ({} / {})",
                cpu_id,
                id,
                cpu_indexes.len(),
                vcpu_count
            );
        }

        let ptable = PageTable::init(MmFlags::empty(), ppool)?;
        let vcpus = (0..vcpu_count)
            .map(|i| Vcpu::new(id, i as u16, Some(cpu_indexes[i])))
            .collect();
        let ipa_begin = if id == PRIMARY_VM_ID {
            Ipaddr::new(mem.start.addr())
        } else {
            Ipaddr::new(config.ipa_mem_begin)
        };
        let ipa_mem = ipa_begin..ipa_begin.add(mem.end.offset_from(mem.start));

        let mut interrupt_desc = config.interrupts.clone();
        interrupt_desc.truncate(crate::config::VM_MANIFEST_MAX_INTERRUPTS);

        self.vms.push(Vm {
            id,
            uuid: config.uuid,
            vcpus,
            cpus: cpu_indexes,
            inner: Mutex::new(VmInner {
                ptable,
                mailbox: Mailbox::new(),
                log_buffer: Vec::with_capacity(LOG_BUFFER_SIZE),
            }),
            aborting: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            boot_order: config.boot_order,
            next_boot: None,
            supports_managed_exit: config.supports_managed_exit,
            secondary_ep: Ipaddr::new(config.secondary_ep),
            interrupt_desc,
            mem,
            ipa_mem,
        });
        info!("[PG] VM {} created with {} vCPUs", id, vcpu_count);
        self.update_boot(id);
        Ok(&self.vms[vm_index(id)])
    }

    pub fn count(&self) -> usize {
        self.vms.len()
    }

    pub fn find(&self, id: VmId) -> Option<&Vm<H>> {
        if id < VM_ID_OFFSET {
            return None;
        }
        self.find_index(vm_index(id))
    }

    pub fn find_index(&self, index: usize) -> Option<&Vm<H>> {
        self.vms.get(index)
    }

    pub fn find_uuid(&self, uuid: u128) -> Option<&Vm<H>> {
        self.vms.iter().find(|vm| vm.uuid == uuid)
    }

    /// The VM running on physical CPU `cpu_index`. The boot CPU belongs to
    /// the first VM to boot.
    pub fn find_from_cpu(&self, cpus: &CpuTable, cpu_index: usize) -> Option<&Vm<H>> {
        let cpu = cpus.find_index(cpu_index)?;
        if cpu.id == 0 {
            return self.get_first_boot();
        }
        self.vms.iter().find(|vm| vm.cpus.contains(&cpu_index))
    }

    /// vCPU index of physical CPU `cpu_index` in whichever VM it belongs to.
    pub fn local_cpu_index(&self, cpu_index: usize) -> Option<u16> {
        self.vms.iter().find_map(|vm| vm.local_cpu_index(cpu_index))
    }

    /// Links VM `id` into the boot list, ordered by ascending boot order.
    /// VMs with equal order keep their insertion order.
    pub(crate) fn update_boot(&mut self, id: VmId) {
        let order = self.vms[vm_index(id)].boot_order;
        let mut prev: Option<VmId> = None;
        let mut cur = self.first_boot;
        while let Some(c) = cur {
            if c == id {
                return;
            }
            let vm = &self.vms[vm_index(c)];
            if vm.boot_order > order {
                break;
            }
            prev = cur;
            cur = vm.next_boot;
        }
        self.vms[vm_index(id)].next_boot = cur;
        match prev {
            Some(p) => self.vms[vm_index(p)].next_boot = Some(id),
            None => self.first_boot = Some(id),
        }
    }

    pub fn get_first_boot(&self) -> Option<&Vm<H>> {
        self.first_boot.and_then(|id| self.find(id))
    }

    /// VMs in boot order.
    pub fn boot_order(&self) -> impl Iterator<Item = &Vm<H>> + '_ {
        core::iter::successors(self.get_first_boot(), move |vm| {
            vm.next_boot.and_then(|id| self.find(id))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vm<H>> + '_ {
        self.vms.iter()
    }

    /// Frees the page tables. Returns the RAM ranges for the caller to free.
    pub(crate) fn fini(self, ppool: &MPool) -> Vec<Range<Paddr>> {
        self.vms
            .into_iter()
            .map(|vm| {
                let mem = vm.mem.clone();
                vm.inner.into_inner().ptable.fini(ppool);
                mem
            })
            .collect()
    }
}
