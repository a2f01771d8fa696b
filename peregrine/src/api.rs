//! The hypervisor ABI: everything a partition (or the primary on its
//! behalf) can ask of the core.

use alloc::boxed::Box;
use core::ops::Range;

use crate::arch::{ArchMm, ArchMmImpl};
use crate::config::{CoreConfig, MAILBOX_SIZE, MAX_VMS, NUM_INTIDS, PAGE_SIZE, SLEEP_INDEFINITE};
use crate::cpu::CpuTable;
use crate::ffa::*;
use crate::guest::{Guest, GuestCtx, GuestEnv, GuestExit};
use crate::mailbox::MailboxState;
use crate::mm::{self, ImageLayout, MPool, MemoryManager, Mode};
use crate::pma::Pma;
use crate::vcpu::{
    FaultInfo, InterruptType, Vcpu, VcpuLocked, VcpuState, INVALID_INTID, VIRTUAL_TIMER_INTID,
};
use crate::vm::{self, TwoVmLocked, Vm, VmId, VmLocked, VmTable, HYPERVISOR_VM_ID, PRIMARY_VM_ID};
use crate::{Ipaddr, Paddr, PgHal, PgResult, Vaddr};

/// Hypercalls [`Core::run`] handles on its own before handing control back
/// to the primary.
pub const RUN_BUDGET: usize = 64;

/// Pages backing the hypervisor image: text, rodata, data.
const IMAGE_PAGES: usize = 3;

enum Step {
    /// Resume the guest with this value.
    Resume(FfaValue),
    /// Stop and hand this value to the primary.
    Return(FfaValue),
}

fn interrupt_value() -> FfaValue {
    FfaValue::new(FFA_INTERRUPT_32)
}

fn wfi_value(vm_vcpu: u64, timeout: u64) -> FfaValue {
    FfaValue::new(PG_FFA_RUN_WAIT_FOR_INTERRUPT)
        .with_arg1(vm_vcpu)
        .with_arg2(timeout)
}

/// # Safety
///
/// `pa` must be a mailbox page, accessed under its VM's lock.
unsafe fn page_bytes<'a, H: PgHal>(pa: Paddr) -> &'a mut [u8] {
    core::slice::from_raw_parts_mut(H::phys_to_virt(pa), MAILBOX_SIZE)
}

/// The hypervisor core: VMs, CPUs, the hypervisor's own address space and
/// the page pool behind all page tables.
pub struct Core<H: PgHal> {
    vms: VmTable<H>,
    cpus: CpuTable,
    mm: MemoryManager<H>,
    ppool: MPool,
    pma: Pma,
    layout: ImageLayout,
    pool_mem: (Paddr, usize),
}

impl<H: PgHal> Core<H> {
    /// Builds the VMs described by `config`. `config.vms[0]` becomes the
    /// primary.
    pub fn new(config: &CoreConfig) -> PgResult<Self> {
        if config.vms.is_empty() || config.vms.len() > MAX_VMS {
            return pg_err!(
                InvalidParam,
                format_args!("{} VMs configured, 1 to {} supported", config.vms.len(), MAX_VMS)
            );
        }
        if !ArchMmImpl::init(config.pa_bits) {
            return pg_err!(InvalidParam, "unsupported physical address width");
        }
        if config.stage2_invalidate {
            mm::enable_stage2_invalidate();
        }

        let pool_base = H::alloc_pages(config.pool_pages)
            .ok_or_else(|| pg_err_type!(NoMemory, "page pool"))?;
        let ppool = MPool::new();
        ppool.add_chunk(pool_base, config.pool_pages * PAGE_SIZE);
        let image = match H::alloc_pages(IMAGE_PAGES) {
            Some(pa) => pa,
            None => {
                H::dealloc_pages(pool_base, config.pool_pages);
                return pg_err!(NoMemory, "hypervisor image");
            }
        };
        let layout = ImageLayout {
            text: image..image.add(PAGE_SIZE),
            rodata: image.add(PAGE_SIZE)..image.add(2 * PAGE_SIZE),
            data: image.add(2 * PAGE_SIZE)..image.add(3 * PAGE_SIZE),
        };
        let mm = match MemoryManager::new(&ppool) {
            Ok(mm) => mm,
            Err(e) => {
                H::dealloc_pages(image, IMAGE_PAGES);
                H::dealloc_pages(pool_base, config.pool_pages);
                return Err(e);
            }
        };

        // From here on, dropping `core` gives everything back.
        let mut core = Self {
            vms: VmTable::new(),
            cpus: CpuTable::module_init(&config.cpu_ids, config.cpu_ids.first().copied().unwrap_or(0)),
            mm,
            ppool,
            pma: Pma::new(),
            layout,
            pool_mem: (pool_base, config.pool_pages),
        };
        core.mm.init(&core.layout, &core.pma, &core.ppool)?;
        for vm_config in &config.vms {
            core.load_vm(vm_config)?;
        }
        for vm in core.vms.boot_order() {
            info!(
                "[PG] VM {} boots with order {}, {} vCPUs",
                vm.id(),
                vm.boot_order(),
                vm.vcpu_count()
            );
        }
        Ok(core)
    }

    fn load_vm(&mut self, config: &crate::config::VmConfig) -> PgResult {
        if config.mem_pages == 0 {
            return pg_err!(InvalidParam, "VM without memory");
        }
        let pa = H::alloc_pages(config.mem_pages)
            .ok_or_else(|| pg_err_type!(NoMemory, "VM memory"))?;
        let mem = pa..pa.add(config.mem_pages * PAGE_SIZE);
        let vm = match self.vms.init_next(config, mem.clone(), &self.cpus, &self.ppool) {
            Ok(vm) => vm,
            Err(e) => {
                H::dealloc_pages(pa, config.mem_pages);
                return Err(e);
            }
        };

        let mut locked = vm.lock();
        let ipa = vm.ipa_mem().start;
        locked.map(mem.start, mem.end, ipa, Mode::R | Mode::W | Mode::X, &self.ppool)?;
        if vm.is_primary() {
            locked.unmap_hypervisor(&self.layout, &self.ppool)?;
            vm.get_vcpu(0).lock().on(ipa, mem.end.offset_from(mem.start) as u64);
        } else {
            vm.get_vcpu(0)
                .lock()
                .secondary_reset_and_start(vm.secondary_ep(), mem.end.offset_from(mem.start) as u64);
        }
        drop(locked);
        vm.set_initialized();
        debug!(
            "[PG] VM {} memory: pa {:#x} - {:#x} at ipa {:#x}",
            vm.id(),
            mem.start,
            mem.end,
            ipa
        );
        Ok(())
    }

    pub fn vms(&self) -> &VmTable<H> {
        &self.vms
    }

    pub fn cpus(&self) -> &CpuTable {
        &self.cpus
    }

    pub fn pma(&self) -> &Pma {
        &self.pma
    }

    pub fn ppool(&self) -> &MPool {
        &self.ppool
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Software walk of the hypervisor's own address space.
    pub fn stage1_walk(&self, va: Vaddr) -> Option<Paddr> {
        self.mm.lock().walk(va)
    }

    /// Installs the code `vcpu` of `vm_id` executes.
    pub fn set_guest(&self, vm_id: VmId, vcpu: u16, guest: Box<dyn Guest>) -> PgResult {
        let vm = self
            .vms
            .find(vm_id)
            .ok_or_else(|| pg_err_type!(InvalidParam, "no such VM"))?;
        if vcpu >= vm.vcpu_count() {
            return pg_err!(InvalidParam, "no such vCPU");
        }
        vm.get_vcpu(vcpu).set_guest(guest);
        Ok(())
    }

    pub fn version(&self) -> FfaValue {
        FfaValue::new((FFA_VERSION_MAJOR << 16) | FFA_VERSION_MINOR)
    }

    pub fn id_get(&self, caller: VmId) -> FfaValue {
        FfaValue::success().with_arg2(caller as u64)
    }

    /// Number of partitions in `arg2`.
    pub fn partition_info_get(&self, _caller: VmId) -> FfaValue {
        FfaValue::success().with_arg2(self.vms.count() as u64)
    }

    /// Primary: nothing to yield to. Secondaries yield back to the primary.
    pub fn yield_now(&self, caller: VmId) -> FfaValue {
        if caller == PRIMARY_VM_ID {
            FfaValue::success()
        } else {
            FfaValue::new(FFA_YIELD_32)
        }
    }

    /// Sets up the caller's mailbox on the given pages of its own memory.
    pub fn rxtx_map(&self, caller: VmId, send: Ipaddr, recv: Ipaddr, page_count: u32) -> FfaValue {
        let vm = match self.vms.find(caller) {
            Some(vm) => vm,
            None => return FfaValue::error(FfaError::InvalidParameters),
        };
        if page_count != 1 {
            return FfaValue::error(FfaError::InvalidParameters);
        }
        if !send.is_aligned(PAGE_SIZE) || !recv.is_aligned(PAGE_SIZE) || send == recv {
            return FfaValue::error(FfaError::InvalidParameters);
        }
        let (send_end, recv_end) = match (send.checked_add(PAGE_SIZE), recv.checked_add(PAGE_SIZE)) {
            (Some(s), Some(r)) => (s, r),
            _ => return FfaValue::error(FfaError::InvalidParameters),
        };

        let mut locked = vm.lock();
        if locked.mailbox.send.is_some() || locked.mailbox.recv.is_some() {
            return FfaValue::error(FfaError::Denied);
        }
        let send_mode = locked.ptable.get_mode(send, send_end);
        let recv_mode = locked.ptable.get_mode(recv, recv_end);
        let (send_mode, recv_mode) = match (send_mode, recv_mode) {
            (Some(s), Some(r))
                if s.is_valid_owned_exclusive()
                    && r.is_valid_owned_exclusive()
                    && s.contains(Mode::R | Mode::W)
                    && r.contains(Mode::R) =>
            {
                (s, r)
            }
            _ => return FfaValue::error(FfaError::Denied),
        };
        let (send_pa, recv_pa) = match (locked.ptable.walk(send), locked.ptable.walk(recv)) {
            (Some(s), Some(r)) => (s, r),
            _ => return FfaValue::error(FfaError::Denied),
        };

        let pages = MailboxPages {
            send: (send, send_pa, send_mode),
            recv: (recv, recv_pa, recv_mode),
        };
        match self.map_mailbox(&mut locked, &pages) {
            Ok(()) => {
                locked.mailbox.send = Some(send_pa);
                locked.mailbox.recv = Some(recv_pa);
                locked.mailbox.state = MailboxState::Empty;
                info!(
                    "[PG] VM {} mailbox: send {:#x}, recv {:#x}",
                    caller, send_pa, recv_pa
                );
                FfaValue::success()
            }
            Err(e) => {
                warn!("[PG] VM {} mailbox setup failed: {:?}", caller, e);
                FfaValue::error(FfaError::NoMemory)
            }
        }
    }

    fn map_mailbox(&self, locked: &mut VmLocked<'_, H>, pages: &MailboxPages) -> PgResult {
        let ppool = &self.ppool;
        let (send_ipa, send_pa, _) = pages.send;
        let (recv_ipa, recv_pa, _) = pages.recv;
        let shared = Mode::UNOWNED | Mode::SHARED | Mode::R;

        locked.map(send_pa, send_pa.add(PAGE_SIZE), send_ipa, shared | Mode::W, ppool)?;
        if let Err(e) = locked.map(recv_pa, recv_pa.add(PAGE_SIZE), recv_ipa, shared, ppool) {
            restore(locked, pages.send, ppool);
            return Err(e);
        }

        let extra = ArchMmImpl::extra_attributes_from_vm(locked.vm().id());
        let mut mm = self.mm.lock();
        let (send_end, recv_end) = (send_pa.add(PAGE_SIZE), recv_pa.add(PAGE_SIZE));
        let owner = HYPERVISOR_VM_ID;
        if let Err(e) = mm.identity_map_and_reserve(send_pa, send_end, Mode::R | extra, owner, &self.pma, ppool) {
            restore(locked, pages.send, ppool);
            restore(locked, pages.recv, ppool);
            return Err(e);
        }
        if let Err(e) = mm.identity_map_and_reserve(recv_pa, recv_end, Mode::W | extra, owner, &self.pma, ppool) {
            let _ = mm.unmap_and_release(send_pa, send_end, owner, &self.pma, ppool);
            restore(locked, pages.send, ppool);
            restore(locked, pages.recv, ppool);
            return Err(e);
        }
        Ok(())
    }

    fn page_of<F>(&self, vm_id: VmId, f: F) -> Result<usize, FfaError>
    where
        F: FnOnce(&mut VmLocked<'_, H>) -> Result<usize, FfaError>,
    {
        let vm = self.vms.find(vm_id).ok_or(FfaError::InvalidParameters)?;
        let mut locked = vm.lock();
        f(&mut locked)
    }

    /// Copies `data` into `vm_id`'s TX buffer at `offset`.
    pub fn write_tx(&self, vm_id: VmId, offset: usize, data: &[u8]) -> Result<(), FfaError> {
        self.page_of(vm_id, |locked| {
            let send = locked.mailbox.send.ok_or(FfaError::Denied)?;
            let end = offset
                .checked_add(data.len())
                .filter(|&end| end <= MAILBOX_SIZE)
                .ok_or(FfaError::InvalidParameters)?;
            // SAFETY: the VM lock is held.
            let page = unsafe { page_bytes::<H>(send) };
            page[offset..end].copy_from_slice(data);
            Ok(data.len())
        })
        .map(|_| ())
    }

    /// Copies from `vm_id`'s RX buffer at `offset`. Returns the bytes copied.
    pub fn read_rx(&self, vm_id: VmId, offset: usize, buf: &mut [u8]) -> Result<usize, FfaError> {
        self.page_of(vm_id, |locked| {
            let recv = locked.mailbox.recv.ok_or(FfaError::Denied)?;
            if offset > MAILBOX_SIZE {
                return Err(FfaError::InvalidParameters);
            }
            let len = buf.len().min(MAILBOX_SIZE - offset);
            // SAFETY: the VM lock is held.
            let page = unsafe { page_bytes::<H>(recv) };
            buf[..len].copy_from_slice(&page[offset..offset + len]);
            Ok(len)
        })
    }

    /// Copies `size` bytes of the sender's TX buffer into the receiver's RX
    /// buffer. With `notify`, a busy receiver records the sender as waiting
    /// for it to become writable.
    pub fn msg_send(&self, sender: VmId, receiver: VmId, size: u32, notify: bool) -> FfaValue {
        if sender == receiver || size as usize > MAILBOX_SIZE {
            return FfaValue::error(FfaError::InvalidParameters);
        }
        let (from, to) = match (self.vms.find(sender), self.vms.find(receiver)) {
            (Some(from), Some(to)) => (from, to),
            _ => return FfaValue::error(FfaError::InvalidParameters),
        };
        let TwoVmLocked {
            vm1: mut from_locked,
            vm2: mut to_locked,
        } = vm::lock_both(from, to);

        let send = match from_locked.mailbox.send {
            Some(pa) => pa,
            None => return FfaValue::error(FfaError::Denied),
        };
        let recv = match to_locked.mailbox.recv {
            Some(pa) if to_locked.mailbox.state == MailboxState::Empty => pa,
            _ => {
                if notify {
                    // Waiting again cancels a pending writable notification.
                    from_locked.mailbox.remove_ready(receiver);
                    to_locked.mailbox.add_waiter(sender);
                    debug!("[PG] VM {} waits for VM {} to become writable", sender, receiver);
                }
                return FfaValue::error(FfaError::Busy);
            }
        };

        // SAFETY: both VM locks are held.
        unsafe {
            let size = size as usize;
            page_bytes::<H>(recv)[..size].copy_from_slice(&page_bytes::<H>(send)[..size]);
        }
        if let Err(e) = to_locked.mailbox.receive(sender, size, FFA_MSG_SEND_32) {
            return FfaValue::error(e);
        }
        trace!("[PG] VM {} -> VM {}: {} bytes", sender, receiver, size);
        FfaValue::success()
    }

    fn take_message(&self, vm: &Vm<H>) -> Option<FfaValue> {
        vm.lock().mailbox.read().map(|msg| msg.to_ffa_value(vm.id()))
    }

    /// The pending message, or `RETRY` if there is none.
    pub fn msg_poll(&self, caller: VmId) -> FfaValue {
        let vm = match self.vms.find(caller) {
            Some(vm) => vm,
            None => return FfaValue::error(FfaError::InvalidParameters),
        };
        self.take_message(vm)
            .unwrap_or_else(|| FfaValue::error(FfaError::Retry))
    }

    /// The pending message. Without one, blocks `vcpu_index` on the mailbox
    /// and returns `FFA_MSG_WAIT_32` with the timeout, unless an interrupt
    /// is already pending.
    pub fn msg_wait(&self, caller: VmId, vcpu_index: u16, timeout: u64) -> FfaValue {
        let vm = match self.vms.find(caller) {
            Some(vm) if vcpu_index < vm.vcpu_count() => vm,
            _ => return FfaValue::error(FfaError::InvalidParameters),
        };
        let vcpu = vm.get_vcpu(vcpu_index);
        let mut locked = vcpu.lock();
        if let Some(msg) = self.take_message(vm) {
            return msg;
        }
        if locked.interrupts.count() > 0 {
            return interrupt_value();
        }
        self.block(&mut locked, VcpuState::BlockedMailbox, timeout);
        FfaValue::new(FFA_MSG_WAIT_32)
            .with_arg1(vm_vcpu(caller, vcpu_index))
            .with_arg2(timeout)
    }

    /// Empties the caller's RX buffer. Returns `FFA_RX_RELEASE_32` instead of
    /// success when VMs were waiting for it, so they can be notified.
    pub fn rx_release(&self, caller: VmId) -> FfaValue {
        match self.release_mailbox(caller) {
            Ok(true) => FfaValue::new(FFA_RX_RELEASE_32).with_arg1(caller as u64),
            Ok(false) => FfaValue::success(),
            Err(e) => FfaValue::error(e),
        }
    }

    fn release_mailbox(&self, vm_id: VmId) -> Result<bool, FfaError> {
        let vm = self.vms.find(vm_id).ok_or(FfaError::InvalidParameters)?;
        let drained = vm.lock().mailbox.release()?;
        for waiter in drained.vm_ids() {
            self.mark_writable(vm, waiter);
        }
        Ok(!drained.is_empty())
    }

    /// Puts `vm` on `waiter`'s ready list, holding both VM locks. Skipped if
    /// `waiter` went back on `vm`'s waiter list after the drain, so an entry
    /// is never on both lists.
    fn mark_writable(&self, vm: &Vm<H>, waiter: VmId) -> bool {
        let waiting_vm = match self.vms.find(waiter) {
            Some(waiting_vm) if waiter != vm.id() => waiting_vm,
            _ => return false,
        };
        let TwoVmLocked {
            vm1: released,
            vm2: mut waiting,
        } = vm::lock_both(vm, waiting_vm);
        if released.mailbox.is_waiting(waiter) {
            return false;
        }
        waiting.mailbox.add_ready(vm.id())
    }

    /// Next VM whose mailbox became writable for the caller, or -1.
    pub fn mailbox_writable_get(&self, caller: VmId) -> i64 {
        self.vms
            .find(caller)
            .and_then(|vm| vm.lock().mailbox.pop_ready())
            .map_or(-1, |id| id as i64)
    }

    /// Next VM to tell that `vm_id`'s mailbox became writable, or -1. Only
    /// the primary may ask.
    pub fn mailbox_waiter_get(&self, caller: VmId, vm_id: VmId) -> i64 {
        if caller != PRIMARY_VM_ID {
            return -1;
        }
        self.vms
            .find(vm_id)
            .and_then(|vm| vm.lock().mailbox.pop_notify())
            .map_or(-1, |id| id as i64)
    }

    fn find_vcpu(&self, vm_id: VmId, vcpu_index: u16) -> Option<(&Vm<H>, &Vcpu)> {
        let vm = self.vms.find(vm_id)?;
        if vcpu_index >= vm.vcpu_count() {
            return None;
        }
        Some((vm, vm.get_vcpu(vcpu_index)))
    }

    /// 0 on success, -1 on a bad vCPU or intid.
    pub fn interrupt_enable(
        &self,
        vm_id: VmId,
        vcpu_index: u16,
        intid: u32,
        enable: bool,
        ty: InterruptType,
    ) -> i64 {
        match self.find_vcpu(vm_id, vcpu_index) {
            Some((_, vcpu)) if vcpu.lock().interrupts.enable(intid, enable, ty) => 0,
            _ => -1,
        }
    }

    pub fn interrupt_get(&self, vm_id: VmId, vcpu_index: u16) -> u32 {
        self.find_vcpu(vm_id, vcpu_index)
            .map_or(INVALID_INTID, |(_, vcpu)| vcpu.lock().interrupts.get())
    }

    /// Makes `intid` pending on the target vCPU. Returns -1 if not allowed,
    /// 1 if whoever runs the target must wake it, 0 otherwise.
    pub fn interrupt_inject(&self, caller: VmId, target_vm: VmId, target_vcpu: u16, intid: u32) -> i64 {
        if intid >= NUM_INTIDS {
            return -1;
        }
        let vcpu = match self.find_vcpu(target_vm, target_vcpu) {
            Some((_, vcpu)) => vcpu,
            None => return -1,
        };
        if caller != PRIMARY_VM_ID && caller != target_vm {
            warn!(
                "[PG] VM {} may not inject interrupts into VM {}",
                caller, target_vm
            );
            return -1;
        }
        let first = vcpu.lock().interrupts.inject(intid);
        trace!(
            "[PG] VM {} injected intid {} into VM {} vCPU {}",
            caller,
            intid,
            target_vm,
            target_vcpu
        );
        first as i64
    }

    /// Starts an off vCPU at `entry`. Callable by the primary or the VM itself.
    pub fn vcpu_on(&self, caller: VmId, vm_id: VmId, vcpu_index: u16, entry: Ipaddr, arg: u64) -> FfaValue {
        if caller != PRIMARY_VM_ID && caller != vm_id {
            return FfaValue::error(FfaError::Denied);
        }
        match self.find_vcpu(vm_id, vcpu_index) {
            Some((vm, vcpu)) if !vm.is_primary() => {
                if vcpu.lock().secondary_reset_and_start(entry, arg) {
                    FfaValue::success()
                } else {
                    FfaValue::error(FfaError::Denied)
                }
            }
            _ => FfaValue::error(FfaError::InvalidParameters),
        }
    }

    /// Turns on physical CPU `cpu_index`. Returns whether it was already on;
    /// if it was off, its vCPU in the owning VM starts at `entry`.
    pub fn cpu_on(&self, cpu_index: usize, entry: Ipaddr, arg: u64) -> Option<bool> {
        let cpu = self.cpus.find_index(cpu_index)?;
        let prev = cpu.turn_on();
        if !prev {
            if let Some(vm) = self.vms.find_from_cpu(&self.cpus, cpu_index) {
                if let Some(local) = vm.local_cpu_index(cpu_index) {
                    vm.get_vcpu(local).lock().on(entry, arg);
                }
            }
        }
        Some(prev)
    }

    pub fn cpu_off(&self, cpu_index: usize) {
        if let Some(cpu) = self.cpus.find_index(cpu_index) {
            cpu.off();
        }
    }

    /// Runs vCPU `vcpu_index` of secondary `vm_id` on behalf of the primary,
    /// until it does something the primary has to handle.
    pub fn run(&self, caller: VmId, vm_id: VmId, vcpu_index: u16) -> FfaValue {
        if caller != PRIMARY_VM_ID {
            return FfaValue::error(FfaError::Denied);
        }
        let (vm, vcpu) = match self.find_vcpu(vm_id, vcpu_index) {
            Some((vm, vcpu)) if !vm.is_primary() => (vm, vcpu),
            _ => return FfaValue::error(FfaError::InvalidParameters),
        };

        let mut retval = {
            let mut locked = vcpu.lock();
            match self.prepare_run(vm, &mut locked) {
                Ok(retval) => {
                    locked.state = VcpuState::Running;
                    locked.regs_available = false;
                    retval
                }
                Err(ret) => return ret,
            }
        };

        let mut guest = vcpu.guest.lock();
        for _ in 0..RUN_BUDGET {
            let exit = match guest.as_mut() {
                Some(guest) => {
                    let mut ctx = GuestCtx::new(self, vm_id, vcpu_index);
                    guest.resume(&mut ctx, retval)
                }
                None => GuestExit::WaitForInterrupt {
                    timeout: SLEEP_INDEFINITE,
                },
            };
            match self.handle_exit(vm, vcpu, exit) {
                Step::Resume(value) => retval = value,
                Step::Return(value) => return value,
            }
        }
        self.park(vcpu, VcpuState::Preempted, retval);
        interrupt_value().with_arg1(vm_vcpu(vm_id, vcpu_index))
    }

    /// Decides whether a vCPU can run now. `Ok` carries the value to resume
    /// it with, `Err` what to return to the primary instead.
    fn prepare_run(&self, vm: &Vm<H>, vcpu: &mut VcpuLocked<'_>) -> Result<FfaValue, FfaValue> {
        let id = vm_vcpu(vm.id(), vcpu.vcpu().index());
        if vm.is_aborting() {
            if vcpu.state != VcpuState::Aborted {
                warn!("[PG] aborting VM {} vCPU {}", vm.id(), vcpu.vcpu().index());
                vcpu.state = VcpuState::Aborted;
            }
            return Err(FfaValue::error(FfaError::Aborted));
        }
        let now = H::current_time_nanos();
        match vcpu.state {
            VcpuState::Ready | VcpuState::Preempted => Ok(vcpu.regs.retval),
            VcpuState::Running => Err(FfaValue::error(FfaError::Busy)),
            VcpuState::Off => Err(wfi_value(id, SLEEP_INDEFINITE)),
            VcpuState::Aborted => Err(FfaValue::error(FfaError::Aborted)),
            VcpuState::BlockedMailbox => {
                if let Some(msg) = self.take_message(vm) {
                    vcpu.timer_deadline = None;
                    return Ok(msg);
                }
                Self::wake_on_interrupt(vcpu, now).ok_or_else(|| {
                    FfaValue::new(FFA_MSG_WAIT_32)
                        .with_arg1(id)
                        .with_arg2(Self::remaining(vcpu, now))
                })
            }
            VcpuState::BlockedInterrupt => Self::wake_on_interrupt(vcpu, now)
                .ok_or_else(|| wfi_value(id, Self::remaining(vcpu, now))),
        }
    }

    /// A blocked vCPU wakes for a pending interrupt or an expired timer.
    fn wake_on_interrupt(vcpu: &mut VcpuLocked<'_>, now: u64) -> Option<FfaValue> {
        if vcpu.interrupts.count() > 0 {
            vcpu.timer_deadline = None;
            return Some(interrupt_value());
        }
        match vcpu.timer_deadline {
            Some(deadline) if now >= deadline => {
                vcpu.timer_deadline = None;
                vcpu.interrupts.inject(VIRTUAL_TIMER_INTID);
                Some(interrupt_value())
            }
            _ => None,
        }
    }

    fn remaining(vcpu: &VcpuLocked<'_>, now: u64) -> u64 {
        vcpu.timer_deadline
            .map_or(SLEEP_INDEFINITE, |deadline| deadline.saturating_sub(now))
    }

    fn block(&self, vcpu: &mut VcpuLocked<'_>, state: VcpuState, timeout: u64) {
        vcpu.state = state;
        vcpu.regs_available = true;
        vcpu.timer_deadline = if timeout == SLEEP_INDEFINITE {
            None
        } else {
            Some(H::current_time_nanos().saturating_add(timeout))
        };
    }

    /// Leaves the vCPU in `state`, to be resumed later with `retval`.
    fn park(&self, vcpu: &Vcpu, state: VcpuState, retval: FfaValue) {
        let mut locked = vcpu.lock();
        locked.state = state;
        locked.regs.retval = retval;
        locked.regs_available = true;
    }

    fn abort(&self, vm: &Vm<H>, vcpu: &Vcpu) -> Step {
        vm.set_aborting();
        self.park(vcpu, VcpuState::Aborted, FfaValue::error(FfaError::Aborted));
        Step::Return(FfaValue::error(FfaError::Aborted))
    }

    fn handle_exit(&self, vm: &Vm<H>, vcpu: &Vcpu, exit: GuestExit) -> Step {
        let vm_id = vm.id();
        let index = vcpu.index();
        let id = vm_vcpu(vm_id, index);
        match exit {
            GuestExit::Yield => {
                self.park(vcpu, VcpuState::Ready, FfaValue::success());
                Step::Return(FfaValue::new(FFA_YIELD_32).with_arg1(id))
            }
            GuestExit::Preempted => {
                self.park(vcpu, VcpuState::Preempted, FfaValue::success());
                Step::Return(interrupt_value().with_arg1(id))
            }
            GuestExit::WaitForInterrupt { timeout } => {
                let mut locked = vcpu.lock();
                if locked.interrupts.count() > 0 {
                    return Step::Resume(interrupt_value());
                }
                self.block(&mut locked, VcpuState::BlockedInterrupt, timeout);
                Step::Return(wfi_value(id, timeout))
            }
            GuestExit::MsgWait { timeout } => {
                let ret = self.msg_wait(vm_id, index, timeout);
                if ret.func == FFA_MSG_WAIT_32 {
                    Step::Return(ret)
                } else {
                    Step::Resume(ret)
                }
            }
            GuestExit::MsgPoll => Step::Resume(self.msg_poll(vm_id)),
            GuestExit::MsgSend { to, size, notify } => {
                let ret = self.msg_send(vm_id, to, size, notify);
                if ret.is_error() {
                    return Step::Resume(ret);
                }
                if to == PRIMARY_VM_ID {
                    // Handed over with this return.
                    if let Some(primary) = self.vms.find(PRIMARY_VM_ID) {
                        primary.lock().mailbox.read();
                    }
                }
                self.park(vcpu, VcpuState::Ready, FfaValue::success());
                Step::Return(
                    FfaValue::new(FFA_MSG_SEND_32)
                        .with_arg1(msg_send_attrs(vm_id, to))
                        .with_arg3(size as u64),
                )
            }
            GuestExit::RxRelease => match self.release_mailbox(vm_id) {
                Ok(true) => {
                    self.park(vcpu, VcpuState::Ready, FfaValue::success());
                    Step::Return(FfaValue::new(FFA_RX_RELEASE_32).with_arg1(vm_id as u64))
                }
                Ok(false) => Step::Resume(FfaValue::success()),
                Err(e) => Step::Resume(FfaValue::error(e)),
            },
            GuestExit::InterruptInject {
                vm: target_vm,
                vcpu: target_vcpu,
                intid,
            } => match self.interrupt_inject(vm_id, target_vm, target_vcpu, intid) {
                r if r < 0 => Step::Resume(FfaValue::error(FfaError::InvalidParameters)),
                1 if (target_vm, target_vcpu) != (vm_id, index) => {
                    self.park(vcpu, VcpuState::Ready, FfaValue::success());
                    Step::Return(
                        FfaValue::new(PG_FFA_RUN_WAKE_UP).with_arg1(vm_vcpu(target_vm, target_vcpu)),
                    )
                }
                _ => Step::Resume(FfaValue::success()),
            },
            GuestExit::PageFault { ipa, mode } => {
                let fault = FaultInfo {
                    ipaddr: ipa,
                    vaddr: Vaddr::new(ipa.addr()),
                    pc: vcpu.lock().regs.pc,
                    mode,
                };
                if vm.handle_page_fault(index, &fault) {
                    Step::Resume(FfaValue::success())
                } else {
                    self.abort(vm, vcpu)
                }
            }
            GuestExit::Off => {
                self.park(vcpu, VcpuState::Off, FfaValue::success());
                Step::Return(wfi_value(id, SLEEP_INDEFINITE))
            }
            GuestExit::Abort => self.abort(vm, vcpu),
        }
    }
}

impl<H: PgHal> GuestEnv for Core<H> {
    fn write_tx(&self, vm: VmId, offset: usize, data: &[u8]) -> Result<(), FfaError> {
        Core::write_tx(self, vm, offset, data)
    }

    fn read_rx(&self, vm: VmId, offset: usize, buf: &mut [u8]) -> Result<usize, FfaError> {
        Core::read_rx(self, vm, offset, buf)
    }

    fn interrupt_enable(&self, vm: VmId, vcpu: u16, intid: u32, enable: bool, ty: InterruptType) -> i64 {
        Core::interrupt_enable(self, vm, vcpu, intid, enable, ty)
    }

    fn interrupt_get(&self, vm: VmId, vcpu: u16) -> u32 {
        Core::interrupt_get(self, vm, vcpu)
    }

    fn mailbox_writable_get(&self, vm: VmId) -> i64 {
        Core::mailbox_writable_get(self, vm)
    }

    fn debug_log(&self, vm: VmId, c: u8) {
        if let Some(vm) = self.vms.find(vm) {
            vm.debug_log(c);
        }
    }
}

impl<H: PgHal> Drop for Core<H> {
    fn drop(&mut self) {
        let vms = core::mem::replace(&mut self.vms, VmTable::new());
        for mem in vms.fini(&self.ppool) {
            H::dealloc_pages(mem.start, mem_pages(&mem));
        }
        H::dealloc_pages(self.layout.text.start, IMAGE_PAGES);
        let (pool_base, pool_pages) = self.pool_mem;
        H::dealloc_pages(pool_base, pool_pages);
        debug!("[PG] core torn down");
    }
}

/// `(ipa, pa, original mode)` of each mailbox page.
struct MailboxPages {
    send: (Ipaddr, Paddr, Mode),
    recv: (Ipaddr, Paddr, Mode),
}

fn restore<H: PgHal>(locked: &mut VmLocked<'_, H>, page: (Ipaddr, Paddr, Mode), ppool: &MPool) {
    let (ipa, pa, mode) = page;
    // The tables for this page exist already, so this cannot run out of memory.
    if let Err(e) = locked.map(pa, pa.add(PAGE_SIZE), ipa, mode, ppool) {
        halt!("[PG] unable to restore mapping of {:#x}: {:?}", ipa, e);
    }
}

fn mem_pages(mem: &Range<Paddr>) -> usize {
    mem.end.offset_from(mem.start) / PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::hal::test_hal::TestHal;
    use crate::vcpu::{MAILBOX_READABLE_INTID, MAILBOX_WRITABLE_INTID};

    fn core_with(secondaries: &[u16]) -> Core<TestHal> {
        let mut config = CoreConfig {
            pool_pages: 128,
            ..CoreConfig::default()
        };
        for (i, &vcpus) in secondaries.iter().enumerate() {
            config = config.with_secondary(VmConfig::secondary(0x10 + i as u128, vcpus, 8));
        }
        Core::new(&config).unwrap()
    }

    /// Maps the first two pages of the VM's RAM as its mailbox.
    fn setup_mailbox(core: &Core<TestHal>, id: VmId) {
        let base = core.vms().find(id).unwrap().ipa_mem().start;
        let ret = core.rxtx_map(id, base, base.add(PAGE_SIZE), 1);
        assert_eq!(ret, FfaValue::success());
    }

    #[test]
    fn rxtx_map_rules() {
        let core = core_with(&[1]);
        let vm = core.vms().find(2).unwrap();
        let base = vm.ipa_mem().start;
        let err = |e| FfaValue::error(e);
        assert_eq!(core.rxtx_map(2, base, base, 1), err(FfaError::InvalidParameters));
        assert_eq!(core.rxtx_map(2, base.add(1), base.add(PAGE_SIZE), 1), err(FfaError::InvalidParameters));
        assert_eq!(core.rxtx_map(2, base, base.add(PAGE_SIZE), 2), err(FfaError::InvalidParameters));
        // Outside the VM's memory.
        assert_eq!(
            core.rxtx_map(2, Ipaddr::new(0x1000), Ipaddr::new(0x2000), 1),
            err(FfaError::Denied)
        );
        // The last page of the address space has no end address.
        let top = Ipaddr::new(usize::MAX & !(PAGE_SIZE - 1));
        assert_eq!(core.rxtx_map(2, top, base, 1), err(FfaError::InvalidParameters));
        assert_eq!(core.rxtx_map(2, base, top, 1), err(FfaError::InvalidParameters));
        setup_mailbox(&core, 2);
        assert_eq!(core.rxtx_map(2, base, base.add(PAGE_SIZE), 1), err(FfaError::Denied));

        let locked = vm.lock();
        let mode = locked.ptable.get_mode(base, base.add(PAGE_SIZE)).unwrap();
        assert!(mode.contains(Mode::UNOWNED | Mode::SHARED | Mode::W));
        let send = locked.mailbox.send.unwrap();
        drop(locked);
        assert_eq!(core.stage1_walk(Vaddr::new(send.addr())), Some(send));
        assert!(core.pma().is_assigned(send, send.add(PAGE_SIZE), HYPERVISOR_VM_ID));
    }

    #[test]
    fn send_receive_release() {
        let core = core_with(&[1, 1]);
        for id in 1..=3 {
            setup_mailbox(&core, id);
        }
        core.write_tx(2, 0, b"ping").unwrap();
        assert_eq!(core.msg_send(2, 3, 4, false), FfaValue::success());
        assert_eq!(core.msg_send(2, 3, 4, false), FfaValue::error(FfaError::Busy));
        assert_eq!(core.msg_send(2, 2, 4, false), FfaValue::error(FfaError::InvalidParameters));
        assert_eq!(
            core.msg_send(2, 3, MAILBOX_SIZE as u32 + 1, false),
            FfaValue::error(FfaError::InvalidParameters)
        );

        let msg = core.msg_poll(3);
        assert_eq!(msg.func, FFA_MSG_SEND_32);
        assert_eq!((msg.msg_send_sender(), msg.msg_send_size()), (2, 4));
        let mut buf = [0u8; 4];
        assert_eq!(core.read_rx(3, 0, &mut buf), Ok(4));
        assert_eq!(&buf, b"ping");
        assert_eq!(core.msg_poll(3), FfaValue::error(FfaError::Retry));

        assert_eq!(core.rx_release(3), FfaValue::success());
        assert_eq!(core.rx_release(3), FfaValue::error(FfaError::Denied));
    }

    #[test]
    fn busy_sender_is_notified() {
        let core = core_with(&[1, 1]);
        for id in 1..=3 {
            setup_mailbox(&core, id);
        }
        assert_eq!(core.msg_send(1, 3, 0, false), FfaValue::success());
        assert_eq!(core.msg_send(2, 3, 0, true), FfaValue::error(FfaError::Busy));
        assert_eq!(core.msg_send(2, 3, 0, true), FfaValue::error(FfaError::Busy));
        assert_eq!(core.mailbox_writable_get(2), -1);

        let ret = core.rx_release(3);
        assert_eq!(ret.func, FFA_RX_RELEASE_32);
        assert_eq!(core.mailbox_waiter_get(2, 3), -1);
        assert_eq!(core.mailbox_waiter_get(PRIMARY_VM_ID, 3), 2);
        assert_eq!(core.mailbox_waiter_get(PRIMARY_VM_ID, 3), -1);
        assert_eq!(core.mailbox_writable_get(2), 3);
        assert_eq!(core.mailbox_writable_get(2), -1);
    }

    #[test]
    fn rewaiting_sender_is_not_marked_writable() {
        let core = core_with(&[1, 1]);
        for id in 1..=3 {
            setup_mailbox(&core, id);
        }
        assert_eq!(core.msg_send(1, 3, 0, false), FfaValue::success());
        assert_eq!(core.msg_send(2, 3, 0, true), FfaValue::error(FfaError::Busy));

        // VM 3 drains its waiters, then fills up again and VM 2 re-waits
        // before the drained entry is moved.
        let x = core.vms().find(3).unwrap();
        let drained = x.lock().mailbox.release().unwrap();
        assert_eq!(drained.vm_ids().collect::<alloc::vec::Vec<_>>(), [2]);
        assert_eq!(core.msg_send(1, 3, 0, false), FfaValue::success());
        assert_eq!(core.msg_send(2, 3, 0, true), FfaValue::error(FfaError::Busy));
        assert!(!core.mark_writable(x, 2));

        let a = core.vms().find(2).unwrap();
        assert!(x.lock().mailbox.is_waiting(2));
        assert!(!a.lock().mailbox.is_ready(3));

        // The next release moves it exactly once.
        assert_eq!(core.rx_release(3).func, FFA_RX_RELEASE_32);
        assert!(!x.lock().mailbox.is_waiting(2));
        assert!(a.lock().mailbox.is_ready(3));
        assert_eq!(a.lock().mailbox.ready_count(), 1);
        assert_eq!(core.mailbox_writable_get(2), 3);
        assert_eq!(core.mailbox_writable_get(2), -1);
        assert!(!core.mark_writable(x, 3));

        // Waiting again cancels a pending notification.
        assert_eq!(core.msg_send(1, 3, 0, false), FfaValue::success());
        assert_eq!(core.rx_release(3), FfaValue::success());
        assert_eq!(core.msg_send(1, 3, 0, false), FfaValue::success());
        assert_eq!(core.msg_send(2, 3, 0, true), FfaValue::error(FfaError::Busy));
        assert_eq!(core.rx_release(3).func, FFA_RX_RELEASE_32);
        assert_eq!(core.msg_send(1, 3, 0, false), FfaValue::success());
        assert_eq!(core.msg_send(2, 3, 0, true), FfaValue::error(FfaError::Busy));
        assert!(!a.lock().mailbox.is_ready(3));
        assert!(x.lock().mailbox.is_waiting(2));
        assert_eq!(core.mailbox_writable_get(2), -1);
    }

    #[test]
    fn interrupt_rules() {
        let core = core_with(&[2, 1]);
        assert_eq!(core.interrupt_enable(2, 0, MAILBOX_READABLE_INTID, true, InterruptType::Irq), 0);
        assert_eq!(core.interrupt_enable(2, 5, 1, true, InterruptType::Irq), -1);
        assert_eq!(core.interrupt_inject(PRIMARY_VM_ID, 2, 0, MAILBOX_READABLE_INTID), 1);
        assert_eq!(core.interrupt_inject(PRIMARY_VM_ID, 2, 0, MAILBOX_READABLE_INTID), 0);
        assert_eq!(core.interrupt_inject(3, 2, 0, MAILBOX_WRITABLE_INTID), -1);
        assert_eq!(core.interrupt_inject(2, 2, 1, NUM_INTIDS), -1);
        assert_eq!(core.interrupt_get(2, 0), MAILBOX_READABLE_INTID);
        assert_eq!(core.interrupt_get(2, 0), INVALID_INTID);
    }

    #[test]
    fn run_entry_checks() {
        let core = core_with(&[2]);
        assert_eq!(core.run(2, 2, 0), FfaValue::error(FfaError::Denied));
        assert_eq!(core.run(PRIMARY_VM_ID, 1, 0), FfaValue::error(FfaError::InvalidParameters));
        assert_eq!(core.run(PRIMARY_VM_ID, 2, 2), FfaValue::error(FfaError::InvalidParameters));
        // vCPU 1 was never started.
        let ret = core.run(PRIMARY_VM_ID, 2, 1);
        assert_eq!(ret.func, PG_FFA_RUN_WAIT_FOR_INTERRUPT);
        assert_eq!(ret.sleep_time(), SLEEP_INDEFINITE);
        // vCPU 0 has no guest and idles.
        let ret = core.run(PRIMARY_VM_ID, 2, 0);
        assert_eq!(ret.func, PG_FFA_RUN_WAIT_FOR_INTERRUPT);
        assert_eq!(core.vms().find(2).unwrap().get_vcpu(0).state(), VcpuState::BlockedInterrupt);

        assert_eq!(
            core.vcpu_on(PRIMARY_VM_ID, 2, 1, Ipaddr::new(0x4000_0000), 0),
            FfaValue::success()
        );
        assert_eq!(
            core.vcpu_on(PRIMARY_VM_ID, 2, 1, Ipaddr::new(0x4000_0000), 0),
            FfaValue::error(FfaError::Denied)
        );
    }

    #[test]
    fn guest_yields_and_aborts() {
        let core = core_with(&[1]);
        let mut calls = 0;
        core.set_guest(
            2,
            0,
            Box::new(move |ctx: &mut GuestCtx<'_>, _ret: FfaValue| {
                calls += 1;
                ctx.log("hello\n");
                if calls == 1 {
                    GuestExit::Yield
                } else {
                    GuestExit::Abort
                }
            }),
        )
        .unwrap();
        let ret = core.run(PRIMARY_VM_ID, 2, 0);
        assert_eq!(ret.func, FFA_YIELD_32);
        assert_eq!((ret.vm_id(), ret.vcpu_index()), (2, 0));
        assert_eq!(core.run(PRIMARY_VM_ID, 2, 0), FfaValue::error(FfaError::Aborted));
        assert!(core.vms().find(2).unwrap().is_aborting());
        assert_eq!(core.run(PRIMARY_VM_ID, 2, 0), FfaValue::error(FfaError::Aborted));
    }

    #[test]
    fn busy_loop_is_preempted() {
        let core = core_with(&[1]);
        core.set_guest(2, 0, Box::new(|_: &mut GuestCtx<'_>, _: FfaValue| GuestExit::MsgPoll))
            .unwrap();
        let ret = core.run(PRIMARY_VM_ID, 2, 0);
        assert_eq!(ret.func, FFA_INTERRUPT_32);
        assert_eq!(core.vms().find(2).unwrap().get_vcpu(0).state(), VcpuState::Preempted);
    }

    #[test]
    fn cpu_on_off() {
        let core = core_with(&[]);
        assert_eq!(core.cpu_on(1, Ipaddr::new(0x8000_0000), 0), Some(false));
        assert_eq!(core.cpu_on(1, Ipaddr::new(0x8000_0000), 0), Some(true));
        core.cpu_off(1);
        assert!(!core.cpus().find_index(1).unwrap().is_on());
        assert_eq!(core.cpu_on(99, Ipaddr::new(0), 0), None);
    }
}
