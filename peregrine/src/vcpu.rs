use alloc::boxed::Box;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::config::{INTERRUPT_REGISTER_BITS, NUM_INTIDS};
use crate::ffa::FfaValue;
use crate::guest::Guest;
use crate::mm::Mode;
use crate::vm::{VmId, PRIMARY_VM_ID};
use crate::{Ipaddr, Vaddr};

pub const INVALID_INTID: u32 = 0xffff_ffff;
pub const MAILBOX_READABLE_INTID: u32 = 1;
pub const MAILBOX_WRITABLE_INTID: u32 = 2;
pub const VIRTUAL_TIMER_INTID: u32 = 3;
pub const MANAGED_EXIT_INTID: u32 = 4;

const INTERRUPT_WORDS: usize = (NUM_INTIDS / INTERRUPT_REGISTER_BITS) as usize;

numeric_enum_macro::numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub enum VcpuState {
        /// Switched off.
        Off = 0,
        /// Ready to be run.
        Ready = 1,
        /// Currently running.
        Running = 2,
        /// Waiting for a message.
        BlockedMailbox = 3,
        /// Preempted by an interrupt.
        Preempted = 4,
        /// Waiting for an interrupt.
        BlockedInterrupt = 5,
        Aborted = 6,
    }
}

numeric_enum_macro::numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    /// Pin a virtual interrupt is signalled on.
    pub enum InterruptType {
        Irq = 0,
        Fiq = 1,
    }
}

/// Virtual interrupt state of one vCPU.
#[derive(Debug, Default, Clone)]
pub struct Interrupts {
    enabled: [u32; INTERRUPT_WORDS],
    pending: [u32; INTERRUPT_WORDS],
    /// Set bits are FIQs.
    ty: [u32; INTERRUPT_WORDS],
    // Interrupts both enabled and pending, per pin.
    irq_count: u32,
    fiq_count: u32,
}

fn split(intid: u32) -> (usize, u32) {
    (
        (intid / INTERRUPT_REGISTER_BITS) as usize,
        1 << (intid % INTERRUPT_REGISTER_BITS),
    )
}

impl Interrupts {
    fn count_inc(&mut self, index: usize, mask: u32) {
        if self.ty[index] & mask == 0 {
            self.irq_count += 1;
        } else {
            self.fiq_count += 1;
        }
    }

    fn count_dec(&mut self, index: usize, mask: u32) {
        if self.ty[index] & mask == 0 {
            self.irq_count -= 1;
        } else {
            self.fiq_count -= 1;
        }
    }

    /// Number of interrupts both enabled and pending.
    pub fn count(&self) -> u32 {
        self.irq_count + self.fiq_count
    }

    pub fn irq_count(&self) -> u32 {
        self.irq_count
    }

    pub fn fiq_count(&self) -> u32 {
        self.fiq_count
    }

    pub fn is_enabled(&self, intid: u32) -> bool {
        let (index, mask) = split(intid);
        intid < NUM_INTIDS && self.enabled[index] & mask != 0
    }

    pub fn is_pending(&self, intid: u32) -> bool {
        let (index, mask) = split(intid);
        intid < NUM_INTIDS && self.pending[index] & mask != 0
    }

    /// Returns false if `intid` is out of range.
    pub fn enable(&mut self, intid: u32, enable: bool, ty: InterruptType) -> bool {
        if intid >= NUM_INTIDS {
            return false;
        }
        let (index, mask) = split(intid);
        if enable {
            if self.pending[index] & !self.enabled[index] & mask != 0 {
                self.count_inc(index, mask);
            }
            self.enabled[index] |= mask;
            match ty {
                InterruptType::Irq => self.ty[index] &= !mask,
                InterruptType::Fiq => self.ty[index] |= mask,
            }
        } else {
            if self.pending[index] & self.enabled[index] & mask != 0 {
                self.count_dec(index, mask);
            }
            self.enabled[index] &= !mask;
            self.ty[index] &= !mask;
        }
        true
    }

    /// Acknowledges the lowest enabled and pending interrupt.
    pub fn get(&mut self) -> u32 {
        for index in 0..INTERRUPT_WORDS {
            let enabled_and_pending = self.enabled[index] & self.pending[index];
            if enabled_and_pending != 0 {
                let bit = enabled_and_pending.trailing_zeros();
                let mask = 1 << bit;
                self.pending[index] &= !mask;
                self.count_dec(index, mask);
                return index as u32 * INTERRUPT_REGISTER_BITS + bit;
            }
        }
        INVALID_INTID
    }

    /// Makes `intid` pending. Returns true if it was enabled, not already
    /// pending, and is now the only interrupt to take, i.e. whoever runs
    /// the vCPU must be told.
    pub fn inject(&mut self, intid: u32) -> bool {
        let (index, mask) = split(intid);
        let mut first = false;
        if self.enabled[index] & !self.pending[index] & mask != 0 {
            self.count_inc(index, mask);
            first = self.count() == 1;
        }
        self.pending[index] |= mask;
        first
    }
}

/// Register state visible to the host model of a vCPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchRegs {
    pub pc: Ipaddr,
    pub arg: u64,
    /// Returned to the guest when it is next resumed.
    pub retval: FfaValue,
}

impl ArchRegs {
    pub fn set_pc_arg(&mut self, pc: Ipaddr, arg: u64) {
        self.pc = pc;
        self.arg = arg;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// A stage-2 fault taken by a vCPU.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub ipaddr: Ipaddr,
    pub vaddr: Vaddr,
    pub pc: Ipaddr,
    pub mode: Mode,
}

pub struct VcpuInner {
    pub state: VcpuState,
    /// Index of the physical CPU the vCPU is pinned to.
    pub cpu: Option<usize>,
    pub regs: ArchRegs,
    pub interrupts: Interrupts,
    /// Cleared while a physical CPU runs the vCPU.
    pub regs_available: bool,
    pub processing_managed_exit: bool,
    /// Virtual timer deadline in nanoseconds of the platform clock.
    pub timer_deadline: Option<u64>,
}

pub struct Vcpu {
    vm_id: VmId,
    index: u16,
    inner: Mutex<VcpuInner>,
    pub(crate) guest: Mutex<Option<Box<dyn Guest>>>,
}

/// A locked vCPU.
pub struct VcpuLocked<'a> {
    vcpu: &'a Vcpu,
    inner: MutexGuard<'a, VcpuInner>,
}

impl Vcpu {
    pub(crate) fn new(vm_id: VmId, index: u16, cpu: Option<usize>) -> Self {
        Self {
            vm_id,
            index,
            inner: Mutex::new(VcpuInner {
                state: VcpuState::Off,
                cpu,
                regs: ArchRegs::default(),
                interrupts: Interrupts::default(),
                regs_available: true,
                processing_managed_exit: false,
                timer_deadline: None,
            }),
            guest: Mutex::new(None),
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn lock(&self) -> VcpuLocked<'_> {
        VcpuLocked {
            vcpu: self,
            inner: self.inner.lock(),
        }
    }

    pub fn state(&self) -> VcpuState {
        self.inner.lock().state
    }

    /// Installs the code this vCPU executes.
    pub fn set_guest(&self, guest: Box<dyn Guest>) {
        *self.guest.lock() = Some(guest);
    }
}

/// Locks two vCPUs in address order.
pub fn lock_both<'a>(a: &'a Vcpu, b: &'a Vcpu) -> (VcpuLocked<'a>, VcpuLocked<'a>) {
    check!(!core::ptr::eq(a, b), "[PG] locking a vCPU twice");
    if (a as *const Vcpu) < (b as *const Vcpu) {
        let la = a.lock();
        (la, b.lock())
    } else {
        let lb = b.lock();
        (a.lock(), lb)
    }
}

impl<'a> VcpuLocked<'a> {
    pub fn vcpu(&self) -> &'a Vcpu {
        self.vcpu
    }

    /// Starts the vCPU at `entry` with `arg` in its first register.
    pub fn on(&mut self, entry: Ipaddr, arg: u64) {
        self.inner.regs.set_pc_arg(entry, arg);
        self.inner.state = VcpuState::Ready;
        trace!(
            "[PG] VM {} vCPU {} on at {:#x}",
            self.vcpu.vm_id,
            self.vcpu.index,
            entry
        );
    }

    pub fn is_off(&self) -> bool {
        self.inner.state == VcpuState::Off
    }

    /// Starts a secondary vCPU if it is off. Returns whether it was off.
    pub fn secondary_reset_and_start(&mut self, entry: Ipaddr, arg: u64) -> bool {
        check!(
            self.vcpu.vm_id != PRIMARY_VM_ID,
            "[PG] resetting a primary vCPU"
        );
        let was_off = self.is_off();
        if was_off {
            self.inner.regs.reset();
            self.on(entry, arg);
        }
        was_off
    }
}

impl Deref for VcpuLocked<'_> {
    type Target = VcpuInner;

    fn deref(&self) -> &VcpuInner {
        &self.inner
    }
}

impl DerefMut for VcpuLocked<'_> {
    fn deref_mut(&mut self) -> &mut VcpuInner {
        &mut self.inner
    }
}
