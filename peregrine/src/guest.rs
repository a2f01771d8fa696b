//! Host-side stand-in for the code a vCPU executes.
//!
//! A [`Guest`] is resumed by [`Core::run`](crate::Core::run) with the result
//! of its previous hypercall and returns the next trap as a [`GuestExit`].

use crate::ffa::{FfaError, FfaValue};
use crate::mm::Mode;
use crate::vcpu::InterruptType;
use crate::vm::VmId;
use crate::Ipaddr;

/// Why a guest stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestExit {
    Yield,
    /// A physical interrupt arrived.
    Preempted,
    /// WFI. `timeout` is in nanoseconds, `SLEEP_INDEFINITE` for none.
    WaitForInterrupt { timeout: u64 },
    MsgWait { timeout: u64 },
    MsgPoll,
    /// Send `size` bytes of the TX buffer to `to`.
    MsgSend { to: VmId, size: u32, notify: bool },
    RxRelease,
    InterruptInject { vm: VmId, vcpu: u16, intid: u32 },
    /// A stage-2 fault on an access of `mode` to `ipa`.
    PageFault { ipa: Ipaddr, mode: Mode },
    Off,
    Abort,
}

pub trait Guest: Send {
    /// Runs until the next trap. `ret` is what the last exit returned.
    fn resume(&mut self, ctx: &mut GuestCtx<'_>, ret: FfaValue) -> GuestExit;
}

impl<F> Guest for F
where
    F: FnMut(&mut GuestCtx<'_>, FfaValue) -> GuestExit + Send,
{
    fn resume(&mut self, ctx: &mut GuestCtx<'_>, ret: FfaValue) -> GuestExit {
        self(ctx, ret)
    }
}

/// Hypervisor services reachable from a running guest.
pub(crate) trait GuestEnv {
    fn write_tx(&self, vm: VmId, offset: usize, data: &[u8]) -> Result<(), FfaError>;
    fn read_rx(&self, vm: VmId, offset: usize, buf: &mut [u8]) -> Result<usize, FfaError>;
    fn interrupt_enable(&self, vm: VmId, vcpu: u16, intid: u32, enable: bool, ty: InterruptType) -> i64;
    fn interrupt_get(&self, vm: VmId, vcpu: u16) -> u32;
    fn mailbox_writable_get(&self, vm: VmId) -> i64;
    fn debug_log(&self, vm: VmId, c: u8);
}

/// What a guest can see of itself and the hypervisor while it runs.
pub struct GuestCtx<'a> {
    env: &'a dyn GuestEnv,
    vm_id: VmId,
    vcpu_index: u16,
}

impl<'a> GuestCtx<'a> {
    pub(crate) fn new(env: &'a dyn GuestEnv, vm_id: VmId, vcpu_index: u16) -> Self {
        Self {
            env,
            vm_id,
            vcpu_index,
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    pub fn vcpu_index(&self) -> u16 {
        self.vcpu_index
    }

    /// Copies `data` to the start of the VM's TX buffer.
    pub fn write_tx(&mut self, data: &[u8]) -> Result<(), FfaError> {
        self.env.write_tx(self.vm_id, 0, data)
    }

    /// Copies the start of the VM's RX buffer out. Returns the bytes copied.
    pub fn read_rx(&mut self, buf: &mut [u8]) -> Result<usize, FfaError> {
        self.env.read_rx(self.vm_id, 0, buf)
    }

    pub fn interrupt_enable(&mut self, intid: u32, enable: bool, ty: InterruptType) -> bool {
        self.env
            .interrupt_enable(self.vm_id, self.vcpu_index, intid, enable, ty)
            == 0
    }

    pub fn interrupt_get(&mut self) -> u32 {
        self.env.interrupt_get(self.vm_id, self.vcpu_index)
    }

    /// Next VM whose mailbox became writable for us, if any.
    pub fn mailbox_writable_get(&mut self) -> Option<VmId> {
        let id = self.env.mailbox_writable_get(self.vm_id);
        (id >= 0).then(|| id as VmId)
    }

    pub fn log(&mut self, s: &str) {
        for c in s.bytes() {
            self.env.debug_log(self.vm_id, c);
        }
    }
}
