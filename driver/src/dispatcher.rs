//! Host side of vCPU scheduling: one worker thread per secondary vCPU,
//! each calling `RUN` in a loop and acting on what the core hands back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use peregrine::config::{MAILBOX_SIZE, SLEEP_INDEFINITE};
use peregrine::ffa::*;
use peregrine::vcpu::{MAILBOX_READABLE_INTID, MAILBOX_WRITABLE_INTID};
use peregrine::vm::{VmId, FIRST_SECONDARY_VM_ID, PRIMARY_VM_ID};
use peregrine::Core;

use crate::hal::HalImpl;
use crate::socket::SocketTable;
use crate::timer::OneShotTimer;

/// Host view of one secondary vCPU.
pub struct HostVcpu {
    vm_id: VmId,
    index: u16,
    task: OnceLock<Thread>,
    /// Set by a wake-up, cleared right before entering `RUN`. A worker does
    /// not go to sleep while it is set.
    abort_sleep: AtomicBool,
    waiting_for_message: AtomicBool,
    sleeping: AtomicBool,
    timer: OneShotTimer,
}

impl HostVcpu {
    fn new(vm_id: VmId, index: u16) -> Self {
        Self {
            vm_id,
            index,
            task: OnceLock::new(),
            abort_sleep: AtomicBool::new(false),
            waiting_for_message: AtomicBool::new(false),
            sleeping: AtomicBool::new(false),
            timer: OneShotTimer::new(),
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    pub fn is_waiting_for_message(&self) -> bool {
        self.waiting_for_message.load(Ordering::SeqCst)
    }

    pub(crate) fn set_task(&self, task: Thread) {
        let _ = self.task.set(task);
    }
}

/// Host view of one secondary VM.
pub struct HostVm {
    id: VmId,
    vcpus: Vec<HostVcpu>,
}

impl HostVm {
    pub fn new(id: VmId, vcpu_count: u16) -> Self {
        Self {
            id,
            vcpus: (0..vcpu_count).map(|i| HostVcpu::new(id, i)).collect(),
        }
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn vcpus(&self) -> &[HostVcpu] {
        &self.vcpus
    }
}

pub struct Dispatcher {
    core: Core<HalImpl>,
    vms: Vec<HostVm>,
    sockets: SocketTable,
    stop: AtomicBool,
}

impl Dispatcher {
    /// `vms` are the secondaries, in id order.
    pub fn new(core: Core<HalImpl>, vms: Vec<HostVm>, sockets: SocketTable) -> Self {
        Self {
            core,
            vms,
            sockets,
            stop: AtomicBool::new(false),
        }
    }

    pub fn core(&self) -> &Core<HalImpl> {
        &self.core
    }

    pub fn vms(&self) -> &[HostVm] {
        &self.vms
    }

    pub fn sockets(&self) -> &SocketTable {
        &self.sockets
    }

    /// A secondary VM, or `None` for the primary and unknown ids.
    pub fn vm_from_id(&self, vm_id: VmId) -> Option<&HostVm> {
        let index = vm_id.checked_sub(FIRST_SECONDARY_VM_ID)?;
        self.vms.get(index as usize)
    }

    pub fn vcpu(&self, vm_id: VmId, index: u16) -> Option<&HostVcpu> {
        self.vm_from_id(vm_id)?.vcpus.get(index as usize)
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Asks every worker to exit and wakes them so they notice.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for vcpu in self.vms.iter().flat_map(|vm| vm.vcpus.iter()) {
            if let Some(task) = vcpu.task.get() {
                task.unpark();
            }
        }
    }

    /// Wakes the worker of `vcpu`. Returns false if it was not asleep.
    pub fn wake_up(&self, vcpu: &HostVcpu) -> bool {
        vcpu.abort_sleep.store(true, Ordering::SeqCst);
        let was_sleeping = vcpu.sleeping.load(Ordering::SeqCst);
        if let Some(task) = vcpu.task.get() {
            task.unpark();
        }
        was_sleeping
    }

    /// Puts the calling worker to sleep until its vCPU is woken, its timer
    /// expires, or a stop is requested. Returns at once if a wake-up arrived
    /// since the worker last entered `RUN`.
    fn sleep(&self, vcpu: &HostVcpu) {
        vcpu.sleeping.store(true, Ordering::SeqCst);
        while !vcpu.abort_sleep.load(Ordering::SeqCst) && !self.should_stop() {
            match vcpu.timer.deadline() {
                None => thread::park(),
                Some(at) => {
                    let now = Instant::now();
                    if now < at {
                        thread::park_timeout(at - now);
                    } else if vcpu.timer.fire() {
                        self.timer_expired(vcpu);
                    }
                }
            }
        }
        vcpu.sleeping.store(false, Ordering::SeqCst);
    }

    fn timer_expired(&self, vcpu: &HostVcpu) {
        trace!("timer of VM {} vCPU {} expired", vcpu.vm_id, vcpu.index);
        self.wake_up(vcpu);
    }

    fn start_timer(vcpu: &HostVcpu, timeout: u64) {
        if timeout != SLEEP_INDEFINITE {
            vcpu.timer.start(Duration::from_nanos(timeout));
        }
    }

    /// Wakes the worker of `vm_id`/`vcpu_index` if it sleeps. A vCPU that
    /// is already running is not interrupted: `RUN` hands control back after
    /// at most [`peregrine::RUN_BUDGET`] hypercalls, and the next `RUN` sees
    /// whatever became pending meanwhile. That budget bounds the delay.
    pub fn handle_wake_up_request(&self, vm_id: VmId, vcpu_index: u16) {
        let vm = match self.vm_from_id(vm_id) {
            Some(vm) => vm,
            None => {
                warn!("Request to wake up non-existent VM id: {}", vm_id);
                return;
            }
        };
        let vcpu = match vm.vcpus.get(vcpu_index as usize) {
            Some(vcpu) => vcpu,
            None => {
                warn!(
                    "Request to wake up non-existent vCPU: {}.{}",
                    vm_id, vcpu_index
                );
                return;
            }
        };
        if !self.wake_up(vcpu) {
            // Picked up on its next RUN.
            trace!("kick VM {} vCPU {}", vm_id, vcpu_index);
        }
    }

    /// Injects `intid` into the first vCPU of `vm_id` and makes sure it
    /// runs to take it.
    pub fn interrupt_vm(&self, vm_id: VmId, intid: u32) {
        if self.vm_from_id(vm_id).is_none() {
            warn!("Request to interrupt non-existent VM id: {}", vm_id);
            return;
        }
        let vcpu = 0;
        match self.core.interrupt_inject(PRIMARY_VM_ID, vm_id, vcpu, intid) {
            -1 => warn!(
                "Failed to inject interrupt {} to vCPU {} of VM {}",
                intid, vcpu, vm_id
            ),
            1 => self.handle_wake_up_request(vm_id, vcpu),
            _ => {}
        }
    }

    /// Tells everyone waiting on `vm_id`'s mailbox that it is writable.
    pub fn notify_waiters(&self, vm_id: VmId) {
        loop {
            let waiter = self.core.mailbox_waiter_get(PRIMARY_VM_ID, vm_id);
            if waiter < 0 {
                break;
            }
            let waiter = waiter as VmId;
            if waiter == PRIMARY_VM_ID {
                // Host sockets never ask to be notified.
                trace!("primary was waiting on VM {}", vm_id);
            } else {
                self.interrupt_vm(waiter, MAILBOX_WRITABLE_INTID);
            }
        }
    }

    /// Makes sure `vm_id` runs to pick up the message in its mailbox.
    pub fn deliver_message(&self, vm_id: VmId) {
        let vm = match self.vm_from_id(vm_id) {
            Some(vm) => vm,
            None => {
                warn!("Tried to deliver message to non-existent VM id: {}", vm_id);
                return;
            }
        };
        if let Some(vcpu) = vm.vcpus.iter().find(|v| v.is_waiting_for_message()) {
            self.handle_wake_up_request(vm.id, vcpu.index);
            return;
        }
        self.interrupt_vm(vm.id, MAILBOX_READABLE_INTID);
    }

    /// A secondary sent the primary `size` bytes: route them to a socket,
    /// then hand the RX buffer back.
    fn handle_message(&self, sender: VmId, size: u32) {
        let mut buf = vec![0u8; (size as usize).min(MAILBOX_SIZE)];
        match self.core.read_rx(PRIMARY_VM_ID, 0, &mut buf) {
            Ok(len) => {
                buf.truncate(len);
                self.sockets.handle_message(sender, &buf);
            }
            Err(e) => error!("cannot read message from VM {}: {:?}", sender, e),
        }
        if self.core.rx_release(PRIMARY_VM_ID).func == FFA_RX_RELEASE_32 {
            self.notify_waiters(PRIMARY_VM_ID);
        }
    }

    /// Body of the worker thread for `vcpu`.
    pub fn vcpu_thread(&self, vcpu: &HostVcpu) {
        // Created stopped: the first wake-up starts it.
        self.sleep(vcpu);
        debug!("vCPU thread {}.{} started", vcpu.vm_id, vcpu.index);

        while !self.should_stop() {
            // About to run the vCPU: earlier wake-ups are consumed.
            vcpu.abort_sleep.store(false, Ordering::SeqCst);
            let ret = self.core.run(PRIMARY_VM_ID, vcpu.vm_id, vcpu.index);
            self.handle_run_return(vcpu, ret);
        }
        debug!("vCPU thread {}.{} stopped", vcpu.vm_id, vcpu.index);
    }

    fn handle_run_return(&self, vcpu: &HostVcpu, ret: FfaValue) {
        match ret.func {
            // Preempted.
            FFA_INTERRUPT_32 => thread::yield_now(),
            FFA_YIELD_32 => {
                if !self.should_stop() {
                    thread::yield_now();
                }
            }
            PG_FFA_RUN_WAIT_FOR_INTERRUPT => {
                Self::start_timer(vcpu, ret.sleep_time());
                self.sleep(vcpu);
                vcpu.timer.cancel();
            }
            FFA_MSG_WAIT_32 => {
                vcpu.waiting_for_message.store(true, Ordering::SeqCst);
                Self::start_timer(vcpu, ret.sleep_time());
                self.sleep(vcpu);
                vcpu.timer.cancel();
                vcpu.waiting_for_message.store(false, Ordering::SeqCst);
            }
            PG_FFA_RUN_WAKE_UP => self.handle_wake_up_request(ret.vm_id(), ret.vcpu_index()),
            FFA_MSG_SEND_32 => {
                let receiver = ret.msg_send_receiver();
                if receiver == PRIMARY_VM_ID {
                    self.handle_message(vcpu.vm_id, ret.msg_send_size());
                } else {
                    self.deliver_message(receiver);
                }
            }
            FFA_RX_RELEASE_32 => self.notify_waiters(vcpu.vm_id),
            FFA_ERROR_32 => {
                warn!(
                    "FF-A error {:?} running VM {} vCPU {}",
                    ret.error_code(),
                    vcpu.vm_id,
                    vcpu.index
                );
                if ret.error_code() == Some(FfaError::Aborted) {
                    if let Some(vm) = self.vm_from_id(vcpu.vm_id) {
                        for other in vm.vcpus.iter().filter(|v| v.index != vcpu.index) {
                            self.handle_wake_up_request(vm.id, other.index);
                        }
                    }
                    self.sleep(vcpu);
                } else if !self.should_stop() {
                    // Treat as a yield and try again later.
                    thread::yield_now();
                }
            }
            func => warn!(
                "unexpected return {:#x} running VM {} vCPU {}",
                func, vcpu.vm_id, vcpu.index
            ),
        }
    }
}
