//! Host driver for the peregrine core.
//!
//! Runs every secondary vCPU on its own worker thread and exposes datagram
//! sockets through which host code talks to the VMs.

#[macro_use]
extern crate log;

#[macro_use]
pub mod logging;

pub mod config;
pub mod dispatcher;
pub mod hal;
pub mod mm;
pub mod socket;
pub mod timer;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use peregrine::config::{CoreConfig, MAX_VCPUS, MAX_VMS, PAGE_SIZE};
use peregrine::ffa::{FfaError, FfaValue, FFA_SUCCESS_32};
use peregrine::vm::{vm_id_from_index, PRIMARY_VM_ID};
use peregrine::{Core, Ipaddr, PgError, PgResult};

use crate::dispatcher::{Dispatcher, HostVm};
use crate::hal::HalImpl;
use crate::socket::{SockResult, SocketTable};

pub use crate::socket::{MsgFlags, SockAddr, SockError, SockState, SockType, Socket, AF_PG};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("hypervisor core error: {0:?}")]
    Core(PgError),
    #[error(transparent)]
    Sock(#[from] SockError),
    #[error("unexpected FF-A result: {0:?}")]
    Ffa(FfaValue),
    #[error("cannot create vCPU thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<PgError> for DriverError {
    fn from(err: PgError) -> Self {
        Self::Core(err)
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub core: CoreConfig,
    /// Per-socket send quota in bytes.
    pub send_quota: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            send_quota: config::DEFAULT_SEND_QUOTA,
        }
    }
}

pub struct Driver {
    host: Arc<Dispatcher>,
    workers: Vec<JoinHandle<()>>,
}

impl Driver {
    pub fn init(config: DriverConfig) -> Result<Self, DriverError> {
        Self::init_with_guests(config, |_| Ok(()))
    }

    /// Like [`Driver::init`], with a chance to install guests on the new
    /// core before any vCPU runs.
    pub fn init_with_guests<F>(config: DriverConfig, install: F) -> Result<Self, DriverError>
    where
        F: FnOnce(&Core<HalImpl>) -> PgResult,
    {
        let core = Core::<HalImpl>::new(&config.core)?;
        install(&core)?;

        // The last two pages of primary memory become its mailbox.
        let primary = core
            .vms()
            .find(PRIMARY_VM_ID)
            .ok_or(DriverError::Core(PgError::BadState))?;
        let mem = primary.ipa_mem();
        if mem.end.offset_from(mem.start) < 2 * PAGE_SIZE {
            error!("Unable to allocate send and receive buffers");
            return Err(DriverError::Core(PgError::NoMemory));
        }
        let send = Ipaddr::new(mem.end.addr() - 2 * PAGE_SIZE);
        let recv = Ipaddr::new(mem.end.addr() - PAGE_SIZE);
        let ret = core.rxtx_map(PRIMARY_VM_ID, send, recv, 1);
        if ret.func != FFA_SUCCESS_32 {
            error!("Unable to configure VM mailbox: {:?}", ret);
            return Err(DriverError::Ffa(ret));
        }

        let ret = core.partition_info_get(PRIMARY_VM_ID);
        if ret.func != FFA_SUCCESS_32 {
            error!("Unable to get VM information: {:?}", ret);
            return Err(DriverError::Ffa(ret));
        }
        let secondary_vm_count = (ret.arg2 as usize).saturating_sub(1);
        info!("secondary_vm_count: {}", secondary_vm_count);
        if secondary_vm_count > MAX_VMS - 1 {
            error!("Number of VMs is out of range: {}", secondary_vm_count);
            return Err(SockError::QuotaExceeded.into());
        }

        let mut vms = Vec::with_capacity(secondary_vm_count);
        let mut total_vcpu_count = 0;
        for i in 0..secondary_vm_count {
            // Only the secondaries are tracked.
            let id = vm_id_from_index(i + 1);
            let vcpu_count = core
                .vms()
                .find(id)
                .ok_or(DriverError::Core(PgError::BadState))?
                .vcpu_count();
            total_vcpu_count += vcpu_count as usize;
            if total_vcpu_count > MAX_VCPUS {
                error!("Too many vcpus: {}", total_vcpu_count);
                return Err(SockError::QuotaExceeded.into());
            }
            vms.push(HostVm::new(id, vcpu_count));
        }

        let host = Arc::new(Dispatcher::new(
            core,
            vms,
            SocketTable::with_send_quota(config.send_quota),
        ));
        let mut driver = Self {
            host: host.clone(),
            workers: Vec::with_capacity(total_vcpu_count),
        };
        for vm in host.vms() {
            for vcpu in vm.vcpus() {
                let (vm_id, index) = (vm.id(), vcpu.index());
                let worker = host.clone();
                // On failure, dropping `driver` stops what was created.
                let handle = thread::Builder::new()
                    .name(format!("vcpu_thread_{}_{}", vm_id, index))
                    .spawn(move || {
                        if let Some(vcpu) = worker.vcpu(vm_id, index) {
                            worker.vcpu_thread(vcpu);
                        }
                    })?;
                vcpu.set_task(handle.thread().clone());
                driver.workers.push(handle);
            }
        }

        let ret = host.core().rx_release(PRIMARY_VM_ID);
        // Nothing has been received yet: an empty RX buffer is fine.
        if ret.is_error() && ret.error_code() != Some(FfaError::Denied) {
            error!("Unable to release RX buffer: {:?}", ret);
            return Err(DriverError::Ffa(ret));
        }
        debug!("socket family {} registered", AF_PG);

        for vm in host.vms() {
            for vcpu in vm.vcpus() {
                host.wake_up(vcpu);
            }
        }
        info!("successfully loaded with {} VMs:", host.vms().len());
        for vm in host.vms() {
            info!("\tVM {}: {} vCPUs", vm.id(), vm.vcpus().len());
        }
        Ok(driver)
    }

    pub fn core(&self) -> &Core<HalImpl> {
        self.host.core()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.host
    }

    /// Creates a socket. Only [`SockType::Datagram`] with protocol 0 is
    /// supported, and only for privileged callers.
    pub fn socket(&self, kind: SockType, protocol: u32, privileged: bool) -> SockResult<Socket> {
        Socket::create(self.host.clone(), kind, protocol, privileged)
    }

    /// Stops and joins every vCPU thread.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!("Preparing to unload");
        self.host.request_stop();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("vcpu").to_string();
            if handle.join().is_err() {
                error!("{} panicked", name);
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
