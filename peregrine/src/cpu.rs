//! Physical CPUs.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::config::MAX_CPUS;

pub type CpuId = u32;

pub struct PhysCpu {
    pub id: CpuId,
    is_on: Mutex<bool>,
    is_assigned: AtomicBool,
}

impl PhysCpu {
    fn new(id: CpuId) -> Self {
        Self {
            id,
            is_on: Mutex::new(false),
            is_assigned: AtomicBool::new(false),
        }
    }

    pub fn is_on(&self) -> bool {
        *self.is_on.lock()
    }

    pub fn is_assigned(&self) -> bool {
        self.is_assigned.load(Ordering::Acquire)
    }

    /// Returns whether the CPU was already on.
    pub(crate) fn turn_on(&self) -> bool {
        let mut on = self.is_on.lock();
        let prev = *on;
        *on = true;
        prev
    }

    pub fn off(&self) {
        *self.is_on.lock() = false;
    }

    /// Claims the CPU for a VM. Returns false if it was already claimed.
    pub(crate) fn assign(&self) -> bool {
        self.is_assigned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// All CPUs of the system. The boot CPU is at index 0 and starts on.
pub struct CpuTable {
    cpus: Vec<PhysCpu>,
}

impl CpuTable {
    /// Sets up the CPUs named in `ids`; `boot_cpu_id` is placed first.
    pub fn module_init(ids: &[CpuId], boot_cpu_id: CpuId) -> Self {
        let count = ids.len().min(MAX_CPUS);
        if ids.len() > MAX_CPUS {
            warn!("[PG] ignoring {} CPUs over the limit", ids.len() - MAX_CPUS);
        }
        let mut cpus: Vec<PhysCpu> = Vec::with_capacity(count.max(1));
        cpus.push(PhysCpu::new(boot_cpu_id));
        let mut found_boot_cpu = false;
        for &id in &ids[..count] {
            if !found_boot_cpu && id == boot_cpu_id {
                found_boot_cpu = true;
            } else {
                cpus.push(PhysCpu::new(id));
            }
        }
        if !found_boot_cpu {
            warn!("[PG] boot CPU's ID not found in config");
            cpus.truncate(MAX_CPUS);
        }
        cpus[0].turn_on();
        debug!("[PG] {} CPUs, boot CPU {:#x}", cpus.len(), boot_cpu_id);
        Self { cpus }
    }

    pub fn count(&self) -> usize {
        self.cpus.len()
    }

    pub fn index(&self, cpu: &PhysCpu) -> usize {
        self.cpus
            .iter()
            .position(|c| core::ptr::eq(c, cpu))
            .unwrap_or_else(|| halt!("[PG] CPU {:#x} is not in the table", cpu.id))
    }

    pub fn find_index(&self, index: usize) -> Option<&PhysCpu> {
        self.cpus.get(index)
    }

    pub fn find(&self, id: CpuId) -> Option<&PhysCpu> {
        self.cpus.iter().find(|c| c.id == id)
    }

    /// Claims the first CPU not assigned to any VM yet.
    pub fn get_next(&self) -> Option<&PhysCpu> {
        self.cpus.iter().find(|c| c.assign())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhysCpu> {
        self.cpus.iter()
    }
}
