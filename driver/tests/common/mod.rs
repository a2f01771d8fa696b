#![allow(dead_code)]

use std::time::{Duration, Instant};

use peregrine::config::{CoreConfig, VmConfig, PAGE_SIZE};
use peregrine::vm::VmId;
use peregrine::{Core, PgError, PgResult};
use pg_driver::hal::HalImpl;
use pg_driver::DriverConfig;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A primary plus `secondaries` single-vCPU VMs, ids 2, 3, ...
pub fn config(secondaries: u16) -> DriverConfig {
    init_logger();
    let mut core = CoreConfig {
        pool_pages: 128,
        ..CoreConfig::default()
    };
    for i in 0..secondaries {
        core = core.with_secondary(VmConfig::secondary(0x100 + i as u128, 1, 8));
    }
    DriverConfig {
        core,
        ..DriverConfig::default()
    }
}

/// Sets up `vm_id`'s mailbox on the first two pages of its memory.
pub fn map_mailbox(core: &Core<HalImpl>, vm_id: VmId) -> PgResult {
    let base = core
        .vms()
        .find(vm_id)
        .ok_or(PgError::InvalidParam)?
        .ipa_mem()
        .start;
    match core.rxtx_map(vm_id, base, base.add(PAGE_SIZE), 1).error_code() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Polls `cond` for up to five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    cond()
}
