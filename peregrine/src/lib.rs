//! Peregrine: the VM runtime core of a small type-1 hypervisor.
//!
//! Stage-1 and stage-2 page tables, partitions with their vCPUs, and the
//! mailbox messaging between partitions. Everything is owned by a [`Core`],
//! which is generic over the platform layer [`PgHal`].

#![cfg_attr(not(any(test, feature = "test-hal")), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

#[macro_use]
mod error;
mod addr;
mod api;
mod hal;
mod interrupt_desc;
mod pma;

pub mod arch;
pub mod config;
pub mod cpu;
pub mod ffa;
pub mod guest;
pub mod mailbox;
pub mod mm;
pub mod vcpu;
pub mod vm;

pub use addr::{Ipaddr, Paddr, Vaddr};
pub use api::{Core, RUN_BUDGET};
pub use error::{PgError, PgResult};
pub use hal::PgHal;
#[cfg(any(test, feature = "test-hal"))]
pub use hal::test_hal;
pub use interrupt_desc::{InterruptDescriptor, InterruptType as InterruptDescType};
pub use pma::Pma;
