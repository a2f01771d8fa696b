//! Host-side constants.

/// Where the simulated physical memory starts.
pub const PHYS_MEMORY_BASE: usize = 0x8000_0000;
pub const PHYS_MEMORY_SIZE: usize = 0x400_0000; // 64M
pub const PHYS_MEMORY_END: usize = PHYS_MEMORY_BASE + PHYS_MEMORY_SIZE;

/// Bytes a socket may have in flight before `sendmsg` blocks.
pub const DEFAULT_SEND_QUOTA: usize = 4 * peregrine::config::MAILBOX_SIZE;

/// log2 of the number of port hash buckets.
pub const PORT_HASH_BITS: usize = 7;
