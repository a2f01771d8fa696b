//! The FF-A style calling convention between partitions and the hypervisor.

use crate::error::PgError;
use crate::vm::VmId;

pub const FFA_ERROR_32: u32 = 0x8400_0060;
pub const FFA_SUCCESS_32: u32 = 0x8400_0061;
pub const FFA_INTERRUPT_32: u32 = 0x8400_0062;
pub const FFA_VERSION_32: u32 = 0x8400_0063;
pub const FFA_RX_RELEASE_32: u32 = 0x8400_0065;
pub const FFA_RXTX_MAP_32: u32 = 0x8400_0066;
pub const FFA_PARTITION_INFO_GET_32: u32 = 0x8400_0068;
pub const FFA_ID_GET_32: u32 = 0x8400_0069;
pub const FFA_MSG_POLL_32: u32 = 0x8400_006A;
pub const FFA_MSG_WAIT_32: u32 = 0x8400_006B;
pub const FFA_YIELD_32: u32 = 0x8400_006C;
pub const FFA_RUN_32: u32 = 0x8400_006D;
pub const FFA_MSG_SEND_32: u32 = 0x8400_006E;

/// Calls and return codes specific to this hypervisor.
pub const PG_MAILBOX_WRITABLE_GET: u32 = 0xff01;
pub const PG_MAILBOX_WAITER_GET: u32 = 0xff02;
pub const PG_INTERRUPT_ENABLE: u32 = 0xff03;
pub const PG_INTERRUPT_GET: u32 = 0xff04;
pub const PG_INTERRUPT_INJECT: u32 = 0xff05;
pub const PG_FFA_RUN_WAIT_FOR_INTERRUPT: u32 = 0xff06;
pub const PG_FFA_RUN_WAKE_UP: u32 = 0xff07;

pub const FFA_VERSION_MAJOR: u32 = 1;
pub const FFA_VERSION_MINOR: u32 = 0;

/// `flags` bit of `FFA_MSG_SEND` asking to be told when the receiver
/// becomes writable.
pub const FFA_MSG_SEND_NOTIFY: u64 = 0x1;

numeric_enum_macro::numeric_enum! {
    #[repr(i32)]
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub enum FfaError {
        NotSupported = -1,
        InvalidParameters = -2,
        NoMemory = -3,
        Busy = -4,
        Interrupted = -5,
        Denied = -6,
        Retry = -7,
        Aborted = -8,
    }
}

impl From<PgError> for FfaError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::NoMemory => Self::NoMemory,
            PgError::Busy => Self::Busy,
            PgError::Denied | PgError::AlreadyExists => Self::Denied,
            PgError::Aborted => Self::Aborted,
            PgError::NotSupported => Self::NotSupported,
            PgError::InvalidAddress | PgError::InvalidParam | PgError::BadState => {
                Self::InvalidParameters
            }
        }
    }
}

impl From<FfaError> for PgError {
    fn from(err: FfaError) -> Self {
        match err {
            FfaError::NotSupported => Self::NotSupported,
            FfaError::InvalidParameters => Self::InvalidParam,
            FfaError::NoMemory => Self::NoMemory,
            FfaError::Busy | FfaError::Retry | FfaError::Interrupted => Self::Busy,
            FfaError::Denied => Self::Denied,
            FfaError::Aborted => Self::Aborted,
        }
    }
}

/// Register values exchanged on a call or return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FfaValue {
    pub func: u32,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
    pub arg6: u64,
    pub arg7: u64,
}

impl FfaValue {
    pub const fn new(func: u32) -> Self {
        Self {
            func,
            arg1: 0,
            arg2: 0,
            arg3: 0,
            arg4: 0,
            arg5: 0,
            arg6: 0,
            arg7: 0,
        }
    }

    pub const fn success() -> Self {
        Self::new(FFA_SUCCESS_32)
    }

    pub const fn with_arg1(mut self, arg1: u64) -> Self {
        self.arg1 = arg1;
        self
    }

    pub const fn with_arg2(mut self, arg2: u64) -> Self {
        self.arg2 = arg2;
        self
    }

    pub const fn with_arg3(mut self, arg3: u64) -> Self {
        self.arg3 = arg3;
        self
    }

    pub fn error(err: FfaError) -> Self {
        Self::new(FFA_ERROR_32).with_arg2(err as i32 as u32 as u64)
    }

    pub fn is_error(&self) -> bool {
        self.func == FFA_ERROR_32
    }

    /// The error code of an `FFA_ERROR_32` value.
    pub fn error_code(&self) -> Option<FfaError> {
        if !self.is_error() {
            return None;
        }
        FfaError::try_from(self.arg2 as u32 as i32).ok()
    }

    /// The VM id packed in `arg1` of RUN results.
    pub fn vm_id(&self) -> VmId {
        vm_id_of(self.arg1)
    }

    pub fn vcpu_index(&self) -> u16 {
        vcpu_index_of(self.arg1)
    }

    /// Sender of an `FFA_MSG_SEND_32`.
    pub fn msg_send_sender(&self) -> VmId {
        (self.arg1 >> 16) as VmId
    }

    /// Receiver of an `FFA_MSG_SEND_32`.
    pub fn msg_send_receiver(&self) -> VmId {
        (self.arg1 & 0xffff) as VmId
    }

    pub fn msg_send_size(&self) -> u32 {
        self.arg3 as u32
    }

    /// Timeout carried by `PG_FFA_RUN_WAIT_FOR_INTERRUPT` and
    /// `FFA_MSG_WAIT_32` results.
    pub fn sleep_time(&self) -> u64 {
        self.arg2
    }
}

impl From<PgError> for FfaValue {
    fn from(err: PgError) -> Self {
        Self::error(err.into())
    }
}

/// Packs a VM id and vCPU index as they appear in `arg1`.
pub const fn vm_vcpu(vm_id: VmId, vcpu_index: u16) -> u64 {
    ((vm_id as u64) << 16) | vcpu_index as u64
}

pub const fn vm_id_of(arg: u64) -> VmId {
    (arg >> 16) as VmId
}

pub const fn vcpu_index_of(arg: u64) -> u16 {
    (arg & 0xffff) as u16
}

pub const fn msg_send_attrs(sender: VmId, receiver: VmId) -> u64 {
    ((sender as u64) << 16) | receiver as u64
}
