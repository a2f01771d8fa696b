/// The error type for hypervisor core operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgError {
    Aborted,
    AlreadyExists,
    BadState,
    Busy,
    Denied,
    InvalidAddress,
    InvalidParam,
    NoMemory,
    NotSupported,
}

/// A [`Result`] type with [`PgError`] as the error type.
pub type PgResult<T = ()> = Result<T, PgError>;

macro_rules! pg_err_type {
    ($err: ident) => {{
        use $crate::error::PgError::*;
        warn!("[PgError::{:?}]", $err);
        $err
    }};
    ($err: ident, $msg: expr) => {{
        use $crate::error::PgError::*;
        warn!("[PgError::{:?}] {}", $err, $msg);
        $err
    }};
}

macro_rules! pg_err {
    ($err: ident) => {
        Err(pg_err_type!($err))
    };
    ($err: ident, $msg: expr) => {
        Err(pg_err_type!($err, $msg))
    };
}

/// Stops the core on a violated invariant. Nothing continues past this point.
macro_rules! halt {
    ($($arg: tt)+) => {{
        error!($($arg)+);
        panic!($($arg)+)
    }};
}

macro_rules! check {
    ($cond: expr) => {
        if !$cond {
            halt!("[PG] check failed: {}", stringify!($cond));
        }
    };
    ($cond: expr, $($arg: tt)+) => {
        if !$cond {
            halt!($($arg)+);
        }
    };
}
