#![allow(dead_code)]

pub use peregrine::test_hal::{pool, TestHal};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
