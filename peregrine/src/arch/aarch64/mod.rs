mod mm;

pub use mm::Aarch64Mm;
