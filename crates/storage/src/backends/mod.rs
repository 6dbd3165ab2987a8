//! Response store backends.

pub mod filesystem;
pub mod memory;
