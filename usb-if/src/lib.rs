#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod err;
pub mod host;
pub mod transfer;

pub use host::DeviceSpeed;
