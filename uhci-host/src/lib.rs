#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub use usb_if::err::*;
pub use usb_if::host::{DeviceSpeed, EndpointAddress, USBError};
pub use usb_if::transfer::*;

#[macro_use]
mod _macros;

pub mod backend;
pub mod err;
pub mod queue;

mod osal;
pub use osal::Kernel;

pub use backend::uhci::*;

// Controller-visible (bus) address. UHCI masters 32-bit addresses only.
define_int_type!(PhysAddr, u32);

define_int_type!(RequestId, u64);
