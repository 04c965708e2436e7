use crate::{err::TransferError, transfer::Direction};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum USBError {
    #[error("Timeout")]
    Timeout,
    #[error("No memory available")]
    NoMemory,
    #[error("Transfer error: {0}")]
    TransferError(#[from] TransferError),
    #[error("Not initialized")]
    NotInitialized,
    #[error("Not found")]
    NotFound,
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("Resource busy")]
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceSpeed {
    Low = 0,
    Full = 1,
    High = 2,
}

impl From<u8> for DeviceSpeed {
    fn from(value: u8) -> Self {
        match value {
            0 => DeviceSpeed::Low,
            2 => DeviceSpeed::High,
            _ => DeviceSpeed::Full,
        }
    }
}

/// Identifies one endpoint of one function on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointAddress {
    /// Device (function) address, 0..=127.
    pub function: u8,
    /// Endpoint number, 0..=15.
    pub number: u8,
    pub direction: Direction,
}

impl EndpointAddress {
    pub fn new(function: u8, number: u8, direction: Direction) -> Self {
        Self {
            function,
            number,
            direction,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.function < 128 && self.number < 16
    }
}
