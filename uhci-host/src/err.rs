use core::fmt::Display;

pub use usb_if::err::TransferError;
pub use usb_if::host::USBError;

use crate::backend::uhci::def::TdStatus;

pub type Result<T = ()> = core::result::Result<T, USBError>;

pub trait ConvertUhciError {
    fn to_result(self) -> core::result::Result<(), TransferError>;
}

impl ConvertUhciError for TdStatus {
    fn to_result(self) -> core::result::Result<(), TransferError> {
        let errors = self & TdStatus::ERRORS;
        if errors.is_empty() {
            return Ok(());
        }
        // The controller sets STALLED together with CRC/timeout and babble once
        // the retry budget runs out, so those win over a plain stall.
        if errors.contains(TdStatus::CRC_TIMEOUT) {
            Err(TransferError::NotResponding)
        } else if errors.contains(TdStatus::BABBLE) {
            Err(TransferError::Babble)
        } else if errors.contains(TdStatus::STALLED) {
            Err(TransferError::Stall)
        } else if errors.contains(TdStatus::DATA_BUFFER) {
            Err(TransferError::DataBuffer)
        } else {
            Err(TransferError::BitStuff)
        }
    }
}

/// Bridges foreign error types into [`USBError`].
#[derive(thiserror::Error, Debug)]
pub struct HostError(USBError);

impl Display for HostError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<dma_api::DError> for HostError {
    fn from(value: dma_api::DError) -> Self {
        match value {
            dma_api::DError::NoMemory => Self(USBError::NoMemory),
            // Memory came back above the 32-bit window.
            dma_api::DError::DmaMaskNotMatch { mask: _, got: _ } => Self(USBError::NoMemory),
            dma_api::DError::LayoutError => Self(USBError::NoMemory),
        }
    }
}

impl From<HostError> for USBError {
    fn from(value: HostError) -> Self {
        value.0
    }
}
