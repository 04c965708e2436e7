use alloc::string::String;

/// Per-transfer completion error, as reported to the transfer's callback.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Endpoint stalled")]
    Stall,
    /// CRC error or response timeout after the retry budget ran out.
    #[error("Device not responding")]
    NotResponding,
    #[error("Babble detected")]
    Babble,
    /// Controller could not keep up with the data stream (overrun or underrun).
    #[error("Data buffer error")]
    DataBuffer,
    #[error("Bit stuff error")]
    BitStuff,
    /// Isochronous frame whose slot passed before the controller reached it.
    #[error("Frame not sent")]
    NotSent,
    #[error("Short isochronous frame")]
    Underrun,
    #[error("Transfer aborted")]
    Aborted,
    #[error("Transfer cancelled")]
    Cancelled,
    #[error("Timeout")]
    Timeout,
    #[error("Other: {0}")]
    Other(String),
}

impl TransferError {
    /// Errors the upper layer may treat as informational for isochronous data.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::Underrun)
    }
}
