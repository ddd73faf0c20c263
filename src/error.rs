//! USB Core Error Types

use core::fmt;

/// USB core error codes returned by subsystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// A parameter was malformed or out of range
    InvalidParameter,
    /// The target device has been disconnected
    DeviceNotConnected,
    /// Memory or controller context allocation failed
    AllocationFailed,
    /// Cancel was issued before the transfer was submitted
    TooEarly,
    /// Cancel raced with completion and lost
    TooLate,
    /// The operation cannot complete in the current state
    NotReady,
    /// The controller does not implement this operation
    NotSupported,
    /// The requested object does not exist
    NotFound,
    /// Controller interface version mismatch at registration
    VersionMismatch,
    /// A supplied buffer is too small for the requested data
    BufferTooSmall,
    /// All 127 bus addresses are in use
    NoFreeAddresses,
    /// The controller has been torn down
    ControllerGone,
    /// A transfer failed with the given kind
    Transfer(TransferError),
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::InvalidParameter => write!(f, "Invalid parameter"),
            UsbError::DeviceNotConnected => write!(f, "Device not connected"),
            UsbError::AllocationFailed => write!(f, "Allocation failed"),
            UsbError::TooEarly => write!(f, "Too early to cancel"),
            UsbError::TooLate => write!(f, "Too late to cancel"),
            UsbError::NotReady => write!(f, "Not ready"),
            UsbError::NotSupported => write!(f, "Operation not supported"),
            UsbError::NotFound => write!(f, "Not found"),
            UsbError::VersionMismatch => write!(f, "Interface version mismatch"),
            UsbError::BufferTooSmall => write!(f, "Buffer too small"),
            UsbError::NoFreeAddresses => write!(f, "No free bus addresses"),
            UsbError::ControllerGone => write!(f, "Controller has been torn down"),
            UsbError::Transfer(kind) => write!(f, "Transfer failed: {}", kind),
        }
    }
}

impl From<TransferError> for UsbError {
    fn from(kind: TransferError) -> Self {
        UsbError::Transfer(kind)
    }
}

/// Result type used throughout the USB core.
pub type Result<T> = core::result::Result<T, UsbError>;

/// Per-transfer failure kind, recorded on the transfer for each attempt.
///
/// `None` means the most recent attempt completed successfully.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    None = 0,
    NotStarted = 1,
    Cancelled = 2,
    AllocatedIncorrectly = 3,
    DoubleSubmitted = 4,
    IncorrectlyFilledOut = 5,
    FailedToSubmit = 6,
    Stalled = 7,
    DataBuffer = 8,
    Babble = 9,
    Nak = 10,
    CrcOrTimeout = 11,
    Bitstuff = 12,
    MissedMicroframe = 13,
    MisalignedBuffer = 14,
    DeviceNotConnected = 15,
    ShortPacket = 16,
}

impl From<u32> for TransferError {
    fn from(value: u32) -> Self {
        match value {
            0 => TransferError::None,
            1 => TransferError::NotStarted,
            2 => TransferError::Cancelled,
            3 => TransferError::AllocatedIncorrectly,
            4 => TransferError::DoubleSubmitted,
            5 => TransferError::IncorrectlyFilledOut,
            6 => TransferError::FailedToSubmit,
            7 => TransferError::Stalled,
            8 => TransferError::DataBuffer,
            9 => TransferError::Babble,
            10 => TransferError::Nak,
            11 => TransferError::CrcOrTimeout,
            12 => TransferError::Bitstuff,
            13 => TransferError::MissedMicroframe,
            14 => TransferError::MisalignedBuffer,
            15 => TransferError::DeviceNotConnected,
            _ => TransferError::ShortPacket,
        }
    }
}

impl TransferError {
    /// Whether this kind is an endpoint halt that clears with
    /// `CLEAR_FEATURE(ENDPOINT_HALT)` followed by a resubmit.
    pub fn is_recoverable_halt(self) -> bool {
        self == TransferError::Stalled
    }

    /// Fold the recorded kind into an operation result.
    pub fn into_result(self) -> Result<()> {
        match self {
            TransferError::None => Ok(()),
            kind => Err(UsbError::Transfer(kind)),
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::None => write!(f, "No error"),
            TransferError::NotStarted => write!(f, "Transfer not started"),
            TransferError::Cancelled => write!(f, "Transfer cancelled"),
            TransferError::AllocatedIncorrectly => write!(f, "Transfer allocated incorrectly"),
            TransferError::DoubleSubmitted => write!(f, "Transfer already submitted"),
            TransferError::IncorrectlyFilledOut => write!(f, "Transfer incorrectly filled out"),
            TransferError::FailedToSubmit => write!(f, "Controller refused submission"),
            TransferError::Stalled => write!(f, "Endpoint stalled"),
            TransferError::DataBuffer => write!(f, "Data buffer error"),
            TransferError::Babble => write!(f, "Babble detected"),
            TransferError::Nak => write!(f, "NAK received"),
            TransferError::CrcOrTimeout => write!(f, "CRC or timeout error"),
            TransferError::Bitstuff => write!(f, "Bit stuffing error"),
            TransferError::MissedMicroframe => write!(f, "Missed microframe"),
            TransferError::MisalignedBuffer => write!(f, "Misaligned buffer"),
            TransferError::DeviceNotConnected => write!(f, "Device not connected"),
            TransferError::ShortPacket => write!(f, "Short packet"),
        }
    }
}
