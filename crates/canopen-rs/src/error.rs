use crate::sdo::SdoAbort;
use crate::types::NodeIdError;
use core::fmt;

/// Defines a portable, descriptive error type for the CANopen stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanOpenError {
    /// The CAN identifier does not fit the frame format.
    InvalidCanId(u32),
    /// The payload exceeds the maximum frame length.
    FrameTooLarge,
    /// No send hook has been installed on the network interface.
    NoDriver,
    /// An underlying I/O error occurred in the driver.
    IoError,
    /// A value in a frame is not a valid node-ID.
    InvalidNodeId(u8),
    /// A value is not a valid static data type identifier.
    InvalidDataType(u16),
    /// An attempt was made to decode a value with an incorrect data type or
    /// length.
    TypeMismatch,
    /// A value lies outside the declared `[min, max]` range of its entry.
    ValueOutOfRange,
    /// The requested object dictionary index does not exist.
    ObjectNotFound,
    /// The requested sub-index does not exist for the given object.
    SubIndexNotFound,
    /// The access mode of the entry forbids the requested operation.
    AccessDenied,
    /// The service has an operation in flight and cannot accept another.
    Busy,
    /// The service is not active in the current NMT state or not configured.
    NotReady,
    /// A peer aborted an SDO or LSS transfer.
    Aborted(SdoAbort),
    /// A mandatory object was missing or invalid during node creation.
    ValidationError(&'static str),
    /// Internal logic error.
    InternalError(&'static str),
}

impl fmt::Display for CanOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCanId(id) => write!(f, "invalid CAN identifier {:#X}", id),
            Self::FrameTooLarge => write!(f, "payload exceeds maximum frame length"),
            Self::NoDriver => write!(f, "no send hook installed"),
            Self::IoError => write!(f, "underlying I/O error"),
            Self::InvalidNodeId(v) => write!(f, "invalid node-ID: {}", v),
            Self::InvalidDataType(v) => write!(f, "invalid data type: {:#06X}", v),
            Self::TypeMismatch => write!(f, "data type mismatch"),
            Self::ValueOutOfRange => write!(f, "value outside declared range"),
            Self::ObjectNotFound => write!(f, "object not found in dictionary"),
            Self::SubIndexNotFound => write!(f, "sub-index not found"),
            Self::AccessDenied => write!(f, "access mode forbids operation"),
            Self::Busy => write!(f, "service busy"),
            Self::NotReady => write!(f, "service not active or not configured"),
            Self::Aborted(code) => write!(f, "transfer aborted: {}", code),
            Self::ValidationError(s) => write!(f, "validation error: {}", s),
            Self::InternalError(s) => write!(f, "internal error: {}", s),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CanOpenError {}

// --- From Implementations for Error Conversion ---

impl From<NodeIdError> for CanOpenError {
    fn from(err: NodeIdError) -> Self {
        match err {
            NodeIdError::InvalidRange(val) => CanOpenError::InvalidNodeId(val),
        }
    }
}

impl From<SdoAbort> for CanOpenError {
    fn from(code: SdoAbort) -> Self {
        CanOpenError::Aborted(code)
    }
}

impl From<&'static str> for CanOpenError {
    fn from(s: &'static str) -> Self {
        CanOpenError::InternalError(s)
    }
}
