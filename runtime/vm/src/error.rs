//! S-VM error type.

use alloc::string::String;
use core::fmt;

/// Broad classes of [`VmError`], used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad calling convention, fragment, signal code or interface version.
    /// Always detected before any buffer is touched.
    MalformedInput,
    /// Missing function, attribute or debug information. Expected outcome.
    NotFound,
    /// Allocation or configured limit exceeded.
    Resource,
    /// A call step failed; the caller must release the call buffers.
    Call,
}

/// S-VM errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Calling convention has an unknown version marker or cannot be parsed
    MalformedSignature,
    /// Fragment contains an unknown code or an unbalanced/nested span
    MalformedFragment,
    /// Fewer segment sizes than variadic spans
    SegmentListTooShort,
    /// A value does not match the slot type declared by the fragment
    TypeMismatch,
    /// Raw signal code is not one of the known signals
    UnknownSignal(u32),
    /// Module implementation was written against another interface version
    InterfaceVersionMismatch(u32),
    /// Function, import or attribute not found
    NotFound,
    /// Index past the end of an attribute or function table
    IndexOutOfRange,
    /// No debug information available
    Unavailable,
    /// Allocation failed or a configured limit was hit
    ResourceExhausted,
    /// Operation not valid in the current call/stack state
    InvalidState,
    /// Import signature does not match what the importer expects
    IncompatibleSignature,
    /// Buffer is smaller than the layout requires
    BufferTooSmall,
    /// Module-defined failure raised while executing a function
    Aborted(String),
}

impl VmError {
    /// Classifies the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedSignature
            | Self::MalformedFragment
            | Self::SegmentListTooShort
            | Self::TypeMismatch
            | Self::UnknownSignal(_)
            | Self::InterfaceVersionMismatch(_) => ErrorCategory::MalformedInput,
            Self::NotFound | Self::IndexOutOfRange | Self::Unavailable => ErrorCategory::NotFound,
            Self::ResourceExhausted => ErrorCategory::Resource,
            Self::InvalidState
            | Self::IncompatibleSignature
            | Self::BufferTooSmall
            | Self::Aborted(_) => ErrorCategory::Call,
        }
    }

    /// Returns true for the expected "not there" outcomes.
    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedSignature => f.write_str("malformed signature"),
            Self::MalformedFragment => f.write_str("malformed fragment"),
            Self::SegmentListTooShort => f.write_str("segment list too short"),
            Self::TypeMismatch => f.write_str("value type mismatch"),
            Self::UnknownSignal(code) => write!(f, "unknown signal {}", code),
            Self::InterfaceVersionMismatch(v) => {
                write!(f, "unsupported module interface version {}", v)
            }
            Self::NotFound => f.write_str("not found"),
            Self::IndexOutOfRange => f.write_str("index out of range"),
            Self::Unavailable => f.write_str("debug information unavailable"),
            Self::ResourceExhausted => f.write_str("resource exhausted"),
            Self::InvalidState => f.write_str("invalid call state"),
            Self::IncompatibleSignature => f.write_str("incompatible import signature"),
            Self::BufferTooSmall => f.write_str("buffer too small"),
            Self::Aborted(msg) => write!(f, "aborted: {}", msg),
        }
    }
}
