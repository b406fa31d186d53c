//! Result codes
//!
//! Every fallible kernel service reports its outcome through [`ResultCode`].
//! The numeric values are kept compatible with the classic CMSIS status
//! encoding, but applications must not rely on them; the enumeration is the
//! contract.
use core::fmt;

/// Status code returned by kernel services.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    /// The operation completed; no error or event occurred.
    Success = 0,

    /// The operation completed; a timeout event occurred.
    EventTimeout = 0x40,

    /// A mandatory parameter was missing or specified an incorrect object.
    ErrorParameter = 0x80,

    /// The specified resource was not available.
    ErrorResource = 0x81,

    /// The operation is not allowed in interrupt context.
    ErrorIsr = 0x82,

    /// An interrupt-level service was re-entered on the same object before
    /// the first invocation completed.
    ErrorIsrRecursive = 0x83,

    /// The system cannot determine the priority or the thread has an illegal
    /// priority.
    ErrorPriority = 0x84,

    /// A structural capacity limit was reached.
    ErrorNoMemory = 0x85,

    /// The value of a parameter is out of range.
    ErrorValue = 0x86,

    /// The specified resource was not available within the timeout period.
    ErrorTimeoutResource = 0xc1,

    /// Unspecified kernel error. Callers treat this as fatal.
    ErrorOs = 0xff,

    /// An argument is invalid for the requested operation.
    Einval = 0x100,

    /// A blocking operation was interrupted.
    Eintr = 0x101,

    /// A counter would exceed its configured maximum.
    Eoverflow = 0x102,
}

impl ResultCode {
    /// POSIX-flavored alias for [`ResultCode::ErrorResource`].
    pub const EAGAIN: Self = Self::ErrorResource;

    /// POSIX-flavored alias for [`ResultCode::ErrorTimeoutResource`].
    pub const ETIMEDOUT: Self = Self::ErrorTimeoutResource;
}

/// Shorthand for `core::result::Result<T, ResultCode>`.
pub type Result<T = ()> = core::result::Result<T, ResultCode>;

/// Get a human-readable description of a result code.
pub fn strerror(code: ResultCode) -> &'static str {
    match code {
        ResultCode::Success => "no error",
        ResultCode::EventTimeout => "timeout event occurred",
        ResultCode::ErrorParameter => "parameter error",
        ResultCode::ErrorResource => "resource not available",
        ResultCode::ErrorIsr => "not allowed in interrupt context",
        ResultCode::ErrorIsrRecursive => "interrupt-level service re-entered",
        ResultCode::ErrorPriority => "illegal priority",
        ResultCode::ErrorNoMemory => "out of memory",
        ResultCode::ErrorValue => "value out of range",
        ResultCode::ErrorTimeoutResource => "resource not available within timeout",
        ResultCode::ErrorOs => "unspecified kernel error",
        ResultCode::Einval => "invalid argument",
        ResultCode::Eintr => "interrupted",
        ResultCode::Eoverflow => "counter overflow",
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::EventTimeout => "EventTimeout",
            Self::ErrorParameter => "ErrorParameter",
            Self::ErrorResource => "ErrorResource",
            Self::ErrorIsr => "ErrorIsr",
            Self::ErrorIsrRecursive => "ErrorIsrRecursive",
            Self::ErrorPriority => "ErrorPriority",
            Self::ErrorNoMemory => "ErrorNoMemory",
            Self::ErrorValue => "ErrorValue",
            Self::ErrorTimeoutResource => "ErrorTimeoutResource",
            Self::ErrorOs => "ErrorOs",
            Self::Einval => "Einval",
            Self::Eintr => "Eintr",
            Self::Eoverflow => "Eoverflow",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(strerror(*self))
    }
}
