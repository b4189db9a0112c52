//! VM error taxonomy
//!
//! Every fallible VMO operation returns [`VmResult`]. Transient conditions
//! (a page request that must be waited on, or a batch that is still being
//! built) are not errors and are reported through
//! [`Resolution`](crate::vm::Resolution) instead. Programming errors such as
//! unpinning a page that was never pinned are fatal and panic.

use thiserror::Error;

/// Result type for VMO operations
pub type VmResult<T> = Result<T, VmError>;

/// Errors returned by VMO operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// The operation is not valid for this kind of object
    #[error("operation not supported by this object")]
    NotSupported,
    /// The range falls outside the object or its window
    #[error("range out of bounds")]
    OutOfRange,
    /// Misaligned or otherwise malformed arguments
    #[error("invalid arguments")]
    InvalidArgs,
    /// The object is in a state that forbids the operation
    #[error("object in bad state")]
    BadState,
    /// Nothing matched the query
    #[error("not found")]
    NotFound,
    /// The resource is temporarily or permanently gone (discarded pages)
    #[error("unavailable")]
    Unavailable,
    /// Page or metadata allocation failed
    #[error("out of memory")]
    NoMemory,
    /// The pager failed to read the data
    #[error("pager I/O failure")]
    Io,
    /// The pager detected corrupted data
    #[error("pager data integrity failure")]
    IoDataIntegrity,
    /// The pager ran out of space
    #[error("pager out of space")]
    NoSpace,
}

impl VmError {
    /// Whether a pager may complete an outstanding page request with this error
    pub fn is_valid_page_request_failure(self) -> bool {
        matches!(
            self,
            VmError::Io | VmError::IoDataIntegrity | VmError::BadState | VmError::NoSpace | VmError::NoMemory
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pager_failure_codes() {
        assert!(VmError::Io.is_valid_page_request_failure());
        assert!(VmError::NoSpace.is_valid_page_request_failure());
        assert!(!VmError::OutOfRange.is_valid_page_request_failure());
        assert!(!VmError::NotSupported.is_valid_page_request_failure());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(alloc::format!("{}", VmError::OutOfRange), "range out of bounds");
    }
}
