//! Error taxonomy shared by every module
//!
//! Each variant maps onto a stable wire status carried in the
//! `api_status` slot of a [`CommandBlock`](crate::command::CommandBlock),
//! so the broker and this layer agree on failure codes.

use thiserror::Error;

/// Result type for all coordination-layer operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Errors returned by the coordination layer
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("object already exists")]
    AlreadyExists,

    #[error("module already initialized")]
    AlreadyInitialized,

    #[error("not found")]
    NotFound,

    #[error("offset out of range")]
    OutOfRange,

    #[error("invalid state")]
    InvalidState,

    #[error("gate is busy")]
    Busy,

    #[error("object still in use by another processor")]
    InUse,

    #[error("out of shared memory")]
    OutOfMemory,

    #[error("status tag missing or mismatched")]
    Corrupted,

    #[error("timed out")]
    Timeout,

    #[error("broker channel failure")]
    ChannelFailure,
}

// ============================================================================
// Wire Status Codes
// ============================================================================

/// Operation successful
pub const S_SUCCESS: i32 = 0;
/// Generic failure
pub const E_FAIL: i32 = -1;
pub const E_INVALIDARG: i32 = -2;
pub const E_MEMORY: i32 = -3;
pub const E_ALREADYEXISTS: i32 = -4;
pub const E_NOTFOUND: i32 = -5;
pub const E_TIMEOUT: i32 = -6;
pub const E_INVALIDSTATE: i32 = -7;
/// OS or transport failure on the broker side
pub const E_OSFAILURE: i32 = -8;
pub const E_BUSY: i32 = -9;
pub const E_INUSE: i32 = -11;
pub const E_CORRUPTED: i32 = -12;
pub const E_OUTOFRANGE: i32 = -13;
pub const E_ALREADYSETUP: i32 = -14;

impl IpcError {
    /// Wire status for this error
    pub const fn status(self) -> i32 {
        match self {
            IpcError::InvalidArgument => E_INVALIDARG,
            IpcError::AlreadyExists => E_ALREADYEXISTS,
            IpcError::AlreadyInitialized => E_ALREADYSETUP,
            IpcError::NotFound => E_NOTFOUND,
            IpcError::OutOfRange => E_OUTOFRANGE,
            IpcError::InvalidState => E_INVALIDSTATE,
            IpcError::Busy => E_BUSY,
            IpcError::InUse => E_INUSE,
            IpcError::OutOfMemory => E_MEMORY,
            IpcError::Corrupted => E_CORRUPTED,
            IpcError::Timeout => E_TIMEOUT,
            IpcError::ChannelFailure => E_OSFAILURE,
        }
    }

    /// Convert a wire status back into a result
    ///
    /// Non-negative values are success. Unknown failure codes are reported
    /// as `ChannelFailure` since the broker did not complete the request.
    pub const fn from_status(status: i32) -> IpcResult<()> {
        if status >= S_SUCCESS {
            return Ok(());
        }
        Err(match status {
            E_INVALIDARG => IpcError::InvalidArgument,
            E_MEMORY => IpcError::OutOfMemory,
            E_ALREADYEXISTS => IpcError::AlreadyExists,
            E_NOTFOUND => IpcError::NotFound,
            E_TIMEOUT => IpcError::Timeout,
            E_INVALIDSTATE => IpcError::InvalidState,
            E_BUSY => IpcError::Busy,
            E_INUSE => IpcError::InUse,
            E_CORRUPTED => IpcError::Corrupted,
            E_OUTOFRANGE => IpcError::OutOfRange,
            E_ALREADYSETUP => IpcError::AlreadyInitialized,
            _ => IpcError::ChannelFailure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [IpcError; 12] = [
        IpcError::InvalidArgument,
        IpcError::AlreadyExists,
        IpcError::AlreadyInitialized,
        IpcError::NotFound,
        IpcError::OutOfRange,
        IpcError::InvalidState,
        IpcError::Busy,
        IpcError::InUse,
        IpcError::OutOfMemory,
        IpcError::Corrupted,
        IpcError::Timeout,
        IpcError::ChannelFailure,
    ];

    #[test]
    fn test_status_codes_are_distinct_failures() {
        for (i, a) in ALL.iter().enumerate() {
            assert!(a.status() < 0);
            for b in &ALL[i + 1..] {
                assert_ne!(a.status(), b.status(), "{:?} and {:?} share a code", a, b);
            }
        }
    }

    #[test]
    fn test_status_decodes_to_same_error() {
        for err in ALL {
            assert_eq!(IpcError::from_status(err.status()), Err(err));
        }
        assert_eq!(IpcError::from_status(S_SUCCESS), Ok(()));
        assert_eq!(IpcError::from_status(2), Ok(()));
        assert_eq!(IpcError::from_status(E_FAIL), Err(IpcError::ChannelFailure));
        assert_eq!(IpcError::from_status(-77), Err(IpcError::ChannelFailure));
    }
}
