//! Error types shared across the YDS workspace.

use thiserror::Error;

/// Numeric error codes surfaced to callers. The values are stable across
/// this version and must not be reordered.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error.
    Ok = 0,
    /// Invalid argument.
    InvalArg = 1,
    /// Out of memory or mapping failure.
    NoMem = 2,
    /// Item not found.
    NotFound = 3,
    /// Internal invariant violation.
    Internal = 4,
    /// Unsupported operation.
    Unsupported = 5,
    /// Data validation failed.
    ValidationFailed = 6,
    /// Operation (RPC, notification) failed.
    OperationFailed = 7,
    /// Insufficient permissions.
    Unauthorized = 8,
    /// Failed to initialize or operate a lock.
    LockFailed = 9,
    /// A timed wait elapsed.
    TimeOut = 10,
    /// A subscriber callback reported an error.
    CallbackFailed = 11,
    /// Underlying system call failure.
    Sys = 12,
    /// Item already exists.
    Exists = 13,
}

/// Errors produced by any YDS subsystem.
#[derive(Error, Debug)]
pub enum YdsError {
    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {msg}")]
    InvalArg {
        /// What was wrong.
        msg: String,
    },

    /// Memory or mapping resources exhausted.
    #[error("Memory allocation failed: {msg}")]
    NoMem {
        /// Failing allocation description.
        msg: String,
    },

    /// A named item does not exist.
    #[error("Not found: {msg}")]
    NotFound {
        /// The missing item.
        msg: String,
    },

    /// An internal invariant was violated. These are bugs; no recovery is
    /// attempted.
    #[error("Internal error: {msg}")]
    Internal {
        /// Violated invariant.
        msg: String,
    },

    /// The requested operation is not supported.
    #[error("Unsupported: {msg}")]
    Unsupported {
        /// Unsupported request description.
        msg: String,
    },

    /// Data failed schema validation.
    #[error("Validation failed: {msg}")]
    ValidationFailed {
        /// Validator message.
        msg: String,
        /// Path of the offending node, if known.
        xpath: Option<String>,
    },

    /// An RPC/action or notification operation failed.
    #[error("Operation failed: {msg}")]
    OperationFailed {
        /// Failure description.
        msg: String,
    },

    /// The caller lacks permissions on a repository file.
    #[error("Access denied: {path}")]
    Unauthorized {
        /// Offending file path.
        path: String,
    },

    /// A lock could not be initialized or operated.
    #[error("Lock operation failed: {msg}")]
    LockFailed {
        /// Failing primitive and errno text.
        msg: String,
    },

    /// A timed lock or event wait elapsed. The caller may retry.
    #[error("Timeout elapsed: {msg}")]
    TimeOut {
        /// What was being waited for.
        msg: String,
    },

    /// A subscriber callback reported an error back to the originator.
    #[error("Callback failed: {msg}")]
    CallbackFailed {
        /// Subscriber-supplied message.
        msg: String,
        /// Path reported by the subscriber, if any.
        xpath: Option<String>,
    },

    /// An underlying system call failed.
    #[error("System error on \"{path}\": {errno}")]
    Sys {
        /// Offending path.
        path: String,
        /// OS errno text.
        errno: String,
    },

    /// The item already exists.
    #[error("Already exists: {msg}")]
    Exists {
        /// The duplicate item.
        msg: String,
    },
}

impl YdsError {
    /// Stable numeric code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            YdsError::InvalArg { .. } => ErrorCode::InvalArg,
            YdsError::NoMem { .. } => ErrorCode::NoMem,
            YdsError::NotFound { .. } => ErrorCode::NotFound,
            YdsError::Internal { .. } => ErrorCode::Internal,
            YdsError::Unsupported { .. } => ErrorCode::Unsupported,
            YdsError::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            YdsError::OperationFailed { .. } => ErrorCode::OperationFailed,
            YdsError::Unauthorized { .. } => ErrorCode::Unauthorized,
            YdsError::LockFailed { .. } => ErrorCode::LockFailed,
            YdsError::TimeOut { .. } => ErrorCode::TimeOut,
            YdsError::CallbackFailed { .. } => ErrorCode::CallbackFailed,
            YdsError::Sys { .. } => ErrorCode::Sys,
            YdsError::Exists { .. } => ErrorCode::Exists,
        }
    }

    /// Build a `Sys` error from an `errno`-style source, mapping EACCES to
    /// `Unauthorized`. EPERM stays `Sys`; the two are distinct conditions.
    pub fn from_errno(path: impl Into<String>, errno: nix::errno::Errno) -> Self {
        let path = path.into();
        if errno == nix::errno::Errno::EACCES {
            YdsError::Unauthorized { path }
        } else {
            YdsError::Sys {
                path,
                errno: errno.desc().to_string(),
            }
        }
    }

    /// Build a `Sys` error from a `std::io::Error` with the offending path.
    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            YdsError::Unauthorized { path }
        } else {
            YdsError::Sys {
                path,
                errno: err.to_string(),
            }
        }
    }
}

/// Result type used across the workspace.
pub type YdsResult<T> = Result<T, YdsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::Ok as u32, 0);
        assert_eq!(ErrorCode::InvalArg as u32, 1);
        assert_eq!(ErrorCode::NoMem as u32, 2);
        assert_eq!(ErrorCode::NotFound as u32, 3);
        assert_eq!(ErrorCode::Internal as u32, 4);
        assert_eq!(ErrorCode::Unsupported as u32, 5);
        assert_eq!(ErrorCode::ValidationFailed as u32, 6);
        assert_eq!(ErrorCode::OperationFailed as u32, 7);
        assert_eq!(ErrorCode::Unauthorized as u32, 8);
        assert_eq!(ErrorCode::LockFailed as u32, 9);
        assert_eq!(ErrorCode::TimeOut as u32, 10);
        assert_eq!(ErrorCode::CallbackFailed as u32, 11);
        assert_eq!(ErrorCode::Sys as u32, 12);
        assert_eq!(ErrorCode::Exists as u32, 13);
    }

    #[test]
    fn test_eacces_eperm_distinct() {
        let acc = YdsError::from_errno("/tmp/f", nix::errno::Errno::EACCES);
        let perm = YdsError::from_errno("/tmp/f", nix::errno::Errno::EPERM);
        assert_eq!(acc.code(), ErrorCode::Unauthorized);
        assert_eq!(perm.code(), ErrorCode::Sys);
    }
}
