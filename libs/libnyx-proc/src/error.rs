//! Error types
//!
//! Two layers: [`Errno`] is what the syscall boundary sees, [`ProcError`]
//! is what library entry points return. Resource exhaustion of the fixed
//! tables is kept in its own class so callers cannot mistake it for an
//! ordinary operational failure.

use thiserror::Error;

/// POSIX-style error codes surfaced to guest binaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(i32)]
pub enum Errno {
    /// No matching or no terminated child
    #[error("no child processes")]
    ECHILD = libc::ECHILD,
    /// Blocking wait interrupted by an asynchronous signal
    #[error("interrupted system call")]
    EINTR = libc::EINTR,
    /// Process does not exist
    #[error("no such process")]
    ESRCH = libc::ESRCH,
    /// Unsupported selector or resource kind
    #[error("invalid argument")]
    EINVAL = libc::EINVAL,
    /// User buffer failed address validation
    #[error("bad address")]
    EFAULT = libc::EFAULT,
    /// Primitive not supported
    #[error("function not implemented")]
    ENOSYS = libc::ENOSYS,
}

impl Errno {
    /// Positive errno value
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Negative value returned at the syscall boundary
    pub const fn as_neg(self) -> i64 {
        -(self as i64)
    }

    /// Convert a negative syscall return back into an `Errno`
    pub fn from_neg(value: i64) -> Option<Self> {
        match -value {
            v if v == libc::ECHILD as i64 => Some(Self::ECHILD),
            v if v == libc::EINTR as i64 => Some(Self::EINTR),
            v if v == libc::ESRCH as i64 => Some(Self::ESRCH),
            v if v == libc::EINVAL as i64 => Some(Self::EINVAL),
            v if v == libc::EFAULT as i64 => Some(Self::EFAULT),
            v if v == libc::ENOSYS as i64 => Some(Self::ENOSYS),
            _ => None,
        }
    }
}

/// Library error type
#[derive(Debug, Error)]
pub enum ProcError {
    /// Recoverable condition reported to the caller
    #[error("{0}")]
    Errno(#[from] Errno),

    /// Every slot of the shared process table is in use
    #[error("Process table full ({capacity} slots)")]
    TableFull { capacity: usize },

    /// The local child pool has no free entry left
    #[error("Maximum number of child processes exceeded ({capacity})")]
    ChildPoolFull { capacity: usize },

    /// Shared region exists but does not match the expected layout
    #[error("Shared region layout mismatch: {0}")]
    Layout(String),

    /// Failure creating or mapping the shared region or its lock
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for process-model operations
pub type Result<T> = std::result::Result<T, ProcError>;

impl ProcError {
    /// Fixed-capacity exhaustion; the instance cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TableFull { .. } | Self::ChildPoolFull { .. })
    }

    /// The errno carried by a recoverable error, if any
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Errno(e) => Some(*e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_codes() {
        assert_eq!(Errno::ECHILD.as_neg(), -10);
        assert_eq!(Errno::EINTR.as_neg(), -4);
        assert_eq!(Errno::ESRCH.as_neg(), -3);
        assert_eq!(Errno::EINVAL.as_neg(), -22);
        assert_eq!(Errno::EFAULT.as_neg(), -14);
        assert_eq!(Errno::ENOSYS.as_neg(), -38);
    }

    #[test]
    fn test_from_neg() {
        for e in [
            Errno::ECHILD,
            Errno::EINTR,
            Errno::ESRCH,
            Errno::EINVAL,
            Errno::EFAULT,
            Errno::ENOSYS,
        ] {
            assert_eq!(Errno::from_neg(e.as_neg()), Some(e));
        }
        assert_eq!(Errno::from_neg(0), None);
        assert_eq!(Errno::from_neg(-1), None);
    }

    #[test]
    fn test_fatal_class() {
        assert!(ProcError::TableFull { capacity: 8 }.is_fatal());
        assert!(ProcError::ChildPoolFull { capacity: 8 }.is_fatal());
        assert!(!ProcError::from(Errno::ECHILD).is_fatal());
        assert_eq!(ProcError::from(Errno::ESRCH).errno(), Some(Errno::ESRCH));
        assert_eq!(ProcError::TableFull { capacity: 8 }.errno(), None);
    }
}
