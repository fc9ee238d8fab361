use std::{io, path::PathBuf};

use snafu::Snafu;

use crate::types::Pid;

/// A specialized `Result` for binding-layer queries.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Binding-layer errors.
///
/// Every variant maps onto one of the kinds returned by [`Error::kind`], which is what callers should match on when they
/// only care about how to react to a failure, and not about its exact origin.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum Error {
    /// The referenced process no longer exists.
    #[snafu(display("process {} not found", pid))]
    NotFound {
        /// Process ID.
        pid: Pid,
    },

    /// The referenced device or interface no longer exists.
    #[snafu(display("no such device: {}", name))]
    NoSuchDevice {
        /// Device or interface name.
        name: String,
    },

    /// The OS refused the query for this process.
    #[snafu(display("access denied to process {} ({})", pid, syscall))]
    PermissionDenied {
        /// Process ID.
        pid: Pid,

        /// The call that was refused.
        syscall: String,
    },

    /// The process exists, but is a zombie.
    #[snafu(display("process {} is a zombie", pid))]
    ZombieProcess {
        /// Process ID.
        pid: Pid,
    },

    /// The metric or facility doesn't exist on this platform.
    #[snafu(display("{} is not supported on this platform", what))]
    Unsupported {
        /// What was asked for.
        what: String,
    },

    /// A system call failed for a reason that couldn't be classified further.
    #[snafu(display("{} failed: {}", syscall, source))]
    Os {
        /// The failed call.
        syscall: String,

        /// The verbatim OS error.
        source: io::Error,
    },

    /// A system call scoped to a process failed for a reason that couldn't be classified further.
    #[snafu(display("{} failed for process {}: {}", syscall, pid, source))]
    ProcessOs {
        /// Process ID.
        pid: Pid,

        /// The failed call.
        syscall: String,

        /// The verbatim OS error.
        source: io::Error,
    },

    /// Growing a kernel query buffer failed to allocate.
    #[snafu(display("failed to allocate {} bytes for a kernel query buffer", requested))]
    OutOfMemory {
        /// Requested buffer size, in bytes.
        requested: usize,
    },

    /// Kernel-provided text could not be interpreted.
    #[snafu(display("failed to parse {}: {}", path.display(), detail))]
    Parse {
        /// The file (or pseudo-file) being parsed.
        path: PathBuf,

        /// What was wrong with it.
        detail: String,
    },
}

/// The kind of an [`Error`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The process, device or interface no longer exists.
    NotFound,

    /// The OS refused the query due to a privilege boundary.
    PermissionDenied,

    /// The process is a zombie, and the attribute is permanently unavailable.
    ZombieProcess,

    /// The metric doesn't exist on this OS, kernel or hardware.
    Unsupported,

    /// Any other OS failure.
    TransientOsError,

    /// A kernel query buffer could not be allocated.
    OutOfMemory,
}

impl Error {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::NoSuchDevice { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ZombieProcess { .. } => ErrorKind::ZombieProcess,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Os { .. } | Self::ProcessOs { .. } | Self::Parse { .. } => ErrorKind::TransientOsError,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
        }
    }

    /// Creates an [`Error::Unsupported`] for the given metric.
    pub fn unsupported<S: Into<String>>(what: S) -> Self {
        Self::Unsupported { what: what.into() }
    }

    /// Creates an [`Error::Os`] from the calling thread's last OS error.
    pub fn last_os_error<S: Into<String>>(syscall: S) -> Self {
        Self::Os {
            syscall: syscall.into(),
            source: io::Error::last_os_error(),
        }
    }

    /// Creates an [`Error::Parse`].
    pub fn parse<P: Into<PathBuf>, D: Into<String>>(path: P, detail: D) -> Self {
        Self::Parse {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Returns the raw OS error code carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } | Self::ProcessOs { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(Error::NotFound { pid: 1 }.kind(), ErrorKind::NotFound);
        assert_eq!(Error::NoSuchDevice { name: "eth9".into() }.kind(), ErrorKind::NotFound);
        assert_eq!(Error::unsupported("cpu_freq").kind(), ErrorKind::Unsupported);
        assert_eq!(Error::parse("/proc/stat", "short line").kind(), ErrorKind::TransientOsError);
        assert_eq!(Error::OutOfMemory { requested: 1 }.kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn os_error_names_the_syscall() {
        let error = Error::Os {
            syscall: "sysctl(kern.proc)".into(),
            source: io::Error::from_raw_os_error(12),
        };
        assert!(error.to_string().starts_with("sysctl(kern.proc) failed: "));
        assert_eq!(error.raw_os_error(), Some(12));
    }
}
