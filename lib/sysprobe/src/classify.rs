//! Per-process error classification.
//!
//! OS error codes are an unreliable signal for why a per-process query failed: `task_for_pid` reports the same error
//! for a missing process and a protected one, `OpenProcess` answers `ERROR_INVALID_PARAMETER` for processes that exited
//! a moment ago, and reading `/proc/<pid>/...` of a zombie fails in creative ways. So when a query fails, the process is
//! probed again, and the answer to "does it still exist, and is it a zombie" decides the error kind.

use std::io;

use crate::{
    error::{Error, Result},
    types::Pid,
};

/// Process liveness probes.
pub trait Liveness {
    /// Returns `true` if a process with this PID currently exists, zombies included.
    fn pid_exists(&self, pid: Pid) -> bool;

    /// Returns `true` if the process exists and is a zombie.
    fn is_zombie(&self, pid: Pid) -> bool;
}

/// Rejects PIDs that can never name a single process.
///
/// Negative values are aliases for process groups or "every process" in `kill(2)` and friends, and must never reach
/// the OS from a per-process query.
pub fn check_pid(pid: Pid) -> Result<()> {
    if pid < 0 {
        return Err(Error::NotFound { pid });
    }
    Ok(())
}

/// Classifies a failed per-process call.
pub fn classify<L: Liveness + ?Sized>(liveness: &L, pid: Pid, syscall: &str, error: io::Error) -> Error {
    if pid < 0 || !liveness.pid_exists(pid) {
        return Error::NotFound { pid };
    }

    if liveness.is_zombie(pid) {
        return Error::ZombieProcess { pid };
    }

    if error.kind() == io::ErrorKind::PermissionDenied {
        return Error::PermissionDenied {
            pid,
            syscall: syscall.to_string(),
        };
    }

    Error::ProcessOs {
        pid,
        syscall: syscall.to_string(),
        source: error,
    }
}

/// Reclassifies an error produced by a per-process query.
///
/// Errors that already carry a process-level kind, or that have nothing to do with the process, are left alone.
pub fn reclassify<L: Liveness + ?Sized>(liveness: &L, pid: Pid, error: Error) -> Error {
    match error {
        Error::Os { syscall, source } | Error::ProcessOs { syscall, source, .. } => {
            classify(liveness, pid, &syscall, source)
        }
        Error::Parse { .. } if !liveness.pid_exists(pid) => Error::NotFound { pid },
        Error::Parse { .. } if liveness.is_zombie(pid) => Error::ZombieProcess { pid },
        other => other,
    }
}

/// Extension methods for attaching per-process classification to results.
pub trait ClassifyExt<T> {
    /// Classifies the error of a failed per-process query.
    fn classify_for<L: Liveness + ?Sized>(self, liveness: &L, pid: Pid) -> Result<T>;
}

impl<T> ClassifyExt<T> for Result<T> {
    fn classify_for<L: Liveness + ?Sized>(self, liveness: &L, pid: Pid) -> Result<T> {
        self.map_err(|e| reclassify(liveness, pid, e))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::error::ErrorKind;

    #[derive(Default)]
    struct FakeLiveness {
        alive: HashSet<Pid>,
        zombies: HashSet<Pid>,
    }

    impl Liveness for FakeLiveness {
        fn pid_exists(&self, pid: Pid) -> bool {
            self.alive.contains(&pid) || self.zombies.contains(&pid)
        }

        fn is_zombie(&self, pid: Pid) -> bool {
            self.zombies.contains(&pid)
        }
    }

    fn eperm() -> io::Error {
        io::Error::from(io::ErrorKind::PermissionDenied)
    }

    #[test]
    fn vanished_process_is_not_found_regardless_of_errno() {
        let liveness = FakeLiveness::default();
        let err = classify(&liveness, 42, "task_for_pid", eperm());
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn zombie_wins_over_permission_denied() {
        let liveness = FakeLiveness {
            zombies: [42].into_iter().collect(),
            ..Default::default()
        };
        let err = classify(&liveness, 42, "proc_pidinfo", eperm());
        assert_eq!(err.kind(), ErrorKind::ZombieProcess);
    }

    #[test]
    fn live_process_permission_denied() {
        let liveness = FakeLiveness {
            alive: [1].into_iter().collect(),
            ..Default::default()
        };
        let err = classify(&liveness, 1, "open(/proc/1/environ)", eperm());
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("/proc/1/environ"));
    }

    #[test]
    fn live_process_other_error_keeps_source() {
        let liveness = FakeLiveness {
            alive: [1].into_iter().collect(),
            ..Default::default()
        };
        let err = classify(&liveness, 1, "read", io::Error::from_raw_os_error(5));
        assert_eq!(err.kind(), ErrorKind::TransientOsError);
        assert_eq!(err.raw_os_error(), Some(5));
    }

    #[test]
    fn negative_pids() {
        assert!(matches!(check_pid(-1), Err(Error::NotFound { pid: -1 })));
        assert!(check_pid(0).is_ok());

        let liveness = FakeLiveness {
            alive: [-1].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(classify(&liveness, -1, "kill", eperm()).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn reclassify_leaves_unrelated_errors() {
        let liveness = FakeLiveness::default();
        let err = reclassify(&liveness, 5, Error::unsupported("proc_cwd"));
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        let err: Result<()> = Err(Error::parse("/proc/5/stat", "truncated"));
        assert_eq!(err.classify_for(&liveness, 5).unwrap_err().kind(), ErrorKind::NotFound);
    }
}
