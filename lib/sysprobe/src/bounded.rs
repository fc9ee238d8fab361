//! Bounded waits for calls that can hang.

use std::{io, sync::mpsc, thread, time::Duration};

use tracing::debug;

use crate::error::{Error, Result};

/// Runs `f` on a worker thread and waits at most `timeout` for it to finish.
///
/// If the deadline passes first, the worker is abandoned (it keeps running detached until the call it's stuck in
/// returns, if ever) and a `TimedOut` OS error naming `syscall` is returned.
///
/// ## Errors
///
/// If the worker thread cannot be spawned, or the deadline passes, an error is returned.
pub fn run_bounded<T, F>(timeout: Duration, syscall: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("sysprobe-bounded".to_string())
        .spawn(move || {
            // The receiver is gone if we timed out, which is fine.
            let _ = tx.send(f());
        })
        .map_err(|source| Error::Os {
            syscall: "thread spawn".to_string(),
            source,
        })?;

    match rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            debug!(syscall, timeout_ms = timeout.as_millis() as u64, "Abandoned call that exceeded its deadline.");
            Err(timed_out(syscall))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::Os {
            syscall: syscall.to_string(),
            source: io::Error::new(io::ErrorKind::Other, "worker thread panicked"),
        }),
    }
}

pub(crate) fn timed_out(syscall: &str) -> Error {
    Error::Os {
        syscall: syscall.to_string(),
        source: io::Error::from(io::ErrorKind::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn fast_call_returns_value() {
        let value = run_bounded(Duration::from_secs(5), "test", || 21 * 2).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn hanging_call_is_abandoned() {
        let started = Instant::now();
        let err = run_bounded(Duration::from_millis(50), "GetFinalPathNameByHandleW", || {
            thread::sleep(Duration::from_secs(10));
        })
        .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(err.kind(), ErrorKind::TransientOsError);
        assert!(err.to_string().contains("GetFinalPathNameByHandleW"));
    }

    #[test]
    fn panicking_call_is_an_error() {
        let result = run_bounded(Duration::from_secs(5), "test", || -> u32 { panic!("boom") });
        assert!(result.is_err());
    }
}
