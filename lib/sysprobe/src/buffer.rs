//! Growable buffers for kernel queries.
//!
//! Many kernel interfaces (`sysctl`, `NtQuerySystemInformation`, `kstat`, `kvm_getprocs`) hand back variable-length
//! tables and expect the caller to guess how much room they need. [`grow_until_fits`] owns the guess-call-regrow loop
//! for all of them, so that every call site gets the same bounds: a capped number of attempts, a capped buffer size,
//! and fallible allocation.

use std::io;

use tracing::trace;

use crate::error::{Error, Result};

const DEFAULT_MAX_SIZE: usize = 256 * 1024 * 1024;
const DEFAULT_MAX_ATTEMPTS: usize = 16;

/// Bounds for growing a kernel query buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BufferPolicy {
    max_size: usize,
    max_attempts: usize,
}

impl BufferPolicy {
    /// Sets the maximum buffer size, in bytes.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the maximum number of calls made before giving up.
    ///
    /// A value of zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Maximum buffer size, in bytes.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Maximum number of calls made before giving up.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Outcome of a single attempt at filling a buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fill {
    /// The call succeeded and wrote this many elements.
    Done(usize),

    /// The buffer was too small.
    ///
    /// If the OS reported how many elements it needs, that's carried along so the next attempt can size for it
    /// directly instead of doubling.
    TooSmall(Option<usize>),
}

/// Allocates a zeroed buffer of `len` elements without aborting on allocation failure.
pub fn try_zeroed<T: Copy + Default>(len: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::OutOfMemory {
        requested: len.saturating_mul(std::mem::size_of::<T>()),
    })?;
    buf.resize(len, T::default());
    Ok(buf)
}

/// Calls `fill` with ever larger buffers until it reports that the result fit.
///
/// The first attempt uses `initial_len` elements. After a [`Fill::TooSmall`], the buffer grows to whichever is larger
/// of twice its size or the reported need plus an eighth of slack (tables like the process list can grow between the
/// sizing call and the real one). The returned buffer is truncated to the written length.
///
/// ## Errors
///
/// If `fill` fails, its error is returned as-is. If a buffer can't be allocated, `OutOfMemory` is returned. If the
/// attempt budget runs out, or the next buffer would exceed the size cap, an `Os` error naming `syscall` is returned.
pub fn grow_until_fits<T, F>(policy: &BufferPolicy, syscall: &str, initial_len: usize, mut fill: F) -> Result<Vec<T>>
where
    T: Copy + Default,
    F: FnMut(&mut [T]) -> Result<Fill>,
{
    let elem_size = std::mem::size_of::<T>().max(1);
    let max_len = policy.max_size / elem_size;
    let mut len = initial_len.max(1);

    for attempt in 0..policy.max_attempts {
        if len > max_len {
            return Err(exhausted(syscall, format!("buffer would exceed {} bytes", policy.max_size)));
        }

        let mut buf = try_zeroed::<T>(len)?;
        match fill(&mut buf)? {
            Fill::Done(written) => {
                buf.truncate(written.min(len));
                return Ok(buf);
            }
            Fill::TooSmall(needed) => {
                let doubled = len.saturating_mul(2);
                let next = match needed {
                    Some(needed) => needed.saturating_add(needed / 8).max(doubled),
                    None => doubled,
                };
                trace!(syscall, attempt, len, next, "Kernel query buffer too small, growing.");
                len = next;
            }
        }
    }

    Err(exhausted(
        syscall,
        format!("buffer still too small after {} attempts", policy.max_attempts),
    ))
}

/// Fails with an `Os` error when a kernel table that always has entries came back empty.
pub fn ensure_nonempty<T>(records: Vec<T>, syscall: &str) -> Result<Vec<T>> {
    if records.is_empty() {
        return Err(Error::Os {
            syscall: syscall.to_string(),
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "kernel returned no records"),
        });
    }
    Ok(records)
}

fn exhausted(syscall: &str, detail: String) -> Error {
    Error::Os {
        syscall: syscall.to_string(),
        source: io::Error::new(io::ErrorKind::Other, detail),
    }
}

/// Reads a `#[repr(C)]` record of type `T` from `bytes` at `offset`, if it fits.
///
/// `T` must be plain old data: every bit pattern of its size must be a valid value.
pub fn read_record<T: Copy>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(std::mem::size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }

    // SAFETY: The range was bounds checked above, `read_unaligned` has no alignment requirement, and callers only use
    // this with plain-old-data kernel structs.
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr().add(offset) as *const T) })
}

/// Reads as many consecutive `#[repr(C)]` records of type `T` as fit in `bytes`.
///
/// A trailing partial record is ignored. The same plain-old-data requirement as [`read_record`] applies.
pub fn read_records<T: Copy>(bytes: &[u8]) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    if size == 0 {
        return Vec::new();
    }
    (0..bytes.len() / size)
        .filter_map(|i| read_record(bytes, i * size))
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn fits_first_time() {
        let policy = BufferPolicy::default();
        let buf = grow_until_fits::<u8, _>(&policy, "test", 16, |buf| {
            buf[..3].copy_from_slice(b"abc");
            Ok(Fill::Done(3))
        })
        .unwrap();
        assert_eq!(buf, b"abc");
    }

    #[test]
    fn grows_to_reported_need() {
        let policy = BufferPolicy::default();
        let mut sizes = Vec::new();
        let buf = grow_until_fits::<u32, _>(&policy, "test", 4, |buf| {
            sizes.push(buf.len());
            if buf.len() < 100 {
                Ok(Fill::TooSmall(Some(100)))
            } else {
                Ok(Fill::Done(100))
            }
        })
        .unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(sizes, vec![4, 112]);
    }

    #[test]
    fn fill_errors_pass_through() {
        let policy = BufferPolicy::default();
        let result = grow_until_fits::<u8, _>(&policy, "test", 4, |_| Err(Error::NotFound { pid: 7 }));
        assert!(matches!(result, Err(Error::NotFound { pid: 7 })));
    }

    #[test]
    fn size_cap_is_transient_error() {
        let policy = BufferPolicy::default().with_max_size(1024);
        let err = grow_until_fits::<u8, _>(&policy, "sysctl(kern.proc)", 16, |_| Ok(Fill::TooSmall(None))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientOsError);
        assert!(err.to_string().contains("sysctl(kern.proc)"));
    }

    #[test]
    fn impossible_allocation_is_out_of_memory() {
        let policy = BufferPolicy::default().with_max_size(usize::MAX);
        let err = grow_until_fits::<u8, _>(&policy, "test", 16, |_| Ok(Fill::TooSmall(Some(usize::MAX / 2)))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn empty_table_is_an_error() {
        assert!(ensure_nonempty(Vec::<u8>::new(), "kvm_getprocs").is_err());
        assert_eq!(ensure_nonempty(vec![1u8], "kvm_getprocs").unwrap(), vec![1]);
    }

    #[test]
    fn read_record_bounds() {
        let bytes = [1u8, 0, 0, 0, 2, 0, 0, 0];
        assert_eq!(read_record::<u32>(&bytes, 0).map(u32::from_le), Some(1));
        assert_eq!(read_record::<u32>(&bytes, 4).map(u32::from_le), Some(2));
        assert_eq!(read_record::<u32>(&bytes, 5), None);
        assert_eq!(read_record::<u32>(&bytes, usize::MAX), None);
    }

    #[test]
    fn read_records_ignores_trailing_bytes() {
        let bytes = [1u8, 0, 2, 0, 3];
        let records = read_records::<u16>(&bytes).into_iter().map(u16::from_le).collect::<Vec<_>>();
        assert_eq!(records, vec![1, 2]);
        assert!(read_records::<u64>(&bytes).is_empty());
    }

    proptest! {
        #[test]
        fn always_too_small_terminates(
            max_attempts in 1usize..32,
            max_size in 1usize..(1 << 20),
            initial in 1usize..4096,
            hint in proptest::option::of(0usize..(1 << 22)),
        ) {
            let policy = BufferPolicy::default().with_max_size(max_size).with_max_attempts(max_attempts);
            let mut calls = 0usize;
            let mut largest = 0usize;
            let result = grow_until_fits::<u8, _>(&policy, "test", initial, |buf| {
                calls += 1;
                largest = largest.max(buf.len());
                Ok(Fill::TooSmall(hint))
            });

            let err = result.unwrap_err();
            prop_assert_eq!(err.kind(), ErrorKind::TransientOsError);
            prop_assert!(calls <= max_attempts);
            prop_assert!(largest <= max_size);
        }

        #[test]
        fn done_never_exceeds_buffer(initial in 1usize..1024, written in 0usize..4096) {
            let policy = BufferPolicy::default();
            let buf = grow_until_fits::<u8, _>(&policy, "test", initial, |_| Ok(Fill::Done(written))).unwrap();
            prop_assert_eq!(buf.len(), written.min(initial));
        }
    }
}
