use std::{ffi::c_void, io, mem::MaybeUninit};

use windows_sys::Win32::{
    Foundation::{CloseHandle, GetLastError, ERROR_BAD_LENGTH, HANDLE},
    System::{
        ProcessStatus::{GetProcessMemoryInfo, QueryWorkingSet, PROCESS_MEMORY_COUNTERS},
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
        Threading::{GetCurrentProcess, OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ},
    },
};

use crate::{Footprint, Target};

/// Bit 8 of a working set block: the page is shareable.
const WORKING_SET_SHARED_BIT: usize = 1 << 8;

/// Upper bound on how many times the working set buffer is regrown before giving up.
const MAX_WORKING_SET_ATTEMPTS: usize = 8;

/// A process handle, closed on drop unless it's the current process pseudo-handle.
struct ProcessHandle {
    handle: HANDLE,
    owned: bool,
}

impl ProcessHandle {
    fn open(target: Target, access: u32) -> io::Result<Self> {
        match target {
            Target::Current => Ok(Self {
                // SAFETY: `GetCurrentProcess` has no preconditions and returns a pseudo-handle.
                handle: unsafe { GetCurrentProcess() },
                owned: false,
            }),
            Target::Pid(pid) => {
                let pid = u32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::NotFound))?;
                // SAFETY: `OpenProcess` has no pointer arguments.
                let handle = unsafe { OpenProcess(access, 0, pid) };
                if handle.is_null() {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { handle, owned: true })
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: The handle came from `OpenProcess` and is closed exactly once.
            unsafe { CloseHandle(self.handle) };
        }
    }
}

/// A memory usage querier.
pub struct Querier {
    target: Target,
    page_size: u64,
}

impl Querier {
    /// Creates a querier for the given target.
    pub fn new(target: Target) -> Self {
        let mut info = MaybeUninit::<SYSTEM_INFO>::zeroed();
        // SAFETY: `GetSystemInfo` always fills the struct.
        let info = unsafe {
            GetSystemInfo(info.as_mut_ptr());
            info.assume_init()
        };
        Self {
            target,
            page_size: u64::from(info.dwPageSize.max(1)),
        }
    }

    /// Gets the resident set size of the target process, in bytes.
    ///
    /// If the resident set size cannot be determined, `None` is returned. This could be for a number of underlying
    /// reasons, such as the process having exited or access being denied.
    pub fn resident_set_size(&mut self) -> Option<usize> {
        let handle = ProcessHandle::open(self.target, PROCESS_QUERY_LIMITED_INFORMATION).ok()?;
        memory_counters(&handle).ok().map(|pmc| pmc.WorkingSetSize)
    }

    /// Gets the full memory footprint of the target process.
    ///
    /// # Errors
    ///
    /// If the process can't be opened, or its working set can't be read, an error is returned.
    pub fn footprint(&mut self) -> io::Result<Footprint> {
        let handle = ProcessHandle::open(self.target, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ)?;
        let pmc = memory_counters(&handle)?;
        let private_pages = count_private_pages(&handle)?;

        Ok(Footprint {
            rss: pmc.WorkingSetSize as u64,
            pss: None,
            uss: Some(private_pages * self.page_size),
            swap: None,
        })
    }
}

impl Default for Querier {
    fn default() -> Self {
        Self::new(Target::Current)
    }
}

fn memory_counters(handle: &ProcessHandle) -> io::Result<PROCESS_MEMORY_COUNTERS> {
    let mut pmc = MaybeUninit::<PROCESS_MEMORY_COUNTERS>::uninit();
    let pmc_len = std::mem::size_of::<PROCESS_MEMORY_COUNTERS>() as u32;

    // SAFETY: The buffer is sized for exactly one `PROCESS_MEMORY_COUNTERS`.
    let result = unsafe { GetProcessMemoryInfo(handle.handle, pmc.as_mut_ptr(), pmc_len) };
    match result {
        0 => Err(io::Error::last_os_error()),
        // SAFETY: We know the structure has been populated by `GetProcessMemoryInfo` at this point.
        _ => Ok(unsafe { pmc.assume_init() }),
    }
}

/// Counts working set pages that are not shareable.
///
/// The working set buffer is a `ULONG_PTR` entry count followed by one `ULONG_PTR` block per page, so it's modeled as
/// a `Vec<usize>` whose first element is the count.
fn count_private_pages(handle: &ProcessHandle) -> io::Result<u64> {
    let mut entries = 4096usize;

    for _ in 0..MAX_WORKING_SET_ATTEMPTS {
        let mut buf = Vec::new();
        buf.try_reserve_exact(entries + 1)
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        buf.resize(entries + 1, 0usize);

        let byte_len = u32::try_from(buf.len() * std::mem::size_of::<usize>())
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;

        // SAFETY: `buf` is valid for `byte_len` bytes.
        let result = unsafe { QueryWorkingSet(handle.handle, buf.as_mut_ptr() as *mut c_void, byte_len) };
        if result != 0 {
            let count = buf[0].min(buf.len() - 1);
            let private = buf[1..=count]
                .iter()
                .filter(|block| *block & WORKING_SET_SHARED_BIT == 0)
                .count();
            return Ok(private as u64);
        }

        // SAFETY: `GetLastError` has no preconditions.
        if unsafe { GetLastError() } != ERROR_BAD_LENGTH {
            return Err(io::Error::last_os_error());
        }

        // The working set can grow between calls, so leave some headroom over what was reported.
        entries = buf[0].max(entries) + buf[0] / 4 + 64;
    }

    Err(io::Error::new(
        io::ErrorKind::Other,
        "working set kept growing faster than the buffer",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic() {
        let mut querier = Querier::default();
        assert!(querier.resident_set_size().is_some());
    }

    #[test]
    fn own_footprint_has_uss() {
        let footprint = Querier::default().footprint().unwrap();
        assert!(footprint.rss > 0);
        assert!(footprint.uss.unwrap() <= footprint.rss);
    }

    #[test]
    fn own_pid_by_id() {
        let mut querier = Querier::new(Target::Pid(std::process::id() as i32));
        assert!(querier.resident_set_size().unwrap() > 0);
    }
}
