//! Process memory querying.
//!
//! This crate provides a cross-platform way to query the memory footprint of a process: its resident set size (RSS),
//! and, where the platform can tell us, its proportional set size (PSS), unique set size (USS) and swapped-out size.
//!
//! ## Linux
//!
//! On Linux, [procfs](https://docs.kernel.org/filesystems/proc.html) is used, and one of three files may be read,
//! depending on their availability:
//!
//! - `/proc/<pid>/smaps_rollup`: a pre-aggregated version of `/proc/<pid>/smaps`. (Available in Linux 4.14+)
//! - `/proc/<pid>/smaps`: detailed information about every memory mapping of the process, which we aggregate.
//!   (Available in Linux 2.6.14+)
//! - `/proc/<pid>/statm`: lazily-updated memory statistics about the process. Only RSS can be derived from it.
//!   (Available in Linux 2.6+)
//!
//! ## macOS
//!
//! On macOS, RSS comes from `proc_pidinfo(PROC_PIDTASKINFO)`, and USS is computed by walking the task's VM regions
//! with `mach_vm_region(VM_REGION_TOP_INFO)` and counting pages that are not shared with any other task. Walking
//! another process' regions requires `task_for_pid`, which generally requires elevated privileges.
//!
//! ## Windows
//!
//! On Windows, RSS is the working set size from `GetProcessMemoryInfo`, and USS is derived from `QueryWorkingSet` by
//! counting working set pages which are not marked as shared.
//!
//! ## Allocations
//!
//! Once a [`Querier`] has been created, querying the current process does not allocate.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::Querier;

#[cfg(target_os = "macos")]
mod darwin;

#[cfg(target_os = "macos")]
pub use darwin::Querier;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "windows")]
pub use windows::Querier;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "windows")))]
mod unsupported;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "windows")))]
pub use unsupported::Querier;

/// The process a [`Querier`] reports on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target {
    /// The calling process.
    Current,

    /// Any process, by PID.
    Pid(i32),
}

/// A snapshot of a process' memory footprint, in bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Footprint {
    /// Resident set size.
    pub rss: u64,

    /// Proportional set size: resident memory, with shared pages divided evenly between the processes sharing them.
    pub pss: Option<u64>,

    /// Unique set size: resident memory which is private to the process.
    pub uss: Option<u64>,

    /// Memory swapped out to disk.
    pub swap: Option<u64>,
}
