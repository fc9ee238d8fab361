//! Helpers shared by every Unix backend.

use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt as _,
    path::Path,
};

use libc::c_int;

use crate::{
    classify::{check_pid, classify, Liveness},
    error::{Error, Result},
    types::{DiskUsage, Pid, Signal},
};

// Only Solaris, illumos and AIX read other address spaces, but the reader is built everywhere to keep it under test.
#[cfg_attr(
    not(any(target_os = "solaris", target_os = "illumos", target_os = "aix")),
    allow(dead_code)
)]
pub(crate) mod addrspace;
#[cfg(not(any(target_os = "aix", target_os = "haiku", target_os = "cygwin")))]
pub(crate) mod ifaddrs;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos"
))]
pub(crate) mod utmpx;

/// Returns `true` if `kill(pid, 0)` finds the process.
///
/// PID 0 is a special case for `kill(2)` (it targets the caller's process group), so it's reported as existing without
/// asking: on every platform where this is used, PID 0 is a kernel task.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
    target_os = "aix",
    target_os = "cygwin"
))]
pub(crate) fn pid_exists(pid: Pid) -> bool {
    if pid < 0 {
        return false;
    }
    if pid == 0 {
        return true;
    }

    // SAFETY: Signal 0 only performs the existence and permission checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }

    // EPERM means the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Maps a portable signal to its number.
pub(crate) fn signal_number(signal: Signal) -> c_int {
    match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
        Signal::Interrupt => libc::SIGINT,
        Signal::Hangup => libc::SIGHUP,
        Signal::Stop => libc::SIGSTOP,
        Signal::Continue => libc::SIGCONT,
        Signal::User1 => libc::SIGUSR1,
        Signal::User2 => libc::SIGUSR2,
    }
}

/// Sends `signal` to a single process.
pub(crate) fn send_signal<L: Liveness + ?Sized>(liveness: &L, pid: Pid, signal: Signal) -> Result<()> {
    check_pid(pid)?;
    if pid == 0 {
        // `kill(0, sig)` would signal our whole process group.
        return Err(Error::PermissionDenied {
            pid,
            syscall: "kill".to_string(),
        });
    }

    // SAFETY: `kill` has no pointer arguments.
    if unsafe { libc::kill(pid, signal_number(signal)) } == -1 {
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ESRCH) {
            return Err(Error::NotFound { pid });
        }
        return Err(classify(liveness, pid, "kill", error));
    }
    Ok(())
}

/// Resets `errno` for calls where `-1` is a legitimate return value.
pub(crate) fn clear_errno() {
    // SAFETY: The errno location is thread local and always valid.
    unsafe {
        #[cfg(target_os = "linux")]
        {
            *libc::__errno_location() = 0;
        }
        #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd", target_os = "cygwin"))]
        {
            *libc::__errno() = 0;
        }
        #[cfg(any(target_os = "macos", target_os = "freebsd"))]
        {
            *libc::__error() = 0;
        }
        #[cfg(any(target_os = "solaris", target_os = "illumos"))]
        {
            *libc::___errno() = 0;
        }
        #[cfg(target_os = "haiku")]
        {
            *libc::_errnop() = 0;
        }
        #[cfg(target_os = "aix")]
        {
            *libc::_Errno() = 0;
        }
    }
}

/// Scheduling priority of a process.
pub(crate) fn get_priority<L: Liveness + ?Sized>(liveness: &L, pid: Pid) -> Result<i32> {
    check_pid(pid)?;
    clear_errno();

    // SAFETY: `getpriority` has no pointer arguments.
    let priority = unsafe { libc::getpriority(libc::PRIO_PROCESS as _, pid as _) };
    if priority == -1 {
        let error = io::Error::last_os_error();
        if error.raw_os_error().unwrap_or(0) != 0 {
            return Err(classify(liveness, pid, "getpriority", error));
        }
    }
    Ok(priority)
}

/// Sets the scheduling priority of a process.
pub(crate) fn set_priority<L: Liveness + ?Sized>(liveness: &L, pid: Pid, value: i32) -> Result<()> {
    check_pid(pid)?;

    // SAFETY: `setpriority` has no pointer arguments.
    if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as _, value) } == -1 {
        return Err(classify(liveness, pid, "setpriority", io::Error::last_os_error()));
    }
    Ok(())
}

/// Usage of the filesystem holding `path`, as seen by an unprivileged user.
pub(crate) fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let c_path = path_to_cstring(path)?;
    let mut stat = std::mem::MaybeUninit::<libc::statvfs>::zeroed();

    // SAFETY: `c_path` is NUL terminated and `stat` is valid for writes.
    if unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) } == -1 {
        return Err(Error::last_os_error(format!("statvfs({})", path.display())));
    }

    // SAFETY: `statvfs` succeeded, so the struct is filled.
    let stat = unsafe { stat.assume_init() };
    Ok(usage_from_statvfs(
        stat.f_blocks as u64,
        stat.f_bfree as u64,
        stat.f_bavail as u64,
        stat.f_frsize as u64,
    ))
}

fn usage_from_statvfs(blocks: u64, bfree: u64, bavail: u64, frsize: u64) -> DiskUsage {
    // Reserved blocks are free but unavailable to unprivileged users, so `total` is what such a user can ever fill.
    let used = blocks.saturating_sub(bfree) * frsize;
    let free = bavail * frsize;
    DiskUsage {
        total: used + free,
        used,
        free,
    }
}

pub(crate) fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Os {
        syscall: "path conversion".to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
    })
}

/// Converts a fixed-size, possibly unterminated C string field into a `String`.
pub(crate) fn c_chars_to_string(chars: &[libc::c_char]) -> String {
    let bytes = chars
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect::<Vec<_>>();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Converts a C string pointer into a `String`, treating null as empty.
///
/// # Safety
///
/// `ptr` must be null, or point to a NUL terminated string.
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
pub(crate) unsafe fn c_ptr_to_string(ptr: *const libc::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Splits a NUL separated argument or environment block.
#[cfg_attr(
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "cygwin"
    )),
    allow(dead_code)
)]
pub(crate) fn split_nul_block(block: &[u8]) -> Vec<String> {
    let block = block.strip_suffix(b"\0").unwrap_or(block);
    if block.is_empty() {
        return Vec::new();
    }
    block
        .split(|b| *b == 0)
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

/// Directories searched for a terminal device node.
const TERMINAL_DIRS: &[&str] = &["/dev/pts", "/dev/term", "/dev"];

/// Finds the terminal device node whose `st_rdev` is `dev`.
#[cfg_attr(
    not(any(target_os = "solaris", target_os = "illumos", target_os = "aix")),
    allow(dead_code)
)]
pub(crate) fn terminal_name(dev: u64) -> Option<String> {
    use std::os::unix::fs::{FileTypeExt as _, MetadataExt as _};

    for dir in TERMINAL_DIRS {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.file_type().is_char_device() && metadata.rdev() as u64 == dev {
                return Some(entry.path().to_string_lossy().into_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "solaris", target_os = "illumos"))]
    fn own_process_exists() {
        assert!(pid_exists(std::process::id() as Pid));
        assert!(!pid_exists(-5));
    }

    #[test]
    fn statvfs_arithmetic() {
        let usage = usage_from_statvfs(1000, 400, 300, 4096);
        assert_eq!(usage.used, 600 * 4096);
        assert_eq!(usage.free, 300 * 4096);
        assert_eq!(usage.total, 900 * 4096);
    }

    #[test]
    fn root_filesystem_usage() {
        let usage = disk_usage(Path::new("/")).unwrap();
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
    }

    #[test]
    fn nul_blocks() {
        assert_eq!(split_nul_block(b"ls\0-l\0/tmp\0"), vec!["ls", "-l", "/tmp"]);
        assert_eq!(split_nul_block(b"a\0\0b"), vec!["a", "", "b"]);
        assert!(split_nul_block(b"").is_empty());
        assert!(split_nul_block(b"\0").is_empty());
    }

    #[test]
    fn fixed_c_strings() {
        let field = [b'p' as libc::c_char, b't' as libc::c_char, b's' as libc::c_char, 0, b'x' as libc::c_char];
        assert_eq!(c_chars_to_string(&field), "pts");
        let unterminated = [b'a' as libc::c_char; 4];
        assert_eq!(c_chars_to_string(&unterminated), "aaaa");
    }
}
