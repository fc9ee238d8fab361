//! AIX `/proc/<pid>` records.
//!
//! Unlike Solaris, AIX lays these out with fixed 64-bit fields whatever the width of the reader or the target.

use std::path::Path;

use libc::c_char;

use crate::{
    buffer::read_record,
    error::{Error, Result},
    platform::posix::c_chars_to_string,
    types::ProcessStatus,
};

const PRFNSZ: usize = 16;
const PRARGSZ: usize = 80;

/// `pr_dmodel` of a 32-bit process.
const PR_MODEL_ILP32: c_char = 0;

/// `pr_ttydev` of a process without a controlling terminal.
pub(super) const NODEV: u64 = u64::MAX;

/// `pr_timestruc64_t`
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(super) struct Timestruc64 {
    pub tv_sec: i64,
    pub tv_nsec: i32,
    pub pad: u32,
}

impl Timestruc64 {
    pub(super) fn seconds(&self) -> f64 {
        self.tv_sec as f64 + f64::from(self.tv_nsec) / 1_000_000_000.0
    }
}

/// The leading part of `lwpsinfo_t`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct LwpsInfoHead {
    pub pr_lwpid: u64,
    pub pr_addr: u64,
    pub pr_wchan: u64,
    pub pr_flag: u32,
    pub pr_wtype: u8,
    pub pr_state: c_char,
    pub pr_sname: c_char,
    pub pr_nice: u8,
    pub pr_pri: i32,
    pub pr_policy: u32,
}

/// `psinfo_t`, up to the head of the representative thread.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct PsInfo {
    pub pr_flag: u32,
    pub pr_flag2: u32,
    pub pr_nlwp: u32,
    pub pr_pad1: u32,
    pub pr_uid: u64,
    pub pr_euid: u64,
    pub pr_gid: u64,
    pub pr_egid: u64,
    pub pr_pid: u64,
    pub pr_ppid: u64,
    pub pr_pgid: u64,
    pub pr_sid: u64,
    pub pr_ttydev: u64,
    pub pr_addr: u64,
    /// Image size, in KiB.
    pub pr_size: u64,
    /// Resident set size, in KiB.
    pub pr_rssize: u64,
    pub pr_start: Timestruc64,
    pub pr_time: Timestruc64,
    pub pr_cid: u16,
    pub pr_pad2: u16,
    pub pr_argc: u32,
    pub pr_argv: u64,
    pub pr_envp: u64,
    pub pr_fname: [c_char; PRFNSZ],
    pub pr_psargs: [c_char; PRARGSZ],
    pub pr_pad: [u64; 8],
    pub pr_lwp: LwpsInfoHead,
}

/// `pstatus_t`, up to the CPU times.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct PStatus {
    pub pr_flag: u32,
    pub pr_flag2: u32,
    pub pr_flags: u32,
    pub pr_nlwp: u32,
    pub pr_stat: c_char,
    pub pr_dmodel: c_char,
    pub pr_pad1: [c_char; 6],
    pub pr_sigpend: [u64; 4],
    pub pr_brkbase: u64,
    pub pr_brksize: u64,
    pub pr_stkbase: u64,
    pub pr_stksize: u64,
    pub pr_pid: u64,
    pub pr_ppid: u64,
    pub pr_pgid: u64,
    pub pr_sid: u64,
    pub pr_utime: Timestruc64,
    pub pr_stime: Timestruc64,
    pub pr_cutime: Timestruc64,
    pub pr_cstime: Timestruc64,
}

/// The fixed part of `prcred_t`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(super) struct PrCred {
    pub pr_euid: u64,
    pub pr_ruid: u64,
    pub pr_suid: u64,
    pub pr_egid: u64,
    pub pr_rgid: u64,
    pub pr_sgid: u64,
    pub pr_pad: [u64; 8],
    pub pr_pad1: u32,
    pub pr_ngroups: u32,
}

/// Decodes a record from the start of a `/proc` file.
pub(super) fn decode<T: Copy>(bytes: &[u8], path: &Path) -> Result<T> {
    read_record::<T>(bytes, 0).ok_or_else(|| {
        Error::parse(
            path,
            format!("short read: {} bytes, want {}", bytes.len(), std::mem::size_of::<T>()),
        )
    })
}

/// Maps the printable state letter of the representative thread.
pub(super) fn status_from_sname(sname: c_char) -> ProcessStatus {
    match sname as u8 {
        b'A' | b'R' | b'O' => ProcessStatus::Running,
        b'S' => ProcessStatus::Sleeping,
        b'W' => ProcessStatus::Waiting,
        b'T' => ProcessStatus::Stopped,
        b'Z' => ProcessStatus::Zombie,
        b'I' => ProcessStatus::Idle,
        _ => ProcessStatus::Sleeping,
    }
}

impl PsInfo {
    pub(super) fn name(&self) -> String {
        c_chars_to_string(&self.pr_fname)
    }

    /// The first 80 characters of the command line, split on whitespace.
    pub(super) fn short_args(&self) -> Vec<String> {
        c_chars_to_string(&self.pr_psargs)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub(super) fn is_zombie(&self) -> bool {
        status_from_sname(self.pr_lwp.pr_sname) == ProcessStatus::Zombie
    }
}

impl PStatus {
    /// Pointer width of the process, for reading its address space.
    pub(super) fn pointer_size(&self) -> usize {
        if self.pr_dmodel == PR_MODEL_ILP32 {
            4
        } else {
            8
        }
    }
}

/// Picks the executable path from `argv[0]`, the working directory and `PATH`.
///
/// AIX has no link to the executable, so this is the best guess `ps` would make too.
pub(super) fn resolve_exe(
    argv0: &str, cwd: Option<&str>, path_var: Option<&str>, is_executable: impl Fn(&Path) -> bool,
) -> Option<String> {
    if argv0.is_empty() {
        return None;
    }
    if argv0.starts_with('/') {
        return Some(argv0.to_string());
    }
    if argv0.contains('/') {
        return cwd.map(|cwd| Path::new(cwd).join(argv0).to_string_lossy().into_owned());
    }
    path_var?
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(argv0))
        .find(|candidate| is_executable(candidate))
        .map(|found| found.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts() {
        assert_eq!(std::mem::size_of::<Timestruc64>(), 16);
        assert_eq!(std::mem::offset_of!(PsInfo, pr_start), 112);
        assert_eq!(std::mem::offset_of!(PsInfo, pr_argv), 152);
        assert_eq!(std::mem::offset_of!(PsInfo, pr_fname), 168);
        assert_eq!(std::mem::offset_of!(PsInfo, pr_lwp), 328);
        assert_eq!(std::mem::offset_of!(PrCred, pr_ngroups), 116);
    }

    #[test]
    fn states() {
        assert_eq!(status_from_sname(b'Z' as c_char), ProcessStatus::Zombie);
        assert_eq!(status_from_sname(b'A' as c_char), ProcessStatus::Running);
        assert_eq!(status_from_sname(b'T' as c_char), ProcessStatus::Stopped);
    }

    #[test]
    fn executable_guesses() {
        let on_path = |p: &Path| p == Path::new("/usr/bin/ksh");
        assert_eq!(resolve_exe("/opt/app/bin/run", None, None, on_path).as_deref(), Some("/opt/app/bin/run"));
        assert_eq!(resolve_exe("./run", Some("/home/me"), None, on_path).as_deref(), Some("/home/me/./run"));
        assert_eq!(
            resolve_exe("ksh", None, Some("/bin:/usr/bin"), on_path).as_deref(),
            Some("/usr/bin/ksh")
        );
        assert_eq!(resolve_exe("ksh", None, None, on_path), None);
        assert_eq!(resolve_exe("", Some("/"), Some("/usr/bin"), on_path), None);
    }

    #[test]
    fn own_psinfo() {
        let path = Path::new("/proc/self/psinfo");
        let info = decode::<PsInfo>(&std::fs::read(path).unwrap(), path).unwrap();
        assert_eq!(info.pr_pid, u64::from(std::process::id()));
        assert!(!info.name().is_empty());
    }
}
