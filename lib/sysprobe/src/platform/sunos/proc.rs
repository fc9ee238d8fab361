//! Binary `/proc/<pid>` records: `psinfo`, `usage`, `lwp/<id>/lwpusage` and `cred`.

use std::path::Path;

use libc::{c_char, c_int, c_short, c_ulong, c_ushort, dev_t, gid_t, pid_t, timespec, uid_t};

use crate::{
    buffer::read_record,
    error::{Error, Result},
    platform::posix::c_chars_to_string,
    types::ProcessStatus,
};

const PRFNSZ: usize = 16;
const PRARGSZ: usize = 80;

/// `pr_dmodel` of a 32-bit process.
pub(super) const PR_MODEL_ILP32: c_char = 1;

/// `pr_ttydev` of a process without a controlling terminal.
pub(super) const PRNODEV: dev_t = !0;

/// The leading part of `lwpsinfo_t`, as embedded in `psinfo_t`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct LwpsInfoHead {
    pub pr_flag: c_int,
    pub pr_lwpid: c_int,
    pub pr_addr: usize,
    pub pr_wchan: usize,
    pub pr_stype: c_char,
    pub pr_state: c_char,
    pub pr_sname: c_char,
    pub pr_nice: c_char,
    pub pr_syscall: c_short,
    pub pr_oldpri: c_char,
    pub pr_cpu: c_char,
    pub pr_pri: c_int,
    pub pr_pctcpu: c_ushort,
    pub pr_pad: c_ushort,
    pub pr_start: timespec,
    pub pr_time: timespec,
}

/// `psinfo_t`, up to the head of the representative LWP.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct PsInfo {
    pub pr_flag: c_int,
    pub pr_nlwp: c_int,
    pub pr_pid: pid_t,
    pub pr_ppid: pid_t,
    pub pr_pgid: pid_t,
    pub pr_sid: pid_t,
    pub pr_uid: uid_t,
    pub pr_euid: uid_t,
    pub pr_gid: gid_t,
    pub pr_egid: gid_t,
    pub pr_addr: usize,
    /// Image size, in KiB.
    pub pr_size: usize,
    /// Resident set size, in KiB.
    pub pr_rssize: usize,
    pub pr_pad1: usize,
    pub pr_ttydev: dev_t,
    pub pr_pctcpu: c_ushort,
    pub pr_pctmem: c_ushort,
    pub pr_start: timespec,
    pub pr_time: timespec,
    pub pr_ctime: timespec,
    pub pr_fname: [c_char; PRFNSZ],
    pub pr_psargs: [c_char; PRARGSZ],
    pub pr_wstat: c_int,
    pub pr_argc: c_int,
    pub pr_argv: usize,
    pub pr_envp: usize,
    pub pr_dmodel: c_char,
    pub pr_pad2: [c_char; 3],
    pub pr_taskid: c_int,
    pub pr_projid: c_int,
    pub pr_nzomb: c_int,
    pub pr_poolid: c_int,
    pub pr_zoneid: c_int,
    pub pr_contract: c_int,
    pub pr_filler: [c_int; 1],
    pub pr_lwp: LwpsInfoHead,
}

/// `prusage_t`, the layout of both `usage` and `lwpusage`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct PrUsage {
    pub pr_lwpid: c_int,
    pub pr_count: c_int,
    pub pr_tstamp: timespec,
    pub pr_create: timespec,
    pub pr_term: timespec,
    pub pr_rtime: timespec,
    pub pr_utime: timespec,
    pub pr_stime: timespec,
    pub pr_ttime: timespec,
    pub pr_tftime: timespec,
    pub pr_dftime: timespec,
    pub pr_kftime: timespec,
    pub pr_ltime: timespec,
    pub pr_slptime: timespec,
    pub pr_wtime: timespec,
    pub pr_stoptime: timespec,
    pub filltime: [timespec; 6],
    pub pr_minf: c_ulong,
    pub pr_majf: c_ulong,
    pub pr_nswap: c_ulong,
    pub pr_inblk: c_ulong,
    pub pr_oublk: c_ulong,
    pub pr_msnd: c_ulong,
    pub pr_mrcv: c_ulong,
    pub pr_sigs: c_ulong,
    pub pr_vctx: c_ulong,
    pub pr_ictx: c_ulong,
    pub pr_sysc: c_ulong,
    pub pr_ioch: c_ulong,
    pub filler: [c_ulong; 10],
}

/// The fixed part of `prcred_t`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(super) struct PrCred {
    pub pr_euid: uid_t,
    pub pr_ruid: uid_t,
    pub pr_suid: uid_t,
    pub pr_egid: gid_t,
    pub pr_rgid: gid_t,
    pub pr_sgid: gid_t,
    pub pr_ngroups: c_int,
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

pub(super) fn seconds(ts: &timespec) -> f64 {
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}

/// Maps `pr_state` (`SSLEEP`, `SRUN`, ...).
pub(super) fn status_from_state(state: c_char) -> ProcessStatus {
    match state {
        1 => ProcessStatus::Sleeping,
        2 | 6 => ProcessStatus::Running,
        3 => ProcessStatus::Zombie,
        4 => ProcessStatus::Stopped,
        5 => ProcessStatus::Idle,
        7 => ProcessStatus::Waiting,
        _ => ProcessStatus::Sleeping,
    }
}

pub(super) const SZOMB: c_char = 3;

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

    /// Pointer width of the process, for reading its address space.
    pub(super) fn pointer_size(&self) -> usize {
        if self.pr_dmodel == PR_MODEL_ILP32 {
            4
        } else {
            8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states() {
        assert_eq!(status_from_state(SZOMB), ProcessStatus::Zombie);
        assert_eq!(status_from_state(6), ProcessStatus::Running);
        assert_eq!(status_from_state(4), ProcessStatus::Stopped);
    }

    #[test]
    fn short_records_are_parse_errors() {
        let error = decode::<PrCred>(&[0u8; 4], Path::new("/proc/1/cred")).unwrap_err();
        assert!(matches!(error, Error::Parse { .. }));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn layouts() {
        assert_eq!(std::mem::size_of::<LwpsInfoHead>(), 72);
        assert_eq!(std::mem::offset_of!(PsInfo, pr_fname), 136);
        assert_eq!(std::mem::offset_of!(PsInfo, pr_lwp), 288);
        assert_eq!(std::mem::offset_of!(PrUsage, pr_minf), 344);
        assert_eq!(std::mem::size_of::<PrUsage>(), 520);
    }

    #[test]
    fn own_psinfo() {
        let path = Path::new("/proc/self/psinfo");
        let info = decode::<PsInfo>(&std::fs::read(path).unwrap(), path).unwrap();
        assert_eq!(info.pr_pid as u32, std::process::id());
        assert!(info.pr_nlwp >= 1);
        assert!(!info.name().is_empty());
    }
}
