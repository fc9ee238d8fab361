//! AIX backend.
//!
//! Process data comes from the binary records under `/proc/<pid>` (`psinfo`, `status`, `cred`) and, for argument and
//! environment vectors, from the process address space. System-wide counters need `libperfstat`, which isn't bound
//! here, so only the queries answerable through POSIX interfaces and `/proc` are implemented.

use std::{collections::BTreeMap, fs, os::unix::fs::PermissionsExt as _, path::Path};

use self::proc::{decode, resolve_exe, PStatus, PrCred, PsInfo, NODEV};
use super::{
    posix::{self, addrspace::AddressSpace},
    procfs::{self, Procfs},
    Platform,
};
use crate::{
    bounded::run_bounded,
    buffer::read_record,
    classify::{check_pid, ClassifyExt as _, Liveness},
    context::BindingContext,
    error::{Error, Result},
    types::*,
};

mod proc;

/// `init`, started moments after the kernel, so its start time stands in for the boot time.
const INIT_PID: Pid = 1;

/// The AIX probe.
pub struct PlatformImpl {
    context: BindingContext,
    procfs: Procfs,
}

impl PlatformImpl {
    /// Creates a new probe.
    pub fn new(context: BindingContext) -> Self {
        let procfs = Procfs::new(context.procfs_root());
        Self { context, procfs }
    }

    fn record<T: Copy>(&self, pid: Pid, name: &str) -> Result<T> {
        check_pid(pid)?;
        let bytes = self.procfs.read_pid_bytes(pid, name).classify_for(self, pid)?;
        decode::<T>(&bytes, &self.procfs.pid_path(pid, name)).classify_for(self, pid)
    }

    fn psinfo(&self, pid: Pid) -> Result<PsInfo> {
        self.record(pid, "psinfo")
    }

    fn pstatus(&self, pid: Pid) -> Result<PStatus> {
        self.record(pid, "status")
    }

    fn cred(&self, pid: Pid) -> Result<PrCred> {
        self.record(pid, "cred")
    }

    fn address_space(&self, pid: Pid) -> Result<AddressSpace<fs::File>> {
        let status = self.pstatus(pid)?;
        let path = self.procfs.pid_path(pid, "as");
        let file = fs::File::open(&path)
            .map_err(|source| procfs::io_error("open", &path, source))
            .classify_for(self, pid)?;
        Ok(AddressSpace::new(file, status.pointer_size()))
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

impl Liveness for PlatformImpl {
    fn pid_exists(&self, pid: Pid) -> bool {
        posix::pid_exists(pid)
    }

    fn is_zombie(&self, pid: Pid) -> bool {
        self.procfs
            .read_pid_bytes(pid, "psinfo")
            .ok()
            .and_then(|bytes| read_record::<PsInfo>(&bytes, 0))
            .map(|info| info.is_zombie())
            .unwrap_or(false)
    }
}

impl Platform for PlatformImpl {
    fn boot_time(&self) -> Result<f64> {
        Ok(self.psinfo(INIT_PID)?.pr_start.seconds())
    }

    fn cpu_count_logical(&self) -> Result<usize> {
        // SAFETY: `sysconf` has no pointer arguments.
        match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } {
            count if count > 0 => Ok(count as usize),
            _ => Err(Error::last_os_error("sysconf(_SC_NPROCESSORS_ONLN)")),
        }
    }

    fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        let path = path.to_path_buf();
        run_bounded(self.context.hanging_call_timeout(), "statvfs", move || {
            posix::disk_usage(&path)
        })?
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        self.procfs.pids()
    }

    fn pid_exists(&self, pid: Pid) -> Result<bool> {
        Ok(Liveness::pid_exists(self, pid))
    }

    fn proc_name(&self, pid: Pid) -> Result<String> {
        Ok(self.psinfo(pid)?.name())
    }

    fn proc_exe(&self, pid: Pid) -> Result<String> {
        let cmdline = self.proc_cmdline(pid)?;
        let argv0 = cmdline.first().map(String::as_str).unwrap_or_default();
        let cwd = self.proc_cwd(pid).ok();
        let path_var = self.proc_environ(pid).ok().and_then(|mut env| env.remove("PATH"));
        resolve_exe(argv0, cwd.as_deref(), path_var.as_deref(), is_executable)
            .ok_or_else(|| Error::unsupported("proc_exe"))
    }

    fn proc_cmdline(&self, pid: Pid) -> Result<Vec<String>> {
        let info = self.psinfo(pid)?;
        let full = self.address_space(pid).and_then(|space| {
            space
                .argv(info.pr_argv, info.pr_argc as usize)
                .classify_for(self, pid)
        });
        match full {
            Ok(args) if !args.is_empty() => Ok(args),
            Ok(_) => Ok(info.short_args()),
            // Other users' address spaces are off limits; `pr_psargs` isn't.
            Err(Error::PermissionDenied { .. }) => Ok(info.short_args()),
            Err(e) => Err(e),
        }
    }

    fn proc_environ(&self, pid: Pid) -> Result<BTreeMap<String, String>> {
        let info = self.psinfo(pid)?;
        let entries = self.address_space(pid)?.envp(info.pr_envp).classify_for(self, pid)?;
        Ok(super::parse_environ_block(entries))
    }

    fn proc_cwd(&self, pid: Pid) -> Result<String> {
        check_pid(pid)?;
        let cwd = self.procfs.read_pid_link(pid, "cwd").classify_for(self, pid)?;
        Ok(cwd.to_string_lossy().into_owned())
    }

    fn proc_ppid(&self, pid: Pid) -> Result<Pid> {
        Ok(self.psinfo(pid)?.pr_ppid as Pid)
    }

    fn proc_status(&self, pid: Pid) -> Result<ProcessStatus> {
        Ok(proc::status_from_sname(self.psinfo(pid)?.pr_lwp.pr_sname))
    }

    fn proc_uids(&self, pid: Pid) -> Result<ProcessIds> {
        let cred = self.cred(pid)?;
        Ok(ProcessIds {
            real: cred.pr_ruid as u32,
            effective: cred.pr_euid as u32,
            saved: cred.pr_suid as u32,
        })
    }

    fn proc_gids(&self, pid: Pid) -> Result<ProcessIds> {
        let cred = self.cred(pid)?;
        Ok(ProcessIds {
            real: cred.pr_rgid as u32,
            effective: cred.pr_egid as u32,
            saved: cred.pr_sgid as u32,
        })
    }

    fn proc_terminal(&self, pid: Pid) -> Result<Option<String>> {
        let dev = self.psinfo(pid)?.pr_ttydev;
        if dev == NODEV {
            return Ok(None);
        }
        Ok(posix::terminal_name(dev))
    }

    fn proc_create_time(&self, pid: Pid) -> Result<f64> {
        Ok(self.psinfo(pid)?.pr_start.seconds())
    }

    fn proc_cpu_times(&self, pid: Pid) -> Result<ProcessCpuTimes> {
        let status = self.pstatus(pid)?;
        Ok(ProcessCpuTimes {
            user: status.pr_utime.seconds(),
            system: status.pr_stime.seconds(),
            children_user: Some(status.pr_cutime.seconds()),
            children_system: Some(status.pr_cstime.seconds()),
        })
    }

    fn proc_memory_info(&self, pid: Pid) -> Result<ProcessMemory> {
        let info = self.psinfo(pid)?;
        Ok(ProcessMemory {
            rss: info.pr_rssize * 1024,
            vms: info.pr_size * 1024,
            ..Default::default()
        })
    }

    fn proc_num_threads(&self, pid: Pid) -> Result<u64> {
        Ok(u64::from(self.psinfo(pid)?.pr_nlwp))
    }

    fn proc_num_fds(&self, pid: Pid) -> Result<u64> {
        check_pid(pid)?;
        let dir = self.procfs.pid_path(pid, "fd");
        let entries = fs::read_dir(&dir)
            .map_err(|source| procfs::io_error("opendir", &dir, source))
            .classify_for(self, pid)?;
        Ok(entries.filter_map(|entry| entry.ok()).count() as u64)
    }

    fn proc_nice(&self, pid: Pid) -> Result<i32> {
        posix::get_priority(self, pid)
    }

    fn proc_set_nice(&self, pid: Pid, value: i32) -> Result<()> {
        posix::set_priority(self, pid, value)
    }

    fn proc_send_signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        posix::send_signal(self, pid, signal)
    }

    fn proc_is_zombie(&self, pid: Pid) -> Result<bool> {
        Ok(self.psinfo(pid)?.is_zombie())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn platform() -> PlatformImpl {
        PlatformImpl::new(BindingContext::builder().testing(true).build())
    }

    #[test]
    fn own_process() {
        let platform = platform();
        let pid = std::process::id() as Pid;
        assert!(platform.pids().unwrap().contains(&pid));
        assert!(platform.proc_memory_info(pid).unwrap().rss > 0);
        assert!(!platform.proc_cmdline(pid).unwrap().is_empty());
        assert!(platform.proc_create_time(pid).unwrap() >= platform.boot_time().unwrap());
        assert!(platform.proc_num_fds(pid).unwrap() >= 3);
    }

    #[test]
    fn missing_process() {
        let platform = platform();
        assert_eq!(platform.proc_name(99_999_996).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(platform.proc_ppid(-1).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(platform.cpu_times().unwrap_err().kind(), ErrorKind::Unsupported);
    }
}
