//! OpenBSD: `kinfo_proc` and `kinfo_file` tables, `uvmexp` memory counters, `hw.diskstats`, and the `utmp` file.

use std::{
    collections::BTreeMap,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use libc::{c_int, c_long};

use super::{kinfo_record, logical_cpus, read_table, split_cpu_ticks, timeval_secs, PlatformImpl, ProcInfo};
use crate::{
    buffer::{grow_until_fits, read_record, read_records, Fill},
    classify::{check_pid, ClassifyExt as _},
    error::{Error, Result},
    filter::{AddressFamilies, ConnectionFilter, SocketTypes},
    platform::{
        bsdlike::{self, sockets, sysctl},
        posix,
    },
    types::*,
};

const CTL_VM: c_int = 2;
const VM_UVMEXP: c_int = 4;
const HW_DISKSTATS: c_int = 9;
const HW_CPUSPEED: c_int = 12;
const HW_PHYSMEM64: c_int = 19;
const KERN_CPTIME: c_int = 40;
const KERN_CPTIME2: c_int = 71;
const KERN_FILE: c_int = 73;
const KERN_FILE_BYPID: c_int = 2;
const KERN_PROC_ARGS: c_int = 55;
const KERN_PROC_ARGV: c_int = 1;
const KERN_PROC_ENV: c_int = 3;
const KERN_PROC_CWD: c_int = 78;
const KERN_PROC_SHOW_THREADS: c_int = 0x4000_0000;

const DTYPE_SOCKET: u32 = 2;

const SIDL: i8 = 1;
const SRUN: i8 = 2;
const SSLEEP: i8 = 3;
const SSTOP: i8 = 4;
const SZOMB: i8 = 5;
const SDEAD: i8 = 6;
const SONPROC: i8 = 7;

/// `CP_USER`, `CP_NICE`, `CP_SYS`, `CP_SPIN`, `CP_INTR`, `CP_IDLE`.
const CPUSTATES: usize = 6;

const UTMP_PATH: &str = "/var/run/utmp";

/// `struct kinfo_file`, up to the fields read here. The kernel copies as much of its own record as the requested
/// element size asks for.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct KinfoFile {
    f_fileaddr: u64,
    f_flag: u32,
    f_iflags: u32,
    f_type: u32,
    f_count: u32,
    f_msgcount: u32,
    f_usecount: u32,
    f_ucred: u64,
    f_uid: u32,
    f_gid: u32,
    f_ops: u64,
    f_offset: u64,
    f_data: u64,
    f_rxfer: u64,
    f_rwfer: u64,
    f_seek: u64,
    f_rbytes: u64,
    f_wbytes: u64,
    v_un: u64,
    v_type: u32,
    v_tag: u32,
    v_flag: u32,
    va_rdev: u32,
    v_data: u64,
    v_mount: u64,
    va_fileid: u64,
    va_size: u64,
    va_mode: u32,
    va_fsid: u32,
    f_mntonname: [u8; 96],
    so_type: u32,
    so_state: u32,
    so_pcb: u64,
    so_protocol: u32,
    so_family: u32,
    inp_ppcb: u64,
    inp_lport: u32,
    inp_laddru: [u32; 4],
    inp_fport: u32,
    inp_faddru: [u32; 4],
    unp_conn: u64,
    pipe_peer: u64,
    pipe_state: u32,
    kq_count: u32,
    kq_state: u32,
    unused1: u32,
    p_pid: u32,
    fd_fd: i32,
    fd_ofileflags: u32,
    p_uid: u32,
    p_gid: u32,
    p_tid: u32,
    p_comm: [u8; 24],
    inp_rtableid: u32,
    so_splice: u64,
    so_splicelen: i64,
    so_rcv_cc: u64,
    so_snd_cc: u64,
    unp_refs: u64,
    unp_nextref: u64,
    unp_addr: u64,
    unp_path: [u8; 104],
    inp_proto: u32,
    t_state: u32,
}

/// `struct uvmexp`, up to the swap and event counters.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct Uvmexp {
    pagesize: c_int,
    pagemask: c_int,
    pageshift: c_int,
    npages: c_int,
    free: c_int,
    active: c_int,
    inactive: c_int,
    paging: c_int,
    wired: c_int,
    zeropages: c_int,
    reserve_pagedaemon: c_int,
    reserve_kernel: c_int,
    unused01: c_int,
    vnodepages: c_int,
    vtextpages: c_int,
    freemin: c_int,
    freetarg: c_int,
    inactarg: c_int,
    wiredmax: c_int,
    anonmin: c_int,
    vtextmin: c_int,
    vnodemin: c_int,
    anonminpct: c_int,
    vtextminpct: c_int,
    vnodeminpct: c_int,
    nswapdev: c_int,
    swpages: c_int,
    swpginuse: c_int,
    swpgonly: c_int,
    nswget: c_int,
    nanon: c_int,
    unused05: c_int,
    unused06: c_int,
    faults: c_int,
    traps: c_int,
    intrs: c_int,
    swtch: c_int,
    softs: c_int,
    syscalls: c_int,
    pageins: c_int,
    pcphit: c_int,
    pcpmiss: c_int,
    pgswapin: c_int,
    pgswapout: c_int,
    /// Counters past the ones read here; the kernel refuses to copy a partial record.
    rest: [c_int; 128],
}

/// `struct diskstats`.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct Diskstats {
    name: [u8; 16],
    busy: c_int,
    rxfer: u64,
    wxfer: u64,
    seek: u64,
    rbytes: u64,
    wbytes: u64,
    attachtime: libc::timeval,
    timestamp: libc::timeval,
    time: libc::timeval,
}

/// `struct utmp`.
#[repr(C)]
#[derive(Clone, Copy)]
struct Utmp {
    line: [u8; 8],
    name: [u8; 32],
    host: [u8; 256],
    time: i64,
}

fn status_from_stat(stat: i8) -> ProcessStatus {
    match stat {
        SIDL => ProcessStatus::Idle,
        SRUN | SONPROC => ProcessStatus::Running,
        SSLEEP => ProcessStatus::Sleeping,
        SSTOP => ProcessStatus::Stopped,
        SZOMB => ProcessStatus::Zombie,
        SDEAD => ProcessStatus::Dead,
        _ => ProcessStatus::Waiting,
    }
}

fn info_from(kinfo: &libc::kinfo_proc, page_size: u64) -> ProcInfo {
    let pages = |count: i32| count.max(0) as u64 * page_size;
    let tdev = kinfo.p_tdev as u32;

    ProcInfo {
        pid: kinfo.p_pid,
        ppid: kinfo.p_ppid,
        status: status_from_stat(kinfo.p_stat as i8),
        comm: posix::c_chars_to_string(&kinfo.p_comm),
        uids: ProcessIds {
            real: kinfo.p_ruid,
            effective: kinfo.p_uid,
            saved: kinfo.p_svuid,
        },
        gids: ProcessIds {
            real: kinfo.p_rgid,
            effective: kinfo.p_gid,
            saved: kinfo.p_svgid,
        },
        // NODEV
        tdev: (tdev != u32::MAX).then_some(tdev as u64),
        create_time: timeval_secs(kinfo.p_ustart_sec as i64, kinfo.p_ustart_usec as i64),
        cpu: ProcessCpuTimes {
            user: timeval_secs(kinfo.p_uutime_sec as i64, kinfo.p_uutime_usec as i64),
            system: timeval_secs(kinfo.p_ustime_sec as i64, kinfo.p_ustime_usec as i64),
            // Children's user and system time are only kept combined.
            children_user: Some(timeval_secs(kinfo.p_uctime_sec as i64, kinfo.p_uctime_usec as i64)),
            children_system: None,
        },
        memory: ProcessMemory {
            rss: pages(kinfo.p_vm_rssize),
            vms: pages(kinfo.p_vm_tsize) + pages(kinfo.p_vm_dsize) + pages(kinfo.p_vm_ssize),
            text: Some(pages(kinfo.p_vm_tsize)),
            data: Some(pages(kinfo.p_vm_dsize)),
            page_faults: Some(kinfo.p_uru_majflt),
            ..Default::default()
        },
        num_threads: None,
        ctx: CtxSwitches {
            voluntary: kinfo.p_uru_nvcsw,
            involuntary: kinfo.p_uru_nivcsw,
        },
        io: IoCounters {
            read_count: kinfo.p_uru_inblock,
            write_count: kinfo.p_uru_oublock,
            ..Default::default()
        },
    }
}

pub(super) fn kinfo(pid: Pid, page_size: u64) -> Result<ProcInfo> {
    let size = std::mem::size_of::<libc::kinfo_proc>() as c_int;
    let mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PID, pid, size, 1];
    let kinfo: libc::kinfo_proc = kinfo_record(&mib, pid, "sysctl(kern.proc.pid)")?;
    Ok(info_from(&kinfo, page_size))
}

pub(super) fn pids(platform: &PlatformImpl) -> Result<Vec<Pid>> {
    let prefix = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_ALL, 0];
    let table = read_table::<libc::kinfo_proc>(platform.context.buffer_policy(), &prefix, "sysctl(kern.proc.all)")?;
    Ok(table.into_iter().map(|kinfo| kinfo.p_pid).collect())
}

pub(super) fn exe(_platform: &PlatformImpl, _pid: Pid) -> Result<String> {
    Err(Error::unsupported("proc_exe"))
}

/// Decodes a `KERN_PROC_ARGS` answer: a NULL-terminated array of pointers into the same buffer, which the kernel
/// relocates to the address the buffer was at.
fn parse_argv(block: &[u8], base: usize) -> Vec<String> {
    let word = std::mem::size_of::<usize>();
    let mut strings = Vec::new();
    let mut slot = 0;
    while let Some(ptr) = read_record::<usize>(block, slot * word) {
        if ptr == 0 {
            break;
        }
        slot += 1;
        let Some(start) = ptr.checked_sub(base).filter(|start| *start < block.len()) else {
            break;
        };
        let rest = &block[start..];
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        strings.push(String::from_utf8_lossy(&rest[..end]).into_owned());
    }
    strings
}

fn proc_args(platform: &PlatformImpl, pid: Pid, which: c_int, syscall: &str) -> Result<Vec<String>> {
    check_pid(pid)?;
    let argmax: c_int = sysctl::value(&[libc::CTL_KERN, libc::KERN_ARGMAX], "sysctl(kern.argmax)")?;
    let mib = [libc::CTL_KERN, KERN_PROC_ARGS, pid, which];
    let block = grow_until_fits::<u8, _>(platform.context.buffer_policy(), syscall, argmax.max(4096) as usize, |buf| {
        let mut len = buf.len();
        // SAFETY: `buf` is valid for `len` bytes of writes.
        let rc = unsafe {
            libc::sysctl(
                mib.as_ptr() as *mut c_int,
                mib.len() as libc::c_uint,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc == -1 {
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::ENOMEM) {
                return Ok(Fill::TooSmall(None));
            }
            return Err(Error::Os {
                syscall: syscall.to_string(),
                source: error,
            });
        }
        Ok(Fill::Done(len))
    })
    .classify_for(platform, pid)?;
    Ok(parse_argv(&block, block.as_ptr() as usize))
}

pub(super) fn cmdline(platform: &PlatformImpl, pid: Pid) -> Result<Vec<String>> {
    proc_args(platform, pid, KERN_PROC_ARGV, "sysctl(kern.proc_args.argv)")
}

pub(super) fn environ(platform: &PlatformImpl, pid: Pid) -> Result<Vec<String>> {
    proc_args(platform, pid, KERN_PROC_ENV, "sysctl(kern.proc_args.env)")
}

pub(super) fn cwd(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    check_pid(pid)?;
    let path: [u8; libc::PATH_MAX as usize] =
        sysctl::value(&[libc::CTL_KERN, KERN_PROC_CWD, pid], "sysctl(kern.proc_cwd)").classify_for(platform, pid)?;
    let end = path.iter().position(|b| *b == 0).unwrap_or(path.len());
    Ok(String::from_utf8_lossy(&path[..end]).into_owned())
}

pub(super) fn threads(platform: &PlatformImpl, pid: Pid) -> Result<Vec<ThreadTimes>> {
    check_pid(pid)?;
    let prefix = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PID | KERN_PROC_SHOW_THREADS, pid];
    let table = read_table::<libc::kinfo_proc>(platform.context.buffer_policy(), &prefix, "sysctl(kern.proc.pid)")
        .classify_for(platform, pid)?;
    Ok(table
        .into_iter()
        // The process itself is listed with a thread ID of -1.
        .filter(|kinfo| kinfo.p_tid >= 0)
        .map(|kinfo| ThreadTimes {
            id: kinfo.p_tid as u64,
            user: timeval_secs(kinfo.p_uutime_sec as i64, kinfo.p_uutime_usec as i64),
            system: timeval_secs(kinfo.p_ustime_sec as i64, kinfo.p_ustime_usec as i64),
        })
        .collect())
}

fn files(platform: &PlatformImpl, pid: Pid) -> Result<Vec<KinfoFile>> {
    check_pid(pid)?;
    let prefix = [libc::CTL_KERN, KERN_FILE, KERN_FILE_BYPID, pid];
    read_table::<KinfoFile>(platform.context.buffer_policy(), &prefix, "sysctl(kern.file)").classify_for(platform, pid)
}

pub(super) fn num_fds(platform: &PlatformImpl, pid: Pid) -> Result<u64> {
    Ok(files(platform, pid)?.iter().filter(|file| file.fd_fd >= 0).count() as u64)
}

/// `kinfo_file` has no path for vnodes.
pub(super) fn open_files(_platform: &PlatformImpl, _pid: Pid) -> Result<Vec<OpenFile>> {
    Err(Error::unsupported("proc_open_files"))
}

fn inet_address(words: &[u32; 4], port: u32, family: AddressFamilies) -> Address {
    // Addresses and ports are kept in network byte order.
    let port = u16::from_be(port as u16);
    let ip = if family == AddressFamilies::Inet {
        IpAddr::V4(Ipv4Addr::from(words[0].to_ne_bytes()))
    } else {
        let mut octets = [0u8; 16];
        for (chunk, word) in octets.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(octets))
    };
    Address::Inet(SocketAddr::new(ip, port))
}

/// Sockets among a process's descriptors.
fn connections_in(files: &[KinfoFile], pid: Pid, filter: &ConnectionFilter) -> Vec<Connection> {
    files
        .iter()
        .filter(|file| file.f_type == DTYPE_SOCKET && file.fd_fd >= 0)
        .filter_map(|file| {
            let family = sockets::family_of(file.so_family as c_int)?;
            let kind = sockets::kind_of(file.so_type as c_int)?;
            if !filter.matches(family, kind) {
                return None;
            }
            let (local, remote) = if family == AddressFamilies::Unix {
                let mut path = vec![0u8, 0u8];
                path.extend_from_slice(&file.unp_path);
                (Some(Address::Unix(sockets::unix_path(&path))), None)
            } else {
                let remote = inet_address(&file.inp_faddru, file.inp_fport, family);
                (
                    Some(inet_address(&file.inp_laddru, file.inp_lport, family)),
                    Some(remote).filter(|a| !sockets::is_unset(a)),
                )
            };
            Some(Connection {
                fd: file.fd_fd,
                family,
                kind,
                local,
                remote,
                status: if kind == SocketTypes::Stream && family != AddressFamilies::Unix {
                    ConnectionStatus::from_bsd_tcp_state(file.t_state as i32)
                } else {
                    ConnectionStatus::None
                },
                pid: Some(pid),
            })
        })
        .collect()
}

pub(super) fn connections(platform: &PlatformImpl, pid: Pid, filter: ConnectionFilter) -> Result<Vec<Connection>> {
    Ok(connections_in(&files(platform, pid)?, pid, &filter))
}

pub(super) fn net_connections(platform: &PlatformImpl, filter: ConnectionFilter) -> Result<Vec<Connection>> {
    super::connections_of_all(platform, |pid| connections(platform, pid, filter))
}

fn times_from_ticks(ticks: &[u64], clock_ticks: f64) -> CpuTimes {
    let secs = |state: usize| ticks.get(state).copied().unwrap_or(0) as f64 / clock_ticks;
    CpuTimes {
        user: secs(0),
        nice: Some(secs(1)),
        // Spinning on a lock is time spent in the kernel.
        system: secs(2) + secs(3),
        interrupt: Some(secs(4)),
        idle: secs(5),
        ..Default::default()
    }
}

pub(super) fn cpu_times(platform: &PlatformImpl) -> Result<CpuTimes> {
    let ticks: [c_long; CPUSTATES] = sysctl::value(&[libc::CTL_KERN, KERN_CPTIME], "sysctl(kern.cp_time)")?;
    let ticks = ticks.map(|tick| tick.max(0) as u64);
    Ok(times_from_ticks(&ticks, platform.clock_ticks))
}

pub(super) fn per_cpu_times(platform: &PlatformImpl) -> Result<Vec<CpuTimes>> {
    let mut ticks = Vec::new();
    for cpu in 0..logical_cpus()? {
        let cpu_ticks: [u64; CPUSTATES] =
            sysctl::value(&[libc::CTL_KERN, KERN_CPTIME2, cpu as c_int], "sysctl(kern.cp_time2)")?;
        ticks.extend_from_slice(&cpu_ticks);
    }
    Ok(split_cpu_ticks(&ticks, CPUSTATES, |cpu| times_from_ticks(cpu, platform.clock_ticks)))
}

pub(super) fn cpu_count_cores() -> Result<usize> {
    Err(Error::unsupported("cpu_count_cores"))
}

fn uvmexp() -> Result<Uvmexp> {
    sysctl::value(&[CTL_VM, VM_UVMEXP], "sysctl(vm.uvmexp)")
}

pub(super) fn cpu_stats() -> Result<CpuStats> {
    let uvm = uvmexp()?;
    let count = |value: c_int| value.max(0) as u64;
    Ok(CpuStats {
        ctx_switches: count(uvm.swtch),
        interrupts: count(uvm.intrs),
        soft_interrupts: count(uvm.softs),
        syscalls: count(uvm.syscalls),
    })
}

pub(super) fn cpu_freq(_platform: &PlatformImpl) -> Result<CpuFreq> {
    let speed: c_int = sysctl::value(&[libc::CTL_HW, HW_CPUSPEED], "sysctl(hw.cpuspeed)")?;
    Ok(CpuFreq {
        current: speed as f64,
        ..Default::default()
    })
}

fn memory_from_uvm(total: u64, uvm: &Uvmexp) -> VirtualMemory {
    let page = uvm.pagesize.max(0) as u64;
    let pages = |count: c_int| count.max(0) as u64 * page;
    let free = pages(uvm.free);
    let inactive = pages(uvm.inactive);
    let active = pages(uvm.active);
    let wired = pages(uvm.wired);
    VirtualMemory {
        total,
        available: inactive + free,
        used: active + wired,
        free,
        active: Some(active),
        inactive: Some(inactive),
        wired: Some(wired),
        ..Default::default()
    }
}

pub(super) fn virtual_memory(_platform: &PlatformImpl) -> Result<VirtualMemory> {
    let total: i64 = sysctl::value(&[libc::CTL_HW, HW_PHYSMEM64], "sysctl(hw.physmem64)")?;
    Ok(memory_from_uvm(total.max(0) as u64, &uvmexp()?))
}

fn swap_from_uvm(uvm: &Uvmexp) -> SwapMemory {
    let page = uvm.pagesize.max(0) as u64;
    let pages = |count: c_int| count.max(0) as u64 * page;
    let total = pages(uvm.swpages);
    let used = pages(uvm.swpginuse);
    SwapMemory {
        total,
        used,
        free: total.saturating_sub(used),
        sin: pages(uvm.pgswapin),
        sout: pages(uvm.pgswapout),
    }
}

pub(super) fn swap_memory(_platform: &PlatformImpl) -> Result<SwapMemory> {
    Ok(swap_from_uvm(&uvmexp()?))
}

fn timeval_millis(tv: &libc::timeval) -> u64 {
    tv.tv_sec.max(0) as u64 * 1000 + tv.tv_usec.max(0) as u64 / 1000
}

pub(super) fn disk_io_counters(platform: &PlatformImpl) -> Result<BTreeMap<String, DiskIoCounters>> {
    let bytes = sysctl::read_bytes(
        platform.context.buffer_policy(),
        &[libc::CTL_HW, HW_DISKSTATS],
        "sysctl(hw.diskstats)",
    )?;
    Ok(read_records::<Diskstats>(&bytes)
        .into_iter()
        .map(|stats| {
            let end = stats.name.iter().position(|b| *b == 0).unwrap_or(stats.name.len());
            // Only the total busy time is kept.
            let busy = timeval_millis(&stats.time);
            let counters = DiskIoCounters {
                read_count: stats.rxfer,
                write_count: stats.wxfer,
                read_bytes: stats.rbytes,
                write_bytes: stats.wbytes,
                read_time: busy,
                write_time: busy,
                busy_time: Some(busy),
            };
            (String::from_utf8_lossy(&stats.name[..end]).into_owned(), counters)
        })
        .collect())
}

pub(super) fn net_io_counters() -> Result<BTreeMap<String, NetIoCounters>> {
    bsdlike::ifnet::io_counters()
}

fn field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Sessions in a `utmp` file. Empty slots are left behind by logouts.
fn parse_utmp(bytes: &[u8]) -> Vec<User> {
    read_records::<Utmp>(bytes)
        .into_iter()
        .filter(|entry| entry.name[0] != 0)
        .map(|entry| {
            let host = field(&entry.host);
            User {
                name: field(&entry.name),
                terminal: Some(field(&entry.line)),
                host: (!host.is_empty()).then_some(host),
                started: entry.time as f64,
                pid: None,
            }
        })
        .collect()
}

/// Logged in users, from `/var/run/utmp`. OpenBSD has no utmpx.
pub(super) fn users() -> Result<Vec<User>> {
    let bytes = std::fs::read(UTMP_PATH).map_err(|source| Error::Os {
        syscall: format!("read({})", UTMP_PATH),
        source,
    })?;
    Ok(parse_utmp(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_pointers() {
        let base = 0x1000usize;
        let word = std::mem::size_of::<usize>();
        let mut block = Vec::new();
        let strings_at = base + 3 * word;
        block.extend_from_slice(&strings_at.to_ne_bytes());
        block.extend_from_slice(&(strings_at + 3).to_ne_bytes());
        block.extend_from_slice(&0usize.to_ne_bytes());
        block.extend_from_slice(b"ls\0-la\0");

        assert_eq!(parse_argv(&block, base), vec!["ls", "-la"]);
        assert!(parse_argv(&[], base).is_empty());
        // A pointer outside the buffer ends the walk.
        let stray = (base + 4096).to_ne_bytes();
        assert!(parse_argv(&stray, base).is_empty());
    }

    #[test]
    fn socket_states() {
        let socket = |fd: i32, so_type: c_int, t_state: u32| {
            // SAFETY: `KinfoFile` is plain old data.
            let mut file: KinfoFile = unsafe { std::mem::zeroed() };
            file.f_type = DTYPE_SOCKET;
            file.fd_fd = fd;
            file.so_family = libc::AF_INET as u32;
            file.so_type = so_type as u32;
            file.inp_laddru[0] = u32::from_ne_bytes([127, 0, 0, 1]);
            file.inp_lport = u32::from(8080u16.to_be());
            file.t_state = t_state;
            file
        };
        let files = [socket(3, libc::SOCK_STREAM, 1), socket(4, libc::SOCK_STREAM, 4), socket(5, libc::SOCK_DGRAM, 0)];

        let all = connections_in(&files, 7, &ConnectionFilter::all());
        let states = all.iter().map(|c| c.status).collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![ConnectionStatus::Listen, ConnectionStatus::Established, ConnectionStatus::None]
        );
        assert_eq!(all[0].local, Some(Address::Inet("127.0.0.1:8080".parse().unwrap())));
        assert_eq!(connections_in(&files, 7, &"udp4".parse().unwrap()).len(), 1);
    }

    #[test]
    fn utmp_records() {
        // SAFETY: `Utmp` is plain old data.
        let mut entry: Utmp = unsafe { std::mem::zeroed() };
        entry.line[..5].copy_from_slice(b"ttyp0");
        entry.name[..5].copy_from_slice(b"alice");
        entry.time = 1_700_000_000;
        let empty: Utmp = unsafe { std::mem::zeroed() };

        let mut bytes = Vec::new();
        for record in [entry, empty] {
            // SAFETY: `record` is plain old data of the given size.
            let raw = unsafe {
                std::slice::from_raw_parts(&record as *const Utmp as *const u8, std::mem::size_of::<Utmp>())
            };
            bytes.extend_from_slice(raw);
        }

        let users = parse_utmp(&bytes);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "alice");
        assert_eq!(users[0].terminal.as_deref(), Some("ttyp0"));
        assert_eq!(users[0].host, None);
        assert_eq!(users[0].started, 1_700_000_000.0);
    }

    #[test]
    fn inet_addresses() {
        let words = [u32::from_ne_bytes([192, 168, 1, 10]), 0, 0, 0];
        let port = u16::to_be(443) as u32;
        assert_eq!(
            inet_address(&words, port, AddressFamilies::Inet),
            Address::Inet("192.168.1.10:443".parse().unwrap())
        );
    }

    #[test]
    fn uvm_accounting() {
        // SAFETY: `Uvmexp` is plain old data.
        let mut uvm: Uvmexp = unsafe { std::mem::zeroed() };
        uvm.pagesize = 4096;
        uvm.free = 10;
        uvm.inactive = 5;
        uvm.active = 20;
        uvm.wired = 3;
        uvm.swpages = 100;
        uvm.swpginuse = 25;

        let memory = memory_from_uvm(1 << 30, &uvm);
        assert_eq!(memory.available, 15 * 4096);
        assert_eq!(memory.used, 23 * 4096);

        let swap = swap_from_uvm(&uvm);
        assert_eq!(swap.free, 75 * 4096);
    }
}
