//! NetBSD: `kinfo_proc2`, `kinfo_lwp` and `kinfo_file` tables, the protocol control block lists for sockets,
//! `uvmexp_sysctl` for memory, and `hw.iostats` for disks.

use std::collections::BTreeMap;

use libc::{c_char, c_int};

use super::{kinfo_record, logical_cpus, read_table, split_cpu_ticks, timeval_secs, PlatformImpl, ProcInfo};
use crate::{
    buffer::read_records,
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
const VM_UVMEXP2: c_int = 5;
const HW_IOSTATS: c_int = 9;
const HW_PHYSMEM64: c_int = 13;
const KERN_PROC2: c_int = 47;
const KERN_PROC_ALL: c_int = 0;
const KERN_PROC_PID: c_int = 1;
const KERN_PROC_ARGS: c_int = 48;
const KERN_PROC_ARGV: c_int = 1;
const KERN_PROC_ENV: c_int = 3;
const KERN_PROC_PATHNAME: c_int = 5;
const KERN_PROC_CWD: c_int = 6;
const KERN_LWP: c_int = 64;
const KERN_FILE2: c_int = 77;
const KERN_FILE_BYPID: c_int = 2;

const DTYPE_SOCKET: u32 = 2;
const IOSTAT_DISK: i32 = 0;

const SIDL: i8 = 1;
const SACTIVE: i8 = 2;
const SDYING: i8 = 3;
const SSTOP: i8 = 4;
const SZOMB: i8 = 5;
const SDEAD: i8 = 6;

/// `CP_USER`, `CP_NICE`, `CP_SYS`, `CP_INTR`, `CP_IDLE`.
const CPUSTATES: usize = 5;

/// The PCB list nodes, with what each one holds.
const PCB_LISTS: [(&str, AddressFamilies, SocketTypes); 7] = [
    ("net.inet.tcp.pcblist", AddressFamilies::Inet, SocketTypes::Stream),
    ("net.inet.udp.pcblist", AddressFamilies::Inet, SocketTypes::Datagram),
    ("net.inet6.tcp6.pcblist", AddressFamilies::Inet6, SocketTypes::Stream),
    ("net.inet6.udp6.pcblist", AddressFamilies::Inet6, SocketTypes::Datagram),
    ("net.local.stream.pcblist", AddressFamilies::Unix, SocketTypes::Stream),
    ("net.local.dgram.pcblist", AddressFamilies::Unix, SocketTypes::Datagram),
    ("net.local.seqpacket.pcblist", AddressFamilies::Unix, SocketTypes::SeqPacket),
];

/// `struct kinfo_lwp`.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct KinfoLwp {
    l_forw: u64,
    l_back: u64,
    l_laddr: u64,
    l_addr: u64,
    l_lid: i32,
    l_flag: i32,
    l_swtime: u32,
    l_slptime: u32,
    l_schedflags: i32,
    l_holdcnt: i32,
    l_priority: u8,
    l_usrpri: u8,
    l_stat: i8,
    l_pad1: i8,
    l_pad2: i32,
    l_wmesg: [c_char; 8],
    l_wchan: u64,
    l_cpuid: u64,
    l_rtime_sec: u32,
    l_rtime_usec: u32,
    l_cpticks: u32,
    l_pctcpu: u32,
    l_pid: u32,
    l_name: [c_char; 20],
}

/// `struct kinfo_file`, as returned by `KERN_FILE2`.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct KinfoFile {
    ki_fileaddr: u64,
    ki_flag: u32,
    ki_iflags: u32,
    ki_ftype: u32,
    ki_count: u32,
    ki_msgcount: u32,
    ki_usecount: u32,
    ki_fucred: u64,
    ki_fuid: u32,
    ki_fgid: u32,
    ki_fops: u64,
    ki_foffset: u64,
    ki_fdata: u64,
    ki_vun: u64,
    ki_vsize: u64,
    ki_vtype: u32,
    ki_vtag: u32,
    ki_vdata: u64,
    ki_pid: u32,
    ki_fd: i32,
    ki_ofileflags: u32,
    ki_padto64bits: u32,
}

/// `struct kinfo_pcb`.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct KinfoPcb {
    ki_pcbaddr: u64,
    ki_ppcbaddr: u64,
    ki_sockaddr: u64,
    ki_family: u32,
    ki_type: u32,
    ki_protocol: u32,
    ki_pflags: u32,
    ki_sostate: u32,
    ki_prstate: u32,
    ki_tstate: i32,
    ki_tflags: u32,
    ki_rcvq: u64,
    ki_sndq: u64,
    ki_src: [u8; 264],
    ki_dst: [u8; 264],
    ki_inode: u64,
    ki_vnode: u64,
    ki_conn: u64,
    ki_refs: u64,
    ki_nextref: u64,
}

/// `struct uvmexp_sysctl`, up to the swap counters.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct UvmexpSysctl {
    pagesize: i64,
    pagemask: i64,
    pageshift: i64,
    npages: i64,
    free: i64,
    active: i64,
    inactive: i64,
    paging: i64,
    wired: i64,
    zeropages: i64,
    reserve_pagedaemon: i64,
    reserve_kernel: i64,
    freemin: i64,
    freetarg: i64,
    inactarg: i64,
    wiredmax: i64,
    nswapdev: i64,
    swpages: i64,
    swpginuse: i64,
    swpgonly: i64,
    nswget: i64,
    unused1: i64,
    cpuhit: i64,
    cpumiss: i64,
    faults: i64,
    traps: i64,
    intrs: i64,
    swtch: i64,
    softs: i64,
    syscalls: i64,
    pageins: i64,
    swapins: i64,
    swapouts: i64,
    pgswapin: i64,
    pgswapout: i64,
    /// Counters past the ones read here; the kernel refuses to copy a partial record.
    rest: [i64; 128],
}

/// `struct io_sysctl`, up to the split read and write counters.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct IoSysctl {
    name: [u8; 16],
    busy: i32,
    kind: i32,
    xfer: u64,
    seek: u64,
    bytes: u64,
    attachtime_sec: u32,
    attachtime_usec: u32,
    timestamp_sec: u32,
    timestamp_usec: u32,
    time_sec: u32,
    time_usec: u32,
    rxfer: u64,
    wxfer: u64,
    rbytes: u64,
    wbytes: u64,
}

fn status_from_stat(stat: i8) -> ProcessStatus {
    match stat {
        SIDL => ProcessStatus::Idle,
        SACTIVE => ProcessStatus::Running,
        SDYING | SZOMB => ProcessStatus::Zombie,
        SSTOP => ProcessStatus::Stopped,
        SDEAD => ProcessStatus::Dead,
        _ => ProcessStatus::Waiting,
    }
}

fn info_from(kinfo: &libc::kinfo_proc2, page_size: u64) -> ProcInfo {
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
        num_threads: Some(kinfo.p_nlwps),
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
    let size = std::mem::size_of::<libc::kinfo_proc2>() as c_int;
    let mib = [libc::CTL_KERN, KERN_PROC2, KERN_PROC_PID, pid, size, 1];
    let kinfo: libc::kinfo_proc2 = kinfo_record(&mib, pid, "sysctl(kern.proc2.pid)")?;
    Ok(info_from(&kinfo, page_size))
}

pub(super) fn pids(platform: &PlatformImpl) -> Result<Vec<Pid>> {
    let prefix = [libc::CTL_KERN, KERN_PROC2, KERN_PROC_ALL, 0];
    let table = read_table::<libc::kinfo_proc2>(platform.context.buffer_policy(), &prefix, "sysctl(kern.proc2.all)")?;
    Ok(table.into_iter().map(|kinfo| kinfo.p_pid).collect())
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn proc_args(platform: &PlatformImpl, pid: Pid, which: c_int, syscall: &str) -> Result<Vec<u8>> {
    platform.proc_node(pid, &[libc::CTL_KERN, KERN_PROC_ARGS, pid, which], syscall)
}

pub(super) fn exe(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    Ok(trim_nul(&proc_args(platform, pid, KERN_PROC_PATHNAME, "sysctl(kern.proc_args.pathname)")?))
}

pub(super) fn cmdline(platform: &PlatformImpl, pid: Pid) -> Result<Vec<String>> {
    let block = proc_args(platform, pid, KERN_PROC_ARGV, "sysctl(kern.proc_args.argv)")?;
    Ok(posix::split_nul_block(&block))
}

pub(super) fn environ(platform: &PlatformImpl, pid: Pid) -> Result<Vec<String>> {
    let block = proc_args(platform, pid, KERN_PROC_ENV, "sysctl(kern.proc_args.env)")?;
    Ok(posix::split_nul_block(&block))
}

pub(super) fn cwd(platform: &PlatformImpl, pid: Pid) -> Result<String> {
    Ok(trim_nul(&proc_args(platform, pid, KERN_PROC_CWD, "sysctl(kern.proc_args.cwd)")?))
}

pub(super) fn threads(platform: &PlatformImpl, pid: Pid) -> Result<Vec<ThreadTimes>> {
    check_pid(pid)?;
    let table = read_table::<KinfoLwp>(
        platform.context.buffer_policy(),
        &[libc::CTL_KERN, KERN_LWP, pid],
        "sysctl(kern.lwp)",
    )
    .classify_for(platform, pid)?;
    // LWPs only track their run time as a whole.
    Ok(table
        .into_iter()
        .map(|lwp| ThreadTimes {
            id: lwp.l_lid.max(0) as u64,
            user: timeval_secs(lwp.l_rtime_sec as i64, lwp.l_rtime_usec as i64),
            system: 0.0,
        })
        .collect())
}

fn files(platform: &PlatformImpl, pid: Pid) -> Result<Vec<KinfoFile>> {
    check_pid(pid)?;
    let prefix = [libc::CTL_KERN, KERN_FILE2, KERN_FILE_BYPID, pid];
    read_table::<KinfoFile>(platform.context.buffer_policy(), &prefix, "sysctl(kern.file2)").classify_for(platform, pid)
}

pub(super) fn num_fds(platform: &PlatformImpl, pid: Pid) -> Result<u64> {
    Ok(files(platform, pid)?.iter().filter(|file| file.ki_fd >= 0).count() as u64)
}

/// `kinfo_file` has no path for vnodes.
pub(super) fn open_files(_platform: &PlatformImpl, _pid: Pid) -> Result<Vec<OpenFile>> {
    Err(Error::unsupported("proc_open_files"))
}

/// Joins a process's socket descriptors with the PCB lists on the socket's kernel address.
fn join_sockets(
    files: &[KinfoFile], pcbs: &[(AddressFamilies, SocketTypes, KinfoPcb)], pid: Pid,
) -> Vec<Connection> {
    let mut connections = Vec::new();
    for file in files.iter().filter(|file| file.ki_ftype == DTYPE_SOCKET && file.ki_fd >= 0) {
        let Some((family, kind, pcb)) = pcbs.iter().find(|(_, _, pcb)| pcb.ki_sockaddr == file.ki_fdata) else {
            continue;
        };
        let status = if *kind == SocketTypes::Stream && *family != AddressFamilies::Unix {
            ConnectionStatus::from_bsd_tcp_state(pcb.ki_tstate)
        } else {
            ConnectionStatus::None
        };
        connections.push(Connection {
            fd: file.ki_fd,
            family: *family,
            kind: *kind,
            local: sockets::sockaddr_address(&pcb.ki_src),
            remote: sockets::sockaddr_address(&pcb.ki_dst).filter(|a| !sockets::is_unset(a)),
            status,
            pid: Some(pid),
        });
    }
    connections
}

/// Protocol control blocks of every list the filter can match.
fn pcbs(platform: &PlatformImpl, filter: ConnectionFilter) -> Result<Vec<(AddressFamilies, SocketTypes, KinfoPcb)>> {
    let mut pcbs = Vec::new();
    for (name, family, kind) in PCB_LISTS {
        if !filter.wants(family, kind) {
            continue;
        }
        let mib = sysctl::mib_by_name(name)?;
        let table = read_table::<KinfoPcb>(platform.context.buffer_policy(), &mib, name)?;
        pcbs.extend(table.into_iter().map(|pcb| (family, kind, pcb)));
    }
    Ok(pcbs)
}

pub(super) fn connections(platform: &PlatformImpl, pid: Pid, filter: ConnectionFilter) -> Result<Vec<Connection>> {
    let files = files(platform, pid)?;
    Ok(join_sockets(&files, &pcbs(platform, filter)?, pid))
}

/// Connections of every process, sharing one read of the PCB lists.
pub(super) fn net_connections(platform: &PlatformImpl, filter: ConnectionFilter) -> Result<Vec<Connection>> {
    let pcbs = pcbs(platform, filter)?;
    super::connections_of_all(platform, |pid| Ok(join_sockets(&files(platform, pid)?, &pcbs, pid)))
}

fn times_from_ticks(ticks: &[u64], clock_ticks: f64) -> CpuTimes {
    let secs = |state: usize| ticks.get(state).copied().unwrap_or(0) as f64 / clock_ticks;
    CpuTimes {
        user: secs(0),
        nice: Some(secs(1)),
        system: secs(2),
        interrupt: Some(secs(3)),
        idle: secs(4),
        ..Default::default()
    }
}

pub(super) fn cpu_times(platform: &PlatformImpl) -> Result<CpuTimes> {
    let ticks = sysctl::value_by_name::<[u64; CPUSTATES]>("kern.cp_time")?;
    Ok(times_from_ticks(&ticks, platform.clock_ticks))
}

pub(super) fn per_cpu_times(platform: &PlatformImpl) -> Result<Vec<CpuTimes>> {
    let mut mib = sysctl::mib_by_name("kern.cp_time")?;
    mib.push(0);
    let slot = mib.len() - 1;

    let mut ticks = Vec::new();
    for cpu in 0..logical_cpus()? {
        mib[slot] = cpu as c_int;
        let cpu_ticks: [u64; CPUSTATES] = sysctl::value(&mib, "sysctl(kern.cp_time.N)")?;
        ticks.extend_from_slice(&cpu_ticks);
    }
    Ok(split_cpu_ticks(&ticks, CPUSTATES, |cpu| times_from_ticks(cpu, platform.clock_ticks)))
}

pub(super) fn cpu_count_cores() -> Result<usize> {
    Err(Error::unsupported("cpu_count_cores"))
}

fn uvmexp() -> Result<UvmexpSysctl> {
    sysctl::value(&[CTL_VM, VM_UVMEXP2], "sysctl(vm.uvmexp2)")
}

pub(super) fn cpu_stats() -> Result<CpuStats> {
    let uvm = uvmexp()?;
    let count = |value: i64| value.max(0) as u64;
    Ok(CpuStats {
        ctx_switches: count(uvm.swtch),
        interrupts: count(uvm.intrs),
        soft_interrupts: count(uvm.softs),
        syscalls: count(uvm.syscalls),
    })
}

pub(super) fn cpu_freq(_platform: &PlatformImpl) -> Result<CpuFreq> {
    Err(Error::unsupported("cpu_freq"))
}

fn memory_from_uvm(total: u64, uvm: &UvmexpSysctl) -> VirtualMemory {
    let pages = |count: i64| count.max(0) as u64 * uvm.pagesize.max(0) as u64;
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

pub(super) fn swap_memory(_platform: &PlatformImpl) -> Result<SwapMemory> {
    let uvm = uvmexp()?;
    let pages = |count: i64| count.max(0) as u64 * uvm.pagesize.max(0) as u64;
    let total = pages(uvm.swpages);
    let used = pages(uvm.swpginuse);
    Ok(SwapMemory {
        total,
        used,
        free: total.saturating_sub(used),
        sin: pages(uvm.pgswapin),
        sout: pages(uvm.pgswapout),
    })
}

fn disk_counters(stats: &[IoSysctl]) -> BTreeMap<String, DiskIoCounters> {
    stats
        .iter()
        .filter(|stat| stat.kind == IOSTAT_DISK)
        .map(|stat| {
            // Only the total busy time is kept.
            let busy = stat.time_sec as u64 * 1000 + stat.time_usec as u64 / 1000;
            let counters = DiskIoCounters {
                read_count: stat.rxfer,
                write_count: stat.wxfer,
                read_bytes: stat.rbytes,
                write_bytes: stat.wbytes,
                read_time: busy,
                write_time: busy,
                busy_time: Some(busy),
            };
            (trim_nul(&stat.name), counters)
        })
        .collect()
}

pub(super) fn disk_io_counters(platform: &PlatformImpl) -> Result<BTreeMap<String, DiskIoCounters>> {
    let mib = [libc::CTL_HW, HW_IOSTATS, std::mem::size_of::<IoSysctl>() as c_int];
    let bytes = sysctl::read_bytes(platform.context.buffer_policy(), &mib, "sysctl(hw.iostats)")?;
    Ok(disk_counters(&read_records::<IoSysctl>(&bytes)))
}

pub(super) fn net_io_counters() -> Result<BTreeMap<String, NetIoCounters>> {
    bsdlike::ifnet::io_counters()
}

pub(super) fn users() -> Result<Vec<User>> {
    posix::utmpx::users()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_file(fd: i32, fdata: u64) -> KinfoFile {
        // SAFETY: `KinfoFile` is plain old data.
        let mut file: KinfoFile = unsafe { std::mem::zeroed() };
        file.ki_ftype = DTYPE_SOCKET;
        file.ki_fd = fd;
        file.ki_fdata = fdata;
        file
    }

    fn pcb(sockaddr: u64, src: &[u8], tstate: i32) -> KinfoPcb {
        // SAFETY: `KinfoPcb` is plain old data.
        let mut pcb: KinfoPcb = unsafe { std::mem::zeroed() };
        pcb.ki_sockaddr = sockaddr;
        pcb.ki_src[..src.len()].copy_from_slice(src);
        pcb.ki_tstate = tstate;
        pcb
    }

    #[test]
    fn layouts() {
        assert_eq!(std::mem::size_of::<KinfoFile>(), 120);
        assert_eq!(std::mem::size_of::<KinfoPcb>(), 640);
        assert_eq!(std::mem::size_of::<KinfoLwp>(), 128);
    }

    #[test]
    fn sockets_join_on_kernel_address() {
        let listener = [16, libc::AF_INET as u8, 0, 80, 0, 0, 0, 0];
        let pcbs = vec![
            (AddressFamilies::Inet, SocketTypes::Stream, pcb(0xdead, &listener, 1)),
            (AddressFamilies::Inet, SocketTypes::Datagram, pcb(0xbeef, &listener, 0)),
        ];
        let files = vec![socket_file(3, 0xdead), socket_file(4, 0xbeef), socket_file(5, 0xf00d)];

        let connections = join_sockets(&files, &pcbs, 7);
        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].fd, 3);
        assert_eq!(connections[0].status, ConnectionStatus::Listen);
        assert_eq!(connections[0].local, Some(Address::Inet("0.0.0.0:80".parse().unwrap())));
        assert_eq!(connections[0].remote, None);
        assert_eq!(connections[1].status, ConnectionStatus::None);
        assert_eq!(connections[1].pid, Some(7));
    }

    #[test]
    fn disk_filtering() {
        // SAFETY: `IoSysctl` is plain old data.
        let mut disk: IoSysctl = unsafe { std::mem::zeroed() };
        disk.name[..3].copy_from_slice(b"wd0");
        disk.rxfer = 10;
        disk.time_sec = 2;
        disk.time_usec = 500_000;
        let mut tape = disk;
        tape.kind = 1;

        let counters = disk_counters(&[disk, tape]);
        assert_eq!(counters.len(), 1);
        assert_eq!(counters["wd0"].read_count, 10);
        assert_eq!(counters["wd0"].busy_time, Some(2500));
    }
}
