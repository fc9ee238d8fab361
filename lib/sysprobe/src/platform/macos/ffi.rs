//! libproc and Mach host declarations that `libc` doesn't carry, or carries with layouts too old to trust.
//!
//! Layouts follow `<sys/proc_info.h>`, `<mach/host_info.h>` and `<net/if.h>` from the current SDK. Every struct's size
//! is checked against the SDK's in the tests below.

#![allow(non_camel_case_types, dead_code)]

use libc::{c_char, c_int, c_void};
use mach2::{kern_return::kern_return_t, port::mach_port_t};

pub(super) const MAXPATHLEN: usize = 1024;
pub(super) const PROC_PIDPATHINFO_MAXSIZE: usize = 4 * MAXPATHLEN;

// `proc_pidinfo` flavors.
pub(super) const PROC_PIDLISTFDS: c_int = 1;
pub(super) const PROC_PIDTBSDINFO: c_int = 3;
pub(super) const PROC_PIDTASKINFO: c_int = 4;
pub(super) const PROC_PIDTHREADINFO: c_int = 5;
pub(super) const PROC_PIDLISTTHREADS: c_int = 6;
pub(super) const PROC_PIDVNODEPATHINFO: c_int = 9;

// `proc_pidfdinfo` flavors.
pub(super) const PROC_PIDFDVNODEPATHINFO: c_int = 2;
pub(super) const PROC_PIDFDSOCKETINFO: c_int = 3;

pub(super) const PROX_FDTYPE_VNODE: u32 = 1;
pub(super) const PROX_FDTYPE_SOCKET: u32 = 2;

pub(super) const SOCKINFO_IN: c_int = 1;
pub(super) const SOCKINFO_TCP: c_int = 2;
pub(super) const SOCKINFO_UN: c_int = 3;

pub(super) const INI_IPV4: u8 = 0x1;
pub(super) const INI_IPV6: u8 = 0x2;

// `p_stat` values from `<sys/proc.h>`.
pub(super) const SIDL: c_char = 1;
pub(super) const SRUN: c_char = 2;
pub(super) const SSLEEP: c_char = 3;
pub(super) const SSTOP: c_char = 4;
pub(super) const SZOMB: c_char = 5;

pub(super) const RUSAGE_INFO_V2: c_int = 2;

pub(super) const HOST_CPU_LOAD_INFO: c_int = 3;
pub(super) const HOST_VM_INFO64: c_int = 4;
pub(super) const PROCESSOR_CPU_LOAD_INFO: c_int = 2;

pub(super) const CPU_STATE_USER: usize = 0;
pub(super) const CPU_STATE_SYSTEM: usize = 1;
pub(super) const CPU_STATE_IDLE: usize = 2;
pub(super) const CPU_STATE_NICE: usize = 3;
pub(super) const CPU_STATE_MAX: usize = 4;

pub(super) const NET_RT_IFLIST2: c_int = 6;
pub(super) const RTM_IFINFO2: u8 = 0x12;

const MAXCOMLEN: usize = 16;
const SOCK_MAXADDRLEN: usize = 255;
const MAXTHREADNAMESIZE: usize = 64;

/// `struct proc_bsdinfo`, for `PROC_PIDTBSDINFO`. Not available for zombies.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct proc_bsdinfo {
    pub pbi_flags: u32,
    pub pbi_status: u32,
    pub pbi_xstatus: u32,
    pub pbi_pid: u32,
    pub pbi_ppid: u32,
    pub pbi_uid: u32,
    pub pbi_gid: u32,
    pub pbi_ruid: u32,
    pub pbi_rgid: u32,
    pub pbi_svuid: u32,
    pub pbi_svgid: u32,
    pub rfu_1: u32,
    pub pbi_comm: [c_char; MAXCOMLEN],
    pub pbi_name: [c_char; 2 * MAXCOMLEN],
    pub pbi_nfiles: u32,
    pub pbi_pgid: u32,
    pub pbi_pjobc: u32,
    pub e_tdev: u32,
    pub e_tpgid: u32,
    pub pbi_nice: i32,
    pub pbi_start_tvsec: u64,
    pub pbi_start_tvusec: u64,
}

/// `struct proc_taskinfo`, for `PROC_PIDTASKINFO`. Times are in Mach absolute time units.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct proc_taskinfo {
    pub pti_virtual_size: u64,
    pub pti_resident_size: u64,
    pub pti_total_user: u64,
    pub pti_total_system: u64,
    pub pti_threads_user: u64,
    pub pti_threads_system: u64,
    pub pti_policy: i32,
    pub pti_faults: i32,
    pub pti_pageins: i32,
    pub pti_cow_faults: i32,
    pub pti_messages_sent: i32,
    pub pti_messages_received: i32,
    pub pti_syscalls_mach: i32,
    pub pti_syscalls_unix: i32,
    pub pti_csw: i32,
    pub pti_threadnum: i32,
    pub pti_numrunning: i32,
    pub pti_priority: i32,
}

/// `struct proc_fdinfo`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct proc_fdinfo {
    pub proc_fd: i32,
    pub proc_fdtype: u32,
}

/// `struct proc_fileinfo`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct proc_fileinfo {
    pub fi_openflags: u32,
    pub fi_status: u32,
    pub fi_offset: i64,
    pub fi_type: i32,
    pub fi_guardflags: u32,
}

/// `struct vinfo_stat`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct vinfo_stat {
    pub vst_dev: u32,
    pub vst_mode: u16,
    pub vst_nlink: u16,
    pub vst_ino: u64,
    pub vst_uid: u32,
    pub vst_gid: u32,
    pub vst_atime: i64,
    pub vst_atimensec: i64,
    pub vst_mtime: i64,
    pub vst_mtimensec: i64,
    pub vst_ctime: i64,
    pub vst_ctimensec: i64,
    pub vst_birthtime: i64,
    pub vst_birthtimensec: i64,
    pub vst_size: i64,
    pub vst_blocks: i64,
    pub vst_blksize: i32,
    pub vst_flags: u32,
    pub vst_gen: u32,
    pub vst_rdev: u32,
    pub vst_qspare: [i64; 2],
}

/// `struct vnode_info`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct vnode_info {
    pub vi_stat: vinfo_stat,
    pub vi_type: c_int,
    pub vi_pad: c_int,
    pub vi_fsid: [i32; 2],
}

/// `struct vnode_info_path`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct vnode_info_path {
    pub vip_vi: vnode_info,
    pub vip_path: [c_char; MAXPATHLEN],
}

/// `struct vnode_fdinfowithpath`, for `PROC_PIDFDVNODEPATHINFO`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct vnode_fdinfowithpath {
    pub pfi: proc_fileinfo,
    pub pvip: vnode_info_path,
}

/// `struct proc_vnodepathinfo`, for `PROC_PIDVNODEPATHINFO`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct proc_vnodepathinfo {
    pub pvi_cdir: vnode_info_path,
    pub pvi_rdir: vnode_info_path,
}

/// `struct sockbuf_info`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct sockbuf_info {
    pub sbi_cc: u32,
    pub sbi_hiwat: u32,
    pub sbi_mbcnt: u32,
    pub sbi_mbmax: u32,
    pub sbi_lowat: u32,
    pub sbi_flags: i16,
    pub sbi_timeo: i16,
}

/// `struct in4in6_addr`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct in4in6_addr {
    pub i46a_pad32: [u32; 3],
    pub i46a_addr4: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) union in_sockinfo_addr {
    pub ina_46: in4in6_addr,
    pub ina_6: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct in_sockinfo_v6 {
    pub in6_hlim: u8,
    pub in6_cksum: c_int,
    pub in6_ifindex: u16,
    pub in6_hops: i16,
}

/// `struct in_sockinfo`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct in_sockinfo {
    pub insi_fport: c_int,
    pub insi_lport: c_int,
    pub insi_gencnt: u64,
    pub insi_flags: u32,
    pub insi_flow: u32,
    pub insi_vflag: u8,
    pub insi_ip_ttl: u8,
    pub rfu_1: u32,
    pub insi_faddr: in_sockinfo_addr,
    pub insi_laddr: in_sockinfo_addr,
    pub insi_v4_tos: u8,
    pub insi_v6: in_sockinfo_v6,
}

/// `struct tcp_sockinfo`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct tcp_sockinfo {
    pub tcpsi_ini: in_sockinfo,
    pub tcpsi_state: c_int,
    pub tcpsi_timer: [c_int; 4],
    pub tcpsi_mss: c_int,
    pub tcpsi_flags: u32,
    pub rfu_1: u32,
    pub tcpsi_tp: u64,
}

/// `struct un_sockinfo`. Both addresses are `struct sockaddr_un`s, padded to `SOCK_MAXADDRLEN`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct un_sockinfo {
    pub unsi_conn_so: u64,
    pub unsi_conn_pcb: u64,
    pub unsi_addr: [u8; SOCK_MAXADDRLEN],
    pub unsi_caddr: [u8; SOCK_MAXADDRLEN],
}

/// The protocol-specific part of `struct socket_info`. Members we don't read are covered by the UNIX one, which is the
/// largest.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) union soi_proto {
    pub pri_in: in_sockinfo,
    pub pri_tcp: tcp_sockinfo,
    pub pri_un: un_sockinfo,
}

/// `struct socket_info`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct socket_info {
    pub soi_stat: vinfo_stat,
    pub soi_so: u64,
    pub soi_pcb: u64,
    pub soi_type: c_int,
    pub soi_protocol: c_int,
    pub soi_family: c_int,
    pub soi_options: i16,
    pub soi_linger: i16,
    pub soi_state: i16,
    pub soi_qlen: i16,
    pub soi_incqlen: i16,
    pub soi_qlimit: i16,
    pub soi_timeo: i16,
    pub soi_error: u16,
    pub soi_oobmark: u32,
    pub soi_rcv: sockbuf_info,
    pub soi_snd: sockbuf_info,
    pub soi_kind: c_int,
    pub rfu_1: u32,
    pub soi_proto: soi_proto,
}

/// `struct socket_fdinfo`, for `PROC_PIDFDSOCKETINFO`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct socket_fdinfo {
    pub pfi: proc_fileinfo,
    pub psi: socket_info,
}

/// `struct proc_threadinfo`, for `PROC_PIDTHREADINFO`. Times are in nanoseconds.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct proc_threadinfo {
    pub pth_user_time: u64,
    pub pth_system_time: u64,
    pub pth_cpu_usage: i32,
    pub pth_policy: i32,
    pub pth_run_state: i32,
    pub pth_flags: i32,
    pub pth_sleep_time: i32,
    pub pth_curpri: i32,
    pub pth_priority: i32,
    pub pth_maxpriority: i32,
    pub pth_name: [c_char; MAXTHREADNAMESIZE],
}

/// `struct rusage_info_v2`. Times are in Mach absolute time units.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct rusage_info_v2 {
    pub ri_uuid: [u8; 16],
    pub ri_user_time: u64,
    pub ri_system_time: u64,
    pub ri_pkg_idle_wkups: u64,
    pub ri_interrupt_wkups: u64,
    pub ri_pageins: u64,
    pub ri_wired_size: u64,
    pub ri_resident_size: u64,
    pub ri_phys_footprint: u64,
    pub ri_proc_start_abstime: u64,
    pub ri_proc_exit_abstime: u64,
    pub ri_child_user_time: u64,
    pub ri_child_system_time: u64,
    pub ri_child_pkg_idle_wkups: u64,
    pub ri_child_interrupt_wkups: u64,
    pub ri_child_pageins: u64,
    pub ri_child_elapsed_abstime: u64,
    pub ri_diskio_bytesread: u64,
    pub ri_diskio_byteswritten: u64,
}

/// `struct host_cpu_load_info`, in clock ticks.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct host_cpu_load_info {
    pub cpu_ticks: [u32; CPU_STATE_MAX],
}

/// `struct vm_statistics64`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct vm_statistics64 {
    pub free_count: u32,
    pub active_count: u32,
    pub inactive_count: u32,
    pub wire_count: u32,
    pub zero_fill_count: u64,
    pub reactivations: u64,
    pub pageins: u64,
    pub pageouts: u64,
    pub faults: u64,
    pub cow_faults: u64,
    pub lookups: u64,
    pub hits: u64,
    pub purges: u64,
    pub purgeable_count: u32,
    pub speculative_count: u32,
    pub decompressions: u64,
    pub compressions: u64,
    pub swapins: u64,
    pub swapouts: u64,
    pub compressor_page_count: u32,
    pub throttled_count: u32,
    pub external_page_count: u32,
    pub internal_page_count: u32,
    pub total_uncompressed_pages_in_compressor: u64,
}

/// `struct xsw_usage`, from `vm.swapusage`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct xsw_usage {
    pub xsu_total: u64,
    pub xsu_avail: u64,
    pub xsu_used: u64,
    pub xsu_pagesize: u32,
    pub xsu_encrypted: u32,
}

/// `struct if_data64`, declared under `#pragma pack(4)`.
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub(super) struct if_data64 {
    pub ifi_type: u8,
    pub ifi_typelen: u8,
    pub ifi_physical: u8,
    pub ifi_addrlen: u8,
    pub ifi_hdrlen: u8,
    pub ifi_recvquota: u8,
    pub ifi_xmitquota: u8,
    pub ifi_unused1: u8,
    pub ifi_mtu: u32,
    pub ifi_metric: u32,
    pub ifi_baudrate: u64,
    pub ifi_ipackets: u64,
    pub ifi_ierrors: u64,
    pub ifi_opackets: u64,
    pub ifi_oerrors: u64,
    pub ifi_collisions: u64,
    pub ifi_ibytes: u64,
    pub ifi_obytes: u64,
    pub ifi_imcasts: u64,
    pub ifi_omcasts: u64,
    pub ifi_iqdrops: u64,
    pub ifi_noproto: u64,
    pub ifi_recvtiming: u32,
    pub ifi_xmittiming: u32,
    pub ifi_lastchange: [i32; 2],
}

/// `struct if_msghdr2`, declared under `#pragma pack(4)`. A `struct sockaddr_dl` naming the interface follows it.
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
pub(super) struct if_msghdr2 {
    pub ifm_msglen: u16,
    pub ifm_version: u8,
    pub ifm_type: u8,
    pub ifm_addrs: c_int,
    pub ifm_flags: c_int,
    pub ifm_index: u16,
    pub ifm_snd_len: c_int,
    pub ifm_snd_maxlen: c_int,
    pub ifm_snd_drops: c_int,
    pub ifm_timer: c_int,
    pub ifm_data: if_data64,
}

/// `struct extern_proc`, the first half of a `KERN_PROC` record. Pointers to kernel objects are opaque.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct extern_proc {
    pub p_starttime: libc::timeval,
    pub p_vmspace: *mut c_void,
    pub p_sigacts: *mut c_void,
    pub p_flag: c_int,
    pub p_stat: c_char,
    pub p_pid: libc::pid_t,
    pub p_oppid: libc::pid_t,
    pub p_dupfd: c_int,
    pub user_stack: *mut c_char,
    pub exit_thread: *mut c_void,
    pub p_debugger: c_int,
    pub sigwait: c_int,
    pub p_estcpu: u32,
    pub p_cpticks: c_int,
    pub p_pctcpu: u32,
    pub p_wchan: *mut c_void,
    pub p_wmesg: *mut c_char,
    pub p_swtime: u32,
    pub p_slptime: u32,
    pub p_realtimer: [libc::timeval; 2],
    pub p_rtime: libc::timeval,
    pub p_uticks: u64,
    pub p_sticks: u64,
    pub p_iticks: u64,
    pub p_traceflag: c_int,
    pub p_tracep: *mut c_void,
    pub p_siglist: c_int,
    pub p_textvp: *mut c_void,
    pub p_holdcnt: c_int,
    pub p_sigmask: u32,
    pub p_sigignore: u32,
    pub p_sigcatch: u32,
    pub p_priority: u8,
    pub p_usrpri: u8,
    pub p_nice: c_char,
    pub p_comm: [c_char; MAXCOMLEN + 1],
    pub p_pgrp: *mut c_void,
    pub p_addr: *mut c_void,
    pub p_xstat: u16,
    pub p_acflag: u16,
    pub p_ru: *mut c_void,
}

/// `struct _pcred`
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct pcred {
    pub pc_lock: [c_char; 72],
    pub pc_ucred: *mut c_void,
    pub p_ruid: libc::uid_t,
    pub p_svuid: libc::uid_t,
    pub p_rgid: libc::gid_t,
    pub p_svgid: libc::gid_t,
    pub p_refcnt: c_int,
}

/// `struct _ucred`
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct ucred {
    pub cr_ref: i32,
    pub cr_uid: libc::uid_t,
    pub cr_ngroups: i16,
    pub cr_groups: [libc::gid_t; 16],
}

/// `struct vmspace`
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct vmspace {
    pub vm_refcnt: c_int,
    pub vm_shm: *mut c_char,
    pub vm_rssize: i32,
    pub vm_swrss: i32,
    pub vm_tsize: i32,
    pub vm_dsize: i32,
    pub vm_ssize: i32,
    pub vm_taddr: *mut c_char,
    pub vm_daddr: *mut c_char,
    pub vm_maxsaddr: *mut c_char,
}

/// `struct eproc`, the second half of a `KERN_PROC` record.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct eproc {
    pub e_paddr: *mut c_void,
    pub e_sess: *mut c_void,
    pub e_pcred: pcred,
    pub e_ucred: ucred,
    pub e_vm: vmspace,
    pub e_ppid: libc::pid_t,
    pub e_pgid: libc::pid_t,
    pub e_jobc: i16,
    pub e_tdev: i32,
    pub e_tpgid: libc::pid_t,
    pub e_tsess: *mut c_void,
    pub e_wmesg: [c_char; 8],
    pub e_xsize: i32,
    pub e_xrssize: i16,
    pub e_xccount: i16,
    pub e_xswrss: i16,
    pub e_flag: i32,
    pub e_login: [c_char; 12],
    pub e_spare: [i32; 4],
}

/// `struct kinfo_proc`, one record of `sysctl(KERN_PROC)`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct kinfo_proc {
    pub kp_proc: extern_proc,
    pub kp_eproc: eproc,
}

extern "C" {
    pub(super) fn proc_pidinfo(pid: c_int, flavor: c_int, arg: u64, buffer: *mut c_void, buffersize: c_int) -> c_int;

    pub(super) fn proc_pidfdinfo(pid: c_int, fd: c_int, flavor: c_int, buffer: *mut c_void, buffersize: c_int)
        -> c_int;

    pub(super) fn proc_pidpath(pid: c_int, buffer: *mut c_void, buffersize: u32) -> c_int;

    pub(super) fn proc_name(pid: c_int, buffer: *mut c_void, buffersize: u32) -> c_int;

    pub(super) fn proc_pid_rusage(pid: c_int, flavor: c_int, buffer: *mut c_void) -> c_int;

    pub(super) fn mach_host_self() -> mach_port_t;

    pub(super) fn host_statistics(host: mach_port_t, flavor: c_int, info: *mut c_int, count: *mut u32) -> kern_return_t;

    pub(super) fn host_statistics64(host: mach_port_t, flavor: c_int, info: *mut c_int, count: *mut u32)
        -> kern_return_t;

    pub(super) fn host_processor_info(
        host: mach_port_t, flavor: c_int, processor_count: *mut u32, info: *mut *mut c_int, info_count: *mut u32,
    ) -> kern_return_t;
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn layouts_match_the_sdk() {
        assert_eq!(size_of::<extern_proc>(), 296);
        assert_eq!(size_of::<eproc>(), 352);
        assert_eq!(size_of::<kinfo_proc>(), 648);
        assert_eq!(size_of::<proc_bsdinfo>(), 136);
        assert_eq!(size_of::<proc_taskinfo>(), 96);
        assert_eq!(size_of::<proc_fdinfo>(), 8);
        assert_eq!(size_of::<proc_fileinfo>(), 24);
        assert_eq!(size_of::<vinfo_stat>(), 136);
        assert_eq!(size_of::<vnode_fdinfowithpath>(), 1200);
        assert_eq!(size_of::<proc_vnodepathinfo>(), 2352);
        assert_eq!(size_of::<in_sockinfo>(), 80);
        assert_eq!(size_of::<tcp_sockinfo>(), 120);
        assert_eq!(size_of::<socket_fdinfo>(), 792);
        assert_eq!(size_of::<proc_threadinfo>(), 112);
        assert_eq!(size_of::<rusage_info_v2>(), 160);
        assert_eq!(size_of::<vm_statistics64>(), 152);
        assert_eq!(size_of::<if_data64>(), 128);
        assert_eq!(size_of::<if_msghdr2>(), 160);
    }
}
