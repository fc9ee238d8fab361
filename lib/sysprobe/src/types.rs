//! Plain-data records returned by queries.
//!
//! Fields that only some platforms can fill are `Option`s. Times are in seconds, sizes in bytes, and frequencies in MHz
//! unless noted otherwise.

use std::{collections::BTreeMap, fmt, net::SocketAddr};

use serde::Serialize;

use crate::filter::{AddressFamilies, SocketTypes};

/// Process identifier.
pub type Pid = i32;

/// System-wide (or per-CPU) CPU time, by category.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CpuTimes {
    pub user: f64,
    pub system: f64,
    pub idle: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nice: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iowait: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub irq: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub softirq: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_nice: Option<f64>,
    /// Time servicing hardware interrupts (Windows, BSD).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<f64>,
    /// Time servicing deferred procedure calls (Windows).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpc: Option<f64>,
}

/// Cumulative CPU event counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    pub ctx_switches: u64,
    pub interrupts: u64,
    pub soft_interrupts: u64,
    pub syscalls: u64,
}

/// CPU frequency, in MHz. `min` and `max` are zero when unknown.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CpuFreq {
    pub current: f64,
    pub min: f64,
    pub max: f64,
}

/// 1, 5 and 15 minute load averages.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoadAvg {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// System memory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VirtualMemory {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub free: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactive: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffers: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slab: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wired: Option<u64>,
}

impl VirtualMemory {
    /// Percentage of memory in use, from `total` and `available`.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.total.saturating_sub(self.available)) as f64 / self.total as f64 * 100.0
    }
}

/// Swap memory. `sin` and `sout` are cumulative bytes swapped in and out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SwapMemory {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub sin: u64,
    pub sout: u64,
}

/// A mounted filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    /// Comma separated mount options, always including exactly one of `ro` and `rw`.
    pub opts: String,
}

/// Filesystem usage, as seen by an unprivileged user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Cumulative per-disk I/O counters. Times are in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiskIoCounters {
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_time: u64,
    pub write_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_time: Option<u64>,
}

/// Cumulative per-interface network counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetIoCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    pub dropin: u64,
    pub dropout: u64,
}

/// Address family of a NIC address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NicFamily {
    Inet,
    Inet6,
    /// Link-layer (MAC) address.
    Link,
}

/// An address assigned to a NIC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NicAddress {
    pub family: NicFamily,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,
    /// Destination address of a point-to-point link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptp: Option<String>,
}

/// NIC duplex mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Duplex {
    Full,
    Half,
    #[default]
    Unknown,
}

/// NIC status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NicStats {
    pub is_up: bool,
    pub duplex: Duplex,
    /// Link speed in Mbit/s, zero when unknown.
    pub speed: u64,
    pub mtu: u64,
    /// Comma separated interface flags, such as `up,broadcast,running,multicast`.
    pub flags: String,
}

/// Address of one end of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Address {
    Inet(SocketAddr),
    Unix(String),
}

/// TCP connection state. UDP and UNIX sockets, and platforms that don't report state, use `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    DeleteTcb,
    Bound,
    Idle,
    None,
}

impl ConnectionStatus {
    /// Maps a BSD-style TCP state number (`TCPS_*`, shared by FreeBSD, NetBSD, OpenBSD and macOS).
    pub fn from_bsd_tcp_state(state: i32) -> Self {
        match state {
            0 => Self::Close,
            1 => Self::Listen,
            2 => Self::SynSent,
            3 => Self::SynRecv,
            4 => Self::Established,
            5 => Self::CloseWait,
            6 => Self::FinWait1,
            7 => Self::Closing,
            8 => Self::LastAck,
            9 => Self::FinWait2,
            10 => Self::TimeWait,
            _ => Self::None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Established => "ESTABLISHED",
            Self::SynSent => "SYN_SENT",
            Self::SynRecv => "SYN_RECV",
            Self::FinWait1 => "FIN_WAIT1",
            Self::FinWait2 => "FIN_WAIT2",
            Self::TimeWait => "TIME_WAIT",
            Self::Close => "CLOSE",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::Listen => "LISTEN",
            Self::Closing => "CLOSING",
            Self::DeleteTcb => "DELETE_TCB",
            Self::Bound => "BOUND",
            Self::Idle => "IDLE",
            Self::None => "NONE",
        };
        f.write_str(name)
    }
}

/// A socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Connection {
    /// File descriptor, or -1 where the platform can't tell.
    pub fd: i32,
    #[serde(serialize_with = "serialize_family")]
    pub family: AddressFamilies,
    #[serde(serialize_with = "serialize_kind")]
    pub kind: SocketTypes,
    pub local: Option<Address>,
    pub remote: Option<Address>,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
}

fn serialize_family<S: serde::Serializer>(family: &AddressFamilies, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&family.to_string())
}

fn serialize_kind<S: serde::Serializer>(kind: &SocketTypes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&kind.to_string())
}

/// A logged-in user session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct User {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Session start, as seconds since the Unix epoch.
    pub started: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
}

/// Remaining battery time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryTime {
    /// Can't be estimated right now.
    Unknown,
    /// Running on AC power.
    Unlimited,
    Seconds(u64),
}

/// Battery status.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Battery {
    pub percent: f64,
    pub secs_left: BatteryTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_plugged: Option<bool>,
}

/// A temperature reading, in degrees Celsius.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Temperature {
    pub label: String,
    pub current: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical: Option<f64>,
}

/// Temperature readings, keyed by sensor name.
pub type Temperatures = BTreeMap<String, Vec<Temperature>>;

/// CPU time consumed by a process.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProcessCpuTimes {
    pub user: f64,
    pub system: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children_user: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children_system: Option<f64>,
}

/// Basic process memory counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessMemory {
    pub rss: u64,
    pub vms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_faults: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_rss: Option<u64>,
}

/// Process memory split by how it's shared.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryFootprint {
    pub rss: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pss: Option<u64>,
    pub uss: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<u64>,
}

/// Real, effective and saved user or group IDs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessIds {
    pub real: u32,
    pub effective: u32,
    pub saved: u32,
}

/// Scheduler state of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    TracingStop,
    Zombie,
    Dead,
    WakeKill,
    Waking,
    Idle,
    Locked,
    Waiting,
    Suspended,
    Parked,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::DiskSleep => "disk-sleep",
            Self::Stopped => "stopped",
            Self::TracingStop => "tracing-stop",
            Self::Zombie => "zombie",
            Self::Dead => "dead",
            Self::WakeKill => "wake-kill",
            Self::Waking => "waking",
            Self::Idle => "idle",
            Self::Locked => "locked",
            Self::Waiting => "waiting",
            Self::Suspended => "suspended",
            Self::Parked => "parked",
        };
        f.write_str(name)
    }
}

/// CPU time consumed by one thread.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThreadTimes {
    pub id: u64,
    pub user: f64,
    pub system: f64,
}

/// Cumulative process I/O counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IoCounters {
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Context switch counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CtxSwitches {
    pub voluntary: u64,
    pub involuntary: u64,
}

/// A regular file held open by a process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OpenFile {
    pub path: String,
    /// File descriptor, or -1 where the platform can't tell.
    pub fd: i32,
}

/// One memory mapping, with resident memory broken down.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryMap {
    pub address: String,
    pub perms: String,
    /// Mapped file, or a pseudo-path such as `[heap]` or `[anon]`.
    pub path: String,
    pub size: u64,
    pub rss: u64,
    pub pss: u64,
    pub shared_clean: u64,
    pub shared_dirty: u64,
    pub private_clean: u64,
    pub private_dirty: u64,
    pub referenced: u64,
    pub anonymous: u64,
    pub swap: u64,
}

/// A resource limit. `None` means unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResourceLimit {
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

/// Signals that can be sent through [`Platform::proc_send_signal`][crate::Platform::proc_send_signal].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Signal {
    /// Polite termination request (`SIGTERM`; `TerminateProcess` on Windows).
    Terminate,
    /// Forced termination (`SIGKILL`; `TerminateProcess` on Windows).
    Kill,
    /// Interrupt (`SIGINT`).
    Interrupt,
    /// Hangup (`SIGHUP`).
    Hangup,
    /// Stop (`SIGSTOP`).
    Stop,
    /// Continue (`SIGCONT`).
    Continue,
    /// User defined (`SIGUSR1`).
    User1,
    /// User defined (`SIGUSR2`).
    User2,
}

/// Resource limits that can be read through [`Platform::proc_rlimit`][crate::Platform::proc_rlimit].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Resource {
    AddressSpace,
    CoreFileSize,
    CpuTime,
    DataSize,
    FileSize,
    Locks,
    LockedMemory,
    MessageQueue,
    Nice,
    OpenFiles,
    Processes,
    ResidentSet,
    RealtimePriority,
    RealtimeTime,
    PendingSignals,
    StackSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_percent() {
        let mem = VirtualMemory {
            total: 200,
            available: 50,
            ..Default::default()
        };
        assert_eq!(mem.percent(), 75.0);
        assert_eq!(VirtualMemory::default().percent(), 0.0);
    }

    #[test]
    fn bsd_tcp_states() {
        assert_eq!(ConnectionStatus::from_bsd_tcp_state(1), ConnectionStatus::Listen);
        assert_eq!(ConnectionStatus::from_bsd_tcp_state(4), ConnectionStatus::Established);
        assert_eq!(ConnectionStatus::from_bsd_tcp_state(10), ConnectionStatus::TimeWait);
        assert_eq!(ConnectionStatus::from_bsd_tcp_state(42), ConnectionStatus::None);
    }

    #[test]
    fn users_differ_by_session_start() {
        let user = User {
            name: "root".to_string(),
            terminal: Some("pts/0".to_string()),
            host: None,
            started: 1_700_000_000.5,
            pid: Some(42),
        };
        let later = User {
            started: 1_700_000_100.0,
            ..user.clone()
        };
        assert_eq!(user, user.clone());
        assert_ne!(user, later);
    }

    #[test]
    fn status_names_match_serialization() {
        assert_eq!(ProcessStatus::DiskSleep.to_string(), "disk-sleep");
        assert_eq!(ConnectionStatus::FinWait1.to_string(), "FIN_WAIT1");
    }
}
