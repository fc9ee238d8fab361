use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use sysprobe::{ConnectionFilter, Pid, Resource};
use tracing::level_filters::LevelFilter;

#[cfg(windows)]
const DEFAULT_USAGE_PATH: &str = "C:\\";
#[cfg(not(windows))]
const DEFAULT_USAGE_PATH: &str = "/";

/// Query process and system information, printing the result as JSON.
#[derive(Parser)]
#[command(about, name = "sysprobe")]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Path to a YAML configuration file.
    ///
    /// Settings can also be given as `SYSPROBE_`-prefixed environment variables, which take precedence.
    #[arg(global = true, short = 'c', long = "config")]
    pub config_file: Option<PathBuf>,

    /// Query to run.
    #[arg(value_enum)]
    pub query: Query,

    /// Process to query. Defaults to this process.
    #[arg(long)]
    pub pid: Option<Pid>,

    /// Which sockets to list, for connection queries.
    #[arg(long, default_value = "inet")]
    pub kind: ConnectionFilter,

    /// Path to report usage for, for `disk-usage`.
    #[arg(long, default_value = DEFAULT_USAGE_PATH)]
    pub path: PathBuf,

    /// Include pseudo, memory and duplicate filesystems, for `disk-partitions`.
    #[arg(long)]
    pub all: bool,

    /// Limit to read, for `proc-rlimit`.
    #[arg(long, value_enum, default_value = "open-files")]
    pub resource: ResourceArg,

    /// Pretty-print the output.
    #[arg(long)]
    pub pretty: bool,
}

impl Cli {
    /// Gets the log level override implied by the user-supplied verbosity, if any.
    pub fn log_level(&self) -> Option<LevelFilter> {
        match self.verbose {
            0 => None,
            1 => Some(LevelFilter::DEBUG),
            _ => Some(LevelFilter::TRACE),
        }
    }

    /// The PID to run process queries against.
    pub fn target_pid(&self) -> Pid {
        self.pid.unwrap_or(std::process::id() as Pid)
    }
}

/// Queries the CLI can run.
///
/// Only read-only operations are exposed: changing priorities, affinities or sending signals is left to callers of
/// the library.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Query {
    BootTime,
    CpuTimes,
    PerCpuTimes,
    CpuCountLogical,
    CpuCountCores,
    CpuStats,
    CpuFreq,
    LoadAvg,
    VirtualMemory,
    SwapMemory,
    DiskPartitions,
    DiskUsage,
    DiskIoCounters,
    NetIoCounters,
    NetIfAddrs,
    NetIfStats,
    NetConnections,
    Users,
    Pids,
    PidExists,
    SensorsBattery,
    SensorsTemperatures,
    ProcName,
    ProcExe,
    ProcCmdline,
    ProcEnviron,
    ProcCwd,
    ProcPpid,
    ProcStatus,
    ProcUids,
    ProcGids,
    ProcTerminal,
    ProcCreateTime,
    ProcCpuTimes,
    ProcMemoryInfo,
    ProcMemoryFullInfo,
    ProcMemoryMaps,
    ProcNumThreads,
    ProcThreads,
    ProcNumCtxSwitches,
    ProcIoCounters,
    ProcOpenFiles,
    ProcNumFds,
    ProcConnections,
    ProcNice,
    ProcCpuAffinity,
    ProcRlimit,
    ProcIsZombie,
}

/// Command-line names for [`Resource`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResourceArg {
    As,
    Core,
    Cpu,
    Data,
    Fsize,
    Locks,
    Memlock,
    Msgqueue,
    Nice,
    OpenFiles,
    Nproc,
    Rss,
    Rtprio,
    Rttime,
    Sigpending,
    Stack,
}

impl From<ResourceArg> for Resource {
    fn from(arg: ResourceArg) -> Self {
        match arg {
            ResourceArg::As => Resource::AddressSpace,
            ResourceArg::Core => Resource::CoreFileSize,
            ResourceArg::Cpu => Resource::CpuTime,
            ResourceArg::Data => Resource::DataSize,
            ResourceArg::Fsize => Resource::FileSize,
            ResourceArg::Locks => Resource::Locks,
            ResourceArg::Memlock => Resource::LockedMemory,
            ResourceArg::Msgqueue => Resource::MessageQueue,
            ResourceArg::Nice => Resource::Nice,
            ResourceArg::OpenFiles => Resource::OpenFiles,
            ResourceArg::Nproc => Resource::Processes,
            ResourceArg::Rss => Resource::ResidentSet,
            ResourceArg::Rtprio => Resource::RealtimePriority,
            ResourceArg::Rttime => Resource::RealtimeTime,
            ResourceArg::Sigpending => Resource::PendingSignals,
            ResourceArg::Stack => Resource::StackSize,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn process_query_with_options() {
        let cli = Cli::try_parse_from(["sysprobe", "proc-connections", "--pid", "42", "--kind", "tcp6", "-vv"]).unwrap();
        assert_eq!(cli.query, Query::ProcConnections);
        assert_eq!(cli.target_pid(), 42);
        assert_eq!(cli.kind, "tcp6".parse::<ConnectionFilter>().unwrap());
        assert_eq!(cli.log_level(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["sysprobe", "net-connections"]).unwrap();
        assert_eq!(cli.kind, ConnectionFilter::inet());
        assert_eq!(cli.target_pid(), std::process::id() as Pid);
        assert_eq!(Resource::from(cli.resource), Resource::OpenFiles);
        assert_eq!(cli.log_level(), None);
    }

    #[test]
    fn bad_kind_rejected() {
        assert!(Cli::try_parse_from(["sysprobe", "net-connections", "--kind", "sctp"]).is_err());
    }
}
