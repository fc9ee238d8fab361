use serde::Serialize;
use serde_json::Value;
use snafu::{ResultExt as _, Snafu};
use sysprobe::{ErrorKind, Platform, Probe};
use tracing::debug;

use crate::config::{Cli, Query};

/// A query failure.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum QueryError {
    /// The probe couldn't answer.
    #[snafu(display("{} failed: {}", query, source))]
    Failed { query: String, source: sysprobe::Error },

    /// The answer couldn't be rendered as JSON.
    #[snafu(display("Failed to serialize {} result.", query))]
    Render { query: String, source: serde_json::Error },
}

impl QueryError {
    /// Process exit code for this failure.
    ///
    /// Each error kind gets its own code so scripts can tell a vanished process from a permission boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Failed { source, .. } => match source.kind() {
                ErrorKind::NotFound => 3,
                ErrorKind::PermissionDenied => 4,
                ErrorKind::ZombieProcess => 5,
                ErrorKind::Unsupported => 6,
                ErrorKind::OutOfMemory => 7,
                ErrorKind::TransientOsError => 8,
            },
            Self::Render { .. } => 1,
        }
    }
}

fn render<T: Serialize>(query: Query, result: sysprobe::Result<T>) -> Result<Value, QueryError> {
    let name = format!("{:?}", query);
    let value = result.context(Failed { query: name.clone() })?;
    serde_json::to_value(value).context(Render { query: name })
}

/// Runs the query named on the command line.
pub fn run(probe: &Probe, cli: &Cli) -> Result<Value, QueryError> {
    let pid = cli.target_pid();
    let query = cli.query;
    debug!(?query, pid, "Running query.");

    match query {
        Query::BootTime => render(query, probe.boot_time()),
        Query::CpuTimes => render(query, probe.cpu_times()),
        Query::PerCpuTimes => render(query, probe.per_cpu_times()),
        Query::CpuCountLogical => render(query, probe.cpu_count_logical()),
        Query::CpuCountCores => render(query, probe.cpu_count_cores()),
        Query::CpuStats => render(query, probe.cpu_stats()),
        Query::CpuFreq => render(query, probe.cpu_freq()),
        Query::LoadAvg => render(query, probe.load_avg()),
        Query::VirtualMemory => render(query, probe.virtual_memory()),
        Query::SwapMemory => render(query, probe.swap_memory()),
        Query::DiskPartitions => render(query, probe.disk_partitions(cli.all)),
        Query::DiskUsage => render(query, probe.disk_usage(&cli.path)),
        Query::DiskIoCounters => render(query, probe.disk_io_counters()),
        Query::NetIoCounters => render(query, probe.net_io_counters()),
        Query::NetIfAddrs => render(query, probe.net_if_addrs()),
        Query::NetIfStats => render(query, probe.net_if_stats()),
        Query::NetConnections => render(query, probe.net_connections(cli.kind)),
        Query::Users => render(query, probe.users()),
        Query::Pids => render(query, probe.pids()),
        Query::PidExists => render(query, probe.pid_exists(pid)),
        Query::SensorsBattery => render(query, probe.sensors_battery()),
        Query::SensorsTemperatures => render(query, probe.sensors_temperatures()),
        Query::ProcName => render(query, probe.proc_name(pid)),
        Query::ProcExe => render(query, probe.proc_exe(pid)),
        Query::ProcCmdline => render(query, probe.proc_cmdline(pid)),
        Query::ProcEnviron => render(query, probe.proc_environ(pid)),
        Query::ProcCwd => render(query, probe.proc_cwd(pid)),
        Query::ProcPpid => render(query, probe.proc_ppid(pid)),
        Query::ProcStatus => render(query, probe.proc_status(pid)),
        Query::ProcUids => render(query, probe.proc_uids(pid)),
        Query::ProcGids => render(query, probe.proc_gids(pid)),
        Query::ProcTerminal => render(query, probe.proc_terminal(pid)),
        Query::ProcCreateTime => render(query, probe.proc_create_time(pid)),
        Query::ProcCpuTimes => render(query, probe.proc_cpu_times(pid)),
        Query::ProcMemoryInfo => render(query, probe.proc_memory_info(pid)),
        Query::ProcMemoryFullInfo => render(query, probe.proc_memory_full_info(pid)),
        Query::ProcMemoryMaps => render(query, probe.proc_memory_maps(pid)),
        Query::ProcNumThreads => render(query, probe.proc_num_threads(pid)),
        Query::ProcThreads => render(query, probe.proc_threads(pid)),
        Query::ProcNumCtxSwitches => render(query, probe.proc_num_ctx_switches(pid)),
        Query::ProcIoCounters => render(query, probe.proc_io_counters(pid)),
        Query::ProcOpenFiles => render(query, probe.proc_open_files(pid)),
        Query::ProcNumFds => render(query, probe.proc_num_fds(pid)),
        Query::ProcConnections => render(query, probe.proc_connections(pid, cli.kind)),
        Query::ProcNice => render(query, probe.proc_nice(pid)),
        Query::ProcCpuAffinity => render(query, probe.proc_cpu_affinity(pid)),
        Query::ProcRlimit => render(query, probe.proc_rlimit(pid, cli.resource.into())),
        Query::ProcIsZombie => render(query, probe.proc_is_zombie(pid)),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;
    use sysprobe::BindingContext;

    use super::*;

    fn probe() -> Probe {
        Probe::new(BindingContext::builder().testing(true).build())
    }

    #[test]
    fn pid_exists_for_self() {
        let cli = Cli::try_parse_from(["sysprobe", "pid-exists"]).unwrap();
        assert_eq!(run(&probe(), &cli).unwrap(), Value::Bool(true));
    }

    #[test]
    fn missing_process_maps_to_not_found_code() {
        let cli = Cli::try_parse_from(["sysprobe", "proc-ppid", "--pid", "99999996"]).unwrap();
        let error = run(&probe(), &cli).unwrap_err();
        assert!(error.to_string().starts_with("ProcPpid failed"), "{}", error);
        assert_eq!(error.exit_code(), 3);
    }
}
