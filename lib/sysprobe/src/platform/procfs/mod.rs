//! Readers and parsers for procfs.
//!
//! Linux and Cygwin expose most of what we need as text under `/proc`. Reading goes through [`Procfs`], which knows the
//! configured mount point; parsing is done by plain functions over `&str` so that it can be tested against fixtures.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    types::Pid,
};

pub(crate) mod disk;
pub(crate) mod net;
pub(crate) mod pid;
pub(crate) mod system;

/// A procfs mount.
#[derive(Clone, Debug)]
pub(crate) struct Procfs {
    root: PathBuf,
}

impl Procfs {
    pub(crate) fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn path<P: AsRef<Path>>(&self, relative: P) -> PathBuf {
        self.root.join(relative)
    }

    pub(crate) fn pid_dir(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string())
    }

    pub(crate) fn pid_path(&self, pid: Pid, name: &str) -> PathBuf {
        self.pid_dir(pid).join(name)
    }

    /// Reads a system-wide file, such as `stat` or `meminfo`.
    pub(crate) fn read<P: AsRef<Path>>(&self, relative: P) -> Result<String> {
        read_text(&self.path(relative))
    }

    /// Reads a file under `/proc/<pid>`.
    ///
    /// Errors are returned unclassified; callers run them through [`ClassifyExt`][crate::classify::ClassifyExt].
    pub(crate) fn read_pid(&self, pid: Pid, name: &str) -> Result<String> {
        read_text(&self.pid_path(pid, name))
    }

    /// Reads a binary (NUL separated) file under `/proc/<pid>`.
    pub(crate) fn read_pid_bytes(&self, pid: Pid, name: &str) -> Result<Vec<u8>> {
        let path = self.pid_path(pid, name);
        fs::read(&path).map_err(|source| io_error("read", &path, source))
    }

    /// Resolves a symlink under `/proc/<pid>`, such as `exe` or `cwd`.
    pub(crate) fn read_pid_link(&self, pid: Pid, name: &str) -> Result<PathBuf> {
        let path = self.pid_path(pid, name);
        fs::read_link(&path).map_err(|source| io_error("readlink", &path, source))
    }

    /// PIDs of every process, from the numeric directory names.
    pub(crate) fn pids(&self) -> Result<Vec<Pid>> {
        let entries = fs::read_dir(&self.root).map_err(|source| io_error("opendir", &self.root, source))?;
        let mut pids = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse::<Pid>().ok()))
            .collect::<Vec<_>>();
        pids.sort_unstable();
        Ok(pids)
    }
}

pub(crate) fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| io_error("read", path, source))
}

pub(crate) fn io_error(syscall: &str, path: &Path, source: io::Error) -> Error {
    Error::Os {
        syscall: format!("{}({})", syscall, path.display()),
        source,
    }
}

/// Returns the remainder of `line` after skipping `n` whitespace separated fields, with leading whitespace trimmed.
///
/// Used for trailing fields, such as paths, that may themselves contain spaces.
pub(crate) fn skip_fields(line: &str, n: usize) -> &str {
    let mut rest = line.trim_start();
    for _ in 0..n {
        match rest.find(char::is_whitespace) {
            Some(end) => rest = rest[end..].trim_start(),
            None => return "",
        }
    }
    rest
}

/// Parses a `Key: value [kB]` line into the key and the value in bytes (or as-is, without a unit).
pub(crate) fn parse_kv_amount(line: &str) -> Option<(&str, u64)> {
    let (key, rest) = line.split_once(':')?;
    let mut parts = rest.split_whitespace();
    let value = parts.next()?.parse::<u64>().ok()?;
    let multiplier = match parts.next() {
        Some("kB") => 1024,
        _ => 1,
    };
    Some((key.trim(), value * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_skipping() {
        assert_eq!(skip_fields("a b  c d e  /path with spaces", 5), "/path with spaces");
        assert_eq!(skip_fields("a b", 5), "");
        assert_eq!(skip_fields("  a b", 1), "b");
    }

    #[test]
    fn kv_amounts() {
        assert_eq!(parse_kv_amount("MemTotal:       16318764 kB"), Some(("MemTotal", 16318764 * 1024)));
        assert_eq!(parse_kv_amount("HugePages_Total:       0"), Some(("HugePages_Total", 0)));
        assert_eq!(parse_kv_amount("garbage"), None);
    }

    #[test]
    fn pids_from_fixture_root() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1", "42", "self", "net", "7"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let procfs = Procfs::new(dir.path());
        assert_eq!(procfs.pids().unwrap(), vec![1, 7, 42]);
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let procfs = Procfs::new(dir.path());
        let err = procfs.read("meminfo").unwrap_err();
        assert!(err.to_string().contains("meminfo"));
    }
}
