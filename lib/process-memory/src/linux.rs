use std::{
    fs::{self, File},
    io::{self, Read},
    mem::MaybeUninit,
    path::{Path, PathBuf},
};

use crate::{Footprint, Target};

const DEFAULT_PROCFS_ROOT: &str = "/proc";

enum StatSource {
    SmapsRollup(Scanner<File>),
    Smaps(Scanner<File>),
    Statm,
}

struct ProcPaths {
    smaps_rollup: PathBuf,
    smaps: PathBuf,
    statm: PathBuf,
}

impl ProcPaths {
    fn new(procfs_root: &Path, target: Target) -> Self {
        let base = match target {
            Target::Current => procfs_root.join("self"),
            Target::Pid(pid) => procfs_root.join(pid.to_string()),
        };

        Self {
            smaps_rollup: base.join("smaps_rollup"),
            smaps: base.join("smaps"),
            statm: base.join("statm"),
        }
    }
}

/// A memory usage querier.
///
/// Depending on what the running kernel exposes, one of three procfs files is read:
///
/// - `smaps_rollup`: pre-aggregated totals (Linux 4.14+), the cheapest way to get a full footprint.
/// - `smaps`: per-mapping detail (Linux 2.6.14+), which we aggregate ourselves.
/// - `statm`: lazily-updated page counts (Linux 2.6+). Only the resident set size is available from it.
pub struct Querier {
    source: StatSource,
    paths: ProcPaths,
    page_size: usize,
}

impl Querier {
    /// Creates a querier for the given target, reading from `/proc`.
    pub fn new(target: Target) -> Self {
        Self::with_procfs_root(target, DEFAULT_PROCFS_ROOT)
    }

    /// Creates a querier for the given target, reading from an alternative procfs mount.
    ///
    /// This is useful when the host's procfs is mapped into a container at a different path, such as `/host/proc`.
    pub fn with_procfs_root<P: AsRef<Path>>(target: Target, procfs_root: P) -> Self {
        let paths = ProcPaths::new(procfs_root.as_ref(), target);
        Self {
            source: determine_stat_source(&paths),
            paths,
            page_size: page_size(),
        }
    }

    /// Gets the resident set size of the target process, in bytes.
    ///
    /// If the resident set size cannot be determined, `None` is returned. For the current process this should be
    /// considered an incredibly rare event; for other processes it usually means the process has exited.
    pub fn resident_set_size(&mut self) -> Option<usize> {
        self.footprint().ok().map(|footprint| footprint.rss as usize)
    }

    /// Gets the full memory footprint of the target process.
    ///
    /// # Errors
    ///
    /// If the underlying procfs file cannot be opened or read, the I/O error is returned as-is, so that callers can
    /// distinguish a vanished process (`NotFound`) from a permission boundary (`PermissionDenied`).
    pub fn footprint(&mut self) -> io::Result<Footprint> {
        match &mut self.source {
            StatSource::SmapsRollup(scanner) => {
                // smaps_rollup holds a single pre-aggregated block, so summing it is the same as reading it.
                scanner.reset_with_path(&self.paths.smaps_rollup)?;
                scan_totals(scanner)
            }
            StatSource::Smaps(scanner) => {
                // One block per mapping: every field we care about is repeated per mapping and must be summed.
                scanner.reset_with_path(&self.paths.smaps)?;
                scan_totals(scanner)
            }
            StatSource::Statm => {
                // statm is a single line of space-delimited page counts. Seven integer fields of at most 20 bytes,
                // plus separators, fits comfortably in 256 bytes.
                let mut buf = [0; 256];
                let mut file = File::open(&self.paths.statm)?;
                let n = file.read(&mut buf)?;
                if n == 0 || n == buf.len() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected statm length"));
                }

                // Resident set size is the second field.
                let rss_pages = buf[..n]
                    .split(|b| *b == b' ')
                    .nth(1)
                    .and_then(|raw| std::str::from_utf8(raw).ok())
                    .and_then(|raw| raw.trim().parse::<u64>().ok())
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed statm"))?;

                Ok(Footprint {
                    rss: rss_pages * self.page_size as u64,
                    pss: None,
                    uss: None,
                    swap: None,
                })
            }
        }
    }
}

impl Default for Querier {
    fn default() -> Self {
        Self::new(Target::Current)
    }
}

fn determine_stat_source(paths: &ProcPaths) -> StatSource {
    if fs::metadata(&paths.smaps_rollup).is_ok() {
        StatSource::SmapsRollup(Scanner::new())
    } else if fs::metadata(&paths.smaps).is_ok() {
        StatSource::Smaps(Scanner::new())
    } else {
        StatSource::Statm
    }
}

fn page_size() -> usize {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        0
    } else {
        page_size as usize
    }
}

/// Running totals over the fields of one or more smaps blocks.
#[derive(Default)]
struct SmapsTotals {
    rss: u64,
    pss: u64,
    private_clean: u64,
    private_dirty: u64,
    swap: u64,
    saw_rss: bool,
}

impl SmapsTotals {
    fn observe(&mut self, line: &[u8]) {
        let Some((key, value)) = split_field(line) else {
            return;
        };

        let slot = match key {
            b"Rss" => {
                self.saw_rss = true;
                &mut self.rss
            }
            b"Pss" => &mut self.pss,
            b"Private_Clean" => &mut self.private_clean,
            b"Private_Dirty" => &mut self.private_dirty,
            b"Swap" => &mut self.swap,
            _ => return,
        };

        if let Some(bytes) = parse_kb_value_as_bytes(value) {
            *slot += bytes;
        }
    }

    fn into_footprint(self) -> io::Result<Footprint> {
        if !self.saw_rss {
            // An empty smaps file is what kernel threads, and processes that exited mid-read, look like.
            return Err(io::Error::new(io::ErrorKind::InvalidData, "no Rss entries in smaps"));
        }

        Ok(Footprint {
            rss: self.rss,
            pss: Some(self.pss),
            uss: Some(self.private_clean + self.private_dirty),
            swap: Some(self.swap),
        })
    }
}

fn scan_totals(scanner: &mut Scanner<File>) -> io::Result<Footprint> {
    let mut totals = SmapsTotals::default();
    while let Some(line) = scanner.next_line()? {
        totals.observe(line);
    }
    totals.into_footprint()
}

/// Splits a `Key:   value kB` line into its key and the remainder starting at the first digit.
fn split_field(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon_idx = line.iter().position(|&b| b == b':')?;
    let (key, rest) = line.split_at(colon_idx);
    let value_idx = rest.iter().position(|b| b.is_ascii_digit())?;
    Some((key, &rest[value_idx..]))
}

fn parse_kb_value_as_bytes(raw_value: &[u8]) -> Option<u64> {
    // The raw value is in the form of `XXXXXX kB`, so take everything up to the first whitespace character.
    let end = raw_value
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(raw_value.len());
    std::str::from_utf8(&raw_value[..end])
        .ok()?
        .parse::<u64>()
        .ok()
        .map(|value| value * 1024)
}

struct Scanner<T> {
    io: Option<T>,
    eof: bool,
    buf: Vec<u8>,
    pending_consume: Option<usize>,
}

impl<T> Scanner<T>
where
    T: Read,
{
    fn new() -> Self {
        Self {
            io: None,
            eof: false,
            buf: Vec::with_capacity(8192),
            pending_consume: None,
        }
    }

    fn reset(&mut self, io: T) {
        self.buf.clear();
        self.eof = false;
        self.pending_consume = None;
        self.io = Some(io);
    }

    fn get_io_mut(&mut self) -> io::Result<&mut T> {
        match self.io.as_mut() {
            Some(io) => Ok(io),
            None => Err(io::Error::new(io::ErrorKind::Other, "no file set in scanner")),
        }
    }

    fn fill_buf(&mut self) -> io::Result<()> {
        if self.eof || self.buf.len() == self.buf.capacity() {
            return Ok(());
        }

        // SAFETY: There's no invalid bit patterns for `u8`.
        let read_buf = unsafe { &mut *(self.buf.spare_capacity_mut() as *mut [MaybeUninit<u8>] as *mut [u8]) };
        let n = self.get_io_mut()?.read(read_buf)?;
        if n == 0 {
            self.eof = true;
        }

        // SAFETY: We've just read `n` bytes into the spare capacity, so incrementing our length by `n` only covers
        // initialized bytes, and can't exceed the buffer capacity.
        unsafe {
            self.buf.set_len(self.buf.len() + n);
        }

        Ok(())
    }

    /// Returns the next line, without its trailing newline.
    ///
    /// The final line is returned even if the file doesn't end with a newline. Lines longer than the scanner's buffer
    /// are reported as invalid data rather than silently split.
    fn next_line(&mut self) -> io::Result<Option<&[u8]>> {
        if let Some(consume) = self.pending_consume.take() {
            self.buf.drain(..consume);
        }

        loop {
            if let Some(newline_idx) = self.buf.iter().position(|&b| b == b'\n') {
                self.pending_consume = Some(newline_idx + 1);
                return Ok(Some(&self.buf[..newline_idx]));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }

                let len = self.buf.len();
                self.pending_consume = Some(len);
                return Ok(Some(&self.buf[..len]));
            }

            if self.buf.len() == self.buf.capacity() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line exceeds scanner buffer"));
            }

            self.fill_buf()?;
        }
    }
}

impl Scanner<File> {
    fn reset_with_path(&mut self, path: &Path) -> io::Result<()> {
        let file = File::open(path)?;
        self.reset(file);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    const ROLLUP: &str = "\
55d6c0a00000-7ffd5b5f2000 ---p 00000000 00:00 0                          [rollup]
Rss:                5712 kB
Pss:                1203 kB
Pss_Dirty:           832 kB
Pss_Anon:            808 kB
Shared_Clean:       4352 kB
Shared_Dirty:          0 kB
Private_Clean:       132 kB
Private_Dirty:      1228 kB
Swap:                 16 kB
SwapPss:              16 kB";

    fn scanner_over(data: &str) -> Scanner<Cursor<Vec<u8>>> {
        let mut scanner = Scanner::new();
        scanner.reset(Cursor::new(data.as_bytes().to_vec()));
        scanner
    }

    #[test]
    fn basic() {
        let mut querier = Querier::default();
        assert!(querier.resident_set_size().is_some());
    }

    #[test]
    fn own_footprint_is_consistent() {
        let footprint = Querier::default().footprint().unwrap();
        assert!(footprint.rss > 0);
        if let Some(uss) = footprint.uss {
            assert!(uss <= footprint.rss);
        }
    }

    #[test]
    fn rollup_totals() {
        let mut scanner = scanner_over(ROLLUP);
        let mut totals = SmapsTotals::default();
        while let Some(line) = scanner.next_line().unwrap() {
            totals.observe(line);
        }

        let footprint = totals.into_footprint().unwrap();
        assert_eq!(footprint.rss, 5712 * 1024);
        assert_eq!(footprint.pss, Some(1203 * 1024));
        assert_eq!(footprint.uss, Some((132 + 1228) * 1024));
        assert_eq!(footprint.swap, Some(16 * 1024));
    }

    #[test]
    fn per_mapping_totals_are_summed() {
        let smaps = "\
00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/dbus-daemon
Rss:                 8 kB
Private_Dirty:       4 kB
Swap:                0 kB
00651000-00652000 r--p 00051000 08:02 173521 /usr/bin/dbus-daemon
Rss:                12 kB
Private_Dirty:       8 kB
Swap:                4 kB
";
        let mut scanner = scanner_over(smaps);
        let mut totals = SmapsTotals::default();
        while let Some(line) = scanner.next_line().unwrap() {
            totals.observe(line);
        }

        let footprint = totals.into_footprint().unwrap();
        assert_eq!(footprint.rss, 20 * 1024);
        assert_eq!(footprint.uss, Some(12 * 1024));
        assert_eq!(footprint.swap, Some(4 * 1024));
    }

    #[test]
    fn empty_smaps_is_an_error() {
        let mut scanner = scanner_over("");
        let mut totals = SmapsTotals::default();
        while let Some(line) = scanner.next_line().unwrap() {
            totals.observe(line);
        }
        assert!(totals.into_footprint().is_err());
    }

    #[test]
    fn overlong_line_is_reported() {
        let long_line = "x".repeat(10_000);
        let mut scanner = scanner_over(&long_line);
        assert!(scanner.next_line().is_err());
    }

    #[test]
    fn nonexistent_pid_is_not_found() {
        let mut querier = Querier::new(Target::Pid(i32::MAX));
        let err = querier.footprint().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
