//! Disk procfs files: `diskstats`, `self/mounts` and `filesystems`.

use std::collections::{BTreeMap, HashSet};

use crate::{
    error::{Error, Result},
    types::{DiskIoCounters, Partition},
};

/// Size of a sector as reported by `diskstats`, regardless of the device's real sector size.
const SECTOR_SIZE: u64 = 512;

/// Parses `/proc/diskstats`.
///
/// Lines have 14 or more fields on 2.6.25 and later (more on newer kernels, which we ignore), or 7 fields for
/// partitions on older 2.6 kernels.
pub(crate) fn parse_diskstats(text: &str) -> Result<BTreeMap<String, DiskIoCounters>> {
    let mut counters = BTreeMap::new();

    for line in text.lines() {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        let name = match fields.get(2) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let number = |i: usize| -> Result<u64> {
            fields[i]
                .parse::<u64>()
                .map_err(|_| Error::parse("/proc/diskstats", format!("{}: bad field {:?}", name, fields[i])))
        };

        let record = match fields.len() {
            n if n >= 14 => DiskIoCounters {
                read_count: number(3)?,
                read_bytes: number(5)? * SECTOR_SIZE,
                read_time: number(6)?,
                write_count: number(7)?,
                write_bytes: number(9)? * SECTOR_SIZE,
                write_time: number(10)?,
                busy_time: Some(number(12)?),
            },
            7 => DiskIoCounters {
                read_count: number(3)?,
                read_bytes: number(4)? * SECTOR_SIZE,
                write_count: number(5)?,
                write_bytes: number(6)? * SECTOR_SIZE,
                ..Default::default()
            },
            _ => {
                return Err(Error::parse(
                    "/proc/diskstats",
                    format!("{}: unexpected field count {}", name, fields.len()),
                ))
            }
        };
        counters.insert(name, record);
    }

    Ok(counters)
}

/// Parses `/proc/filesystems` into the names of filesystems backed by a device.
pub(crate) fn parse_physical_filesystems(text: &str) -> HashSet<String> {
    let mut names = text
        .lines()
        .filter(|line| !line.starts_with("nodev"))
        .map(|line| line.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect::<HashSet<_>>();
    // ZFS datasets have no backing device but are real storage.
    names.insert("zfs".to_string());
    names
}

/// Parses a `mounts` file (`/proc/self/mounts` or `/etc/mtab`).
///
/// When `physical` is given, only mounts whose type appears in it are kept.
pub(crate) fn parse_mounts(text: &str, physical: Option<&HashSet<String>>) -> Vec<Partition> {
    let mut partitions = Vec::new();

    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mountpoint), Some(fstype), Some(opts)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        if let Some(physical) = physical {
            if !physical.contains(fstype) {
                continue;
            }
        }

        partitions.push(Partition {
            device: if device == "none" { String::new() } else { unescape_octal(device) },
            mountpoint: unescape_octal(mountpoint),
            fstype: fstype.to_string(),
            opts: opts.to_string(),
        });
    }

    partitions
}

/// Decodes the `\NNN` escapes the kernel uses for spaces, tabs, newlines and backslashes in mount fields.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4].iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diskstats_fixture() {
        let text = "   8       0 sda 120 30 4000 250 80 10 1600 400 0 500 650 0 0 0 0
   8       1 sda1 100 2 20 4
";
        let stats = parse_diskstats(text).unwrap();
        let sda = &stats["sda"];
        assert_eq!(sda.read_count, 120);
        assert_eq!(sda.read_bytes, 4000 * 512);
        assert_eq!(sda.read_time, 250);
        assert_eq!(sda.write_count, 80);
        assert_eq!(sda.write_bytes, 1600 * 512);
        assert_eq!(sda.write_time, 400);
        assert_eq!(sda.busy_time, Some(500));

        let sda1 = &stats["sda1"];
        assert_eq!(sda1.read_count, 100);
        assert_eq!(sda1.read_bytes, 2 * 512);
        assert_eq!(sda1.write_count, 20);
        assert_eq!(sda1.write_bytes, 4 * 512);
        assert_eq!(sda1.busy_time, None);
    }

    #[test]
    fn diskstats_with_odd_field_count_is_a_parse_error() {
        assert!(parse_diskstats("8 0 sda 1 2 3 4 5 6\n").is_err());
        assert!(parse_diskstats("8 0 sda x 2 3 4\n").is_err());
    }

    #[test]
    fn mounts_fixture() {
        let filesystems = parse_physical_filesystems("nodev\tsysfs\nnodev\tproc\n\text4\n\tvfat\n");
        assert!(filesystems.contains("ext4"));
        assert!(filesystems.contains("zfs"));
        assert!(!filesystems.contains("proc"));

        let mounts = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda2 / ext4 rw,relatime,errors=remount-ro 0 0
/dev/sdb1 /media/usb\\040stick vfat ro,nosuid 0 0
";
        let physical = parse_mounts(mounts, Some(&filesystems));
        assert_eq!(physical.len(), 2);
        assert_eq!(physical[0].mountpoint, "/");
        assert_eq!(physical[0].fstype, "ext4");
        assert_eq!(physical[1].mountpoint, "/media/usb stick");
        assert_eq!(physical[1].opts, "ro,nosuid");

        assert_eq!(parse_mounts(mounts, None).len(), 4);
    }

    #[test]
    fn octal_escapes() {
        assert_eq!(unescape_octal("a\\040b\\011c\\134d"), "a b\tc\\d");
        assert_eq!(unescape_octal("trailing\\04"), "trailing\\04");
        assert_eq!(unescape_octal("\\999"), "\\999");
    }
}
