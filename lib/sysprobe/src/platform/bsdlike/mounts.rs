//! Mounted filesystems through `getfsstat` (`getvfsstat` on NetBSD).

use std::path::Path;

use crate::{
    buffer::{grow_until_fits, read_records, BufferPolicy, Fill},
    error::{Error, Result},
    platform::posix::c_chars_to_string,
    types::Partition,
};

#[cfg(not(target_os = "netbsd"))]
type MountEntry = libc::statfs;
#[cfg(target_os = "netbsd")]
type MountEntry = libc::statvfs;

const RDONLY: u64 = 0x1;

/// Flags shared by every kernel here, in the order they're rendered.
const COMMON_OPTIONS: &[(u64, &str)] = &[
    (0x2, "sync"),
    (0x4, "noexec"),
    (0x8, "nosuid"),
    (0x40, "async"),
    (0x1000, "local"),
    (0x2000, "quota"),
    (0x4000, "rootfs"),
];

#[cfg(target_os = "macos")]
const PLATFORM_OPTIONS: &[(u64, &str)] = &[
    (0x10, "nodev"),
    (0x20, "union"),
    (0x10_0000, "dontbrowse"),
    (0x40_0000, "automounted"),
    (0x80_0000, "journaled"),
    (0x1000_0000, "noatime"),
];

#[cfg(target_os = "freebsd")]
const PLATFORM_OPTIONS: &[(u64, &str)] = &[
    (0x10, "nfsv4acls"),
    (0x20, "union"),
    (0x8000, "user"),
    (0x10_0000, "suiddir"),
    (0x20_0000, "softdep"),
    (0x40_0000, "nosymfollow"),
    (0x200_0000, "gjournal"),
    (0x400_0000, "multilabel"),
    (0x800_0000, "acls"),
    (0x1000_0000, "noatime"),
    (0x4000_0000, "noclusterr"),
    (0x8000_0000, "noclusterw"),
];

#[cfg(target_os = "openbsd")]
const PLATFORM_OPTIONS: &[(u64, &str)] = &[
    (0x10, "nodev"),
    (0x800, "wxallowed"),
    (0x8000, "noatime"),
    (0x400_0000, "softdep"),
];

#[cfg(target_os = "netbsd")]
const PLATFORM_OPTIONS: &[(u64, &str)] = &[
    (0x10, "nodev"),
    (0x20, "union"),
    (0x8000, "nocoredump"),
    (0x200_0000, "log"),
    (0x400_0000, "noatime"),
    (0x2000_0000, "symperm"),
    (0x4000_0000, "nodevmtime"),
    (0x8000_0000, "softdep"),
];

/// Renders mount flags as `ro` or `rw`, followed by the other options set.
pub(crate) fn mount_options(flags: u64) -> String {
    let access = if flags & RDONLY != 0 { "ro" } else { "rw" };
    std::iter::once(access)
        .chain(
            COMMON_OPTIONS
                .iter()
                .chain(PLATFORM_OPTIONS)
                .filter(|(bit, _)| flags & bit != 0)
                .map(|(_, name)| *name),
        )
        .collect::<Vec<_>>()
        .join(",")
}

fn entries(policy: &BufferPolicy) -> Result<Vec<MountEntry>> {
    let entry_size = std::mem::size_of::<MountEntry>();

    // SAFETY: A null buffer only asks for the number of mounted filesystems.
    let count = unsafe { fsstat(std::ptr::null_mut(), 0) };
    if count == -1 {
        return Err(Error::last_os_error(FSSTAT));
    }

    let bytes = grow_until_fits::<u8, _>(policy, FSSTAT, (count as usize + 1) * entry_size, |buf| {
        let capacity = buf.len() / entry_size;
        // SAFETY: `buf` holds room for `capacity` entries.
        let written = unsafe { fsstat(buf.as_mut_ptr() as *mut MountEntry, capacity * entry_size) };
        if written == -1 {
            return Err(Error::last_os_error(FSSTAT));
        }
        // A full buffer may have been truncated silently.
        let written = written as usize;
        if written >= capacity {
            return Ok(Fill::TooSmall(Some((written + 1) * entry_size)));
        }
        Ok(Fill::Done(written * entry_size))
    })?;

    Ok(read_records(&bytes))
}

#[cfg(not(target_os = "netbsd"))]
const FSSTAT: &str = "getfsstat";
#[cfg(target_os = "netbsd")]
const FSSTAT: &str = "getvfsstat";

#[cfg(not(target_os = "netbsd"))]
unsafe fn fsstat(buf: *mut MountEntry, size: usize) -> libc::c_int {
    libc::getfsstat(buf, size as _, libc::MNT_NOWAIT)
}

#[cfg(target_os = "netbsd")]
unsafe fn fsstat(buf: *mut MountEntry, size: usize) -> libc::c_int {
    libc::getvfsstat(buf, size as _, libc::MNT_NOWAIT)
}

#[cfg(not(target_os = "netbsd"))]
fn flags(entry: &MountEntry) -> u64 {
    entry.f_flags as u64
}

#[cfg(target_os = "netbsd")]
fn flags(entry: &MountEntry) -> u64 {
    entry.f_flag as u64
}

/// Mounted filesystems. Unless `all` is set, only those backed by a device node that exists are kept.
pub(crate) fn partitions(policy: &BufferPolicy, all: bool) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    for entry in entries(policy)? {
        let device = c_chars_to_string(&entry.f_mntfromname);
        if !all && (device.is_empty() || !Path::new(&device).exists()) {
            continue;
        }
        partitions.push(Partition {
            device,
            mountpoint: c_chars_to_string(&entry.f_mntonname),
            fstype: c_chars_to_string(&entry.f_fstypename),
            opts: mount_options(flags(&entry)),
        });
    }
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_rendering() {
        assert_eq!(mount_options(0), "rw");
        assert_eq!(mount_options(0x1 | 0x8 | 0x1000), "ro,nosuid,local");
    }

    #[test]
    fn root_is_mounted() {
        let partitions = partitions(&BufferPolicy::default(), true).unwrap();
        assert!(partitions.iter().any(|p| p.mountpoint == "/"));
    }
}
