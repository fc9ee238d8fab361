use std::{collections::BTreeMap, ffi::c_void, io, path::Path, ptr};

use windows_sys::Win32::{
    Foundation::{ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND},
    Storage::FileSystem::{
        CreateFileW, GetDiskFreeSpaceExW, GetDriveTypeW, GetLogicalDriveStringsW, GetVolumeInformationW,
        QueryDosDeviceW, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    },
    System::{
        Diagnostics::Debug::{SetErrorMode, SEM_FAILCRITICALERRORS},
        IO::DeviceIoControl,
    },
};

use super::{ffi, from_wide, to_wide, HandleGuard, PlatformImpl};
use crate::{
    bounded::run_bounded,
    error::{Error, Result},
    types::{DiskIoCounters, DiskUsage, Partition},
};

/// Physical drives probed for I/O counters.
const MAX_PHYSICAL_DRIVES: u32 = 32;

const FILE_READ_ONLY_VOLUME: u32 = 0x0008_0000;

// `GetDriveTypeW` results.
const DRIVE_UNKNOWN: u32 = 0;
const DRIVE_NO_ROOT_DIR: u32 = 1;
const DRIVE_REMOVABLE: u32 = 2;
const DRIVE_FIXED: u32 = 3;
const DRIVE_REMOTE: u32 = 4;
const DRIVE_CDROM: u32 = 5;
const DRIVE_RAMDISK: u32 = 6;

/// Splits a `a\0b\0\0` list.
pub(super) fn split_multi_sz(wide: &[u16]) -> Vec<String> {
    wide.split(|c| *c == 0)
        .take_while(|item| !item.is_empty())
        .map(String::from_utf16_lossy)
        .collect()
}

/// Root paths of every drive letter in use, like `C:\`.
fn logical_drives() -> Result<Vec<String>> {
    let mut buf = vec![0u16; 512];
    // SAFETY: `buf` is valid for its length in characters.
    let len = unsafe { GetLogicalDriveStringsW(buf.len() as u32, buf.as_mut_ptr()) } as usize;
    if len == 0 || len > buf.len() {
        return Err(Error::last_os_error("GetLogicalDriveStringsW"));
    }
    Ok(split_multi_sz(&buf[..len]))
}

fn drive_type_name(drive_type: u32) -> &'static str {
    match drive_type {
        DRIVE_REMOVABLE => "removable",
        DRIVE_FIXED => "fixed",
        DRIVE_REMOTE => "remote",
        DRIVE_CDROM => "cdrom",
        DRIVE_RAMDISK => "ramdisk",
        DRIVE_NO_ROOT_DIR => "noroot",
        _ => "unknown",
    }
}

/// Mount options: writability first, then the kind of drive.
pub(super) fn partition_opts(volume_flags: Option<u32>, drive_type: u32) -> String {
    let access = match volume_flags {
        Some(flags) if flags & FILE_READ_ONLY_VOLUME != 0 => "ro",
        _ => "rw",
    };
    format!("{},{}", access, drive_type_name(drive_type))
}

/// Restores the thread's error mode when dropped.
struct ErrorModeGuard(u32);

impl ErrorModeGuard {
    /// Stops Windows from popping up "insert a disk" dialogs for empty drives.
    fn quiet() -> Self {
        // SAFETY: `SetErrorMode` has no pointer arguments.
        Self(unsafe { SetErrorMode(SEM_FAILCRITICALERRORS) })
    }
}

impl Drop for ErrorModeGuard {
    fn drop(&mut self) {
        // SAFETY: As above.
        unsafe { SetErrorMode(self.0) };
    }
}

/// Volume flags and file system name, or `None` for drives without media.
fn volume_information(root: &str) -> Option<(u32, String)> {
    let root = to_wide(root);
    let mut fs_name = [0u16; 64];
    let mut flags = 0u32;
    // SAFETY: `root` is NUL-terminated, and every out buffer is valid for the lengths given.
    let ok = unsafe {
        GetVolumeInformationW(
            root.as_ptr(),
            ptr::null_mut(),
            0,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut flags,
            fs_name.as_mut_ptr(),
            fs_name.len() as u32,
        )
    };
    (ok != 0).then(|| (flags, from_wide(&fs_name)))
}

pub(super) fn partitions(platform: &PlatformImpl, all: bool) -> Result<Vec<Partition>> {
    let _quiet = ErrorModeGuard::quiet();

    let mut partitions = Vec::new();
    for root in logical_drives()? {
        let wide = to_wide(&root);
        // SAFETY: `wide` is NUL-terminated.
        let drive_type = unsafe { GetDriveTypeW(wide.as_ptr()) };
        if !all && matches!(drive_type, DRIVE_UNKNOWN | DRIVE_NO_ROOT_DIR | DRIVE_REMOVABLE | DRIVE_CDROM) {
            continue;
        }

        let volume = volume_information(&root);
        if volume.is_none() {
            platform.swallowed("GetVolumeInformationW", &io::Error::last_os_error());
        }
        partitions.push(Partition {
            device: root.clone(),
            mountpoint: root,
            fstype: volume.as_ref().map(|(_, fs)| fs.clone()).unwrap_or_default(),
            opts: partition_opts(volume.map(|(flags, _)| flags), drive_type),
        });
    }
    Ok(partitions)
}

pub(super) fn usage(platform: &PlatformImpl, path: &Path) -> Result<DiskUsage> {
    let syscall = "GetDiskFreeSpaceExW";
    let wide = to_wide(&path.to_string_lossy());
    // Network drives can stall for as long as the redirector waits on the server.
    let result = run_bounded(platform.context.hanging_call_timeout(), syscall, move || {
        let _quiet = ErrorModeGuard::quiet();
        let (mut available, mut total, mut free) = (0u64, 0u64, 0u64);
        // SAFETY: `wide` is NUL-terminated, and the counters are valid for writes.
        if unsafe { GetDiskFreeSpaceExW(wide.as_ptr(), &mut available, &mut total, &mut free) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((available, total, free))
    })?;

    let (available, total, free) = result.map_err(|source| Error::Os {
        syscall: syscall.to_string(),
        source,
    })?;
    Ok(DiskUsage {
        total,
        used: total.saturating_sub(free),
        free: available,
    })
}

fn drive_performance(drive: u32) -> Result<Option<ffi::DiskPerformance>> {
    let path = to_wide(&format!(r"\\.\PhysicalDrive{}", drive));
    // SAFETY: `path` is NUL-terminated; no access rights are needed for the performance IOCTL.
    let handle = unsafe {
        CreateFileW(
            path.as_ptr(),
            0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            ptr::null(),
            OPEN_EXISTING,
            0,
            ptr::null_mut(),
        )
    };
    let Some(handle) = HandleGuard::new(handle) else {
        let error = io::Error::last_os_error();
        return match error.raw_os_error() {
            Some(code) if code == ERROR_FILE_NOT_FOUND as i32 || code == ERROR_PATH_NOT_FOUND as i32 => Ok(None),
            _ => Err(Error::Os {
                syscall: "CreateFileW".to_string(),
                source: error,
            }),
        };
    };

    let mut perf = ffi::DiskPerformance::default();
    let mut returned = 0u32;
    // SAFETY: `perf` is valid for its size in bytes of writes.
    let ok = unsafe {
        DeviceIoControl(
            handle.raw(),
            ffi::IOCTL_DISK_PERFORMANCE,
            ptr::null(),
            0,
            &mut perf as *mut _ as *mut c_void,
            std::mem::size_of::<ffi::DiskPerformance>() as u32,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(Error::last_os_error("DeviceIoControl(IOCTL_DISK_PERFORMANCE)"));
    }
    Ok(Some(perf))
}

pub(super) fn io_counters(platform: &PlatformImpl) -> Result<BTreeMap<String, DiskIoCounters>> {
    let mut counters = BTreeMap::new();
    for drive in 0..MAX_PHYSICAL_DRIVES {
        match drive_performance(drive) {
            Ok(Some(perf)) => {
                counters.insert(
                    format!("PhysicalDrive{}", drive),
                    DiskIoCounters {
                        read_count: u64::from(perf.ReadCount),
                        write_count: u64::from(perf.WriteCount),
                        read_bytes: perf.BytesRead.max(0) as u64,
                        write_bytes: perf.BytesWritten.max(0) as u64,
                        // 100ns units.
                        read_time: perf.ReadTime.max(0) as u64 / 10_000,
                        write_time: perf.WriteTime.max(0) as u64 / 10_000,
                        busy_time: None,
                    },
                );
            }
            Ok(None) => {}
            // Virtual disks and disks with performance counters turned off refuse the IOCTL.
            Err(e) => platform.swallowed("disk performance", &e),
        }
    }
    Ok(counters)
}

/// NT device names for every drive letter, like `\Device\HarddiskVolume3` for `C:`.
pub(super) fn dos_devices() -> Vec<(String, String)> {
    let Ok(drives) = logical_drives() else {
        return Vec::new();
    };
    drives
        .iter()
        .filter_map(|root| {
            let drive = root.trim_end_matches('\\').to_string();
            let wide = to_wide(&drive);
            let mut target = vec![0u16; 1024];
            // SAFETY: `wide` is NUL-terminated and `target` is valid for its length in characters.
            let len = unsafe { QueryDosDeviceW(wide.as_ptr(), target.as_mut_ptr(), target.len() as u32) } as usize;
            let device = split_multi_sz(&target[..len.min(target.len())]).into_iter().next()?;
            Some((device, drive))
        })
        .collect()
}

/// Rewrites a path under an NT device name into one under its drive letter.
pub(super) fn to_dos_path(path: &str, devices: &[(String, String)]) -> String {
    for (device, drive) in devices {
        if let Some(rest) = path.strip_prefix(device.as_str()) {
            if rest.is_empty() || rest.starts_with('\\') {
                return format!("{}{}", drive, rest);
            }
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    #[test]
    fn multi_strings() {
        assert_eq!(split_multi_sz(&wide("C:\\\0D:\\\0\0")), vec!["C:\\", "D:\\"]);
        assert!(split_multi_sz(&wide("\0")).is_empty());
    }

    #[test]
    fn device_paths() {
        let devices = vec![
            (r"\Device\HarddiskVolume1".to_string(), "C:".to_string()),
            (r"\Device\HarddiskVolume10".to_string(), "D:".to_string()),
        ];
        assert_eq!(to_dos_path(r"\Device\HarddiskVolume1\Windows\a.dll", &devices), r"C:\Windows\a.dll");
        assert_eq!(to_dos_path(r"\Device\HarddiskVolume10\b.dll", &devices), r"D:\b.dll");
        assert_eq!(to_dos_path(r"\Device\Mup\share\c.dll", &devices), r"\Device\Mup\share\c.dll");
    }

    #[test]
    fn options() {
        assert_eq!(partition_opts(Some(0), DRIVE_FIXED), "rw,fixed");
        assert_eq!(partition_opts(Some(FILE_READ_ONLY_VOLUME), DRIVE_CDROM), "ro,cdrom");
        assert_eq!(partition_opts(None, DRIVE_REMOVABLE), "rw,removable");
    }

    #[test]
    fn system_drive_usage() {
        let platform = PlatformImpl::new(crate::context::BindingContext::builder().testing(true).build());
        let usage = usage(&platform, Path::new(r"C:\")).unwrap();
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
        assert!(usage.free <= usage.total);
    }
}
