use std::{
    ffi::c_void,
    net::{Ipv4Addr, Ipv6Addr},
    time::{SystemTime, UNIX_EPOCH},
};

use windows_sys::Win32::System::{
    Power::{GetSystemPowerStatus, SYSTEM_POWER_STATUS},
    RemoteDesktop::{
        WTSClientAddress, WTSEnumerateSessionsW, WTSFreeMemory, WTSQuerySessionInformationW, WTSSessionInfo,
        WTSUserName, WTS_INFO_CLASS, WTSINFOW, WTS_CLIENT_ADDRESS, WTS_CURRENT_SERVER_HANDLE, WTS_SESSION_INFOW,
    },
    SystemInformation::GetTickCount64,
};

use super::{filetime_to_unix, from_wide, from_wide_ptr};
use crate::{
    error::{Error, Result},
    types::{Battery, BatteryTime, User},
};

const AF_INET: u32 = 2;
const AF_INET6: u32 = 23;

const BATTERY_FLAG_NO_BATTERY: u8 = 128;
const BATTERY_FLAG_UNKNOWN: u8 = 255;
const BATTERY_LIFE_UNKNOWN: u32 = u32::MAX;

pub(super) fn boot_time() -> Result<f64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Os {
            syscall: "SystemTime::now".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
        .as_secs_f64();
    // SAFETY: `GetTickCount64` has no arguments.
    let uptime_ms = unsafe { GetTickCount64() };
    Ok(now - uptime_ms as f64 / 1000.0)
}

/// Memory handed out by the WTS API, freed on drop.
struct WtsMemory<T> {
    ptr: *mut T,
    len: u32,
}

impl<T> Drop for WtsMemory<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: The pointer came from a WTS call and is freed exactly once.
            unsafe { WTSFreeMemory(self.ptr as *mut c_void) };
        }
    }
}

fn query_session(session: u32, class: WTS_INFO_CLASS) -> Option<WtsMemory<u16>> {
    let mut memory = WtsMemory {
        ptr: std::ptr::null_mut(),
        len: 0,
    };
    // SAFETY: Both out pointers are valid for writes.
    let ok = unsafe {
        WTSQuerySessionInformationW(WTS_CURRENT_SERVER_HANDLE, session, class, &mut memory.ptr, &mut memory.len)
    };
    (ok != 0 && !memory.ptr.is_null()).then_some(memory)
}

/// Reads a `T` out of WTS memory, if the OS handed back enough bytes for one.
fn read_session<T: Copy>(memory: &WtsMemory<u16>) -> Option<T> {
    if (memory.len as usize) < std::mem::size_of::<T>() {
        return None;
    }
    // SAFETY: The buffer holds at least one `T`, read without alignment assumptions.
    Some(unsafe { std::ptr::read_unaligned(memory.ptr as *const T) })
}

/// The client address of a remote session, if it's an IP address.
pub(super) fn client_host(family: u32, address: &[u8; 20]) -> Option<String> {
    match family {
        AF_INET => {
            let octets: [u8; 4] = address[2..6].try_into().ok()?;
            Some(Ipv4Addr::from(octets).to_string())
        }
        AF_INET6 => {
            let octets: [u8; 16] = address[2..18].try_into().ok()?;
            Some(Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

fn session_user(session: u32) -> Option<User> {
    let name_memory = query_session(session, WTSUserName)?;
    // SAFETY: `WTSUserName` returns a NUL-terminated string.
    let name = unsafe { from_wide_ptr(name_memory.ptr) };
    if name.is_empty() {
        return None;
    }

    let host = query_session(session, WTSClientAddress)
        .and_then(|memory| read_session::<WTS_CLIENT_ADDRESS>(&memory))
        .and_then(|address| client_host(address.AddressFamily, &address.Address));
    let info = query_session(session, WTSSessionInfo).and_then(|memory| read_session::<WTSINFOW>(&memory));
    let started = info
        .as_ref()
        .filter(|info| info.LogonTime > 0)
        .map(|info| filetime_to_unix(info.LogonTime))
        .unwrap_or_default();
    let terminal = info
        .map(|info| from_wide(&info.WinStationName))
        .filter(|station| !station.is_empty());

    Some(User {
        name,
        terminal,
        host,
        started,
        pid: None,
    })
}

pub(super) fn users() -> Result<Vec<User>> {
    let mut sessions = WtsMemory::<WTS_SESSION_INFOW> {
        ptr: std::ptr::null_mut(),
        len: 0,
    };
    // SAFETY: Both out pointers are valid for writes.
    if unsafe { WTSEnumerateSessionsW(WTS_CURRENT_SERVER_HANDLE, 0, 1, &mut sessions.ptr, &mut sessions.len) } == 0 {
        return Err(Error::last_os_error("WTSEnumerateSessionsW"));
    }
    if sessions.ptr.is_null() {
        return Ok(Vec::new());
    }

    // SAFETY: The OS returned `len` sessions at `ptr`.
    let list = unsafe { std::slice::from_raw_parts(sessions.ptr, sessions.len as usize) };
    Ok(list.iter().filter_map(|session| session_user(session.SessionId)).collect())
}

/// Battery status from the `SYSTEM_POWER_STATUS` fields, or `None` without a battery.
pub(super) fn battery_from(ac_line: u8, flags: u8, percent: u8, life_secs: u32) -> Option<Battery> {
    if flags & BATTERY_FLAG_NO_BATTERY != 0 || flags == BATTERY_FLAG_UNKNOWN {
        return None;
    }
    let power_plugged = match ac_line {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    };
    let secs_left = match (power_plugged, life_secs) {
        (Some(true), _) => BatteryTime::Unlimited,
        (_, BATTERY_LIFE_UNKNOWN) => BatteryTime::Unknown,
        (_, secs) => BatteryTime::Seconds(u64::from(secs)),
    };
    Some(Battery {
        percent: f64::from(percent.min(100)),
        secs_left,
        power_plugged,
    })
}

pub(super) fn battery() -> Result<Option<Battery>> {
    // SAFETY: Plain old data.
    let mut status: SYSTEM_POWER_STATUS = unsafe { std::mem::zeroed() };
    // SAFETY: `status` is valid for writes.
    if unsafe { GetSystemPowerStatus(&mut status) } == 0 {
        return Err(Error::last_os_error("GetSystemPowerStatus"));
    }
    Ok(battery_from(
        status.ACLineStatus,
        status.BatteryFlag,
        status.BatteryLifePercent,
        status.BatteryLifeTime,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batteries() {
        assert_eq!(battery_from(1, 8, 80, 0), Some(Battery {
            percent: 80.0,
            secs_left: BatteryTime::Unlimited,
            power_plugged: Some(true),
        }));
        assert_eq!(battery_from(0, 0, 42, 3600).unwrap().secs_left, BatteryTime::Seconds(3600));
        assert_eq!(battery_from(0, 0, 42, u32::MAX).unwrap().secs_left, BatteryTime::Unknown);
        assert_eq!(battery_from(255, 0, 42, 60).unwrap().power_plugged, None);
        assert_eq!(battery_from(1, 128, 255, u32::MAX), None);
    }

    #[test]
    fn client_addresses() {
        let mut address = [0u8; 20];
        address[2..6].copy_from_slice(&[192, 168, 0, 9]);
        assert_eq!(client_host(AF_INET, &address).as_deref(), Some("192.168.0.9"));
        assert_eq!(client_host(0, &address), None);
    }

    #[test]
    fn booted_in_the_past() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64();
        let boot = boot_time().unwrap();
        assert!(boot > 0.0 && boot < now);
    }
}
