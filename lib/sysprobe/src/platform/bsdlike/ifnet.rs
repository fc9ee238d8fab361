//! Interface counters and status from `getifaddrs` link-layer entries and `SIOCGIFMEDIA`.

use std::collections::BTreeMap;
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
use std::{
    io,
    os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd},
};

use crate::{
    error::{Error, Result},
    platform::posix::ifaddrs::{flag_names, is_up, IfAddrs},
    types::{Duplex, NetIoCounters, NicStats},
};

/// Per-interface counters, from each interface's `if_data`.
///
/// Some of these counters are 32-bit on some kernels and wrap around.
#[cfg_attr(target_os = "macos", allow(dead_code))]
pub(crate) fn io_counters() -> Result<BTreeMap<String, NetIoCounters>> {
    let ifaddrs = IfAddrs::new()?;
    let mut counters = BTreeMap::new();
    for ifa in ifaddrs.iter() {
        let Some(data) = ifa.link_data() else {
            continue;
        };
        counters.insert(
            ifa.name(),
            NetIoCounters {
                bytes_sent: data.ifi_obytes as u64,
                bytes_recv: data.ifi_ibytes as u64,
                packets_sent: data.ifi_opackets as u64,
                packets_recv: data.ifi_ipackets as u64,
                errin: data.ifi_ierrors as u64,
                errout: data.ifi_oerrors as u64,
                dropin: data.ifi_iqdrops as u64,
                dropout: output_drops(&data),
            },
        );
    }
    Ok(counters)
}

#[cfg(target_os = "freebsd")]
fn output_drops(data: &libc::if_data) -> u64 {
    data.ifi_oqdrops as u64
}

#[cfg(not(target_os = "freebsd"))]
fn output_drops(_data: &libc::if_data) -> u64 {
    0
}

/// Status of every interface.
pub(crate) fn if_stats() -> Result<BTreeMap<String, NicStats>> {
    let ifaddrs = IfAddrs::new()?;
    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
    let socket = control_socket()?;

    let mut stats = BTreeMap::new();
    for ifa in ifaddrs.iter() {
        let Some(data) = ifa.link_data() else {
            continue;
        };
        let name = ifa.name();

        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
        let duplex = match media_duplex(&socket, &name) {
            Ok(duplex) => duplex,
            // The interface went away between `getifaddrs` and the ioctl.
            Err(Error::NoSuchDevice { .. }) => continue,
            Err(e) => return Err(e),
        };
        #[cfg(target_os = "openbsd")]
        let duplex = Duplex::Unknown;

        let flags = ifa.flags();
        stats.insert(
            name,
            NicStats {
                is_up: is_up(flags),
                duplex,
                speed: data.ifi_baudrate as u64 / 1_000_000,
                mtu: data.ifi_mtu as u64,
                flags: flag_names(flags),
            },
        );
    }
    Ok(stats)
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
mod media {
    use libc::{c_char, c_int};

    /// `struct ifmediareq` from `<net/if_media.h>`.
    #[repr(C)]
    pub(super) struct IfMediaReq {
        pub(super) name: [c_char; libc::IFNAMSIZ],
        pub(super) current: c_int,
        pub(super) mask: c_int,
        pub(super) status: c_int,
        pub(super) active: c_int,
        pub(super) count: c_int,
        pub(super) ulist: *mut c_int,
    }

    #[cfg(not(target_os = "netbsd"))]
    const SIOCGIFMEDIA_NR: u32 = 56;
    #[cfg(target_os = "netbsd")]
    const SIOCGIFMEDIA_NR: u32 = 54;

    /// `_IOWR('i', n, struct ifmediareq)`.
    pub(super) const SIOCGIFMEDIA: u32 = 0xc000_0000
        | (((std::mem::size_of::<IfMediaReq>() as u32) & 0x1fff) << 16)
        | ((b'i' as u32) << 8)
        | SIOCGIFMEDIA_NR;

    pub(super) const IFM_FDX: c_int = 0x0010_0000;
    pub(super) const IFM_HDX: c_int = 0x0020_0000;
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
fn control_socket() -> Result<OwnedFd> {
    // SAFETY: `socket` has no pointer arguments.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd == -1 {
        return Err(Error::last_os_error("socket"));
    }
    // SAFETY: `fd` is a freshly created descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Duplex mode of the active media.
///
/// Interfaces without selectable media (loopback, tunnels, bridges) report unknown duplex.
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd"))]
fn media_duplex(socket: &OwnedFd, name: &str) -> Result<Duplex> {
    use libc::c_char;
    use media::*;

    if name.len() >= libc::IFNAMSIZ || name.bytes().any(|b| b == 0) {
        return Err(Error::NoSuchDevice { name: name.to_string() });
    }
    let mut req = IfMediaReq {
        name: [0; libc::IFNAMSIZ],
        current: 0,
        mask: 0,
        status: 0,
        active: 0,
        count: 0,
        ulist: std::ptr::null_mut(),
    };
    for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
        *dst = src as c_char;
    }

    // SAFETY: `req` is a properly laid out `ifmediareq` with no media list to fill, and outlives the call.
    if unsafe { libc::ioctl(socket.as_raw_fd(), SIOCGIFMEDIA as _, &mut req as *mut IfMediaReq) } == -1 {
        let error = io::Error::last_os_error();
        return match error.raw_os_error() {
            Some(libc::ENXIO) | Some(libc::ENODEV) => Err(Error::NoSuchDevice { name: name.to_string() }),
            Some(libc::EINVAL) | Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP) => Ok(Duplex::Unknown),
            _ => Err(Error::Os {
                syscall: format!("ioctl(SIOCGIFMEDIA, {})", name),
                source: error,
            }),
        };
    }

    Ok(if req.active & IFM_FDX != 0 {
        Duplex::Full
    } else if req.active & IFM_HDX != 0 {
        Duplex::Half
    } else {
        Duplex::Unknown
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_counters_and_stats() {
        let stats = if_stats().unwrap();
        let (name, loopback) = stats.iter().find(|(name, _)| name.starts_with("lo")).unwrap();
        assert!(loopback.mtu > 0);
        assert!(loopback.flags.contains("loopback"));
        assert_eq!(loopback.duplex, Duplex::Unknown);

        let counters = io_counters().unwrap();
        assert!(counters.contains_key(name));
    }

    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    #[test]
    fn media_request_layout() {
        assert_eq!(media::SIOCGIFMEDIA & 0xffff, 0x6938);
    }
}
