use std::{
    collections::BTreeMap,
    io,
    os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd},
};

use libc::c_char;

use super::PlatformImpl;
use crate::{
    error::{Error, Result},
    platform::posix::ifaddrs,
    types::{Duplex, NicStats},
};

const SIOCGIFMTU: libc::c_ulong = 0x8921;
const SIOCETHTOOL: libc::c_ulong = 0x8946;
const ETHTOOL_GSET: u32 = 0x0000_0001;
const DUPLEX_HALF: u8 = 0x00;
const DUPLEX_FULL: u8 = 0x01;
const SPEED_UNKNOWN: u32 = u32::MAX;

/// `struct ifreq`, with only the union members we use.
#[repr(C)]
struct IfReq {
    name: [c_char; libc::IFNAMSIZ],
    data: IfReqData,
}

#[repr(C)]
union IfReqData {
    mtu: libc::c_int,
    ptr: *mut libc::c_void,
    // The kernel's union is as large as a `struct ifmap`.
    _pad: [u8; 24],
}

/// `struct ethtool_cmd` from `<linux/ethtool.h>`.
#[repr(C)]
#[derive(Default)]
struct EthtoolCmd {
    cmd: u32,
    supported: u32,
    advertising: u32,
    speed: u16,
    duplex: u8,
    port: u8,
    phy_address: u8,
    transceiver: u8,
    autoneg: u8,
    mdio_support: u8,
    maxtxpkt: u32,
    maxrxpkt: u32,
    speed_hi: u16,
    eth_tp_mdix: u8,
    eth_tp_mdix_ctrl: u8,
    lp_advertising: u32,
    reserved: [u32; 2],
}

fn ifreq(name: &str) -> Result<IfReq> {
    if name.len() >= libc::IFNAMSIZ || name.bytes().any(|b| b == 0) {
        return Err(Error::NoSuchDevice { name: name.to_string() });
    }

    let mut req = IfReq {
        name: [0; libc::IFNAMSIZ],
        data: IfReqData { _pad: [0; 24] },
    };
    for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
        *dst = src as c_char;
    }
    Ok(req)
}

fn control_socket() -> Result<OwnedFd> {
    // SAFETY: `socket` has no pointer arguments.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd == -1 {
        return Err(Error::last_os_error("socket"));
    }
    // SAFETY: `fd` is a freshly created descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn mtu(socket: &OwnedFd, name: &str) -> Result<u64> {
    let mut req = ifreq(name)?;
    // SAFETY: `req` is a properly laid out `ifreq` that outlives the call.
    if unsafe { libc::ioctl(socket.as_raw_fd(), SIOCGIFMTU as _, &mut req as *mut IfReq) } == -1 {
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ENODEV) {
            return Err(Error::NoSuchDevice { name: name.to_string() });
        }
        return Err(Error::Os {
            syscall: format!("ioctl(SIOCGIFMTU, {})", name),
            source: error,
        });
    }
    // SAFETY: The kernel filled in the `mtu` member.
    Ok(unsafe { req.data.mtu }.max(0) as u64)
}

/// Duplex and speed (in Mbit/s) through the legacy ethtool interface.
///
/// Interfaces without a driver that supports ethtool (loopback, bridges, tunnels) fail with `EOPNOTSUPP`, and report
/// unknown values instead of an error.
fn duplex_and_speed(socket: &OwnedFd, name: &str) -> Result<(Duplex, u64)> {
    let mut cmd = EthtoolCmd {
        cmd: ETHTOOL_GSET,
        ..Default::default()
    };
    let mut req = ifreq(name)?;
    req.data.ptr = &mut cmd as *mut EthtoolCmd as *mut libc::c_void;

    // SAFETY: `req` points at `cmd`, and both outlive the call.
    if unsafe { libc::ioctl(socket.as_raw_fd(), SIOCETHTOOL as _, &mut req as *mut IfReq) } == -1 {
        let error = io::Error::last_os_error();
        return match error.raw_os_error() {
            Some(libc::EOPNOTSUPP) | Some(libc::EINVAL) | Some(libc::EPERM) | Some(libc::ENODEV) => {
                Ok((Duplex::Unknown, 0))
            }
            _ => Err(Error::Os {
                syscall: format!("ioctl(SIOCETHTOOL, {})", name),
                source: error,
            }),
        };
    }

    let duplex = match cmd.duplex {
        DUPLEX_FULL => Duplex::Full,
        DUPLEX_HALF => Duplex::Half,
        _ => Duplex::Unknown,
    };
    let speed = u32::from(cmd.speed) | (u32::from(cmd.speed_hi) << 16);
    let speed = if speed == SPEED_UNKNOWN || speed == u32::from(u16::MAX) {
        0
    } else {
        u64::from(speed)
    };
    Ok((duplex, speed))
}

pub(super) fn if_stats(platform: &PlatformImpl) -> Result<BTreeMap<String, NicStats>> {
    let socket = control_socket()?;
    let mut stats = BTreeMap::new();

    for (name, flags) in ifaddrs::interface_flags()? {
        // Interfaces can vanish between listing and querying them.
        let mtu = match mtu(&socket, &name) {
            Ok(mtu) => mtu,
            Err(Error::NoSuchDevice { .. }) => continue,
            Err(e) => return Err(e),
        };
        let (duplex, speed) = match duplex_and_speed(&socket, &name) {
            Ok(values) => values,
            Err(e) => {
                platform.swallowed("ethtool", &e);
                (Duplex::Unknown, 0)
            }
        };

        stats.insert(
            name,
            NicStats {
                is_up: ifaddrs::is_up(flags),
                duplex,
                speed,
                mtu,
                flags: ifaddrs::flag_names(flags),
            },
        );
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ethtool_cmd_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<EthtoolCmd>(), 44);
        assert_eq!(std::mem::size_of::<IfReq>(), libc::IFNAMSIZ + 24);
    }

    #[test]
    fn long_names_are_rejected() {
        assert!(matches!(
            ifreq("an-interface-name-too-long"),
            Err(Error::NoSuchDevice { .. })
        ));
        assert!(ifreq("eth0").is_ok());
    }

    #[test]
    fn loopback_stats() {
        let socket = control_socket().unwrap();
        assert!(mtu(&socket, "lo").unwrap() > 0);
        assert_eq!(duplex_and_speed(&socket, "lo").unwrap().0, Duplex::Unknown);
    }
}
