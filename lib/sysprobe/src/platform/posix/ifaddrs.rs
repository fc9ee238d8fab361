use std::{
    collections::BTreeMap,
    ffi::CStr,
    net::{Ipv4Addr, Ipv6Addr},
};

use libc::{c_int, sockaddr};

use crate::{
    error::{Error, Result},
    types::{NicAddress, NicFamily},
};

/// The list returned by `getifaddrs`, freed on drop.
pub(crate) struct IfAddrs {
    head: *mut libc::ifaddrs,
}

impl IfAddrs {
    pub(crate) fn new() -> Result<Self> {
        let mut head = std::ptr::null_mut();
        // SAFETY: `head` is a valid out pointer.
        if unsafe { libc::getifaddrs(&mut head) } == -1 {
            return Err(Error::last_os_error("getifaddrs"));
        }
        Ok(Self { head })
    }

    pub(crate) fn iter(&self) -> IfAddrsIter<'_> {
        IfAddrsIter {
            next: self.head,
            _owner: self,
        }
    }
}

impl Drop for IfAddrs {
    fn drop(&mut self) {
        if !self.head.is_null() {
            // SAFETY: `head` came from a successful `getifaddrs` and is freed exactly once.
            unsafe { libc::freeifaddrs(self.head) };
        }
    }
}

pub(crate) struct IfAddrsIter<'a> {
    next: *mut libc::ifaddrs,
    _owner: &'a IfAddrs,
}

/// One entry of the `getifaddrs` list, borrowed from it.
pub(crate) struct IfAddr<'a> {
    entry: &'a libc::ifaddrs,
}

impl<'a> Iterator for IfAddrsIter<'a> {
    type Item = IfAddr<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: Entries stay valid until the owning `IfAddrs` is dropped, which the lifetime ties us to.
        let entry = unsafe { &*self.next };
        self.next = entry.ifa_next;
        Some(IfAddr { entry })
    }
}

impl IfAddr<'_> {
    pub(crate) fn name(&self) -> String {
        if self.entry.ifa_name.is_null() {
            return String::new();
        }
        // SAFETY: `ifa_name` is a NUL terminated string owned by the list.
        unsafe { CStr::from_ptr(self.entry.ifa_name) }.to_string_lossy().into_owned()
    }

    pub(crate) fn flags(&self) -> u32 {
        self.entry.ifa_flags as u32
    }

    /// The interface's `struct if_data`, carried by its link-layer entry.
    #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
    pub(crate) fn link_data(&self) -> Option<libc::if_data> {
        let addr = self.entry.ifa_addr;
        // SAFETY: A non-null `ifa_addr` points at a socket address owned by the list.
        if addr.is_null() || c_int::from(unsafe { (*addr).sa_family }) != libc::AF_LINK || self.entry.ifa_data.is_null() {
            return None;
        }
        // SAFETY: For `AF_LINK` entries, `ifa_data` points at the interface's `if_data`, owned by the list.
        Some(unsafe { std::ptr::read_unaligned(self.entry.ifa_data as *const libc::if_data) })
    }

    fn address(&self) -> *const sockaddr {
        self.entry.ifa_addr
    }

    fn netmask(&self) -> *const sockaddr {
        self.entry.ifa_netmask
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn broadcast_or_destination(&self) -> *const sockaddr {
        self.entry.ifa_ifu
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn broadcast_or_destination(&self) -> *const sockaddr {
        self.entry.ifa_dstaddr
    }
}

/// Interface flags, with their conventional names.
const FLAG_NAMES: &[(c_int, &str)] = &[
    (libc::IFF_UP as c_int, "up"),
    (libc::IFF_BROADCAST as c_int, "broadcast"),
    (libc::IFF_DEBUG as c_int, "debug"),
    (libc::IFF_LOOPBACK as c_int, "loopback"),
    (libc::IFF_POINTOPOINT as c_int, "pointopoint"),
    (libc::IFF_RUNNING as c_int, "running"),
    (libc::IFF_NOARP as c_int, "noarp"),
    (libc::IFF_PROMISC as c_int, "promisc"),
    (libc::IFF_ALLMULTI as c_int, "allmulti"),
    (libc::IFF_MULTICAST as c_int, "multicast"),
];

/// Renders interface flags as a comma separated list, such as `up,broadcast,running,multicast`.
pub(crate) fn flag_names(flags: u32) -> String {
    FLAG_NAMES
        .iter()
        .filter(|(bit, _)| flags & (*bit as u32) != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn is_up(flags: u32) -> bool {
    let up = libc::IFF_UP as u32;
    let running = libc::IFF_RUNNING as u32;
    flags & up != 0 && flags & running != 0
}

pub(crate) fn is_point_to_point(flags: u32) -> bool {
    flags & (libc::IFF_POINTOPOINT as u32) != 0
}

/// Flags of every interface, by name.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "solaris", target_os = "illumos"))]
pub(crate) fn interface_flags() -> Result<BTreeMap<String, u32>> {
    let ifaddrs = IfAddrs::new()?;
    let mut by_name = BTreeMap::new();
    for ifa in ifaddrs.iter() {
        // Every address of an interface carries the same flags.
        by_name.entry(ifa.name()).or_insert_with(|| ifa.flags());
    }
    Ok(by_name)
}

/// Addresses assigned to each interface.
pub(crate) fn net_if_addrs() -> Result<BTreeMap<String, Vec<NicAddress>>> {
    let ifaddrs = IfAddrs::new()?;
    let mut by_name: BTreeMap<String, Vec<NicAddress>> = BTreeMap::new();

    for ifa in ifaddrs.iter() {
        // SAFETY: The sockaddr pointers are either null or point into the list owned by `ifaddrs`.
        let Some((family, address)) = (unsafe { sockaddr_to_string(ifa.address()) }) else {
            continue;
        };
        let netmask = unsafe { sockaddr_to_string(ifa.netmask()) }.map(|(_, mask)| mask);
        let other = unsafe { sockaddr_to_string(ifa.broadcast_or_destination()) }.map(|(_, addr)| addr);

        let (broadcast, ptp) = if is_point_to_point(ifa.flags()) {
            (None, other)
        } else {
            (other, None)
        };

        by_name.entry(ifa.name()).or_default().push(NicAddress {
            family,
            address,
            netmask,
            broadcast,
            ptp,
        });
    }

    Ok(by_name)
}

/// Renders a socket address as text, along with its family.
///
/// Families other than IPv4, IPv6 and link-layer return `None`.
///
/// # Safety
///
/// `addr` must be null, or point to a valid socket address of the size its family implies.
pub(crate) unsafe fn sockaddr_to_string(addr: *const sockaddr) -> Option<(NicFamily, String)> {
    if addr.is_null() {
        return None;
    }

    match c_int::from((*addr).sa_family) {
        libc::AF_INET => {
            let sin = &*(addr as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some((NicFamily::Inet, ip.to_string()))
        }
        libc::AF_INET6 => {
            let sin6 = &*(addr as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some((NicFamily::Inet6, ip.to_string()))
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        libc::AF_PACKET => {
            let sll = &*(addr as *const libc::sockaddr_ll);
            let len = usize::from(sll.sll_halen).min(sll.sll_addr.len());
            Some((NicFamily::Link, format_mac(&sll.sll_addr[..len])?))
        }
        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
        libc::AF_LINK => {
            let sdl = &*(addr as *const libc::sockaddr_dl);
            // The link-layer address follows the interface name inside `sdl_data`, which is declared shorter than
            // what the kernel actually hands out.
            let data = sdl.sdl_data.as_ptr() as *const u8;
            let mac = std::slice::from_raw_parts(data.add(usize::from(sdl.sdl_nlen)), usize::from(sdl.sdl_alen));
            Some((NicFamily::Link, format_mac(mac)?))
        }
        _ => None,
    }
}

/// Formats a hardware address as colon separated hex, or `None` if it's empty.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) fn format_mac(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    Some(
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
    fn mac_formatting() {
        assert_eq!(format_mac(&[0, 0x1b, 0x21, 0xaa, 0xbb, 0xcc]).as_deref(), Some("00:1b:21:aa:bb:cc"));
        assert_eq!(format_mac(&[]), None);
    }

    #[test]
    fn flag_rendering() {
        let flags = (libc::IFF_UP | libc::IFF_RUNNING | libc::IFF_LOOPBACK) as u32;
        assert_eq!(flag_names(flags), "up,loopback,running");
        assert!(is_up(flags));
        assert!(!is_up(libc::IFF_UP as u32));
    }

    #[test]
    fn loopback_has_an_address() {
        let addrs = net_if_addrs().unwrap();
        let has_loopback = addrs
            .values()
            .flatten()
            .any(|addr| addr.address == "127.0.0.1" || addr.address == "::1");
        assert!(has_loopback);
    }
}
