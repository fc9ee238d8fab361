//! Network interfaces, keyed by their friendly name (`Ethernet`, `Wi-Fi`).

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use windows_sys::Win32::{
    Foundation::{ERROR_BUFFER_OVERFLOW, ERROR_NO_DATA, NO_ERROR},
    NetworkManagement::{
        IpHelper::{
            GetAdaptersAddresses, GetIfEntry2, GAA_FLAG_SKIP_ANYCAST, GAA_FLAG_SKIP_DNS_SERVER, GAA_FLAG_SKIP_MULTICAST,
            IP_ADAPTER_ADDRESSES_LH, MIB_IF_ROW2,
        },
        Ndis::NET_LUID_LH,
    },
};

use super::{from_wide_ptr, grow_aligned, PlatformImpl};
use crate::{
    buffer::Fill,
    error::{Error, Result},
    types::{Duplex, NetIoCounters, NicAddress, NicFamily, NicStats},
};

const AF_UNSPEC: u32 = 0;
const AF_INET: u16 = 2;
const AF_INET6: u16 = 23;

const IF_OPER_STATUS_UP: i32 = 1;
const IF_TYPE_SOFTWARE_LOOPBACK: u32 = 24;

/// What we keep of one `IP_ADAPTER_ADDRESSES` entry.
struct Adapter {
    name: String,
    mac: Option<String>,
    addresses: Vec<(IpAddr, u8)>,
    mtu: u32,
    if_type: u32,
    up: bool,
    speed_bps: u64,
    luid: NET_LUID_LH,
}

/// Decodes an IPv4 or IPv6 `SOCKADDR`.
pub(super) fn ip_from_sockaddr(bytes: &[u8]) -> Option<IpAddr> {
    let family = u16::from_ne_bytes(bytes.get(0..2)?.try_into().ok()?);
    match family {
        AF_INET => {
            let octets: [u8; 4] = bytes.get(4..8)?.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AF_INET6 => {
            let octets: [u8; 16] = bytes.get(8..24)?.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// The netmask for an on-link prefix length.
pub(super) fn prefix_netmask(address: &IpAddr, prefix: u8) -> IpAddr {
    match address {
        IpAddr::V4(_) => {
            let bits = u32::MAX.checked_shl(32u32.saturating_sub(u32::from(prefix))).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(bits))
        }
        IpAddr::V6(_) => {
            let bits = u128::MAX.checked_shl(128u32.saturating_sub(u32::from(prefix))).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(bits))
        }
    }
}

/// `AA-BB-CC-DD-EE-FF`, the way Windows prints hardware addresses.
pub(super) fn format_mac(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    Some(bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join("-"))
}

fn adapters(platform: &PlatformImpl) -> Result<Vec<Adapter>> {
    let syscall = "GetAdaptersAddresses";
    let flags = GAA_FLAG_SKIP_ANYCAST | GAA_FLAG_SKIP_MULTICAST | GAA_FLAG_SKIP_DNS_SERVER;
    let buf = grow_aligned(platform.context.buffer_policy(), syscall, 16 * 1024, |buf, capacity| {
        let mut size = capacity as u32;
        // SAFETY: `buf` is valid for `size` bytes of writes, and 8-byte aligned.
        let code = unsafe {
            GetAdaptersAddresses(AF_UNSPEC, flags, std::ptr::null(), buf as *mut IP_ADAPTER_ADDRESSES_LH, &mut size)
        };
        match code {
            NO_ERROR => Ok(Fill::Done(capacity)),
            ERROR_NO_DATA => Ok(Fill::Done(0)),
            ERROR_BUFFER_OVERFLOW => Ok(Fill::TooSmall(Some(size as usize))),
            code => Err(Error::Os {
                syscall: syscall.to_string(),
                source: std::io::Error::from_raw_os_error(code as i32),
            }),
        }
    })?;

    let mut adapters = Vec::new();
    if buf.bytes().is_empty() {
        return Ok(adapters);
    }

    let mut current = buf.bytes().as_ptr() as *const IP_ADAPTER_ADDRESSES_LH;
    while !current.is_null() {
        // SAFETY: The list and everything it points at live inside `buf`, which outlives this loop.
        let adapter = unsafe { &*current };

        let mut addresses = Vec::new();
        let mut unicast = adapter.FirstUnicastAddress;
        while !unicast.is_null() {
            // SAFETY: As above.
            let entry = unsafe { &*unicast };
            let sockaddr = entry.Address;
            if !sockaddr.lpSockaddr.is_null() && sockaddr.iSockaddrLength > 0 {
                // SAFETY: The OS reports the length of the socket address it points at.
                let bytes = unsafe {
                    std::slice::from_raw_parts(sockaddr.lpSockaddr as *const u8, sockaddr.iSockaddrLength as usize)
                };
                if let Some(ip) = ip_from_sockaddr(bytes) {
                    addresses.push((ip, entry.OnLinkPrefixLength));
                }
            }
            unicast = entry.Next;
        }

        let mac_len = (adapter.PhysicalAddressLength as usize).min(adapter.PhysicalAddress.len());
        adapters.push(Adapter {
            // SAFETY: `FriendlyName` is a NUL-terminated string inside `buf`.
            name: unsafe { from_wide_ptr(adapter.FriendlyName) },
            mac: format_mac(&adapter.PhysicalAddress[..mac_len]),
            addresses,
            mtu: adapter.Mtu,
            if_type: adapter.IfType,
            up: adapter.OperStatus == IF_OPER_STATUS_UP,
            speed_bps: adapter.TransmitLinkSpeed,
            luid: adapter.Luid,
        });
        current = adapter.Next;
    }
    Ok(adapters)
}

pub(super) fn if_addrs(platform: &PlatformImpl) -> Result<BTreeMap<String, Vec<NicAddress>>> {
    let mut nics = BTreeMap::new();
    for adapter in adapters(platform)? {
        let mut addresses = adapter
            .addresses
            .iter()
            .map(|(ip, prefix)| NicAddress {
                family: if ip.is_ipv4() { NicFamily::Inet } else { NicFamily::Inet6 },
                address: ip.to_string(),
                netmask: Some(prefix_netmask(ip, *prefix).to_string()),
                broadcast: None,
                ptp: None,
            })
            .collect::<Vec<_>>();
        if let Some(mac) = adapter.mac {
            addresses.push(NicAddress {
                family: NicFamily::Link,
                address: mac,
                netmask: None,
                broadcast: None,
                ptp: None,
            });
        }
        nics.insert(adapter.name, addresses);
    }
    Ok(nics)
}

pub(super) fn if_stats(platform: &PlatformImpl) -> Result<BTreeMap<String, NicStats>> {
    Ok(adapters(platform)?
        .into_iter()
        .map(|adapter| {
            let mut flags = Vec::new();
            if adapter.up {
                flags.extend(["up", "running"]);
            }
            if adapter.if_type == IF_TYPE_SOFTWARE_LOOPBACK {
                flags.push("loopback");
            }
            let stats = NicStats {
                is_up: adapter.up,
                // Windows doesn't expose duplex; anything that's up is assumed full duplex.
                duplex: if adapter.up { Duplex::Full } else { Duplex::Unknown },
                speed: match adapter.speed_bps {
                    u64::MAX => 0,
                    bps => bps / 1_000_000,
                },
                mtu: match adapter.mtu {
                    u32::MAX => 0,
                    mtu => u64::from(mtu),
                },
                flags: flags.join(","),
            };
            (adapter.name, stats)
        })
        .collect())
}

pub(super) fn io_counters(platform: &PlatformImpl) -> Result<BTreeMap<String, NetIoCounters>> {
    let mut counters = BTreeMap::new();
    for adapter in adapters(platform)? {
        // SAFETY: Plain old data.
        let mut row: MIB_IF_ROW2 = unsafe { std::mem::zeroed() };
        row.InterfaceLuid = adapter.luid;
        // SAFETY: `row` is valid for writes, with the interface to look up filled in.
        let code = unsafe { GetIfEntry2(&mut row) };
        if code != NO_ERROR {
            platform.swallowed(
                "GetIfEntry2",
                &std::io::Error::from_raw_os_error(code as i32),
            );
            continue;
        }
        counters.insert(
            adapter.name,
            NetIoCounters {
                bytes_sent: row.OutOctets,
                bytes_recv: row.InOctets,
                packets_sent: row.OutUcastPkts + row.OutNUcastPkts,
                packets_recv: row.InUcastPkts + row.InNUcastPkts,
                errin: row.InErrors,
                errout: row.OutErrors,
                dropin: row.InDiscards,
                dropout: row.OutDiscards,
            },
        );
    }
    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addresses() {
        let mut v4 = vec![0u8; 16];
        v4[0..2].copy_from_slice(&AF_INET.to_ne_bytes());
        v4[4..8].copy_from_slice(&[192, 168, 1, 20]);
        assert_eq!(ip_from_sockaddr(&v4), Some("192.168.1.20".parse().unwrap()));

        let mut v6 = vec![0u8; 28];
        v6[0..2].copy_from_slice(&AF_INET6.to_ne_bytes());
        v6[8..24].copy_from_slice(&"fe80::1".parse::<Ipv6Addr>().unwrap().octets());
        assert_eq!(ip_from_sockaddr(&v6), Some("fe80::1".parse().unwrap()));

        assert_eq!(ip_from_sockaddr(&v6[..10]), None);
        assert_eq!(ip_from_sockaddr(&[0u8; 16]), None);
    }

    #[test]
    fn netmasks() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(prefix_netmask(&v4, 24).to_string(), "255.255.255.0");
        assert_eq!(prefix_netmask(&v4, 0).to_string(), "0.0.0.0");
        assert_eq!(prefix_netmask(&v4, 32).to_string(), "255.255.255.255");

        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(prefix_netmask(&v6, 64).to_string(), "ffff:ffff:ffff:ffff::");
    }

    #[test]
    fn hardware_addresses() {
        assert_eq!(format_mac(&[0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]).unwrap(), "00-1A-2B-3C-4D-5E");
        assert_eq!(format_mac(&[]), None);
    }

    #[test]
    fn loopback_is_listed() {
        let platform = PlatformImpl::new(crate::context::BindingContext::builder().testing(true).build());
        let stats = if_stats(&platform).unwrap();
        assert!(stats.values().any(|nic| nic.flags.contains("loopback")));
        assert!(if_addrs(&platform)
            .unwrap()
            .values()
            .flatten()
            .any(|address| address.address == "127.0.0.1"));
    }
}
