//! Socket families, types and `sockaddr` decoding shared by the BSD-derived kernels.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{
    filter::{AddressFamilies, SocketTypes},
    types::Address,
};

pub(crate) fn family_of(family: libc::c_int) -> Option<AddressFamilies> {
    match family {
        libc::AF_INET => Some(AddressFamilies::Inet),
        libc::AF_INET6 => Some(AddressFamilies::Inet6),
        libc::AF_UNIX => Some(AddressFamilies::Unix),
        _ => None,
    }
}

pub(crate) fn kind_of(kind: libc::c_int) -> Option<SocketTypes> {
    match kind {
        libc::SOCK_STREAM => Some(SocketTypes::Stream),
        libc::SOCK_DGRAM => Some(SocketTypes::Datagram),
        libc::SOCK_SEQPACKET => Some(SocketTypes::SeqPacket),
        _ => None,
    }
}

/// Path of a `sockaddr_un`, stored after its length and family bytes.
pub(crate) fn unix_path(sockaddr: &[u8]) -> String {
    let path = sockaddr.get(2..).unwrap_or_default();
    let end = path.iter().position(|b| *b == 0).unwrap_or(path.len());
    String::from_utf8_lossy(&path[..end]).into_owned()
}

/// Decodes a raw BSD `sockaddr` (`sa_len`, `sa_family`, then the family's payload).
#[cfg_attr(target_os = "macos", allow(dead_code))]
pub(crate) fn sockaddr_address(sockaddr: &[u8]) -> Option<Address> {
    let family = *sockaddr.get(1)? as libc::c_int;
    let port = || Some(u16::from_be_bytes([*sockaddr.get(2)?, *sockaddr.get(3)?]));
    match family {
        libc::AF_INET => {
            let octets: [u8; 4] = sockaddr.get(4..8)?.try_into().ok()?;
            Some(Address::Inet(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port()?)))
        }
        libc::AF_INET6 => {
            let octets: [u8; 16] = sockaddr.get(8..24)?.try_into().ok()?;
            Some(Address::Inet(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port()?)))
        }
        libc::AF_UNIX => {
            // `sa_len` bounds the path when the kernel didn't NUL terminate it.
            let len = (sockaddr[0] as usize).clamp(2, sockaddr.len());
            Some(Address::Unix(unix_path(&sockaddr[..len])))
        }
        _ => None,
    }
}

/// Returns `true` for the placeholder a kernel reports as the peer of an unconnected socket.
pub(crate) fn is_unset(address: &Address) -> bool {
    match address {
        Address::Inet(addr) => addr.port() == 0 && addr.ip().is_unspecified(),
        Address::Unix(path) => path.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_paths() {
        let mut sockaddr = vec![0u8; 16];
        sockaddr[2..10].copy_from_slice(b"/tmp/sck");
        assert_eq!(unix_path(&sockaddr), "/tmp/sck");
        assert_eq!(unix_path(&[0, 1]), "");
    }

    #[test]
    fn inet_sockaddrs() {
        let v4 = [16, libc::AF_INET as u8, 0x1f, 0x90, 127, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            sockaddr_address(&v4),
            Some(Address::Inet("127.0.0.1:8080".parse().unwrap()))
        );

        let mut v6 = [0u8; 28];
        v6[0] = 28;
        v6[1] = libc::AF_INET6 as u8;
        v6[3] = 53;
        v6[23] = 1;
        assert_eq!(sockaddr_address(&v6), Some(Address::Inet("[::1]:53".parse().unwrap())));

        assert_eq!(sockaddr_address(&[0, 0]), None);
        assert_eq!(sockaddr_address(&v4[..6]), None);
    }

    #[test]
    fn unix_sockaddr_respects_length() {
        let mut sockaddr = [b'x'; 32];
        sockaddr[0] = 6;
        sockaddr[1] = libc::AF_UNIX as u8;
        sockaddr[2..6].copy_from_slice(b"/tmp");
        assert_eq!(sockaddr_address(&sockaddr), Some(Address::Unix("/tmp".to_string())));
    }

    #[test]
    fn unset_peers() {
        assert!(is_unset(&Address::Inet("0.0.0.0:0".parse().unwrap())));
        assert!(!is_unset(&Address::Inet("0.0.0.0:22".parse().unwrap())));
        assert!(is_unset(&Address::Unix(String::new())));
    }
}
