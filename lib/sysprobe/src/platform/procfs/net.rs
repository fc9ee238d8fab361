//! Network procfs files: `net/dev`, `net/{tcp,udp}{,6}` and `net/unix`.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use crate::{
    error::{Error, Result},
    filter::SocketTypes,
    types::{ConnectionStatus, NetIoCounters},
};

/// Parses `/proc/net/dev`.
pub(crate) fn parse_net_dev(text: &str) -> Result<BTreeMap<String, NetIoCounters>> {
    let mut counters = BTreeMap::new();

    // Two header lines.
    for line in text.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let values = rest
            .split_whitespace()
            .map(|v| v.parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::parse("/proc/net/dev", format!("{}: {}", name.trim(), e)))?;
        if values.len() < 16 {
            return Err(Error::parse("/proc/net/dev", format!("{}: too few columns", name.trim())));
        }

        // Receive: bytes packets errs drop fifo frame compressed multicast.
        // Transmit: bytes packets errs drop fifo colls carrier compressed.
        counters.insert(
            name.trim().to_string(),
            NetIoCounters {
                bytes_recv: values[0],
                packets_recv: values[1],
                errin: values[2],
                dropin: values[3],
                bytes_sent: values[8],
                packets_sent: values[9],
                errout: values[10],
                dropout: values[11],
            },
        );
    }

    Ok(counters)
}

/// One line of `/proc/net/{tcp,udp}{,6}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct InetSocket {
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    pub status: ConnectionStatus,
    pub inode: u64,
}

/// Parses `/proc/net/tcp`, `/proc/net/tcp6`, `/proc/net/udp` or `/proc/net/udp6`.
///
/// Addresses are printed by the kernel as the hex of the in-memory (network order) words read as native integers, so
/// they're decoded back with native byte order.
pub(crate) fn parse_net_inet(text: &str, kind: SocketTypes) -> Result<Vec<InetSocket>> {
    let mut sockets = Vec::new();

    for line in text.lines().skip(1) {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.len() < 10 {
            continue;
        }

        let local = parse_hex_socket_addr(fields[1])?;
        let remote = parse_hex_socket_addr(fields[2])?;
        let state = u8::from_str_radix(fields[3], 16)
            .map_err(|_| Error::parse("/proc/net/tcp", format!("bad state {:?}", fields[3])))?;
        let inode = fields[9]
            .parse::<u64>()
            .map_err(|_| Error::parse("/proc/net/tcp", format!("bad inode {:?}", fields[9])))?;

        let status = if kind == SocketTypes::Stream {
            tcp_status(state)
        } else {
            ConnectionStatus::None
        };

        sockets.push(InetSocket {
            local,
            remote: (!(remote.ip().is_unspecified() && remote.port() == 0)).then_some(remote),
            status,
            inode,
        });
    }

    Ok(sockets)
}

/// Maps the Linux `TCP_*` state numbers.
pub(crate) fn tcp_status(state: u8) -> ConnectionStatus {
    match state {
        0x01 => ConnectionStatus::Established,
        0x02 => ConnectionStatus::SynSent,
        0x03 | 0x0C => ConnectionStatus::SynRecv,
        0x04 => ConnectionStatus::FinWait1,
        0x05 => ConnectionStatus::FinWait2,
        0x06 => ConnectionStatus::TimeWait,
        0x07 => ConnectionStatus::Close,
        0x08 => ConnectionStatus::CloseWait,
        0x09 => ConnectionStatus::LastAck,
        0x0A => ConnectionStatus::Listen,
        0x0B => ConnectionStatus::Closing,
        _ => ConnectionStatus::None,
    }
}

fn parse_hex_socket_addr(field: &str) -> Result<SocketAddr> {
    let bad = || Error::parse("/proc/net", format!("bad address {:?}", field));
    let (ip, port) = field.split_once(':').ok_or_else(bad)?;
    let port = u16::from_str_radix(port, 16).map_err(|_| bad())?;

    let ip = match ip.len() {
        8 => {
            let word = u32::from_str_radix(ip, 16).map_err(|_| bad())?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(&ip[i * 8..i * 8 + 8], 16).map_err(|_| bad())?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(bad()),
    };

    Ok(SocketAddr::new(ip, port))
}

/// One line of `/proc/net/unix`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct UnixSocket {
    pub kind: SocketTypes,
    pub inode: u64,
    pub path: String,
}

/// Parses `/proc/net/unix`.
pub(crate) fn parse_net_unix(text: &str) -> Result<Vec<UnixSocket>> {
    let mut sockets = Vec::new();

    // Num RefCount Protocol Flags Type St Inode Path
    for line in text.lines().skip(1) {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.len() < 7 {
            continue;
        }

        let kind = match u16::from_str_radix(fields[4], 16) {
            Ok(1) => SocketTypes::Stream,
            Ok(2) => SocketTypes::Datagram,
            Ok(5) => SocketTypes::SeqPacket,
            _ => continue,
        };
        let inode = fields[6]
            .parse::<u64>()
            .map_err(|_| Error::parse("/proc/net/unix", format!("bad inode {:?}", fields[6])))?;

        sockets.push(UnixSocket {
            kind,
            inode,
            path: super::skip_fields(line, 7).to_string(),
        });
    }

    Ok(sockets)
}

/// Extracts the inode from a `socket:[12345]` fd link target.
pub(crate) fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 2776770   11307    0    0    0     0          0         0  2776770   11307    0    0    0     0       0          0
  eth0: 1215645    2751    1    2    0     0          0         0  1782404    4324    3    4    0   427       0          0
";

    #[test]
    fn net_dev_fixture() {
        let counters = parse_net_dev(NET_DEV).unwrap();
        assert_eq!(counters.len(), 2);
        let eth0 = &counters["eth0"];
        assert_eq!(eth0.bytes_recv, 1215645);
        assert_eq!(eth0.packets_recv, 2751);
        assert_eq!(eth0.errin, 1);
        assert_eq!(eth0.dropin, 2);
        assert_eq!(eth0.bytes_sent, 1782404);
        assert_eq!(eth0.packets_sent, 4324);
        assert_eq!(eth0.errout, 3);
        assert_eq!(eth0.dropout, 4);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn tcp_fixture() {
        let text = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000   999        0 36125 1 0000000000000000 100 0 0 10 0
   1: 0100007F:A1B2 0100007F:0CEA 01 00000000:00000000 00:00000000 00000000  1000        0 40001 1 0000000000000000 20 4 30 10 -1
";
        let sockets = parse_net_inet(text, SocketTypes::Stream).unwrap();
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].local, "127.0.0.1:3306".parse().unwrap());
        assert_eq!(sockets[0].remote, None);
        assert_eq!(sockets[0].status, ConnectionStatus::Listen);
        assert_eq!(sockets[0].inode, 36125);
        assert_eq!(sockets[1].remote, Some("127.0.0.1:3306".parse().unwrap()));
        assert_eq!(sockets[1].status, ConnectionStatus::Established);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn tcp6_fixture() {
        let text = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000001000000:0016 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 17540 1 0000000000000000 100 0 0 10 0
   1: 0000000000000000FFFF00000100007F:1F90 00000000000000000000000000000000:0000 07 00000000:00000000 00:00000000 00000000     0        0 17541 2 0000000000000000
";
        let sockets = parse_net_inet(text, SocketTypes::Datagram).unwrap();
        assert_eq!(sockets[0].local, "[::1]:22".parse().unwrap());
        assert_eq!(sockets[1].local, "[::ffff:127.0.0.1]:8080".parse().unwrap());
        // UDP never reports a state, whatever the column says.
        assert_eq!(sockets[1].status, ConnectionStatus::None);
    }

    #[test]
    fn malformed_address_is_a_parse_error() {
        let text = "header\n   0: 0100007F 00000000:0000 0A 0 0 0 0 0 1 0\n";
        assert!(parse_net_inet(text, SocketTypes::Stream).is_err());
    }

    #[test]
    fn unix_fixture() {
        let text = "Num       RefCount Protocol Flags    Type St Inode Path
0000000000000000: 00000002 00000000 00010000 0001 01 16163 /run/systemd/private socket
0000000000000000: 00000002 00000000 00000000 0002 01 16170
0000000000000000: 00000003 00000000 00000000 0005 03 20001 @abstract
";
        let sockets = parse_net_unix(text).unwrap();
        assert_eq!(sockets.len(), 3);
        assert_eq!(sockets[0].kind, SocketTypes::Stream);
        assert_eq!(sockets[0].path, "/run/systemd/private socket");
        assert_eq!(sockets[1].kind, SocketTypes::Datagram);
        assert_eq!(sockets[1].path, "");
        assert_eq!(sockets[2].kind, SocketTypes::SeqPacket);
        assert_eq!(sockets[2].inode, 20001);
    }

    #[test]
    fn socket_links() {
        assert_eq!(socket_inode("socket:[36125]"), Some(36125));
        assert_eq!(socket_inode("pipe:[36125]"), None);
        assert_eq!(socket_inode("/dev/null"), None);
    }
}
