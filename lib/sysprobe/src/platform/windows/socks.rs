//! TCP and UDP sockets from the IP Helper owner-PID tables.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use windows_sys::Win32::{
    Foundation::{ERROR_INSUFFICIENT_BUFFER, NO_ERROR},
    NetworkManagement::IpHelper::{GetExtendedTcpTable, GetExtendedUdpTable, TCP_TABLE_OWNER_PID_ALL, UDP_TABLE_OWNER_PID},
};

use super::{ffi, grow_aligned, PlatformImpl};
use crate::{
    buffer::{read_record, Fill},
    error::{Error, Result},
    filter::{AddressFamilies, ConnectionFilter, SocketTypes},
    types::{Address, Connection, ConnectionStatus, Pid},
};

const AF_INET: u32 = 2;
const AF_INET6: u32 = 23;

/// `MIB_TCP_STATE`
pub(super) fn tcp_state(state: u32) -> ConnectionStatus {
    match state {
        1 => ConnectionStatus::Close,
        2 => ConnectionStatus::Listen,
        3 => ConnectionStatus::SynSent,
        4 => ConnectionStatus::SynRecv,
        5 => ConnectionStatus::Established,
        6 => ConnectionStatus::FinWait1,
        7 => ConnectionStatus::FinWait2,
        8 => ConnectionStatus::CloseWait,
        9 => ConnectionStatus::Closing,
        10 => ConnectionStatus::LastAck,
        11 => ConnectionStatus::TimeWait,
        12 => ConnectionStatus::DeleteTcb,
        _ => ConnectionStatus::None,
    }
}

/// Rows of a `MIB_*TABLE_OWNER_PID`: a `u32` count, then the rows.
pub(super) fn table_rows<T: Copy>(bytes: &[u8]) -> Vec<T> {
    let Some(count) = read_record::<u32>(bytes, 0) else {
        return Vec::new();
    };
    let size = std::mem::size_of::<T>();
    (0..count as usize)
        .map_while(|i| read_record::<T>(bytes, 4 + i * size))
        .collect()
}

/// Ports are stored in network byte order in the low half of a `u32`.
fn port(raw: u32) -> u16 {
    u16::from_be(raw as u16)
}

fn v4(raw: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(raw.to_ne_bytes()))
}

fn v6(raw: [u8; 16]) -> IpAddr {
    IpAddr::V6(Ipv6Addr::from(raw))
}

/// The remote end, which listening and unconnected sockets don't have.
fn remote(ip: IpAddr, port: u16, status: ConnectionStatus) -> Option<Address> {
    if status == ConnectionStatus::Listen || (ip.is_unspecified() && port == 0) {
        return None;
    }
    Some(Address::Inet(SocketAddr::new(ip, port)))
}

fn connection(
    family: AddressFamilies, kind: SocketTypes, local: SocketAddr, remote: Option<Address>, status: ConnectionStatus,
    pid: u32,
) -> Connection {
    Connection {
        fd: -1,
        family,
        kind,
        local: Some(Address::Inet(local)),
        remote,
        status,
        pid: Some(pid as Pid),
    }
}

pub(super) fn tcp4(row: &ffi::TcpRowOwnerPid) -> Connection {
    let status = tcp_state(row.dwState);
    connection(
        AddressFamilies::Inet,
        SocketTypes::Stream,
        SocketAddr::new(v4(row.dwLocalAddr), port(row.dwLocalPort)),
        remote(v4(row.dwRemoteAddr), port(row.dwRemotePort), status),
        status,
        row.dwOwningPid,
    )
}

pub(super) fn tcp6(row: &ffi::Tcp6RowOwnerPid) -> Connection {
    let status = tcp_state(row.dwState);
    connection(
        AddressFamilies::Inet6,
        SocketTypes::Stream,
        SocketAddr::new(v6(row.ucLocalAddr), port(row.dwLocalPort)),
        remote(v6(row.ucRemoteAddr), port(row.dwRemotePort), status),
        status,
        row.dwOwningPid,
    )
}

pub(super) fn udp4(row: &ffi::UdpRowOwnerPid) -> Connection {
    let local = SocketAddr::new(v4(row.dwLocalAddr), port(row.dwLocalPort));
    connection(AddressFamilies::Inet, SocketTypes::Datagram, local, None, ConnectionStatus::None, row.dwOwningPid)
}

pub(super) fn udp6(row: &ffi::Udp6RowOwnerPid) -> Connection {
    let local = SocketAddr::new(v6(row.ucLocalAddr), port(row.dwLocalPort));
    connection(AddressFamilies::Inet6, SocketTypes::Datagram, local, None, ConnectionStatus::None, row.dwOwningPid)
}

fn read_table(platform: &PlatformImpl, syscall: &str, tcp: bool, family: u32) -> Result<Vec<u8>> {
    let buf = grow_aligned(platform.context.buffer_policy(), syscall, 16 * 1024, |buf, capacity| {
        let mut size = capacity as u32;
        // SAFETY: `buf` is valid for `size` bytes of writes.
        let code = unsafe {
            if tcp {
                GetExtendedTcpTable(buf, &mut size, 0, family, TCP_TABLE_OWNER_PID_ALL, 0)
            } else {
                GetExtendedUdpTable(buf, &mut size, 0, family, UDP_TABLE_OWNER_PID, 0)
            }
        };
        match code {
            NO_ERROR => Ok(Fill::Done(size as usize)),
            ERROR_INSUFFICIENT_BUFFER => Ok(Fill::TooSmall(Some(size as usize))),
            code => Err(Error::Os {
                syscall: syscall.to_string(),
                source: std::io::Error::from_raw_os_error(code as i32),
            }),
        }
    })?;
    Ok(buf.bytes().to_vec())
}

pub(super) fn connections(platform: &PlatformImpl, pid: Option<Pid>, filter: ConnectionFilter) -> Result<Vec<Connection>> {
    let mut connections = Vec::new();

    if filter.wants(AddressFamilies::Inet, SocketTypes::Stream) {
        let bytes = read_table(platform, "GetExtendedTcpTable(AF_INET)", true, AF_INET)?;
        connections.extend(table_rows::<ffi::TcpRowOwnerPid>(&bytes).iter().map(tcp4));
    }
    if filter.wants(AddressFamilies::Inet6, SocketTypes::Stream) {
        let bytes = read_table(platform, "GetExtendedTcpTable(AF_INET6)", true, AF_INET6)?;
        connections.extend(table_rows::<ffi::Tcp6RowOwnerPid>(&bytes).iter().map(tcp6));
    }
    if filter.wants(AddressFamilies::Inet, SocketTypes::Datagram) {
        let bytes = read_table(platform, "GetExtendedUdpTable(AF_INET)", false, AF_INET)?;
        connections.extend(table_rows::<ffi::UdpRowOwnerPid>(&bytes).iter().map(udp4));
    }
    if filter.wants(AddressFamilies::Inet6, SocketTypes::Datagram) {
        let bytes = read_table(platform, "GetExtendedUdpTable(AF_INET6)", false, AF_INET6)?;
        connections.extend(table_rows::<ffi::Udp6RowOwnerPid>(&bytes).iter().map(udp6));
    }

    if let Some(pid) = pid {
        connections.retain(|connection| connection.pid == Some(pid));
    }
    Ok(connections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table<T: Copy>(rows: &[T]) -> Vec<u8> {
        let size = std::mem::size_of::<T>();
        let mut bytes = vec![0u8; 4 + rows.len() * size];
        bytes[..4].copy_from_slice(&(rows.len() as u32).to_ne_bytes());
        for (i, row) in rows.iter().enumerate() {
            // SAFETY: In bounds, and unaligned writes have no alignment requirement.
            unsafe { std::ptr::write_unaligned(bytes.as_mut_ptr().add(4 + i * size) as *mut T, *row) };
        }
        bytes
    }

    fn be_port(port: u16) -> u32 {
        u32::from(port.to_be())
    }

    #[test]
    fn ipv4_tcp_rows() {
        let listening = ffi::TcpRowOwnerPid {
            dwState: 2,
            dwLocalAddr: u32::from_ne_bytes([127, 0, 0, 1]),
            dwLocalPort: be_port(8080),
            dwRemoteAddr: 0,
            dwRemotePort: 0,
            dwOwningPid: 42,
        };
        let established = ffi::TcpRowOwnerPid {
            dwState: 5,
            dwRemoteAddr: u32::from_ne_bytes([10, 1, 2, 3]),
            dwRemotePort: be_port(50_000),
            ..listening
        };

        let rows = table_rows::<ffi::TcpRowOwnerPid>(&table(&[listening, established]));
        let connections = rows.iter().map(tcp4).collect::<Vec<_>>();

        assert_eq!(connections[0].status, ConnectionStatus::Listen);
        assert_eq!(connections[0].local, Some(Address::Inet("127.0.0.1:8080".parse().unwrap())));
        assert_eq!(connections[0].remote, None);
        assert_eq!(connections[0].pid, Some(42));
        assert_eq!(connections[1].status, ConnectionStatus::Established);
        assert_eq!(connections[1].remote, Some(Address::Inet("10.1.2.3:50000".parse().unwrap())));
    }

    #[test]
    fn ipv6_udp_rows() {
        let row = ffi::Udp6RowOwnerPid {
            ucLocalAddr: "::1".parse::<Ipv6Addr>().unwrap().octets(),
            dwLocalScopeId: 0,
            dwLocalPort: be_port(53),
            dwOwningPid: 7,
        };
        let connection = udp6(&table_rows::<ffi::Udp6RowOwnerPid>(&table(&[row]))[0]);
        assert_eq!(connection.family, AddressFamilies::Inet6);
        assert_eq!(connection.kind, SocketTypes::Datagram);
        assert_eq!(connection.local, Some(Address::Inet("[::1]:53".parse().unwrap())));
        assert_eq!(connection.status, ConnectionStatus::None);
        assert_eq!(connection.fd, -1);
    }

    #[test]
    fn truncated_tables() {
        let mut bytes = table(&[ffi::UdpRowOwnerPid { dwLocalAddr: 0, dwLocalPort: 0, dwOwningPid: 1 }]);
        bytes[..4].copy_from_slice(&5u32.to_ne_bytes());
        assert_eq!(table_rows::<ffi::UdpRowOwnerPid>(&bytes).len(), 1);
        assert!(table_rows::<ffi::UdpRowOwnerPid>(&[]).is_empty());
    }

    #[test]
    fn states() {
        assert_eq!(tcp_state(11), ConnectionStatus::TimeWait);
        assert_eq!(tcp_state(12), ConnectionStatus::DeleteTcb);
        assert_eq!(tcp_state(0), ConnectionStatus::None);
    }
}
