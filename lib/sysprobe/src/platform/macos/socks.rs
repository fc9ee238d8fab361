//! Socket enumeration through `PROC_PIDFDSOCKETINFO`, one process at a time.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::{ffi, proc, PlatformImpl};
use crate::{
    error::Result,
    filter::{AddressFamilies, ConnectionFilter},
    platform::bsdlike::sockets::{family_of, is_unset, kind_of, unix_path},
    types::{Address, Connection, ConnectionStatus, Pid},
};

fn inet_address(addr: &ffi::in_sockinfo_addr, port: libc::c_int, family: AddressFamilies) -> SocketAddr {
    // Ports are stored in network byte order.
    let port = u16::from_be(port as u16);
    // SAFETY: Both union members are plain byte arrays covering the same storage.
    let ip = unsafe {
        if family == AddressFamilies::Inet {
            IpAddr::V4(Ipv4Addr::from(addr.ina_46.i46a_addr4))
        } else {
            IpAddr::V6(Ipv6Addr::from(addr.ina_6))
        }
    };
    SocketAddr::new(ip, port)
}

fn connection_from(info: &ffi::socket_info, fd: i32, pid: Pid, filter: &ConnectionFilter) -> Option<Connection> {
    let family = family_of(info.soi_family)?;
    let kind = kind_of(info.soi_type)?;
    if !filter.matches(family, kind) {
        return None;
    }

    let (local, remote, status) = if family == AddressFamilies::Unix {
        if info.soi_kind != ffi::SOCKINFO_UN {
            return None;
        }
        // SAFETY: `soi_kind` says the UNIX member is the live one.
        let un = unsafe { info.soi_proto.pri_un };
        let local = unix_path(&un.unsi_addr);
        let remote = unix_path(&un.unsi_caddr);
        (
            Some(Address::Unix(local)),
            (!remote.is_empty()).then_some(Address::Unix(remote)),
            ConnectionStatus::None,
        )
    } else {
        // SAFETY: `soi_kind` says which member is live, and the TCP one starts with the generic one.
        let (ini, status) = unsafe {
            match info.soi_kind {
                ffi::SOCKINFO_TCP => (
                    info.soi_proto.pri_tcp.tcpsi_ini,
                    ConnectionStatus::from_bsd_tcp_state(info.soi_proto.pri_tcp.tcpsi_state),
                ),
                ffi::SOCKINFO_IN => (info.soi_proto.pri_in, ConnectionStatus::None),
                _ => return None,
            }
        };
        let local = inet_address(&ini.insi_laddr, ini.insi_lport, family);
        let remote = inet_address(&ini.insi_faddr, ini.insi_fport, family);
        (
            Some(Address::Inet(local)),
            Some(Address::Inet(remote)).filter(|remote| !is_unset(remote)),
            status,
        )
    };

    Some(Connection {
        fd,
        family,
        kind,
        local,
        remote,
        status,
        pid: Some(pid),
    })
}

pub(super) fn process_connections(platform: &PlatformImpl, pid: Pid, filter: ConnectionFilter) -> Result<Vec<Connection>> {
    let mut connections = Vec::new();
    for fd in proc::list_fds(platform, pid)? {
        if fd.proc_fdtype != ffi::PROX_FDTYPE_SOCKET {
            continue;
        }
        let Some(info) = proc::fd_info::<ffi::socket_fdinfo>(
            platform,
            pid,
            fd.proc_fd,
            ffi::PROC_PIDFDSOCKETINFO,
            "proc_pidfdinfo(PROC_PIDFDSOCKETINFO)",
        )?
        else {
            continue;
        };
        if let Some(connection) = connection_from(&info.psi, fd.proc_fd, pid, &filter) {
            connections.push(connection);
        }
    }
    Ok(connections)
}

/// Sockets of every process we're allowed to inspect.
pub(super) fn system_connections(platform: &PlatformImpl, filter: ConnectionFilter) -> Result<Vec<Connection>> {
    let mut connections = Vec::new();
    for pid in proc::pids(platform)? {
        // Processes exit, or belong to someone else, while we walk them.
        match process_connections(platform, pid, filter) {
            Ok(found) => connections.extend(found),
            Err(e) => platform.swallowed("process connections", &e),
        }
    }
    Ok(connections)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::{context::BindingContext, filter::SocketTypes};

    #[test]
    fn finds_own_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let platform = PlatformImpl::new(BindingContext::builder().build());
        let pid = std::process::id() as Pid;

        let connections = process_connections(&platform, pid, "tcp4".parse().unwrap()).unwrap();
        let found = connections
            .iter()
            .find(|c| matches!(c.local, Some(Address::Inet(addr)) if addr.port() == port))
            .unwrap();
        assert_eq!(found.status, ConnectionStatus::Listen);
        assert_eq!(found.remote, None);
        assert_eq!(found.pid, Some(pid));

        let udp_only = process_connections(&platform, pid, "udp".parse().unwrap()).unwrap();
        assert!(udp_only.iter().all(|c| c.kind == SocketTypes::Datagram));
    }
}
