//! Socket enumeration from `/proc/net/*`, attributed to processes through their `fd` directories.

use std::{collections::HashMap, fs};

use super::PlatformImpl;
use crate::{
    classify::ClassifyExt as _,
    error::{Error, Result},
    filter::{AddressFamilies, ConnectionFilter, SocketTypes},
    platform::procfs::{io_error, net},
    types::{Address, Connection, ConnectionStatus, Pid},
};

/// `/proc/net` tables, with the family and type of the sockets they list.
const INET_TABLES: &[(&str, AddressFamilies, SocketTypes)] = &[
    ("net/tcp", AddressFamilies::Inet, SocketTypes::Stream),
    ("net/tcp6", AddressFamilies::Inet6, SocketTypes::Stream),
    ("net/udp", AddressFamilies::Inet, SocketTypes::Datagram),
    ("net/udp6", AddressFamilies::Inet6, SocketTypes::Datagram),
];

type Owners = HashMap<u64, Vec<(Pid, i32)>>;

/// Maps socket inodes to the `(pid, fd)` pairs holding them.
fn socket_owners(platform: &PlatformImpl, pid: Option<Pid>) -> Result<Owners> {
    let mut owners = Owners::new();

    match pid {
        Some(pid) => collect_fds(platform, pid, &mut owners).classify_for(platform, pid)?,
        None => {
            for pid in platform.procfs.pids()? {
                // Processes exit, or belong to someone else, while we walk them.
                if let Err(e) = collect_fds(platform, pid, &mut owners) {
                    platform.swallowed("socket owners", &e);
                }
            }
        }
    }

    Ok(owners)
}

fn collect_fds(platform: &PlatformImpl, pid: Pid, owners: &mut Owners) -> Result<()> {
    let dir = platform.procfs.pid_path(pid, "fd");
    let entries = fs::read_dir(&dir).map_err(|source| io_error("opendir", &dir, source))?;

    for entry in entries.filter_map(|entry| entry.ok()) {
        let Some(fd) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) else {
            continue;
        };
        // The descriptor may have been closed since listing.
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        if let Some(inode) = target.to_str().and_then(net::socket_inode) {
            owners.entry(inode).or_default().push((pid, fd));
        }
    }

    Ok(())
}

/// Sockets matching `filter`, system-wide or held by `pid`.
pub(super) fn connections(platform: &PlatformImpl, filter: ConnectionFilter, pid: Option<Pid>) -> Result<Vec<Connection>> {
    let owners = socket_owners(platform, pid)?;
    let mut connections = Vec::new();

    let mut emit = |inode: u64, template: Connection| match owners.get(&inode) {
        Some(holders) => {
            for &(owner, fd) in holders {
                connections.push(Connection {
                    fd,
                    pid: Some(owner),
                    ..template.clone()
                });
            }
        }
        // Sockets nobody visible holds only show up system-wide.
        None if pid.is_none() => connections.push(template),
        None => {}
    };

    for &(table, family, kind) in INET_TABLES {
        if !filter.matches(family, kind) {
            continue;
        }
        // Tables are missing when the kernel lacks IPv6.
        let Some(text) = read_table(platform, table)? else {
            continue;
        };
        for socket in net::parse_net_inet(&text, kind)? {
            emit(
                socket.inode,
                Connection {
                    fd: -1,
                    family,
                    kind,
                    local: Some(Address::Inet(socket.local)),
                    remote: socket.remote.map(Address::Inet),
                    status: socket.status,
                    pid: None,
                },
            );
        }
    }

    if filter.wants(AddressFamilies::Unix, SocketTypes::all_bits()) {
        if let Some(text) = read_table(platform, "net/unix")? {
            for socket in net::parse_net_unix(&text)? {
                if !filter.matches(AddressFamilies::Unix, socket.kind) {
                    continue;
                }
                emit(
                    socket.inode,
                    Connection {
                        fd: -1,
                        family: AddressFamilies::Unix,
                        kind: socket.kind,
                        local: Some(Address::Unix(socket.path)),
                        remote: None,
                        status: ConnectionStatus::None,
                        pid: None,
                    },
                );
            }
        }
    }

    Ok(connections)
}

fn read_table(platform: &PlatformImpl, table: &str) -> Result<Option<String>> {
    match platform.procfs.read(table) {
        Ok(text) => Ok(Some(text)),
        Err(Error::Os { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::context::BindingContext;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn fixture_tables_are_attributed_to_holders() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        write(
            &proc_root,
            "net/tcp",
            "  sl  local_address rem_address   st\n   0: 0100007F:0CEA 00000000:0000 0A 0:0 0:0 0 0 0 100 1\n   1: 0100007F:0050 00000000:0000 0A 0:0 0:0 0 0 0 200 1\n",
        );
        write(
            &proc_root,
            "net/unix",
            "Num RefCount Protocol Flags Type St Inode Path\n0: 2 0 0 0002 01 300 /run/log\n",
        );
        fs::create_dir_all(proc_root.join("42/fd")).unwrap();
        std::os::unix::fs::symlink("socket:[100]", proc_root.join("42/fd/3")).unwrap();
        std::os::unix::fs::symlink("/dev/null", proc_root.join("42/fd/0")).unwrap();

        let platform = PlatformImpl::new(BindingContext::builder().procfs_root(&proc_root).build());

        let all = connections(&platform, ConnectionFilter::all(), None).unwrap();
        assert_eq!(all.len(), 3);
        let held = all.iter().find(|c| c.pid == Some(42)).unwrap();
        assert_eq!(held.fd, 3);
        assert_eq!(held.status, ConnectionStatus::Listen);
        assert!(all.iter().any(|c| c.pid.is_none() && c.fd == -1 && c.kind == SocketTypes::Stream));

        let unix = connections(&platform, "unix".parse().unwrap(), None).unwrap();
        assert_eq!(unix.len(), 1);
        assert_eq!(unix[0].local, Some(Address::Unix("/run/log".to_string())));

        let udp = connections(&platform, "udp".parse().unwrap(), None).unwrap();
        assert!(udp.is_empty());
    }
}
