//! Connection filters.
//!
//! A connection query takes a set of address families and a set of socket types, and only reports sockets matching
//! both. Both sets are bitmasks, so membership checks are a single `contains`.

use std::{fmt, str::FromStr};

use bitmask_enum::bitmask;

use crate::error::{Error, Result};

/// Socket address families.
#[bitmask(u8)]
#[bitmask_config(vec_debug)]
pub enum AddressFamilies {
    /// IPv4.
    Inet,

    /// IPv6.
    Inet6,

    /// UNIX domain sockets.
    Unix,
}

impl Default for AddressFamilies {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for AddressFamilies {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut families = Vec::new();

        if self.contains(Self::Inet) {
            families.push("inet");
        }

        if self.contains(Self::Inet6) {
            families.push("inet6");
        }

        if self.contains(Self::Unix) {
            families.push("unix");
        }

        write!(f, "{}", families.join("|"))
    }
}

/// Socket types.
#[bitmask(u8)]
#[bitmask_config(vec_debug)]
pub enum SocketTypes {
    /// Stream sockets (TCP).
    Stream,

    /// Datagram sockets (UDP).
    Datagram,

    /// Sequenced packet sockets.
    SeqPacket,
}

impl Default for SocketTypes {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for SocketTypes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut types = Vec::new();

        if self.contains(Self::Stream) {
            types.push("stream");
        }

        if self.contains(Self::Datagram) {
            types.push("dgram");
        }

        if self.contains(Self::SeqPacket) {
            types.push("seqpacket");
        }

        write!(f, "{}", types.join("|"))
    }
}

/// Which sockets a connection query reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionFilter {
    families: AddressFamilies,
    types: SocketTypes,
}

impl ConnectionFilter {
    /// Creates a filter matching sockets in any of `families` with any of `types`.
    pub fn new(families: AddressFamilies, types: SocketTypes) -> Self {
        Self { families, types }
    }

    /// Matches every socket.
    pub fn all() -> Self {
        Self::new(AddressFamilies::all_bits(), SocketTypes::all_bits())
    }

    /// Matches TCP and UDP sockets over IPv4 and IPv6.
    pub fn inet() -> Self {
        Self::new(
            AddressFamilies::Inet | AddressFamilies::Inet6,
            SocketTypes::Stream | SocketTypes::Datagram,
        )
    }

    /// Address families accepted by this filter.
    pub fn families(&self) -> AddressFamilies {
        self.families
    }

    /// Socket types accepted by this filter.
    pub fn types(&self) -> SocketTypes {
        self.types
    }

    /// Returns `true` if a socket of this family and type passes the filter.
    pub fn matches(&self, family: AddressFamilies, kind: SocketTypes) -> bool {
        self.families.contains(family) && self.types.contains(kind)
    }

    /// Returns `true` if any socket of this family could pass the filter.
    ///
    /// Used to skip whole kernel tables, such as `/proc/net/tcp6`, up front.
    pub fn wants(&self, family: AddressFamilies, kind: SocketTypes) -> bool {
        self.families.intersects(family) && self.types.intersects(kind)
    }
}

impl Default for ConnectionFilter {
    fn default() -> Self {
        Self::inet()
    }
}

impl FromStr for ConnectionFilter {
    type Err = Error;

    /// Parses the conventional connection kind names: `inet`, `inet4`, `inet6`, `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`,
    /// `udp6`, `unix` and `all`.
    fn from_str(kind: &str) -> Result<Self> {
        let ipv4 = AddressFamilies::Inet;
        let ipv6 = AddressFamilies::Inet6;
        let tcp = SocketTypes::Stream;
        let udp = SocketTypes::Datagram;

        let filter = match kind {
            "all" => Self::all(),
            "inet" => Self::inet(),
            "inet4" => Self::new(ipv4, tcp | udp),
            "inet6" => Self::new(ipv6, tcp | udp),
            "tcp" => Self::new(ipv4 | ipv6, tcp),
            "tcp4" => Self::new(ipv4, tcp),
            "tcp6" => Self::new(ipv6, tcp),
            "udp" => Self::new(ipv4 | ipv6, udp),
            "udp4" => Self::new(ipv4, udp),
            "udp6" => Self::new(ipv6, udp),
            "unix" => Self::new(AddressFamilies::Unix, SocketTypes::all_bits()),
            other => return Err(Error::unsupported(format!("connection kind `{}`", other))),
        };
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let tcp4: ConnectionFilter = "tcp4".parse().unwrap();
        assert!(tcp4.matches(AddressFamilies::Inet, SocketTypes::Stream));
        assert!(!tcp4.matches(AddressFamilies::Inet6, SocketTypes::Stream));
        assert!(!tcp4.matches(AddressFamilies::Inet, SocketTypes::Datagram));

        let unix: ConnectionFilter = "unix".parse().unwrap();
        assert!(unix.matches(AddressFamilies::Unix, SocketTypes::Datagram));
        assert!(!unix.matches(AddressFamilies::Inet, SocketTypes::Stream));

        let all: ConnectionFilter = "all".parse().unwrap();
        assert!(all.matches(AddressFamilies::Unix, SocketTypes::SeqPacket));

        assert!("sctp".parse::<ConnectionFilter>().is_err());
    }

    #[test]
    fn default_is_inet() {
        let filter = ConnectionFilter::default();
        assert!(filter.matches(AddressFamilies::Inet6, SocketTypes::Datagram));
        assert!(!filter.matches(AddressFamilies::Unix, SocketTypes::Stream));
    }

    #[test]
    fn wants_whole_tables() {
        let udp6: ConnectionFilter = "udp6".parse().unwrap();
        assert!(udp6.wants(AddressFamilies::Inet6, SocketTypes::Datagram));
        assert!(!udp6.wants(AddressFamilies::Inet | AddressFamilies::Inet6, SocketTypes::Stream));
        assert!(!udp6.wants(AddressFamilies::Inet, SocketTypes::Datagram));
    }

    #[test]
    fn all_covers_every_flag() {
        let all = ConnectionFilter::all();
        for family in [AddressFamilies::Inet, AddressFamilies::Inet6, AddressFamilies::Unix] {
            for kind in [SocketTypes::Stream, SocketTypes::Datagram, SocketTypes::SeqPacket] {
                assert!(all.matches(family, kind));
            }
        }
        assert_eq!(all.families().to_string(), "inet|inet6|unix");
        assert_eq!(all.types().to_string(), "stream|dgram|seqpacket");
    }

    #[test]
    fn display() {
        assert_eq!(AddressFamilies::Inet6.to_string(), "inet6");
        assert_eq!((SocketTypes::Stream | SocketTypes::Datagram).to_string(), "stream|dgram");
    }
}
