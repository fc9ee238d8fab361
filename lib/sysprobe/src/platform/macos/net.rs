//! Interface counters from the `NET_RT_IFLIST2` routing table dump, which carries 64-bit counters.

use std::collections::BTreeMap;

use super::{ffi, PlatformImpl};
use crate::{
    buffer::read_record,
    error::Result,
    platform::bsdlike::sysctl,
    types::NetIoCounters,
};

/// Offsets into the `struct sockaddr_dl` following each interface header.
const SDL_NLEN: usize = 5;
const SDL_DATA: usize = 8;

/// Walks a routing message dump, keeping the `RTM_IFINFO2` messages.
fn parse_iflist2(bytes: &[u8]) -> BTreeMap<String, NetIoCounters> {
    let header_len = std::mem::size_of::<ffi::if_msghdr2>();
    let mut counters = BTreeMap::new();
    let mut offset = 0;

    while let Some(msglen) = read_record::<u16>(bytes, offset) {
        let msglen = msglen as usize;
        if msglen == 0 {
            break;
        }
        let message = &bytes[offset..(offset + msglen).min(bytes.len())];
        offset += msglen;

        let Some(header) = read_record::<ffi::if_msghdr2>(message, 0) else {
            continue;
        };
        if header.ifm_type != ffi::RTM_IFINFO2 {
            continue;
        }

        let Some(&nlen) = message.get(header_len + SDL_NLEN) else {
            continue;
        };
        let name_start = header_len + SDL_DATA;
        let Some(name) = message.get(name_start..name_start + nlen as usize) else {
            continue;
        };

        let data = header.ifm_data;
        counters.insert(
            String::from_utf8_lossy(name).into_owned(),
            NetIoCounters {
                bytes_sent: data.ifi_obytes,
                bytes_recv: data.ifi_ibytes,
                packets_sent: data.ifi_opackets,
                packets_recv: data.ifi_ipackets,
                errin: data.ifi_ierrors,
                errout: data.ifi_oerrors,
                dropin: data.ifi_iqdrops,
                dropout: 0,
            },
        );
    }

    counters
}

pub(super) fn io_counters(platform: &PlatformImpl) -> Result<BTreeMap<String, NetIoCounters>> {
    let mib = [libc::CTL_NET, libc::PF_ROUTE, 0, 0, ffi::NET_RT_IFLIST2, 0];
    let bytes = sysctl::read_bytes(platform.context.buffer_policy(), &mib, "sysctl(net.route.iflist2)")?;
    Ok(parse_iflist2(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BindingContext;

    fn interface_message(name: &str, ibytes: u64, obytes: u64) -> Vec<u8> {
        // SAFETY: The header is plain old data.
        let mut header: ffi::if_msghdr2 = unsafe { std::mem::zeroed() };
        let header_len = std::mem::size_of::<ffi::if_msghdr2>();
        header.ifm_msglen = (header_len + SDL_DATA + name.len()) as u16;
        header.ifm_type = ffi::RTM_IFINFO2;
        header.ifm_data.ifi_ibytes = ibytes;
        header.ifm_data.ifi_obytes = obytes;
        header.ifm_data.ifi_ipackets = 7;

        // SAFETY: `header` is `header_len` bytes of plain old data.
        let mut message =
            unsafe { std::slice::from_raw_parts(&header as *const ffi::if_msghdr2 as *const u8, header_len) }.to_vec();
        let mut sockaddr = vec![0u8; SDL_DATA];
        sockaddr[SDL_NLEN] = name.len() as u8;
        message.extend_from_slice(&sockaddr);
        message.extend_from_slice(name.as_bytes());
        message
    }

    #[test]
    fn skips_address_messages() {
        let mut dump = interface_message("lo0", 100, 100);
        // An `RTM_NEWADDR` message.
        dump.extend_from_slice(&[8, 0, 5, 0x0c, 0, 0, 0, 0]);
        dump.extend_from_slice(&interface_message("en0", 1234, 5678));

        let counters = parse_iflist2(&dump);
        assert_eq!(counters.len(), 2);
        let en0 = &counters["en0"];
        assert_eq!(en0.bytes_recv, 1234);
        assert_eq!(en0.bytes_sent, 5678);
        assert_eq!(en0.packets_recv, 7);
    }

    #[test]
    fn truncated_dump() {
        let dump = interface_message("en0", 1, 1);
        assert!(parse_iflist2(&dump[..40]).is_empty());
        assert!(parse_iflist2(&[]).is_empty());
    }

    #[test]
    fn live_loopback() {
        let platform = PlatformImpl::new(BindingContext::builder().build());
        assert!(io_counters(&platform).unwrap().contains_key("lo0"));
    }
}
