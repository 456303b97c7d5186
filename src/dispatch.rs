//! Ingress demultiplexing and egress frame assembly.

use crate::arp;
use crate::config::FIXED_IP;
use crate::conn::{self, ConnectionTable};
use crate::driver::{Nic, Offload};
use crate::wire::{
    EtherType, EthernetHeader, Ipv4Header, UdpHeader, ETHERNET_HEADER_LEN, IPV4_HEADER_LEN,
    PROTO_UDP, UDP_HEADER_LEN,
};

/// Outcome of dispatching one ingress frame. `wakes` names the
/// connection slots whose arrival or ARP resolution should be signaled
/// to waiters. `dropped` is true only for frames that are genuinely
/// discarded (truncated/malformed headers, wrong destination IP, an
/// unhandled protocol, or a UDP datagram with no connection on its
/// port) — not for ARP traffic the stack successfully acted on but that
/// happens to have nobody to wake, such as replying to a request or
/// recording a reply against no (or an already-resolved) connection.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Dispatched {
    pub wakes: Vec<usize>,
    pub dropped: bool,
}

impl Dispatched {
    fn handled(wakes: Vec<usize>) -> Self {
        Self { wakes, dropped: false }
    }

    fn dropped() -> Self {
        Self { wakes: Vec::new(), dropped: true }
    }
}

/// Parses one ingress frame and routes it; internal parse/drop errors
/// never propagate to callers, they're only reflected in the returned
/// [`Dispatched::dropped`] flag.
pub fn handle_frame(
    nic: &mut Nic,
    cache: &mut arp::ArpCache,
    conns: &mut ConnectionTable,
    buf: &[u8],
) -> Dispatched {
    let Ok((eth, consumed)) = EthernetHeader::unpack(buf) else {
        log::debug!("dropping frame: truncated Ethernet header ({} bytes)", buf.len());
        return Dispatched::dropped();
    };
    let rest = &buf[consumed..];

    match eth.ethertype {
        EtherType::Arp => {
            let Ok((packet, _)) = crate::wire::ArpPacket::unpack(rest) else {
                log::debug!("dropping frame: malformed ARP packet");
                return Dispatched::dropped();
            };
            // Replying to a request, or recording a reply against no
            // matching connection, is still "handled" — only a genuinely
            // malformed packet counts as dropped.
            Dispatched::handled(arp::handle_arp(nic, cache, conns, &packet))
        }
        EtherType::Ipv4 => {
            let Ok((ip, ip_len)) = Ipv4Header::unpack(rest) else {
                log::debug!("dropping frame: malformed IPv4 header");
                return Dispatched::dropped();
            };
            if ip.dst != FIXED_IP {
                log::debug!("dropping frame: not addressed to us (dst={:#010x})", ip.dst);
                return Dispatched::dropped();
            }
            if ip.protocol != PROTO_UDP {
                log::trace!("dropping frame: unhandled IP protocol {:#04x}", ip.protocol);
                return Dispatched::dropped();
            }
            let udp_rest = &rest[ip_len..];
            let Ok((udp, udp_len)) = UdpHeader::unpack(udp_rest) else {
                log::debug!("dropping frame: malformed UDP header");
                return Dispatched::dropped();
            };
            // udp.len (header + payload) bounds the payload explicitly;
            // anything past it is Ethernet minimum-frame padding, not data.
            let Some(payload_len) = (udp.len as usize).checked_sub(UDP_HEADER_LEN) else {
                log::debug!("dropping frame: UDP length {} shorter than header", udp.len);
                return Dispatched::dropped();
            };
            let Some(payload) = udp_rest.get(udp_len..udp_len + payload_len) else {
                log::debug!("dropping frame: UDP length {} exceeds frame", udp.len);
                return Dispatched::dropped();
            };
            match conns.deliver_udp(udp.dst_port, payload) {
                Some(fd) => Dispatched::handled(vec![fd]),
                None => {
                    log::debug!("dropping datagram: no connection on port {}", udp.dst_port);
                    Dispatched::dropped()
                }
            }
        }
        EtherType::Other(_) => Dispatched::dropped(),
    }
}

/// Builds one Ethernet/IPv4/UDP frame carrying `payload`.
pub fn build_udp_frame(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: u32,
    dst_ip: u32,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut buf = vec![0u8; total];

    let eth = EthernetHeader {
        dst: dst_mac,
        src: src_mac,
        ethertype: EtherType::Ipv4,
    };
    let mut off = eth.pack(&mut buf);

    let ip = Ipv4Header::for_udp(src_ip, dst_ip, 0, (UDP_HEADER_LEN + payload.len()) as u16);
    off += ip.pack(&mut buf[off..]);

    let udp = UdpHeader::new(src_port, dst_port, payload.len() as u16);
    off += udp.pack(&mut buf[off..]);

    buf[off..].copy_from_slice(payload);
    buf
}

/// Egress for one connection `write`. Assembles the frame and hands it
/// to the NIC with UDP checksum offload enabled.
pub fn send_udp(
    nic: &mut Nic,
    local_mac: [u8; 6],
    remote_mac: [u8; 6],
    local_addr: u32,
    remote_addr: u32,
    local_port_slot: usize,
    remote_port: u16,
    payload: &[u8],
) -> crate::error::NetResult<()> {
    let frame = build_udp_frame(
        local_mac,
        remote_mac,
        local_addr,
        remote_addr,
        conn::local_port(local_port_slot),
        remote_port,
        payload,
    );
    nic.transmit(&frame, Offload::UdpChecksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::fake::FakeHal;
    use std::sync::Arc;

    fn boot() -> Nic {
        let _ = env_logger::try_init();
        let hal: Arc<dyn crate::hal::Hal> = Arc::new(FakeHal::new([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]));
        Nic::init(hal).unwrap()
    }

    #[test]
    fn udp_frame_matches_expected_shape() {
        let frame = build_udp_frame(
            [0x52, 0x54, 0x00, 0x12, 0x34, 0x56],
            [1, 2, 3, 4, 5, 6],
            0x0A00_0002,
            0x0A00_0001,
            3000,
            5000,
            b"hello, world",
        );
        assert_eq!(frame[12..14], [0x08, 0x00]);
        let (ip, ip_len) = Ipv4Header::unpack(&frame[ETHERNET_HEADER_LEN..]).unwrap();
        assert_eq!(ip.total_len, 40);
        assert_eq!(ip.protocol, PROTO_UDP);
        let (udp, udp_len) =
            UdpHeader::unpack(&frame[ETHERNET_HEADER_LEN + ip_len..]).unwrap();
        assert_eq!(udp.len, 20);
        let payload_off = ETHERNET_HEADER_LEN + ip_len + udp_len;
        assert_eq!(&frame[payload_off..], b"hello, world");
    }

    #[test]
    fn frame_to_wrong_dst_ip_is_dropped() {
        let mut nic = boot();
        let mut cache = arp::ArpCache::new();
        let mut conns = ConnectionTable::new();
        let fd = conns.allocate(0x0A00_0001, 5000).unwrap();
        conns.resolve_all(0x0A00_0001, [0xAA; 6]);
        let frame = build_udp_frame(
            [1; 6],
            nic.mac(),
            0x0A00_0001,
            0x0A00_0003,
            5000,
            conn::local_port(fd),
            b"abc",
        );
        let outcome = handle_frame(&mut nic, &mut cache, &mut conns, &frame);
        assert!(outcome.wakes.is_empty());
        assert!(outcome.dropped);
        assert!(!conns.pending(fd).unwrap());
    }

    #[test]
    fn udp_datagram_delivered_to_connection() {
        let mut nic = boot();
        let mut cache = arp::ArpCache::new();
        let mut conns = ConnectionTable::new();
        let fd = conns.allocate(0x0A00_0001, 5000).unwrap();
        let port = conn::local_port(fd);
        let frame = build_udp_frame([1; 6], nic.mac(), 0x0A00_0001, FIXED_IP, 5000, port, b"abc");
        let outcome = handle_frame(&mut nic, &mut cache, &mut conns, &frame);
        assert_eq!(outcome.wakes, vec![fd]);
        assert!(!outcome.dropped);
        let mut out = [0u8; 16];
        let n = conns.read(fd, &mut out).unwrap();
        assert_eq!(&out[..n], b"abc");
    }

    #[test]
    fn trailing_padding_past_udp_len_is_not_delivered() {
        // Real frames below the Ethernet minimum get zero-padded by the
        // device; UDP's own length field, not the buffer's end, bounds
        // the payload.
        let mut nic = boot();
        let mut cache = arp::ArpCache::new();
        let mut conns = ConnectionTable::new();
        let fd = conns.allocate(0x0A00_0001, 5000).unwrap();
        let port = conn::local_port(fd);
        let mut frame = build_udp_frame([1; 6], nic.mac(), 0x0A00_0001, FIXED_IP, 5000, port, b"abc");
        frame.extend_from_slice(&[0u8; 20]);
        let outcome = handle_frame(&mut nic, &mut cache, &mut conns, &frame);
        assert_eq!(outcome.wakes, vec![fd]);
        let mut out = [0u8; 16];
        let n = conns.read(fd, &mut out).unwrap();
        assert_eq!(&out[..n], b"abc");
    }

    #[test]
    fn arp_reply_with_no_matching_connection_is_handled_not_dropped() {
        // A reply still populates the shared ARP cache even if nothing
        // is currently waiting on it, so it must not count as dropped.
        let mut nic = boot();
        let mut cache = arp::ArpCache::new();
        let mut conns = ConnectionTable::new();
        let reply = crate::wire::ArpPacket {
            oper: crate::wire::OPER_REPLY,
            sha: [0xAA; 6],
            spa: 0x0A00_0001,
            tha: nic.mac(),
            tpa: FIXED_IP,
        };
        let mut frame = vec![0u8; ETHERNET_HEADER_LEN + crate::wire::ARP_PACKET_LEN];
        let eth = EthernetHeader {
            dst: nic.mac(),
            src: reply.sha,
            ethertype: EtherType::Arp,
        };
        let off = eth.pack(&mut frame);
        reply.pack(&mut frame[off..]);

        let outcome = handle_frame(&mut nic, &mut cache, &mut conns, &frame);
        assert!(outcome.wakes.is_empty());
        assert!(!outcome.dropped);
        assert_eq!(cache.lookup(0x0A00_0001), Some([0xAA; 6]));
    }

    #[test]
    fn arp_request_is_handled_not_dropped() {
        let mut nic = boot();
        let mut cache = arp::ArpCache::new();
        let mut conns = ConnectionTable::new();
        let request = crate::wire::ArpPacket {
            oper: crate::wire::OPER_REQUEST,
            sha: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            spa: 0x0A00_0007,
            tha: [0; 6],
            tpa: FIXED_IP,
        };
        let mut frame = vec![0u8; ETHERNET_HEADER_LEN + crate::wire::ARP_PACKET_LEN];
        let eth = EthernetHeader {
            dst: nic.mac(),
            src: request.sha,
            ethertype: EtherType::Arp,
        };
        let off = eth.pack(&mut frame);
        request.pack(&mut frame[off..]);

        let outcome = handle_frame(&mut nic, &mut cache, &mut conns, &frame);
        assert!(outcome.wakes.is_empty());
        assert!(!outcome.dropped);
    }
}
