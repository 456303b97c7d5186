//! ARP resolution, plus a process-wide address→MAC cache shared across
//! connections instead of resolving each connection independently.

use std::collections::HashMap;

use crate::conn::ConnectionTable;
use crate::config::FIXED_IP;
use crate::driver::{Nic, Offload};
use crate::wire::{
    ArpPacket, EtherType, EthernetHeader, ARP_PACKET_LEN, BROADCAST_MAC, ETHERNET_HEADER_LEN,
    OPER_REPLY, OPER_REQUEST,
};

/// address → (MAC, last-updated ms), shared by every connection instead
/// of resolved independently per slot.
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: HashMap<u32, (([u8; 6]), u64)>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, addr: u32) -> Option<[u8; 6]> {
        self.entries.get(&addr).map(|(mac, _)| *mac)
    }

    pub fn insert(&mut self, addr: u32, mac: [u8; 6], now_ms: u64) {
        self.entries.insert(addr, (mac, now_ms));
    }
}

/// Builds and transmits the Ethernet+ARP frame for `packet`.
fn send_arp(nic: &mut Nic, dst_mac: [u8; 6], packet: &ArpPacket) {
    let mut buf = [0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];
    let eth = EthernetHeader {
        dst: dst_mac,
        src: nic.mac(),
        ethertype: EtherType::Arp,
    };
    eth.pack(&mut buf[..ETHERNET_HEADER_LEN]);
    packet.pack(&mut buf[ETHERNET_HEADER_LEN..]);
    // ARP carries no IP/UDP checksums to offload.
    let _ = nic.transmit(&buf, Offload::None);
}

/// Broadcasts an ARP request for `addr`.
pub fn arp_request(nic: &mut Nic, addr: u32) {
    log::debug!("ARP: broadcasting request for {addr:#010x}");
    let request = ArpPacket {
        oper: OPER_REQUEST,
        sha: nic.mac(),
        spa: FIXED_IP,
        tha: [0; 6],
        tpa: addr,
    };
    send_arp(nic, BROADCAST_MAC, &request);
}

/// Handles one parsed ARP packet: replies to requests
/// targeting our fixed IP, and on replies updates both the shared cache
/// and every matching connection's `dst_mac`. Returns the indices of
/// connection slots just resolved, so the caller can wake their waiters
/// after releasing whatever it needs to.
pub fn handle_arp(
    nic: &mut Nic,
    cache: &mut ArpCache,
    conns: &mut ConnectionTable,
    packet: &ArpPacket,
) -> Vec<usize> {
    if packet.tpa != FIXED_IP {
        return Vec::new();
    }

    match packet.oper {
        OPER_REPLY => {
            log::info!(
                "ARP: {:#010x} is at {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                packet.spa,
                packet.sha[0], packet.sha[1], packet.sha[2],
                packet.sha[3], packet.sha[4], packet.sha[5]
            );
            cache.insert(packet.spa, packet.sha, nic.hal_now_ms());
            conns.resolve_all(packet.spa, packet.sha)
        }
        OPER_REQUEST => {
            log::debug!("ARP: request for our IP from {:#010x}, replying", packet.spa);
            let reply = ArpPacket {
                oper: OPER_REPLY,
                sha: nic.mac(),
                spa: FIXED_IP,
                tha: packet.sha,
                tpa: packet.spa,
            };
            send_arp(nic, packet.sha, &reply);
            Vec::new()
        }
        _ => {
            log::debug!("dropping ARP packet: unknown oper {}", packet.oper);
            Vec::new()
        }
    }
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
    fn request_frame_is_broadcast() {
        let mut nic = boot();
        arp_request(&mut nic, 0x0A00_0001);
        assert!(nic.tx_ctx_written());
    }

    #[test]
    fn cache_updated_on_reply() {
        let mut nic = boot();
        let mut cache = ArpCache::new();
        let mut conns = ConnectionTable::new();
        let reply = ArpPacket {
            oper: OPER_REPLY,
            sha: [0xAA; 6],
            spa: 0x0A00_0001,
            tha: nic.mac(),
            tpa: FIXED_IP,
        };
        handle_arp(&mut nic, &mut cache, &mut conns, &reply);
        assert_eq!(cache.lookup(0x0A00_0001), Some([0xAA; 6]));
    }

    #[test]
    fn reply_for_other_ip_is_ignored() {
        let mut nic = boot();
        let mut cache = ArpCache::new();
        let mut conns = ConnectionTable::new();
        let reply = ArpPacket {
            oper: OPER_REPLY,
            sha: [0xAA; 6],
            spa: 0x0A00_0001,
            tha: nic.mac(),
            tpa: 0x0A00_0099,
        };
        handle_arp(&mut nic, &mut cache, &mut conns, &reply);
        assert_eq!(cache.lookup(0x0A00_0001), None);
    }
}
