//! ARP for IPv4-over-Ethernet (RFC 826): htype=1, ptype=0x0800, hlen=6,
//! plen=4.

use super::{htonl, htons, ntohl, ntohs, Truncated};

pub const ARP_PACKET_LEN: usize = 28;

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;
const HLEN_ETHERNET: u8 = 6;
const PLEN_IPV4: u8 = 4;

pub const OPER_REQUEST: u16 = 1;
pub const OPER_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub oper: u16,
    /// Sender hardware address.
    pub sha: [u8; 6],
    /// Sender protocol address.
    pub spa: u32,
    /// Target hardware address.
    pub tha: [u8; 6],
    /// Target protocol address.
    pub tpa: u32,
}

impl ArpPacket {
    pub fn pack(&self, buf: &mut [u8]) -> usize {
        buf[0..2].copy_from_slice(&htons(HTYPE_ETHERNET).to_ne_bytes());
        buf[2..4].copy_from_slice(&htons(PTYPE_IPV4).to_ne_bytes());
        buf[4] = HLEN_ETHERNET;
        buf[5] = PLEN_IPV4;
        buf[6..8].copy_from_slice(&htons(self.oper).to_ne_bytes());
        buf[8..14].copy_from_slice(&self.sha);
        buf[14..18].copy_from_slice(&htonl(self.spa).to_ne_bytes());
        buf[18..24].copy_from_slice(&self.tha);
        buf[24..28].copy_from_slice(&htonl(self.tpa).to_ne_bytes());
        ARP_PACKET_LEN
    }

    pub fn unpack(buf: &[u8]) -> Result<(Self, usize), Truncated> {
        if buf.len() < ARP_PACKET_LEN {
            return Err(Truncated);
        }
        let htype = ntohs(u16::from_ne_bytes([buf[0], buf[1]]));
        let ptype = ntohs(u16::from_ne_bytes([buf[2], buf[3]]));
        if htype != HTYPE_ETHERNET || ptype != PTYPE_IPV4 || buf[4] != HLEN_ETHERNET || buf[5] != PLEN_IPV4
        {
            return Err(Truncated);
        }
        let oper = ntohs(u16::from_ne_bytes([buf[6], buf[7]]));
        let mut sha = [0u8; 6];
        sha.copy_from_slice(&buf[8..14]);
        let spa = ntohl(u32::from_ne_bytes([buf[14], buf[15], buf[16], buf[17]]));
        let mut tha = [0u8; 6];
        tha.copy_from_slice(&buf[18..24]);
        let tpa = ntohl(u32::from_ne_bytes([buf[24], buf[25], buf[26], buf[27]]));
        Ok((
            Self {
                oper,
                sha,
                spa,
                tha,
                tpa,
            },
            ARP_PACKET_LEN,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let p = ArpPacket {
            oper: OPER_REPLY,
            sha: [0x52, 0x54, 0x00, 0x12, 0x34, 0x56],
            spa: 0x0A00_0001,
            tha: [1, 2, 3, 4, 5, 6],
            tpa: 0x0A00_0002,
        };
        let mut buf = [0u8; ARP_PACKET_LEN];
        p.pack(&mut buf);
        let (p2, n) = ArpPacket::unpack(&buf).unwrap();
        assert_eq!(n, ARP_PACKET_LEN);
        assert_eq!(p, p2);
    }

    #[test]
    fn rejects_non_ethernet_ipv4() {
        let mut buf = [0u8; ARP_PACKET_LEN];
        buf[1] = 6; // htype = 6, not 1
        assert_eq!(ArpPacket::unpack(&buf), Err(Truncated));
    }
}
