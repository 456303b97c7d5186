//! IPv4 without options (20-byte header).

use super::{htons, ntohs, Truncated};

pub const IPV4_HEADER_LEN: usize = 20;

pub const PROTO_UDP: u8 = 0x11;

const VERSION_IHL: u8 = (4 << 4) | 5; // version=4, IHL=5 (no options)
const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: u32,
    pub dst: u32,
}

impl Ipv4Header {
    /// Builds a header for a UDP datagram carrying `payload_len` bytes.
    /// Checksum is left as zero on the wire — egress checksumming is
    /// hardware-offloaded via the TX context descriptor.
    pub fn for_udp(src: u32, dst: u32, id: u16, payload_len: u16) -> Self {
        Self {
            tos: 0,
            total_len: IPV4_HEADER_LEN as u16 + 8 + payload_len,
            id,
            ttl: DEFAULT_TTL,
            protocol: PROTO_UDP,
            src,
            dst,
        }
    }

    pub fn pack(&self, buf: &mut [u8]) -> usize {
        buf[0] = VERSION_IHL;
        buf[1] = self.tos;
        buf[2..4].copy_from_slice(&htons(self.total_len).to_ne_bytes());
        buf[4..6].copy_from_slice(&htons(self.id).to_ne_bytes());
        buf[6..8].copy_from_slice(&htons(0).to_ne_bytes()); // frag_off = 0
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        buf[10..12].copy_from_slice(&htons(0).to_ne_bytes()); // checksum, offloaded
        buf[12..16].copy_from_slice(&super::htonl(self.src).to_ne_bytes());
        buf[16..20].copy_from_slice(&super::htonl(self.dst).to_ne_bytes());
        IPV4_HEADER_LEN
    }

    pub fn unpack(buf: &[u8]) -> Result<(Self, usize), Truncated> {
        if buf.len() < IPV4_HEADER_LEN {
            return Err(Truncated);
        }
        let version = buf[0] >> 4;
        let ihl = buf[0] & 0x0F;
        if version != 4 || ihl != 5 {
            return Err(Truncated);
        }
        let total_len = ntohs(u16::from_ne_bytes([buf[2], buf[3]]));
        let id = ntohs(u16::from_ne_bytes([buf[4], buf[5]]));
        let ttl = buf[8];
        let protocol = buf[9];
        let src = super::ntohl(u32::from_ne_bytes([buf[12], buf[13], buf[14], buf[15]]));
        let dst = super::ntohl(u32::from_ne_bytes([buf[16], buf[17], buf[18], buf[19]]));
        Ok((
            Self {
                tos: buf[1],
                total_len,
                id,
                ttl,
                protocol,
                src,
                dst,
            },
            IPV4_HEADER_LEN,
        ))
    }
}
