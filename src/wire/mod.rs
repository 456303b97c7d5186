//! Byte-order conversion and per-header pack/unpack routines for
//! Ethernet, ARP, IPv4, and UDP.
//!
//! Every multi-byte wire field is big-endian ("network byte order").
//! Each header type exposes `pack`/`unpack` pairs operating on fixed-size
//! byte arrays at exact wire offsets, independent of any host struct
//! layout.

mod arp;
mod endian;
mod ethernet;
mod ipv4;
mod udp;

pub use arp::{ArpPacket, ARP_PACKET_LEN, OPER_REPLY, OPER_REQUEST};
pub use endian::{htonl, htons, ntohl, ntohs};
pub use ethernet::{EtherType, EthernetHeader, BROADCAST_MAC, ETHERNET_HEADER_LEN};
pub use ipv4::{Ipv4Header, IPV4_HEADER_LEN, PROTO_UDP};
pub use udp::{UdpHeader, UDP_HEADER_LEN};

/// A parse failure in one of the wire codecs. These are never propagated
/// to callers of the syscall surface; ingress code counts and drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated;
