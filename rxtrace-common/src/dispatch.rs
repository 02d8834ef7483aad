//! Fixed-depth Ethernet → IPv4 → TCP/UDP walk.
//!
//! Straight-line early returns only: every step that cannot proceed stops and
//! hands back what was extracted so far. Nothing here is an error.

use network_types::{eth::EthHdr, ip::Ipv4Hdr, tcp::TcpHdr, udp::UdpHdr};

use crate::{
    cursor::{Field, Frame, Header, HeaderCursor},
    event::{IPPROTO_TCP, IPPROTO_UDP},
    hash::flow_hash,
};

const ETH_P_IP: u16 = 0x0800;
const IP_OFFSET_MASK: u16 = 0x1fff;

pub enum Ethernet {}
pub enum Ipv4 {}
pub enum Tcp {}
pub enum Udp {}

impl Header for Ethernet {
    const LEN: usize = EthHdr::LEN;
}

impl Header for Ipv4 {
    const LEN: usize = Ipv4Hdr::LEN;
}

impl Header for Tcp {
    const LEN: usize = TcpHdr::LEN;
}

impl Header for Udp {
    const LEN: usize = UdpHdr::LEN;
}

// Offsets follow IEEE 802.3, RFC 791, RFC 9293 and RFC 768.
const ETHER_TYPE: Field<Ethernet, u16> = Field::at(12);
const IPV4_VERSION_IHL: Field<Ipv4, u8> = Field::at(0);
const IPV4_FRAG_OFF: Field<Ipv4, u16> = Field::at(6);
const IPV4_PROTO: Field<Ipv4, u8> = Field::at(9);
const IPV4_SRC: Field<Ipv4, u32> = Field::at(12);
const IPV4_DST: Field<Ipv4, u32> = Field::at(16);
const TCP_SRC_PORT: Field<Tcp, u16> = Field::at(0);
const TCP_DST_PORT: Field<Tcp, u16> = Field::at(2);
const UDP_SRC_PORT: Field<Udp, u16> = Field::at(0);
const UDP_DST_PORT: Field<Udp, u16> = Field::at(2);

/// What the dispatcher could extract. Unreached fields stay zero.
///
/// Addresses and ports keep their wire byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowTuple {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowTuple {
    pub const EMPTY: FlowTuple = FlowTuple {
        src_addr: 0,
        dst_addr: 0,
        src_port: 0,
        dst_port: 0,
        protocol: 0,
    };

    #[inline(always)]
    pub fn correlation_key(&self) -> u32 {
        flow_hash(self.src_addr, self.dst_addr, self.protocol)
    }
}

/// Walks a frame that starts at the Ethernet header.
#[inline(always)]
pub fn dispatch_link<F: Frame>(cursor: &HeaderCursor<'_, F>) -> FlowTuple {
    let Some(eth) = cursor.header::<Ethernet>(0) else {
        return FlowTuple::EMPTY;
    };
    match eth.get(ETHER_TYPE) {
        Some(ether_type) if ether_type == ETH_P_IP.to_be() => {}
        _ => return FlowTuple::EMPTY,
    }
    dispatch_network(cursor, eth.end())
}

/// Walks from an IPv4 header at `offset`.
#[inline(always)]
pub fn dispatch_network<F: Frame>(cursor: &HeaderCursor<'_, F>, offset: usize) -> FlowTuple {
    let mut tuple = FlowTuple::EMPTY;

    let Some(ip) = cursor.header::<Ipv4>(offset) else {
        return tuple;
    };
    let Some(version_ihl) = ip.get(IPV4_VERSION_IHL) else {
        return tuple;
    };
    let ihl = (version_ihl & 0x0f) as usize;
    if version_ihl >> 4 != 4 || ihl < 5 {
        return tuple;
    }
    let (Some(src_addr), Some(dst_addr), Some(protocol), Some(frag_off)) = (
        ip.get(IPV4_SRC),
        ip.get(IPV4_DST),
        ip.get(IPV4_PROTO),
        ip.get(IPV4_FRAG_OFF),
    ) else {
        return tuple;
    };
    tuple.src_addr = src_addr;
    tuple.dst_addr = dst_addr;
    tuple.protocol = protocol;

    // Later fragments have no transport header.
    if u16::from_be(frag_off) & IP_OFFSET_MASK != 0 {
        return tuple;
    }

    let transport = offset + ihl * 4;
    match protocol {
        IPPROTO_TCP => {
            if let Some(tcp) = cursor.header::<Tcp>(transport) {
                if let (Some(src), Some(dst)) = (tcp.get(TCP_SRC_PORT), tcp.get(TCP_DST_PORT)) {
                    tuple.src_port = src;
                    tuple.dst_port = dst;
                }
            }
        }
        IPPROTO_UDP => {
            if let Some(udp) = cursor.header::<Udp>(transport) {
                if let (Some(src), Some(dst)) = (udp.get(UDP_SRC_PORT), udp.get(UDP_DST_PORT)) {
                    tuple.src_port = src;
                    tuple.dst_port = dst;
                }
            }
        }
        _ => {}
    }

    tuple
}
