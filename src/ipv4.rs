use std::net::Ipv4Addr;
use std::sync::Arc;

use etherparse::{Ipv4Header, Ipv4HeaderSlice};
use log::trace;

use crate::arp::Arp;
use crate::err::Error;
use crate::link::{Link, ETHERTYPE_IPV4};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;

const TTL: u8 = 32;

/// What the transport layers know about the layer below them: one send.
/// Keeping it a trait lets the TCP core run against a captured wire.
pub trait IpSender: Send + Sync {
    fn send(&self, src: Option<Ipv4Addr>, dst: Ipv4Addr, proto: u8, bytes: &[u8])
        -> Result<(), Error>;
}

/// Splits an IPv4 packet into `(header, payload)`. The payload is bounded
/// by `total_len`; Ethernet pads short frames and the padding must not leak
/// into the transport layer.
pub fn parse(buf: &[u8]) -> Result<(Ipv4HeaderSlice<'_>, &[u8]), Error> {
    let hdr = Ipv4HeaderSlice::from_slice(buf)?;

    let start = (hdr.ihl() * 4) as usize;
    let end = hdr.total_len() as usize;
    if end < start || end > buf.len() {
        return Err(Error::Truncated);
    }

    Ok((hdr, &buf[start..end]))
}

/// The IPv4 layer: framing, checksum and routing on the way down.
pub struct Ipv4 {
    link: Arc<Link>,
    arp: Arc<Arp>,
    addr: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
}

impl Ipv4 {
    pub fn new(
        link: Arc<Link>,
        arp: Arc<Arp>,
        addr: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Self {
        Ipv4 {
            link,
            arp,
            addr,
            netmask,
            gateway,
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// On-subnet destinations are next hops themselves; everything else
    /// goes through the gateway.
    fn route(&self, dst: Ipv4Addr) -> Ipv4Addr {
        let mask = u32::from(self.netmask);
        if u32::from(dst) & mask == u32::from(self.addr) & mask {
            dst
        } else {
            self.gateway
        }
    }
}

impl IpSender for Ipv4 {
    fn send(
        &self,
        src: Option<Ipv4Addr>,
        dst: Ipv4Addr,
        proto: u8,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let next_hop = self.route(dst);
        let hw = self.arp.resolve(next_hop)?;

        let src = src.unwrap_or(self.addr);
        let hdr = Ipv4Header::new(bytes.len() as u16, TTL, proto, src.octets(), dst.octets());

        let mut packet = Vec::with_capacity(20 + bytes.len());
        hdr.write(&mut packet).unwrap();
        packet.extend_from_slice(bytes);

        trace!("tx {} -> {} proto={} len={}", src, dst, proto, bytes.len());
        self.link.send(hw, ETHERTYPE_IPV4, &packet)
    }
}
