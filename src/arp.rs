use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::err::Error;
use crate::link::{Link, BROADCAST, ETHERTYPE_ARP, ETHERTYPE_IPV4};

const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;

const RESOLVE_ATTEMPTS: u32 = 3;
const RESOLVE_WAIT: Duration = Duration::from_secs(1);

/// The fixed Ethernet/IPv4 ARP body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Packet {
    op: u16,
    sender_hw: [u8; 6],
    sender_ip: Ipv4Addr,
    target_hw: [u8; 6],
    target_ip: Ipv4Addr,
}

impl Packet {
    fn pack(&self) -> [u8; 28] {
        let mut bytes = [0u8; 28];
        bytes[0..2].copy_from_slice(&1u16.to_be_bytes()); // Ethernet
        bytes[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        bytes[4] = 6;
        bytes[5] = 4;
        bytes[6..8].copy_from_slice(&self.op.to_be_bytes());
        bytes[8..14].copy_from_slice(&self.sender_hw);
        bytes[14..18].copy_from_slice(&self.sender_ip.octets());
        bytes[18..24].copy_from_slice(&self.target_hw);
        bytes[24..28].copy_from_slice(&self.target_ip.octets());
        bytes
    }

    fn unpack(payload: &[u8]) -> Option<Packet> {
        if payload.len() < 28 {
            return None;
        }
        // Ethernet hardware, IPv4 protocol, nothing else
        if payload[0..2] != 1u16.to_be_bytes()
            || payload[2..4] != ETHERTYPE_IPV4.to_be_bytes()
            || payload[4] != 6
            || payload[5] != 4
        {
            return None;
        }

        Some(Packet {
            op: u16::from_be_bytes([payload[6], payload[7]]),
            sender_hw: payload[8..14].try_into().unwrap(),
            sender_ip: Ipv4Addr::new(payload[14], payload[15], payload[16], payload[17]),
            target_hw: payload[18..24].try_into().unwrap(),
            target_ip: Ipv4Addr::new(payload[24], payload[25], payload[26], payload[27]),
        })
    }
}

/// Address resolution for the stack: a learned cache, a blocking `resolve`,
/// and replies for whoever asks about our address.
pub struct Arp {
    link: Arc<Link>,
    addr: Ipv4Addr,
    cache: Mutex<HashMap<Ipv4Addr, [u8; 6]>>,
    resolved: Condvar,
}

impl Arp {
    pub fn new(link: Arc<Link>, addr: Ipv4Addr) -> Self {
        Arp {
            link,
            addr,
            cache: Mutex::new(HashMap::new()),
            resolved: Condvar::new(),
        }
    }

    /// Learns the sender of every valid ARP packet and answers requests for
    /// our own address.
    pub fn handle(&self, payload: &[u8]) {
        let Some(packet) = Packet::unpack(payload) else {
            trace!("dropping malformed arp packet");
            return;
        };

        {
            let mut cache = self.cache.lock().unwrap();
            if cache.insert(packet.sender_ip, packet.sender_hw).is_none() {
                debug!("arp: learned {} at {:02x?}", packet.sender_ip, packet.sender_hw);
            }
            self.resolved.notify_all();
        }

        if packet.op == OP_REQUEST && packet.target_ip == self.addr {
            let reply = Packet {
                op: OP_REPLY,
                sender_hw: self.link.hwaddr(),
                sender_ip: self.addr,
                target_hw: packet.sender_hw,
                target_ip: packet.sender_ip,
            };
            if let Err(e) = self.link.send(packet.sender_hw, ETHERTYPE_ARP, &reply.pack()) {
                debug!("arp reply to {} failed: {}", packet.sender_ip, e);
            }
        }
    }

    /// Blocks until `ip` resolves, asking the wire a bounded number of
    /// times before giving up.
    pub fn resolve(&self, ip: Ipv4Addr) -> Result<[u8; 6], Error> {
        for _ in 0..RESOLVE_ATTEMPTS {
            {
                let cache = self.cache.lock().unwrap();
                if let Some(hw) = cache.get(&ip) {
                    return Ok(*hw);
                }
            }

            let request = Packet {
                op: OP_REQUEST,
                sender_hw: self.link.hwaddr(),
                sender_ip: self.addr,
                target_hw: [0; 6],
                target_ip: ip,
            };
            self.link.send(BROADCAST, ETHERTYPE_ARP, &request.pack())?;

            let cache = self.cache.lock().unwrap();
            let (cache, _) = self
                .resolved
                .wait_timeout_while(cache, RESOLVE_WAIT, |c| !c.contains_key(&ip))
                .unwrap();
            if let Some(hw) = cache.get(&ip) {
                return Ok(*hw);
            }
        }

        Err(Error::HostUnreachable(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let packet = Packet {
            op: OP_REQUEST,
            sender_hw: [0x02, 0, 0x0a, 0, 0, 0x04],
            sender_ip: Ipv4Addr::new(10, 0, 0, 4),
            target_hw: [0; 6],
            target_ip: Ipv4Addr::new(10, 0, 0, 1),
        };

        let bytes = packet.pack();
        assert_eq!(Packet::unpack(&bytes), Some(packet));
    }

    #[test]
    fn non_ethernet_ipv4_bodies_are_rejected() {
        let packet = Packet {
            op: OP_REPLY,
            sender_hw: [1; 6],
            sender_ip: Ipv4Addr::new(10, 0, 0, 1),
            target_hw: [2; 6],
            target_ip: Ipv4Addr::new(10, 0, 0, 4),
        };

        let mut bytes = packet.pack();
        bytes[1] = 6; // token ring
        assert_eq!(Packet::unpack(&bytes), None);

        assert_eq!(Packet::unpack(&bytes[..20]), None);
    }
}
