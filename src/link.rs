use std::os::fd::AsRawFd;

use etherparse::{Ethernet2Header, Ethernet2HeaderSlice};
use log::trace;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd;
use tidy_tuntap::Tap;

use crate::err::Error;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const BROADCAST: [u8; 6] = [0xff; 6];

/// The stack's own hardware address, locally administered. The host learns
/// it from our ARP replies.
pub const HWADDR: [u8; 6] = [0x02, 0x00, 0x0a, 0x00, 0x00, 0x04];

/// MTU-sized payload plus the Ethernet header.
pub const MAX_FRAME: usize = 1514;

/// Where an inbound frame is routed. The protocol set is closed; everything
/// else falls through as `Ignored`.
pub enum Ingress<'a> {
    Arp(&'a [u8]),
    Ipv4(&'a [u8]),
    Ignored,
}

/// The frame device. Reads and writes go through the raw fd so the ingress
/// thread and senders can share it without a device-wide lock.
pub struct Link {
    tap: Tap,
    hwaddr: [u8; 6],
}

impl Link {
    pub fn new(tap: Tap, hwaddr: [u8; 6]) -> Self {
        Link { tap, hwaddr }
    }

    pub fn hwaddr(&self) -> [u8; 6] {
        self.hwaddr
    }

    /// Waits briefly for one frame; 0 means the poll timed out.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let fd = self.tap.as_raw_fd();
        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        if poll(&mut pfd[..], 10)? == 0 {
            return Ok(0);
        }
        Ok(unistd::read(fd, buf)?)
    }

    /// Frames `payload` and puts it on the wire.
    pub fn send(&self, dst: [u8; 6], ether_type: u16, payload: &[u8]) -> Result<(), Error> {
        let hdr = Ethernet2Header {
            source: self.hwaddr,
            destination: dst,
            ether_type,
        };

        let mut frame = Vec::with_capacity(14 + payload.len());
        hdr.write(&mut frame).unwrap();
        frame.extend_from_slice(payload);

        unistd::write(self.tap.as_raw_fd(), &frame)?;
        Ok(())
    }
}

/// Classifies one frame for the ingress dispatcher.
pub fn classify(hwaddr: [u8; 6], frame: &[u8]) -> Result<Ingress<'_>, Error> {
    let hdr = Ethernet2HeaderSlice::from_slice(frame)?;
    if hdr.destination() != hwaddr && hdr.destination() != BROADCAST {
        return Ok(Ingress::Ignored);
    }

    let payload = &frame[hdr.slice().len()..];
    Ok(match hdr.ether_type() {
        ETHERTYPE_ARP => Ingress::Arp(payload),
        ETHERTYPE_IPV4 => Ingress::Ipv4(payload),
        other => {
            trace!("ignoring ethertype {:#06x}", other);
            Ingress::Ignored
        }
    })
}
