use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{info, trace, warn};
use tidy_tuntap::Tap;

mod arp;
mod err;
mod icmp;
mod ipv4;
mod link;
mod tcp;

pub use err::Error;
pub use tcp::{Socket, State};

use arp::Arp;
use ipv4::{IpSender, Ipv4, PROTO_ICMP, PROTO_TCP};
use link::{Ingress, Link, HWADDR, MAX_FRAME};
use tcp::{transmitter_loop, RetransmitQueue, Tcp};

/// A user-space TCP/IPv4 stack behind a TAP device. Owns the ingress
/// dispatcher and transmitter threads; sockets hatch from `socket()`.
pub struct NetStack {
    tcp: Arc<Tcp>,
    rtx: Arc<RetransmitQueue>,
    running: Arc<AtomicBool>,
    ingress: Option<thread::JoinHandle<()>>,
    transmitter: Option<thread::JoinHandle<()>>,
}

impl NetStack {
    /// Brings up the TAP device with `host_addr` on the host side and
    /// claims `addr` for the stack itself.
    pub fn new(
        ifname: &str,
        host_addr: Ipv4Addr,
        addr: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> Result<Self, Error> {
        let tap = Tap::new(ifname, false)?;
        tap.set_addr(host_addr)?;
        tap.set_netmask(netmask)?;
        tap.bring_up()?;

        let link = Arc::new(Link::new(tap, HWADDR));
        let arp = Arc::new(Arp::new(link.clone(), addr));
        let ip = Arc::new(Ipv4::new(
            link.clone(),
            arp.clone(),
            addr,
            netmask,
            host_addr,
        ));
        let rtx = Arc::new(RetransmitQueue::new());
        let tcp = Tcp::new(addr, ip.clone(), rtx.clone());

        let running = Arc::new(AtomicBool::new(true));

        let ingress = {
            let link = link.clone();
            let arp = arp.clone();
            let ip = ip.clone();
            let tcp = tcp.clone();
            let running = running.clone();
            thread::spawn(move || ingress_loop(link, arp, ip, tcp, running))
        };

        let transmitter = {
            let rtx = rtx.clone();
            let ip: Arc<dyn IpSender> = ip;
            thread::spawn(move || transmitter_loop(rtx, ip))
        };

        info!("{} is up, stack at {}", ifname, addr);

        Ok(NetStack {
            tcp,
            rtx,
            running,
            ingress: Some(ingress),
            transmitter: Some(transmitter),
        })
    }

    /// A fresh, unbound socket on this stack.
    pub fn socket(&self) -> Socket {
        Socket::new(self.tcp.clone())
    }

    /// Stops the worker threads and waits for them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.rtx.close();
        if let Some(handle) = self.ingress.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.transmitter.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The link-layer read loop: one frame at a time, classified and handed to
/// ARP or up through IPv4 to ICMP/TCP.
fn ingress_loop(
    link: Arc<Link>,
    arp: Arc<Arp>,
    ip: Arc<Ipv4>,
    tcp: Arc<Tcp>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_FRAME];

    while running.load(Ordering::Acquire) {
        let n = match link.recv(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                warn!("link read failed: {}", e);
                continue;
            }
        };

        match link::classify(link.hwaddr(), &buf[..n]) {
            Ok(Ingress::Arp(payload)) => arp.handle(payload),
            Ok(Ingress::Ipv4(packet)) => match ipv4::parse(packet) {
                Ok((hdr, body)) => {
                    if hdr.destination_addr() != ip.addr() {
                        trace!("ignoring packet for {}", hdr.destination_addr());
                        continue;
                    }
                    match hdr.protocol() {
                        PROTO_TCP => tcp.handle(&hdr, body),
                        PROTO_ICMP => icmp::handle(&*ip, &hdr, body),
                        proto => trace!("ignoring protocol {}", proto),
                    }
                }
                Err(e) => trace!("dropping packet: {}", e),
            },
            Ok(Ingress::Ignored) => {}
            Err(e) => trace!("dropping frame: {}", e),
        }
    }
}
