use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use etherparse::Ipv4HeaderSlice;
use log::{trace, warn};
use rand::Rng;

use crate::err::Error;
use crate::ipv4::{IpSender, PROTO_TCP};

use super::codec;
use super::conn::{Connection, SegmentEvent};
use super::rtx::RetransmitQueue;
use super::seq::SeqNum;
use super::{Dual, Quad, State};

#[derive(Default)]
struct Tables {
    established: HashMap<Quad, Arc<Connection>>,
    listening: HashMap<Dual, Arc<Connection>>,
}

/// TCP entry point. Owns the connection tables, routes inbound segments to
/// the right connection and answers traffic matching nothing with a reset.
pub(crate) struct Tcp {
    addr: Ipv4Addr,
    tables: Mutex<Tables>,
    ip: Arc<dyn IpSender>,
    rtx: Arc<RetransmitQueue>,
}

impl Tcp {
    pub fn new(addr: Ipv4Addr, ip: Arc<dyn IpSender>, rtx: Arc<RetransmitQueue>) -> Arc<Self> {
        Arc::new(Tcp {
            addr,
            tables: Mutex::new(Tables::default()),
            ip,
            rtx,
        })
    }

    /// The stack's own address, the local half of every active quad.
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn new_connection(&self) -> Arc<Connection> {
        let iss = SeqNum(rand::thread_rng().gen());
        Connection::new(self.ip.clone(), self.rtx.clone(), iss)
    }

    /// Reacts to the TCP payload of one IPv4 packet.
    pub fn handle(&self, ip4h: &Ipv4HeaderSlice, tcp_bytes: &[u8]) {
        let seg = match codec::parse(ip4h, tcp_bytes) {
            Ok(seg) => seg,
            Err(e) => {
                warn!("dropping segment from {}: {}", ip4h.source_addr(), e);
                return;
            }
        };

        let hdr = &seg.hdr;
        trace!(
            "rx {}:{} -> {}:{} seq={} ack={} len={} [{}{}{}{}{}]",
            ip4h.source_addr(),
            hdr.source_port(),
            ip4h.destination_addr(),
            hdr.destination_port(),
            hdr.sequence_number(),
            hdr.acknowledgment_number(),
            seg.payload.len(),
            if hdr.syn() { "S" } else { "" },
            if hdr.ack() { "A" } else { "" },
            if hdr.fin() { "F" } else { "" },
            if hdr.rst() { "R" } else { "" },
            if hdr.psh() { "P" } else { "" },
        );

        let quad = Quad {
            local: Dual {
                ipv4: ip4h.destination_addr(),
                port: hdr.destination_port(),
            },
            remote: Dual {
                ipv4: ip4h.source_addr(),
                port: hdr.source_port(),
            },
        };
        let event = SegmentEvent {
            quad,
            seq: SeqNum(hdr.sequence_number()),
            ack: SeqNum(hdr.acknowledgment_number()),
            wnd: hdr.window_size(),
            urg: hdr.urgent_pointer(),
            syn: hdr.syn(),
            ack_set: hdr.ack(),
            fin: hdr.fin(),
            rst: hdr.rst(),
            psh: hdr.psh(),
            urg_set: hdr.urg(),
            options: seg.options,
            payload: seg.payload,
        };

        let conn = {
            let tables = self.tables.lock().unwrap();
            if let Some(conn) = tables.established.get(&quad) {
                Some(conn.clone())
            } else if event.syn && !event.rst && !event.fin {
                tables.listening.get(&quad.local).cloned()
            } else {
                None
            }
        };

        match conn {
            Some(conn) => {
                conn.handle_segment(&event);
                if conn.state() == State::Closed {
                    self.remove_connection(&conn);
                }
            }
            None => {
                /*
                If the connection does not exist (CLOSED), then a reset is
                sent in response to any incoming segment except another
                reset. A SYN segment that does not match an existing
                connection is rejected by this means.
                */
                if event.rst {
                    return;
                }
                trace!("orphan segment from {}:{}", quad.remote.ipv4, quad.remote.port);
                let bytes = codec::reset_for(quad, &event);
                if let Err(e) = self.ip.send(None, quad.remote.ipv4, PROTO_TCP, &bytes) {
                    warn!("rst to {} failed: {}", quad.remote.ipv4, e);
                }
            }
        }
    }

    /// Registers a connection in the table its state selects.
    pub fn add_connection(&self, conn: &Arc<Connection>) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        let quad = conn.quad();

        match conn.state() {
            State::Closed => Err(Error::ConnectionClosed),
            State::Listen => match tables.listening.entry(quad.local) {
                Entry::Occupied(_) => Err(Error::ConnectionReuse),
                Entry::Vacant(slot) => {
                    slot.insert(conn.clone());
                    Ok(())
                }
            },
            _ => match tables.established.entry(quad) {
                Entry::Occupied(_) => Err(Error::ConnectionReuse),
                Entry::Vacant(slot) => {
                    slot.insert(conn.clone());
                    Ok(())
                }
            },
        }
    }

    /// Drops the connection from whichever table still holds it.
    pub fn remove_connection(&self, conn: &Arc<Connection>) {
        let mut tables = self.tables.lock().unwrap();
        let quad = conn.quad();

        if let Some(found) = tables.established.get(&quad) {
            if Arc::ptr_eq(found, conn) {
                tables.established.remove(&quad);
                return;
            }
        }
        if let Some(found) = tables.listening.get(&quad.local) {
            if Arc::ptr_eq(found, conn) {
                tables.listening.remove(&quad.local);
            }
        }
    }
}
