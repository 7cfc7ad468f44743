use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::err::Error;

use super::conn::Connection;
use super::demux::Tcp;
use super::{Dual, Quad, State};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A blocking, stream-oriented handle over one TCP connection (or, after
/// `listen`, over a listening endpoint that `accept` hatches peers from).
pub struct Socket {
    tcp: Arc<Tcp>,
    conn: Option<Arc<Connection>>,
}

impl Socket {
    pub(crate) fn new(tcp: Arc<Tcp>) -> Self {
        Socket { tcp, conn: None }
    }

    fn conn(&self) -> Result<&Arc<Connection>, Error> {
        self.conn.as_ref().ok_or(Error::NotConnected)
    }

    /// Binds a listening endpoint on `host:port`.
    pub fn listen(&mut self, host: &str, port: u16, backlog: usize) -> Result<(), Error> {
        if self.conn.is_some() {
            return Err(Error::SocketInUse);
        }

        let local = Dual {
            ipv4: host.parse()?,
            port,
        };
        let conn = self.tcp.new_connection();
        conn.set_passive(local, backlog)?;
        self.tcp.add_connection(&conn)?;

        debug!("listening on {}:{}", local.ipv4, port);
        self.conn = Some(conn);
        Ok(())
    }

    /// Blocks for an incoming connection, answers its SYN and returns the
    /// established peer socket.
    pub fn accept(&self) -> Result<Socket, Error> {
        let listener = self.conn.as_ref().ok_or(Error::NotListening)?;

        loop {
            let record = listener.wait_pending()?;

            let child = self.tcp.new_connection();
            child.set_active(record.quad, Some(&record))?;
            if let Err(e) = self.tcp.add_connection(&child) {
                // stale duplicate of a handshake already in flight
                warn!("dropping SYN from {:?}: {}", record.quad.remote, e);
                continue;
            }
            child.send_syn()?;

            match child.wait_change(State::SynReceived, None) {
                State::Established => {
                    return Ok(Socket {
                        tcp: self.tcp.clone(),
                        conn: Some(child),
                    });
                }
                state => {
                    debug!("handshake with {:?} died in {:?}", record.quad.remote, state);
                    self.tcp.remove_connection(&child);
                    child.deinit();
                    return Err(Error::AcceptFailed);
                }
            }
        }
    }

    /// Opens a connection to `host:port` from an ephemeral local port.
    /// Blocks up to 30 seconds for the handshake.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), Error> {
        if self.conn.is_some() {
            return Err(Error::SocketInUse);
        }

        let quad = Quad {
            local: Dual {
                ipv4: self.tcp.addr(),
                port: rand::thread_rng().gen_range(1025..=65535),
            },
            remote: Dual {
                ipv4: host.parse()?,
                port,
            },
        };

        let conn = self.tcp.new_connection();
        conn.set_active(quad, None)?;
        self.tcp.add_connection(&conn)?;
        conn.send_syn()?;

        match conn.wait_change(State::SynSent, Some(CONNECT_TIMEOUT)) {
            State::Established => {
                self.conn = Some(conn);
                Ok(())
            }
            state => {
                debug!("connect to {}:{} died in {:?}", quad.remote.ipv4, port, state);
                self.tcp.remove_connection(&conn);
                conn.deinit();
                Err(Error::ConnectionRefused)
            }
        }
    }

    /// Blocks until data, end of stream (0), or teardown.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.conn()?.read(buf)
    }

    /// Queues what fits in the usable send window; returns the short count.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.conn()?.write(buf)
    }

    pub fn state(&self) -> State {
        self.conn
            .as_ref()
            .map_or(State::Closed, |conn| conn.state())
    }

    /// Runs the close handshake for the current state and releases the
    /// connection.
    pub fn close(&mut self) -> Result<(), Error> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        let result = conn.close();
        self.tcp.remove_connection(&conn);
        conn.deinit();
        result
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(e) = self.close() {
                warn!("close on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex as StdMutex;
    use std::thread;

    use etherparse::{Ipv4Header, Ipv4HeaderSlice, TcpHeaderSlice};

    use super::super::codec::{self, SegmentMeta};
    use super::super::rtx::{transmitter_loop, RetransmitQueue};
    use super::super::SeqNum;
    use crate::ipv4::IpSender;

    use super::*;

    /// Captures everything the stack puts on the wire.
    struct Wire {
        tx: StdMutex<Sender<Vec<u8>>>,
    }

    impl IpSender for Wire {
        fn send(
            &self,
            _src: Option<Ipv4Addr>,
            _dst: Ipv4Addr,
            _proto: u8,
            bytes: &[u8],
        ) -> Result<(), Error> {
            // the receiver may be gone once the test has what it needs
            let _ = self.tx.lock().unwrap().send(bytes.to_vec());
            Ok(())
        }
    }

    struct Harness {
        tcp: Arc<Tcp>,
        rtx: Arc<RetransmitQueue>,
        rx: Receiver<Vec<u8>>,
        transmitter: Option<thread::JoinHandle<()>>,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::channel();
        let wire: Arc<Wire> = Arc::new(Wire {
            tx: StdMutex::new(tx),
        });
        let rtx = Arc::new(RetransmitQueue::new());
        let tcp = Tcp::new(Ipv4Addr::new(10, 0, 0, 4), wire.clone(), rtx.clone());
        let transmitter = {
            let rtx = rtx.clone();
            thread::spawn(move || transmitter_loop(rtx, wire))
        };
        Harness {
            tcp,
            rtx,
            rx,
            transmitter: Some(transmitter),
        }
    }

    impl Harness {
        /// Injects a segment as if the peer had sent it.
        fn deliver(&self, meta: &SegmentMeta, payload: &[u8]) {
            let tcp_bytes = codec::build(meta, payload);
            let ip = Ipv4Header::new(
                tcp_bytes.len() as u16,
                32,
                6,
                meta.quad.local.ipv4.octets(),
                meta.quad.remote.ipv4.octets(),
            );
            let mut ip_bytes = Vec::new();
            ip.write(&mut ip_bytes).unwrap();
            let ip4h = Ipv4HeaderSlice::from_slice(&ip_bytes).unwrap();
            self.tcp.handle(&ip4h, &tcp_bytes);
        }

        /// Waits for the next outbound segment matching `pred`, skipping
        /// retransmissions and whatever else interleaves.
        fn expect<F>(&self, pred: F) -> Vec<u8>
        where
            F: Fn(&TcpHeaderSlice, &[u8]) -> bool,
        {
            loop {
                let bytes = self
                    .rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("no matching segment on the wire");
                let hdr = TcpHeaderSlice::from_slice(&bytes).unwrap();
                let payload = &bytes[hdr.slice().len()..];
                if pred(&hdr, payload) {
                    return bytes;
                }
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.rtx.close();
            if let Some(handle) = self.transmitter.take() {
                handle.join().unwrap();
            }
        }
    }

    fn peer_quad(port: u16) -> Quad {
        Quad {
            local: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 1),
                port,
            },
            remote: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 4),
                port: 5501,
            },
        }
    }

    #[test]
    fn passive_accept_echo_and_close() {
        let h = harness();

        let mut listener = Socket::new(h.tcp.clone());
        listener.listen("10.0.0.4", 5501, 8).unwrap();

        let server = thread::spawn(move || {
            let mut peer = listener.accept().unwrap();
            assert_eq!(peer.state(), State::Established);

            let mut buf = [0u8; 64];
            let n = peer.read(&mut buf).unwrap();
            assert_eq!(peer.write(&buf[..n]).unwrap(), n);

            // peer closes; we see end of stream and finish the dance
            assert_eq!(peer.read(&mut buf).unwrap(), 0);
            peer.close().unwrap();
            n
        });

        let pq = peer_quad(43000);

        // three-way handshake, from the peer's side
        let mut syn = SegmentMeta::new(pq, SeqNum(100));
        syn.syn = true;
        syn.wnd = 4096;
        syn.mss = Some(1460);
        h.deliver(&syn, &[]);

        let synack = h.expect(|hdr, _| hdr.syn() && hdr.ack());
        let synack_hdr = TcpHeaderSlice::from_slice(&synack).unwrap();
        assert_eq!(synack_hdr.acknowledgment_number(), 101);
        let iss = SeqNum(synack_hdr.sequence_number());

        let mut ack = SegmentMeta::new(pq, SeqNum(101));
        ack.ack = Some(iss + 1);
        ack.wnd = 4096;
        h.deliver(&ack, &[]);

        // echo round trip
        let mut ping = SegmentMeta::new(pq, SeqNum(101));
        ping.ack = Some(iss + 1);
        ping.psh = true;
        ping.wnd = 4096;
        h.deliver(&ping, b"Ping!");

        h.expect(|hdr, payload| {
            payload.is_empty() && hdr.ack() && hdr.acknowledgment_number() == 106
        });
        let echo = h.expect(|hdr, payload| payload == b"Ping!" && hdr.psh());
        let echo_hdr = TcpHeaderSlice::from_slice(&echo).unwrap();
        assert_eq!(SeqNum(echo_hdr.sequence_number()), iss + 1);

        let mut echo_ack = SegmentMeta::new(pq, SeqNum(106));
        echo_ack.ack = Some(iss + 6);
        echo_ack.wnd = 4096;
        h.deliver(&echo_ack, &[]);

        // peer starts the close
        let mut fin = SegmentMeta::new(pq, SeqNum(106));
        fin.fin = true;
        fin.ack = Some(iss + 6);
        fin.wnd = 4096;
        h.deliver(&fin, &[]);

        h.expect(|hdr, _| hdr.ack() && hdr.acknowledgment_number() == 107);
        h.expect(|hdr, _| hdr.fin());

        let mut last_ack = SegmentMeta::new(pq, SeqNum(107));
        last_ack.ack = Some(iss + 7);
        last_ack.wnd = 4096;
        h.deliver(&last_ack, &[]);

        assert_eq!(server.join().unwrap(), 5);
    }

    #[test]
    fn connect_refused_by_reset() {
        let h = harness();

        let mut socket = Socket::new(h.tcp.clone());
        let connector = thread::spawn(move || {
            let result = socket.connect("10.0.0.1", 5501);
            (socket.state(), result)
        });

        let syn = h.expect(|hdr, _| hdr.syn() && !hdr.ack());
        let syn_hdr = TcpHeaderSlice::from_slice(&syn).unwrap();

        let mut rst = SegmentMeta::new(
            Quad {
                local: Dual {
                    ipv4: Ipv4Addr::new(10, 0, 0, 1),
                    port: 5501,
                },
                remote: Dual {
                    ipv4: Ipv4Addr::new(10, 0, 0, 4),
                    port: syn_hdr.source_port(),
                },
            },
            SeqNum(0),
        );
        rst.rst = true;
        rst.ack = Some(SeqNum(syn_hdr.sequence_number()) + 1);
        h.deliver(&rst, &[]);

        let (state, result) = connector.join().unwrap();
        assert_eq!(state, State::Closed);
        assert!(matches!(result, Err(Error::ConnectionRefused)));
    }
}
