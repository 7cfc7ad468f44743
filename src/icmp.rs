use etherparse::{Icmpv4Header, Icmpv4Slice, Icmpv4Type, Ipv4HeaderSlice};
use log::{debug, trace};

use crate::ipv4::{IpSender, PROTO_ICMP};

/// Answers echo requests; everything else is dropped. Purely cosmetic so a
/// ping can confirm the stack is alive.
pub fn handle(ip: &dyn IpSender, hdr: &Ipv4HeaderSlice, payload: &[u8]) {
    let icmp = match Icmpv4Slice::from_slice(payload) {
        Ok(icmp) => icmp,
        Err(e) => {
            trace!("dropping icmp packet: {}", e);
            return;
        }
    };

    let echo = match icmp.icmp_type() {
        Icmpv4Type::EchoRequest(echo) => echo,
        other => {
            trace!("ignoring icmp type {:?}", other);
            return;
        }
    };

    let reply = Icmpv4Header::with_checksum(Icmpv4Type::EchoReply(echo), icmp.payload());
    let mut bytes = Vec::with_capacity(8 + icmp.payload().len());
    reply.write(&mut bytes).unwrap();
    bytes.extend_from_slice(icmp.payload());

    debug!(
        "icmp: echoing {} bytes back to {}",
        icmp.payload().len(),
        hdr.source_addr()
    );
    if let Err(e) = ip.send(None, hdr.source_addr(), PROTO_ICMP, &bytes) {
        debug!("icmp reply to {} failed: {}", hdr.source_addr(), e);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use etherparse::{IcmpEchoHeader, Ipv4Header};

    use crate::err::Error;

    use super::*;

    #[derive(Default)]
    struct Sink {
        sent: Mutex<Vec<(Ipv4Addr, u8, Vec<u8>)>>,
    }

    impl IpSender for Sink {
        fn send(
            &self,
            _src: Option<Ipv4Addr>,
            dst: Ipv4Addr,
            proto: u8,
            bytes: &[u8],
        ) -> Result<(), Error> {
            self.sent.lock().unwrap().push((dst, proto, bytes.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn echo_request_is_answered() {
        let sink = Sink::default();

        let echo = IcmpEchoHeader { id: 7, seq: 42 };
        let request = Icmpv4Header::with_checksum(Icmpv4Type::EchoRequest(echo), b"abcdefgh");
        let mut icmp_bytes = Vec::new();
        request.write(&mut icmp_bytes).unwrap();
        icmp_bytes.extend_from_slice(b"abcdefgh");

        let ip = Ipv4Header::new(
            icmp_bytes.len() as u16,
            32,
            PROTO_ICMP,
            [10, 0, 0, 1],
            [10, 0, 0, 4],
        );
        let mut ip_bytes = Vec::new();
        ip.write(&mut ip_bytes).unwrap();
        let hdr = Ipv4HeaderSlice::from_slice(&ip_bytes).unwrap();

        handle(&sink, &hdr, &icmp_bytes);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (dst, proto, bytes) = &sent[0];
        assert_eq!(*dst, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(*proto, PROTO_ICMP);

        let reply = Icmpv4Slice::from_slice(bytes).unwrap();
        match reply.icmp_type() {
            Icmpv4Type::EchoReply(hdr) => {
                assert_eq!(hdr.id, 7);
                assert_eq!(hdr.seq, 42);
            }
            other => panic!("expected an echo reply, got {:?}", other),
        }
        assert_eq!(reply.payload(), b"abcdefgh");
    }

    #[test]
    fn echo_replies_are_not_answered() {
        let sink = Sink::default();

        let echo = IcmpEchoHeader { id: 1, seq: 1 };
        let reply = Icmpv4Header::with_checksum(Icmpv4Type::EchoReply(echo), &[]);
        let mut icmp_bytes = Vec::new();
        reply.write(&mut icmp_bytes).unwrap();

        let ip = Ipv4Header::new(
            icmp_bytes.len() as u16,
            32,
            PROTO_ICMP,
            [10, 0, 0, 1],
            [10, 0, 0, 4],
        );
        let mut ip_bytes = Vec::new();
        ip.write(&mut ip_bytes).unwrap();
        let hdr = Ipv4HeaderSlice::from_slice(&ip_bytes).unwrap();

        handle(&sink, &hdr, &icmp_bytes);
        assert!(sink.sent.lock().unwrap().is_empty());
    }
}
