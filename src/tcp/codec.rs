use etherparse::{Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice, TcpOptionElement};

use crate::err::Error;

use super::seq::SeqNum;
use super::Quad;

/// Options recorded off a segment. MSS is the only one acted upon; window
/// scale, SACK and timestamps are kept but inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub sack: Option<(u32, u32)>,
    pub timestamp: Option<(u32, u32)>,
}

/// A checksum-verified inbound segment.
pub struct TcpSegment<'a> {
    pub hdr: TcpHeaderSlice<'a>,
    pub options: SegmentOptions,
    pub payload: &'a [u8],
}

/// Decodes and verifies the TCP portion of an IPv4 packet.
pub fn parse<'a>(ip4h: &Ipv4HeaderSlice<'a>, buf: &'a [u8]) -> Result<TcpSegment<'a>, Error> {
    let hdr = TcpHeaderSlice::from_slice(buf)?;
    let payload = &buf[hdr.slice().len()..];

    let expected = hdr
        .to_header()
        .calc_checksum_ipv4_raw(ip4h.source(), ip4h.destination(), payload)
        .map_err(|_| Error::BadChecksum)?;
    if expected != hdr.checksum() {
        return Err(Error::BadChecksum);
    }

    Ok(TcpSegment {
        options: parse_options(&hdr),
        hdr,
        payload,
    })
}

/// END terminates, NOP skips, the rest are recorded. An option we do not
/// know ends the scan without invalidating the segment.
fn parse_options(hdr: &TcpHeaderSlice) -> SegmentOptions {
    let mut options = SegmentOptions::default();

    for element in hdr.options_iterator() {
        match element {
            Ok(TcpOptionElement::Noop) => continue,
            Ok(TcpOptionElement::MaximumSegmentSize(mss)) => options.mss = Some(mss),
            Ok(TcpOptionElement::WindowScale(shift)) => options.window_scale = Some(shift),
            Ok(TcpOptionElement::SelectiveAcknowledgementPermitted) => {
                options.sack_permitted = true
            }
            Ok(TcpOptionElement::SelectiveAcknowledgement(first, _)) => {
                options.sack = Some(first)
            }
            Ok(TcpOptionElement::Timestamp(val, echo)) => options.timestamp = Some((val, echo)),
            Err(_) => break,
        }
    }

    options
}

/// Everything needed to put a segment on the wire. `quad.local` is the
/// sender side; the checksum covers the usual pseudo-header.
#[derive(Debug, Clone, Copy)]
pub struct SegmentMeta {
    pub quad: Quad,
    pub seq: SeqNum,
    pub ack: Option<SeqNum>,
    pub wnd: u16,
    pub syn: bool,
    pub fin: bool,
    pub psh: bool,
    pub rst: bool,
    pub mss: Option<u16>,
}

impl SegmentMeta {
    pub fn new(quad: Quad, seq: SeqNum) -> Self {
        SegmentMeta {
            quad,
            seq,
            ack: None,
            wnd: 0,
            syn: false,
            fin: false,
            psh: false,
            rst: false,
            mss: None,
        }
    }
}

/// Packs header, options and payload into wire bytes, host order in,
/// network order out.
pub fn build(meta: &SegmentMeta, payload: &[u8]) -> Vec<u8> {
    let mut hdr = TcpHeader::new(
        meta.quad.local.port,
        meta.quad.remote.port,
        meta.seq.raw(),
        meta.wnd,
    );

    hdr.syn = meta.syn;
    hdr.fin = meta.fin;
    hdr.psh = meta.psh;
    hdr.rst = meta.rst;
    if let Some(ack) = meta.ack {
        hdr.ack = true;
        hdr.acknowledgment_number = ack.raw();
    }
    if let Some(mss) = meta.mss {
        // a single MSS option always fits
        hdr.set_options(&[TcpOptionElement::MaximumSegmentSize(mss)])
            .unwrap();
    }

    hdr.checksum = hdr
        .calc_checksum_ipv4_raw(
            meta.quad.local.ipv4.octets(),
            meta.quad.remote.ipv4.octets(),
            payload,
        )
        .unwrap();

    let mut bytes = Vec::with_capacity(hdr.header_len() as usize + payload.len());
    hdr.write(&mut bytes).unwrap();
    bytes.extend_from_slice(payload);

    bytes
}

/// Reset for a segment that matched no connection:
///
///     If the incoming segment has the ACK bit set, the reset takes its
///     sequence number from the ACK field of the segment; otherwise, the
///     reset has sequence number zero and the ACK field is set to the sum
///     of the sequence number and segment length of the incoming segment.
pub fn reset_for(quad: Quad, seg: &super::SegmentEvent) -> Vec<u8> {
    let mut meta = SegmentMeta::new(quad, SeqNum(0));
    meta.rst = true;

    if seg.ack_set {
        meta.seq = seg.ack;
    } else {
        meta.ack = Some(seg.seq + 1);
    }

    build(&meta, &[])
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use etherparse::Ipv4Header;

    use super::super::{Dual, SegmentEvent};
    use super::*;

    fn quad() -> Quad {
        Quad {
            local: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 4),
                port: 5501,
            },
            remote: Dual {
                ipv4: Ipv4Addr::new(10, 0, 0, 1),
                port: 43000,
            },
        }
    }

    fn ip_header_for(quad: Quad, tcp_bytes: &[u8]) -> Vec<u8> {
        let hdr = Ipv4Header::new(
            tcp_bytes.len() as u16,
            32,
            6,
            quad.local.ipv4.octets(),
            quad.remote.ipv4.octets(),
        );
        let mut buf = Vec::new();
        hdr.write(&mut buf).unwrap();
        buf
    }

    #[test]
    fn build_then_parse_round_trip() {
        let mut meta = SegmentMeta::new(quad(), SeqNum(100));
        meta.ack = Some(SeqNum(55));
        meta.wnd = 4096;
        meta.psh = true;
        let bytes = build(&meta, b"Ping!");

        let ip_bytes = ip_header_for(quad(), &bytes);
        let ip4h = Ipv4HeaderSlice::from_slice(&ip_bytes).unwrap();
        let seg = parse(&ip4h, &bytes).unwrap();

        assert_eq!(seg.hdr.source_port(), 5501);
        assert_eq!(seg.hdr.destination_port(), 43000);
        assert_eq!(seg.hdr.sequence_number(), 100);
        assert_eq!(seg.hdr.acknowledgment_number(), 55);
        assert!(seg.hdr.ack());
        assert!(seg.hdr.psh());
        assert!(!seg.hdr.syn());
        assert_eq!(seg.payload, b"Ping!");
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let meta = SegmentMeta::new(quad(), SeqNum(100));
        let mut bytes = build(&meta, b"hello");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let ip_bytes = ip_header_for(quad(), &bytes);
        let ip4h = Ipv4HeaderSlice::from_slice(&ip_bytes).unwrap();
        assert!(matches!(parse(&ip4h, &bytes), Err(Error::BadChecksum)));
    }

    #[test]
    fn mss_option_is_parsed() {
        let mut meta = SegmentMeta::new(quad(), SeqNum(0));
        meta.syn = true;
        meta.mss = Some(1400);
        let bytes = build(&meta, &[]);

        let ip_bytes = ip_header_for(quad(), &bytes);
        let ip4h = Ipv4HeaderSlice::from_slice(&ip_bytes).unwrap();
        let seg = parse(&ip4h, &bytes).unwrap();
        assert_eq!(seg.options.mss, Some(1400));
        assert_eq!(seg.options.window_scale, None);
    }

    #[test]
    fn unknown_option_ends_the_scan_silently() {
        let mut meta = SegmentMeta::new(quad(), SeqNum(0));
        meta.syn = true;
        let mut bytes = build(&meta, &[]);

        // graft an option area: unknown kind 0xfd, then an MSS that must
        // never be reached
        let mut options = vec![0xfd, 0x02, 0x02, 0x04, 0x05, 0xb4, 0x00, 0x00];
        let doff = ((20 + options.len()) / 4) as u8;
        bytes[12] = doff << 4;
        let mut grafted = bytes[..20].to_vec();
        grafted.append(&mut options);

        let mut hdr = TcpHeaderSlice::from_slice(&grafted).unwrap().to_header();
        hdr.checksum = hdr
            .calc_checksum_ipv4_raw(
                quad().local.ipv4.octets(),
                quad().remote.ipv4.octets(),
                &[],
            )
            .unwrap();
        let mut rebuilt = Vec::new();
        hdr.write(&mut rebuilt).unwrap();

        let ip_bytes = ip_header_for(quad(), &rebuilt);
        let ip4h = Ipv4HeaderSlice::from_slice(&ip_bytes).unwrap();
        let seg = parse(&ip4h, &rebuilt).unwrap();
        assert_eq!(seg.options.mss, None);
    }

    fn event(seq: u32, ack: Option<u32>) -> SegmentEvent<'static> {
        SegmentEvent {
            quad: quad(),
            seq: SeqNum(seq),
            ack: SeqNum(ack.unwrap_or(0)),
            wnd: 1024,
            urg: 0,
            syn: false,
            ack_set: ack.is_some(),
            fin: false,
            rst: false,
            psh: false,
            urg_set: false,
            options: SegmentOptions::default(),
            payload: &[],
        }
    }

    #[test]
    fn reset_for_segment_without_ack() {
        let bytes = reset_for(quad(), &event(700, None));
        let hdr = TcpHeaderSlice::from_slice(&bytes).unwrap();
        assert!(hdr.rst());
        assert!(hdr.ack());
        assert_eq!(hdr.sequence_number(), 0);
        assert_eq!(hdr.acknowledgment_number(), 701);
    }

    #[test]
    fn reset_for_segment_with_ack() {
        let bytes = reset_for(quad(), &event(700, Some(4242)));
        let hdr = TcpHeaderSlice::from_slice(&bytes).unwrap();
        assert!(hdr.rst());
        assert!(!hdr.ack());
        assert_eq!(hdr.sequence_number(), 4242);
    }
}
