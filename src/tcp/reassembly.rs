use std::cmp;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use log::trace;

use crate::err::Error;

use super::seq::SeqNum;

/// One run of received bytes. `contig` marks spans inside the in-order
/// prefix; those are always at the front of the list.
#[derive(Debug)]
struct Span {
    seq: SeqNum,
    psh: bool,
    contig: bool,
    data: Vec<u8>,
}

impl Span {
    fn end(&self) -> SeqNum {
        self.seq + self.data.len() as u32
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Sequence-ordered; the contiguous prefix comes first.
    spans: VecDeque<Span>,
    /// One past the in-order prefix; the cumulative-ack frontier.
    frontier: SeqNum,
    /// Unread bytes inside the in-order prefix.
    contiguous: usize,
    /// All buffered bytes, in order or not.
    buffered: usize,
    /// In-order PSH boundaries the reader has not crossed yet.
    psh_pending: usize,
    /// A zero-length PSH marker was consumed: the stream has ended.
    eof: bool,
    closed: bool,
}

/// Accepts bytes by sequence number in any order and hands the reader the
/// contiguous prefix. Readers block until a full buffer, a PSH boundary, or
/// teardown.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    inner: Mutex<Inner>,
    data_available: Condvar,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        ReassemblyBuffer::default()
    }

    /// Pins the frontier to the first in-order byte. Must happen before any
    /// insert, once the peer's initial sequence number is known.
    pub fn reset_base(&self, seq: SeqNum) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.spans.is_empty());
        inner.frontier = seq;
    }

    pub fn insert(&self, seq: SeqNum, bytes: &[u8], psh: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        let mut seq = seq;
        let mut bytes = bytes;

        // Anything before the unread edge was consumed already.
        let unread = inner.frontier - inner.contiguous as u32;
        if seq < unread {
            let stale = cmp::min((unread - seq) as usize, bytes.len());
            if stale == bytes.len() {
                trace!("reassembly: dropping stale bytes at {}", seq);
                return;
            }
            bytes = &bytes[stale..];
            seq = unread;
        }

        let mut idx = inner.spans.len();
        if bytes.is_empty() {
            if !psh {
                return;
            }
            // end-of-stream marker; it sits exactly at the frontier
            while idx > 0 && seq < inner.spans[idx - 1].seq {
                idx -= 1;
            }
        } else {
            let mut end = seq + bytes.len() as u32;

            // slot after every span starting at or before us
            idx = inner
                .spans
                .iter()
                .position(|s| seq < s.seq)
                .unwrap_or(inner.spans.len());

            if let Some(prev) = idx.checked_sub(1).map(|i| &inner.spans[i]) {
                if !prev.data.is_empty() && end <= prev.end() {
                    trace!("reassembly: {}..{} already covered", seq, end);
                    return;
                }
                if seq < prev.end() {
                    let overlap = (prev.end() - seq) as usize;
                    bytes = &bytes[overlap..];
                    seq = seq + overlap as u32;
                }
            }

            // walk the successors: skip past duplicates of the in-order
            // prefix, swallow spans we fully cover, trim against the first
            // one we only reach into
            while idx < inner.spans.len() {
                let next = &inner.spans[idx];
                if next.contig {
                    if end <= next.end() {
                        return;
                    }
                    let overlap = (next.end() - seq) as usize;
                    bytes = &bytes[overlap..];
                    seq = next.end();
                    idx += 1;
                    continue;
                }
                if next.data.is_empty() || end < next.end() {
                    if seq <= next.seq && next.seq < end {
                        let keep = (next.seq - seq) as usize;
                        bytes = &bytes[..keep];
                        end = seq + keep as u32;
                    }
                    break;
                }
                let gone = inner.spans.remove(idx).unwrap();
                inner.buffered -= gone.data.len();
                trace!("reassembly: {}..{} supersedes {}", seq, end, gone.seq);
            }

            if bytes.is_empty() {
                return;
            }
        }

        inner.buffered += bytes.len();
        inner.spans.insert(
            idx,
            Span {
                seq,
                psh,
                contig: false,
                data: bytes.to_vec(),
            },
        );

        // extend the in-order prefix over whatever now lines up
        let mut run = inner.frontier;
        let mut grown_contiguous = 0;
        let mut grown_psh = 0;
        for span in inner.spans.iter_mut() {
            if span.contig {
                continue;
            }
            if span.seq != run {
                break;
            }
            span.contig = true;
            run = span.end();
            grown_contiguous += span.data.len();
            if span.psh {
                grown_psh += 1;
            }
        }
        inner.frontier = run;
        inner.contiguous += grown_contiguous;
        inner.psh_pending += grown_psh;

        if grown_contiguous > 0 || grown_psh > 0 {
            self.data_available.notify_all();
        }
    }

    /// Blocks until the buffer can fill `out`, a PSH boundary is pending, or
    /// the buffer is torn down. Returns 0 once the end-of-stream marker is
    /// reached.
    pub fn read(&self, out: &mut [u8]) -> Result<usize, Error> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.eof && inner.contiguous == 0 {
                return Ok(0);
            }
            if inner.psh_pending > 0 || inner.contiguous >= out.len() {
                break;
            }
            if inner.closed {
                if inner.contiguous > 0 {
                    break;
                }
                return Err(Error::NoData);
            }
            inner = self.data_available.wait(inner).unwrap();
        }

        let mut n = 0;
        while n < out.len() {
            let Some(front) = inner.spans.front_mut() else {
                break;
            };
            if !front.contig {
                if inner.contiguous != 0 {
                    return Err(Error::NonContiguousData);
                }
                break;
            }

            if front.data.is_empty() {
                // end-of-stream marker; deliver data first, the marker on
                // its own wake
                if n > 0 {
                    break;
                }
                inner.spans.pop_front();
                inner.psh_pending -= 1;
                inner.eof = true;
                return Ok(0);
            }

            let take = cmp::min(out.len() - n, front.data.len());
            out[n..n + take].copy_from_slice(&front.data[..take]);
            n += take;
            inner.contiguous -= take;
            inner.buffered -= take;

            if take == front.data.len() {
                let drained = inner.spans.pop_front().unwrap();
                if drained.psh {
                    inner.psh_pending -= 1;
                    break;
                }
            } else {
                let front = inner.spans.front_mut().unwrap();
                front.data.drain(..take);
                front.seq = front.seq + take as u32;
                break;
            }
        }

        Ok(n)
    }

    /// The cumulative-ack frontier, if any contiguous bytes are buffered.
    pub fn ackable(&self) -> Option<SeqNum> {
        let inner = self.inner.lock().unwrap();
        (inner.contiguous > 0).then_some(inner.frontier)
    }

    pub fn bytes_buffered(&self) -> usize {
        self.inner.lock().unwrap().buffered
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.spans.clear();
        inner.contiguous = 0;
        inner.buffered = 0;
        inner.psh_pending = 0;
    }

    /// Tears the buffer down; blocked readers observe it and bail out.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.data_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;

    use super::*;

    #[test]
    fn out_of_order_segments_merge_in_sequence() {
        let buf = ReassemblyBuffer::new();
        buf.reset_base(SeqNum(101));

        buf.insert(SeqNum(101), b"AB", false);
        buf.insert(SeqNum(105), b"EF", false);
        assert_eq!(buf.ackable(), Some(SeqNum(103)));

        buf.insert(SeqNum(103), b"CD", true);
        assert_eq!(buf.ackable(), Some(SeqNum(107)));

        let mut out = [0u8; 16];
        let n = buf.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"ABCDEF");
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let chunks: Vec<(u32, &[u8])> = vec![
            (1000, b"the "),
            (1004, b"quick "),
            (1010, b"brown "),
            (1016, b"fox"),
        ];

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let mut shuffled = chunks.clone();
            shuffled.shuffle(&mut rng);

            let buf = ReassemblyBuffer::new();
            buf.reset_base(SeqNum(1000));
            for (seq, bytes) in shuffled.iter() {
                buf.insert(SeqNum(*seq), bytes, *seq == 1016);
            }

            let mut out = [0u8; 32];
            let n = buf.read(&mut out).unwrap();
            assert_eq!(&out[..n], b"the quick brown fox");
        }
    }

    #[test]
    fn duplicates_and_covered_copies_are_dropped() {
        let buf = ReassemblyBuffer::new();
        buf.reset_base(SeqNum(10));

        buf.insert(SeqNum(10), b"abcdef", false);
        buf.insert(SeqNum(12), b"cd", false);
        buf.insert(SeqNum(10), b"abcdef", true);
        assert_eq!(buf.bytes_buffered(), 6);

        // retransmit with extra data: only the tail is new
        buf.insert(SeqNum(10), b"abcdefgh", true);
        assert_eq!(buf.bytes_buffered(), 8);
        assert_eq!(buf.ackable(), Some(SeqNum(18)));

        let mut out = [0u8; 32];
        let n = buf.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"abcdefgh");
    }

    #[test]
    fn retransmission_across_buffered_chunks_keeps_only_the_tail() {
        let buf = ReassemblyBuffer::new();
        buf.reset_base(SeqNum(10));

        buf.insert(SeqNum(10), b"abc", false);
        buf.insert(SeqNum(13), b"def", false);
        assert_eq!(buf.bytes_buffered(), 6);

        // a retransmit spanning both chunks plus two new bytes
        buf.insert(SeqNum(10), b"abcdefgh", true);
        assert_eq!(buf.bytes_buffered(), 8);
        assert_eq!(buf.ackable(), Some(SeqNum(18)));

        let mut out = [0u8; 16];
        let n = buf.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"abcdefgh");
    }

    #[test]
    fn psh_unblocks_a_short_read_once() {
        let buf = ReassemblyBuffer::new();
        buf.reset_base(SeqNum(0));

        buf.insert(SeqNum(0), b"Ping!", true);

        // far more requested than buffered: PSH lets it through anyway
        let mut out = [0u8; 1024];
        let n = buf.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"Ping!");
        assert_eq!(buf.bytes_buffered(), 0);
    }

    #[test]
    fn partial_consumption_keeps_the_rest() {
        let buf = ReassemblyBuffer::new();
        buf.reset_base(SeqNum(0));
        buf.insert(SeqNum(0), b"abcdefgh", true);

        let mut out = [0u8; 3];
        assert_eq!(buf.read(&mut out).unwrap(), 3);
        assert_eq!(&out, b"abc");
        assert_eq!(buf.bytes_buffered(), 5);

        let mut rest = [0u8; 8];
        let n = buf.read(&mut rest).unwrap();
        assert_eq!(&rest[..n], b"defgh");
    }

    #[test]
    fn empty_psh_marker_signals_end_of_stream() {
        let buf = ReassemblyBuffer::new();
        buf.reset_base(SeqNum(50));
        buf.insert(SeqNum(50), b"bye", false);
        buf.insert(SeqNum(53), &[], true);

        let mut out = [0u8; 16];
        let n = buf.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"bye");
        assert_eq!(buf.read(&mut out).unwrap(), 0);
        // the stream stays ended
        assert_eq!(buf.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn close_wakes_a_blocked_reader() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let buf = Arc::new(ReassemblyBuffer::new());
        let handle = {
            let buf = buf.clone();
            thread::spawn(move || {
                let mut out = [0u8; 8];
                buf.read(&mut out)
            })
        };

        thread::sleep(Duration::from_millis(50));
        buf.close();
        assert!(matches!(handle.join().unwrap(), Err(Error::NoData)));
    }

    #[test]
    fn stale_retransmission_after_read_is_ignored() {
        let buf = ReassemblyBuffer::new();
        buf.reset_base(SeqNum(0));
        buf.insert(SeqNum(0), b"abcd", true);

        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out).unwrap(), 4);

        buf.insert(SeqNum(0), b"abcd", true);
        assert_eq!(buf.bytes_buffered(), 0);
        assert_eq!(buf.ackable(), None);
    }
}
