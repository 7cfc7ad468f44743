use std::cmp::{self, Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::ipv4::{IpSender, PROTO_TCP};

use super::seq::SeqNum;
use super::Quad;

/*
Until a round-trip time (RTT) measurement has been made for a
segment sent between the sender and receiver, the sender SHOULD
set RTO <- 1 second, though the "backing off" on repeated
retransmission still applies.
*/
pub(crate) const BASE_RTO: Duration = Duration::from_secs(1);

/// Back-off stops growing here; retransmission itself does not stop.
pub(crate) const MAX_RETRIES: u32 = 8;

/// An unacknowledged segment awaiting (re)transmission. Ordered by deadline,
/// ties broken in insertion order.
#[derive(Debug, Clone)]
pub struct Unacked {
    pub quad: Quad,
    pub end_seq: SeqNum,
    pub retries: u32,
    pub deadline: Instant,
    pub bytes: Arc<[u8]>,
    token: u64,
}

impl PartialEq for Unacked {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.token == other.token
    }
}

impl Eq for Unacked {}

impl PartialOrd for Unacked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Unacked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.token.cmp(&other.token))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Unacked>>,
    next_token: u64,
    closed: bool,
}

/// Deadline-ordered queue of unacked segments. `dequeue` blocks until the
/// earliest deadline fires, re-arms the entry with exponential back-off and
/// hands it to the transmitter; a cumulative ACK evicts everything it covers.
#[derive(Debug, Default)]
pub struct RetransmitQueue {
    inner: Mutex<Inner>,
    pending: Condvar,
}

impl RetransmitQueue {
    pub fn new() -> Self {
        RetransmitQueue::default()
    }

    /// Takes ownership of the wire bytes; they live until acked or purged.
    pub fn enqueue(&self, quad: Quad, end_seq: SeqNum, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        let token = inner.next_token;
        inner.next_token += 1;
        inner.heap.push(Reverse(Unacked {
            quad,
            end_seq,
            retries: 0,
            deadline: Instant::now(),
            bytes: bytes.into(),
            token,
        }));
        self.pending.notify_one();
    }

    /// Blocks until the earliest entry is due. Returns `None` once closed.
    pub fn dequeue(&self) -> Option<Unacked> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return None;
            }

            let now = Instant::now();
            let due = match inner.heap.peek() {
                Some(Reverse(head)) if head.deadline <= now => true,
                _ => false,
            };

            if due {
                let Reverse(mut entry) = inner.heap.pop().unwrap();
                entry.retries = cmp::min(entry.retries + 1, MAX_RETRIES);
                entry.deadline = now + BASE_RTO * cmp::min(entry.retries, MAX_RETRIES);
                inner.heap.push(Reverse(entry.clone()));
                trace!(
                    "rtx: firing seg up to {} for {:?}, retry {}",
                    entry.end_seq,
                    entry.quad,
                    entry.retries
                );
                return Some(entry);
            }

            match inner.heap.peek() {
                Some(Reverse(head)) => {
                    let wait = head.deadline - now;
                    let (guard, _) = self.pending.wait_timeout(inner, wait).unwrap();
                    inner = guard;
                }
                None => inner = self.pending.wait(inner).unwrap(),
            }
        }
    }

    /// Drops every entry of `quad` covered by the cumulative ack.
    pub fn ack(&self, quad: Quad, upto: SeqNum) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.heap.len();
        inner
            .heap
            .retain(|r| !(r.0.quad == quad && r.0.end_seq <= upto));
        if inner.heap.len() != before {
            trace!(
                "rtx: ack {} evicted {} segs for {:?}",
                upto,
                before - inner.heap.len(),
                quad
            );
            self.pending.notify_all();
        }
    }

    /// Drops everything a dying connection still has in flight.
    pub fn purge(&self, quad: Quad) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.heap.len();
        inner.heap.retain(|r| r.0.quad != quad);
        if inner.heap.len() != before {
            self.pending.notify_all();
        }
    }

    pub fn pending_count(&self, quad: Quad) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.heap.iter().filter(|r| r.0.quad == quad).count()
    }

    /// Drains the queue and releases every blocked waiter.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.heap.clear();
        self.pending.notify_all();
    }
}

/// The transmitter thread body: drain due segments into the IPv4 layer. A
/// failed send is logged; the entry stays queued for its next deadline.
pub fn transmitter_loop(queue: Arc<RetransmitQueue>, ip: Arc<dyn IpSender>) {
    while let Some(seg) = queue.dequeue() {
        if let Err(e) = ip.send(None, seg.quad.remote.ipv4, PROTO_TCP, &seg.bytes) {
            warn!("transmit to {} failed: {}", seg.quad.remote.ipv4, e);
        }
    }
}
