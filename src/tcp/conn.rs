use std::cmp;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::err::Error;
use crate::ipv4::{IpSender, PROTO_TCP};

use super::codec::{self, SegmentMeta, SegmentOptions};
use super::reassembly::ReassemblyBuffer;
use super::rtx::RetransmitQueue;
use super::seq::SeqNum;
use super::{Dual, Quad, State, DEFAULT_MSS, DEFAULT_WINDOW};

const MSL: Duration = Duration::from_secs(2 * 60);

/// How long a close() waits for the peer's side of the termination dance.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// A SYN parked on a listening connection until accept() picks it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SynRecord {
    pub quad: Quad,
    pub seq: SeqNum,
    pub wnd: u16,
    pub options: SegmentOptions,
}

/// Everything the state machine needs to know about an inbound segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentEvent<'a> {
    pub quad: Quad,
    pub seq: SeqNum,
    pub ack: SeqNum,
    pub wnd: u16,
    pub urg: u16,
    pub syn: bool,
    pub ack_set: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg_set: bool,
    pub options: SegmentOptions,
    pub payload: &'a [u8],
}

impl SegmentEvent<'_> {
    /// SEG.LEN: payload plus one sequence number each for SYN and FIN.
    fn len(&self) -> u32 {
        self.payload.len() as u32 + self.syn as u32 + self.fin as u32
    }

    /// One past the payload, where a carried FIN would sit.
    fn end(&self) -> SeqNum {
        self.seq + self.payload.len() as u32
    }
}

/// I/O the state machine wants performed once the transition is decided.
/// Keeping these out of `on_segment` keeps every transition a pure-ish
/// function over the TCB, testable without a wire.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Emission {
    /// Bare ACK of the current receive state.
    Ack,
    /// (Re)send SYN+ACK from ISS, carrying our MSS.
    SynAck,
    /// Reset with an explicit sequence number, never queued.
    Rst { seq: SeqNum, ack: Option<SeqNum> },
    /// Park a SYN for accept().
    Park(SynRecord),
    /// Evict retransmit entries covered by the cumulative ack.
    Evict(SeqNum),
    /// Hand payload bytes from `skip` onward to the reassembly buffer.
    Ingest { skip: usize, psh: bool },
    /// A FIN whose sequence slot is `end`; end-of-stream if it is in order.
    Fin { end: SeqNum },
    /// Nothing of this connection's is worth retransmitting anymore.
    Purge,
}

#[derive(Debug)]
pub(crate) struct Tcb {
    pub state: State,
    pub quad: Quad,
    pub iss: SeqNum,
    pub irs: SeqNum,
    pub snd_una: SeqNum,
    pub snd_nxt: SeqNum,
    pub snd_wnd: u16,
    pub snd_wl1: SeqNum,
    pub snd_wl2: SeqNum,
    pub rcv_nxt: SeqNum,
    pub rcv_wnd: u16,
    pub mss: u16,
    pub urg_rcv: u16,
    pub urg_snd: u16,
    pub backlog: usize,
    pub pending: VecDeque<SynRecord>,
    /// 2·MSL stamp taken on entering TIME_WAIT; recorded, not enforced.
    pub time_wait: Option<Instant>,
}

impl Tcb {
    pub fn new(iss: SeqNum) -> Self {
        Tcb {
            state: State::Closed,
            quad: Quad {
                local: Dual::unspecified(),
                remote: Dual::unspecified(),
            },
            iss,
            irs: SeqNum(0),
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: SeqNum(0),
            snd_wl2: SeqNum(0),
            rcv_nxt: SeqNum(0),
            rcv_wnd: DEFAULT_WINDOW,
            mss: DEFAULT_MSS,
            urg_rcv: 0,
            urg_snd: 0,
            backlog: 0,
            pending: VecDeque::new(),
            time_wait: None,
        }
    }

    /// Our FIN occupied the last sequence number we sent.
    fn fin_acked(&self) -> bool {
        self.snd_una == self.snd_nxt
    }

    fn enter_time_wait(&mut self) {
        self.state = State::TimeWait;
        self.time_wait = Some(Instant::now() + 2 * MSL);
    }

    /*
    There are four cases for the acceptability test for an
    incoming segment:

    Segment Length  Receive Window  Test
    0               0               SEG.SEQ = RCV.NXT

    0               >0              RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND

    >0              0               not acceptable

                                    RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND

    >0              >0              or

                                    RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
    */
    fn acceptable(&self, seg: &SegmentEvent) -> bool {
        let len = seg.len();
        let wnd = self.rcv_wnd as u32;
        let nxt = self.rcv_nxt;

        if len == 0 && wnd == 0 {
            seg.seq == nxt
        } else if len == 0 {
            nxt <= seg.seq && seg.seq < nxt + wnd
        } else if wnd == 0 {
            false
        } else {
            let last = seg.seq + len - 1;
            (nxt <= seg.seq && seg.seq < nxt + wnd) || (nxt <= last && last < nxt + wnd)
        }
    }

    /// Reacts to a segment: updates the TCB, decides the next state and
    /// returns the emissions the connection must perform.
    pub fn on_segment(&mut self, seg: &SegmentEvent) -> Vec<Emission> {
        let mut out = Vec::new();

        match self.state {
            State::Closed => {
                if !seg.rst {
                    out.push(Emission::Rst {
                        seq: if seg.ack_set { seg.ack } else { SeqNum(0) },
                        ack: (!seg.ack_set).then(|| seg.seq + 1),
                    });
                }
                out
            }
            State::Listen => self.on_listen(seg),
            State::SynSent => self.on_syn_sent(seg),
            _ => self.on_synchronized(seg),
        }
    }

    /*
    If the state is LISTEN: an incoming RST should be ignored; any
    acknowledgment is bad if it arrives on a connection still in the
    LISTEN state (<SEQ=SEG.ACK><CTL=RST>); a SYN is queued for the user.
    */
    fn on_listen(&mut self, seg: &SegmentEvent) -> Vec<Emission> {
        let mut out = Vec::new();

        if seg.rst {
            return out;
        }

        if seg.ack_set {
            out.push(Emission::Rst {
                seq: seg.ack,
                ack: None,
            });
            return out;
        }

        if seg.syn && !seg.fin {
            if self.pending.len() < self.backlog {
                out.push(Emission::Park(SynRecord {
                    quad: seg.quad,
                    seq: seg.seq,
                    wnd: seg.wnd,
                    options: seg.options,
                }));
            } else {
                warn!("backlog full on {:?}, dropping SYN", self.quad.local);
            }
        }

        out
    }

    /*
    If the state is SYN-SENT: an ACK outside (ISS, SND.NXT] gets a reset
    (unless RST is set); an acceptable RST means connection refused; a
    SYN+ACK completes the handshake; a lone SYN is a simultaneous open
    and answers SYN+ACK from SYN-RECEIVED.
    */
    fn on_syn_sent(&mut self, seg: &SegmentEvent) -> Vec<Emission> {
        let mut out = Vec::new();

        if seg.ack_set {
            if !(self.iss < seg.ack && seg.ack <= self.snd_nxt) {
                if !seg.rst {
                    out.push(Emission::Rst {
                        seq: seg.ack,
                        ack: None,
                    });
                }
                return out;
            }
            if seg.rst {
                self.state = State::Closed;
                out.push(Emission::Purge);
                return out;
            }
        }
        if seg.rst {
            return out;
        }

        if seg.syn {
            self.irs = seg.seq;
            self.rcv_nxt = seg.seq + 1;
            if let Some(mss) = seg.options.mss {
                self.mss = mss;
            }
            if seg.ack_set {
                self.snd_una = seg.ack;
                out.push(Emission::Evict(seg.ack));
            }

            if self.iss < self.snd_una {
                // our SYN is acked
                self.state = State::Established;
                self.snd_wnd = seg.wnd;
                self.snd_wl1 = seg.seq;
                self.snd_wl2 = seg.ack;
                out.push(Emission::Ack);
            } else {
                // simultaneous open
                self.state = State::SynReceived;
                out.push(Emission::SynAck);
            }
        }

        out
    }

    fn on_synchronized(&mut self, seg: &SegmentEvent) -> Vec<Emission> {
        let mut out = Vec::new();

        // First, check the sequence number. An unacceptable segment earns a
        // bare ACK unless it is a reset.
        if !self.acceptable(seg) {
            if !seg.rst {
                out.push(Emission::Ack);
            }
            return out;
        }

        // Second, the RST bit.
        if seg.rst {
            self.state = State::Closed;
            out.push(Emission::Purge);
            return out;
        }

        // Fourth, the SYN bit: in the window in a synchronized state is an
        // error, answered with a reset.
        if seg.syn {
            out.push(Emission::Rst {
                seq: self.snd_nxt,
                ack: None,
            });
            self.state = State::Closed;
            out.push(Emission::Purge);
            return out;
        }

        // Fifth, the ACK field: without it, drop.
        if !seg.ack_set {
            return out;
        }

        if self.state == State::SynReceived {
            /*
            If SND.UNA < SEG.ACK =< SND.NXT, enter ESTABLISHED and set
            SND.WND <- SEG.WND, SND.WL1 <- SEG.SEQ, SND.WL2 <- SEG.ACK;
            otherwise form a reset <SEQ=SEG.ACK><CTL=RST>.
            */
            if self.snd_una < seg.ack && seg.ack <= self.snd_nxt {
                self.state = State::Established;
                self.snd_una = seg.ack;
                self.snd_wnd = seg.wnd;
                self.snd_wl1 = seg.seq;
                self.snd_wl2 = seg.ack;
                out.push(Emission::Evict(seg.ack));
            } else {
                out.push(Emission::Rst {
                    seq: seg.ack,
                    ack: None,
                });
                return out;
            }
        } else {
            if self.snd_una < seg.ack && seg.ack <= self.snd_nxt {
                self.snd_una = seg.ack;
                out.push(Emission::Evict(seg.ack));
            } else if self.snd_nxt < seg.ack {
                // acks something never sent
                out.push(Emission::Ack);
                return out;
            }

            /*
            If SND.UNA =< SEG.ACK =< SND.NXT, the send window should be
            updated. If (SND.WL1 < SEG.SEQ or (SND.WL1 = SEG.SEQ and
            SND.WL2 =< SEG.ACK)), set SND.WND <- SEG.WND, SND.WL1 <-
            SEG.SEQ, SND.WL2 <- SEG.ACK. The check prevents old segments
            from updating the window.
            */
            if self.snd_una <= seg.ack && seg.ack <= self.snd_nxt {
                if self.snd_wl1 < seg.seq
                    || (self.snd_wl1 == seg.seq && self.snd_wl2 <= seg.ack)
                {
                    self.snd_wnd = seg.wnd;
                    self.snd_wl1 = seg.seq;
                    self.snd_wl2 = seg.ack;
                }
            }

            match self.state {
                State::FinWait1 => {
                    if self.fin_acked() {
                        self.state = State::FinWait2;
                    }
                }
                State::Closing => {
                    if self.fin_acked() {
                        self.enter_time_wait();
                    }
                }
                State::LastAck => {
                    if self.fin_acked() {
                        self.state = State::Closed;
                        out.push(Emission::Purge);
                        return out;
                    }
                }
                State::TimeWait => {
                    self.time_wait = Some(Instant::now() + 2 * MSL);
                }
                _ => {}
            }
        }

        // Seventh, the segment text. Only states that still expect data take
        // it; the rest arrive after the peer's FIN and carry none.
        if matches!(
            self.state,
            State::Established | State::FinWait1 | State::FinWait2
        ) {
            if seg.urg_set {
                self.urg_rcv = seg.urg;
            }
            if !seg.payload.is_empty() {
                let skip = if seg.seq < self.rcv_nxt {
                    (self.rcv_nxt - seg.seq) as usize
                } else {
                    0
                };
                if skip < seg.payload.len() {
                    out.push(Emission::Ingest {
                        skip,
                        psh: seg.psh,
                    });
                }
            }
        }

        // Eighth, the FIN bit.
        if seg.fin {
            out.push(Emission::Fin { end: seg.end() });
        }

        out
    }
}

/// Per-chunk send flags for `transmit`. Resets never go through `transmit`;
/// they carry explicit sequence numbers and are built straight in codec.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SendFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub psh: bool,
    pub mss: Option<u16>,
}

impl SendFlags {
    fn ack() -> Self {
        SendFlags {
            ack: true,
            ..SendFlags::default()
        }
    }
}

/// One TCP connection: the TCB behind a mutex, a state-change condition,
/// the reassembly buffer, and the collaborators the transmit path needs.
pub(crate) struct Connection {
    tcb: Mutex<Tcb>,
    state_var: Condvar,
    accept_var: Condvar,
    reassembly: ReassemblyBuffer,
    ip: Arc<dyn IpSender>,
    rtx: Arc<RetransmitQueue>,
}

impl Connection {
    pub fn new(ip: Arc<dyn IpSender>, rtx: Arc<RetransmitQueue>, iss: SeqNum) -> Arc<Self> {
        Arc::new(Connection {
            tcb: Mutex::new(Tcb::new(iss)),
            state_var: Condvar::new(),
            accept_var: Condvar::new(),
            reassembly: ReassemblyBuffer::new(),
            ip,
            rtx,
        })
    }

    pub fn state(&self) -> State {
        self.tcb.lock().unwrap().state
    }

    pub fn quad(&self) -> Quad {
        self.tcb.lock().unwrap().quad
    }

    /// CLOSED -> LISTEN.
    pub fn set_passive(&self, local: Dual, backlog: usize) -> Result<(), Error> {
        let mut tcb = self.tcb.lock().unwrap();
        if tcb.state != State::Closed {
            return Err(Error::SocketInUse);
        }
        tcb.quad = Quad {
            local,
            remote: Dual::unspecified(),
        };
        tcb.backlog = cmp::max(backlog, 1);
        tcb.state = State::Listen;
        Ok(())
    }

    /// CLOSED -> SYN_SENT, or CLOSED -> SYN_RECEIVED when seeded with a
    /// parked SYN from a listener.
    pub fn set_active(&self, quad: Quad, syn: Option<&SynRecord>) -> Result<(), Error> {
        let mut tcb = self.tcb.lock().unwrap();
        if tcb.state != State::Closed {
            return Err(Error::SocketInUse);
        }
        tcb.quad = quad;
        match syn {
            Some(rec) => {
                tcb.irs = rec.seq;
                tcb.rcv_nxt = rec.seq + 1;
                tcb.snd_wnd = rec.wnd;
                if let Some(mss) = rec.options.mss {
                    tcb.mss = mss;
                }
                tcb.state = State::SynReceived;
                self.reassembly.reset_base(tcb.rcv_nxt);
            }
            None => tcb.state = State::SynSent,
        }
        Ok(())
    }

    /// Builds and sends one segment from the current send state. The new
    /// `snd_nxt` slice is reserved here; everything except pure ACKs goes
    /// through the retransmission queue.
    fn transmit(&self, tcb: &mut Tcb, flags: SendFlags, payload: &[u8]) -> Result<(), Error> {
        let mut meta = SegmentMeta::new(tcb.quad, tcb.snd_nxt);
        meta.ack = flags.ack.then_some(tcb.rcv_nxt);
        meta.wnd = tcb.rcv_wnd;
        meta.syn = flags.syn;
        meta.fin = flags.fin;
        meta.psh = flags.psh;
        meta.mss = flags.mss;
        let bytes = codec::build(&meta, payload);

        let phantom = (flags.syn || flags.fin) && payload.is_empty();
        tcb.snd_nxt = tcb.snd_nxt + payload.len() as u32 + phantom as u32;
        debug_assert!(tcb.snd_una <= tcb.snd_nxt);

        if payload.is_empty() && !flags.syn && !flags.fin {
            self.ip
                .send(None, tcb.quad.remote.ipv4, PROTO_TCP, &bytes)
        } else {
            self.rtx.enqueue(tcb.quad, tcb.snd_nxt, bytes);
            Ok(())
        }
    }

    /// First segment of a handshake: SYN from SYN_SENT, SYN+ACK from
    /// SYN_RECEIVED, advertising our MSS.
    pub fn send_syn(&self) -> Result<(), Error> {
        let mut tcb = self.tcb.lock().unwrap();
        let flags = SendFlags {
            syn: true,
            ack: tcb.state == State::SynReceived,
            mss: Some(DEFAULT_MSS),
            ..SendFlags::default()
        };
        self.transmit(&mut tcb, flags, &[])
    }

    /// Reacts to one inbound segment: runs the state machine, performs its
    /// emissions, wakes whoever the outcome concerns.
    pub fn handle_segment(&self, seg: &SegmentEvent) {
        let mut tcb = self.tcb.lock().unwrap();
        let old = tcb.state;

        let emissions = tcb.on_segment(seg);

        // the active handshake just learned the peer's ISS
        if old == State::SynSent && tcb.state != State::SynSent {
            self.reassembly.reset_base(tcb.rcv_nxt);
        }

        let mut wants_ack = false;
        for emission in emissions {
            wants_ack |= self.perform(&mut tcb, emission, seg);
        }
        if wants_ack {
            if let Err(e) = self.transmit(&mut tcb, SendFlags::ack(), &[]) {
                warn!("ack to {} failed: {}", tcb.quad.remote.ipv4, e);
            }
        }

        if tcb.state != old {
            debug!(
                "{}:{} <-> {}:{}: {:?} -> {:?}",
                tcb.quad.local.ipv4,
                tcb.quad.local.port,
                tcb.quad.remote.ipv4,
                tcb.quad.remote.port,
                old,
                tcb.state
            );
            self.state_var.notify_all();
        }
        if tcb.state == State::Closed {
            self.reassembly.close();
        }
    }

    /// Carries one emission out. Returns whether an ACK should follow once
    /// every emission of the segment has been handled (so data + FIN in one
    /// segment produce a single ACK).
    fn perform(&self, tcb: &mut Tcb, emission: Emission, seg: &SegmentEvent) -> bool {
        match emission {
            Emission::Ack => true,
            Emission::SynAck => {
                // handshake restart: nothing sent before ISS+1 matters now
                self.rtx.purge(tcb.quad);
                tcb.snd_nxt = tcb.iss;
                let flags = SendFlags {
                    syn: true,
                    ack: true,
                    mss: Some(DEFAULT_MSS),
                    ..SendFlags::default()
                };
                if let Err(e) = self.transmit(tcb, flags, &[]) {
                    warn!("syn+ack to {} failed: {}", tcb.quad.remote.ipv4, e);
                }
                false
            }
            Emission::Rst { seq, ack } => {
                let mut meta = SegmentMeta::new(tcb.quad, seq);
                meta.rst = true;
                meta.ack = ack;
                let bytes = codec::build(&meta, &[]);
                if let Err(e) = self.ip.send(None, tcb.quad.remote.ipv4, PROTO_TCP, &bytes) {
                    warn!("rst to {} failed: {}", tcb.quad.remote.ipv4, e);
                }
                false
            }
            Emission::Park(record) => {
                tcb.pending.push_back(record);
                self.accept_var.notify_one();
                false
            }
            Emission::Evict(upto) => {
                self.rtx.ack(tcb.quad, upto);
                false
            }
            Emission::Purge => {
                self.rtx.purge(tcb.quad);
                false
            }
            Emission::Ingest { skip, psh } => {
                let seq = seg.seq + skip as u32;
                let mut data = &seg.payload[skip..];

                // never take bytes past the advertised window
                let limit = tcb.rcv_nxt + tcb.rcv_wnd as u32;
                let end = seq + data.len() as u32;
                if limit < end {
                    data = &data[..(limit - seq) as usize];
                }
                if data.is_empty() {
                    return false;
                }

                self.reassembly.insert(seq, data, psh);

                // collapse the ack over everything now contiguous
                let mut ack = tcb.rcv_nxt;
                if let Some(frontier) = self.reassembly.ackable() {
                    if ack < frontier {
                        ack = frontier;
                    }
                }
                if seg.seq <= tcb.rcv_nxt {
                    let covered = seq + data.len() as u32;
                    if ack < covered {
                        ack = covered;
                    }
                }
                tcb.rcv_nxt = ack;
                tcb.rcv_wnd =
                    DEFAULT_WINDOW.saturating_sub(self.reassembly.bytes_buffered() as u16);
                true
            }
            Emission::Fin { end } => {
                if end != tcb.rcv_nxt {
                    // out of order; the peer will retransmit it in order
                    return false;
                }
                tcb.rcv_nxt = tcb.rcv_nxt + 1;
                // zero-length PSH marker: a blocked reader wakes and sees
                // end of stream
                self.reassembly.insert(end, &[], true);

                match tcb.state {
                    State::SynReceived | State::Established => tcb.state = State::CloseWait,
                    State::FinWait1 => {
                        if tcb.fin_acked() {
                            tcb.enter_time_wait();
                        } else {
                            tcb.state = State::Closing;
                        }
                    }
                    State::FinWait2 => tcb.enter_time_wait(),
                    State::TimeWait => {
                        tcb.time_wait = Some(Instant::now() + 2 * MSL);
                    }
                    _ => {}
                }
                true
            }
        }
    }

    /// Sleeps until the state moves off `current` or the timeout elapses;
    /// returns whatever the state is then.
    pub fn wait_change(&self, current: State, timeout: Option<Duration>) -> State {
        let tcb = self.tcb.lock().unwrap();
        match timeout {
            None => {
                self.state_var
                    .wait_while(tcb, |t| t.state == current)
                    .unwrap()
                    .state
            }
            Some(limit) => {
                let (tcb, _) = self
                    .state_var
                    .wait_timeout_while(tcb, limit, |t| t.state == current)
                    .unwrap();
                tcb.state
            }
        }
    }

    /// Pops a parked SYN if one is waiting.
    pub fn next_pending(&self) -> Option<SynRecord> {
        self.tcb.lock().unwrap().pending.pop_front()
    }

    /// Blocks until a parked SYN is available on this listener.
    pub fn wait_pending(&self) -> Result<SynRecord, Error> {
        let mut tcb = self.tcb.lock().unwrap();
        loop {
            if tcb.state != State::Listen {
                return Err(Error::NotListening);
            }
            if let Some(record) = tcb.pending.pop_front() {
                return Ok(record);
            }
            tcb = self.accept_var.wait(tcb).unwrap();
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        {
            let mut tcb = self.tcb.lock().unwrap();
            loop {
                match tcb.state {
                    State::Established
                    | State::FinWait1
                    | State::FinWait2
                    | State::CloseWait => break,
                    State::SynSent | State::SynReceived => {
                        tcb = self.state_var.wait(tcb).unwrap();
                    }
                    State::Listen => return Err(Error::NotListening),
                    State::Closed => return Err(Error::NotConnected),
                    _ => return Err(Error::Closing),
                }
            }
        }

        match self.reassembly.read(buf) {
            Err(Error::NoData) => Err(Error::NotConnected),
            other => other,
        }
    }

    /// Queues as much of `buf` as the usable window allows, sliced into
    /// MSS-sized segments, PSH on the last one.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let mut tcb = self.tcb.lock().unwrap();
        loop {
            match tcb.state {
                State::Established | State::CloseWait => break,
                State::SynSent | State::SynReceived => {
                    tcb = self.state_var.wait(tcb).unwrap();
                }
                State::Listen => return Err(Error::NotListening),
                State::Closed => return Err(Error::NotConnected),
                _ => return Err(Error::Closing),
            }
        }

        let mut queued = 0;
        while queued < buf.len() {
            let in_flight = tcb.snd_nxt - tcb.snd_una;
            let usable = (tcb.snd_wnd as u32).saturating_sub(in_flight) as usize;
            if usable == 0 {
                break;
            }

            let chunk = cmp::min(cmp::min(usable, tcb.mss as usize), buf.len() - queued);
            let flags = SendFlags {
                ack: true,
                psh: queued + chunk == buf.len(),
                ..SendFlags::default()
            };
            self.transmit(&mut tcb, flags, &buf[queued..queued + chunk])?;
            queued += chunk;
        }

        if queued == 0 {
            return Err(Error::WouldBlock);
        }
        Ok(queued)
    }

    /// The close of the user API. ESTABLISHED sends FIN and moves to
    /// FIN_WAIT1; CLOSE_WAIT sends FIN and moves to LAST_ACK, then waits for
    /// the final ACK.
    pub fn close(&self) -> Result<(), Error> {
        let mut tcb = self.tcb.lock().unwrap();
        match tcb.state {
            State::Closed | State::TimeWait => Ok(()),
            State::Listen | State::SynSent => {
                tcb.state = State::Closed;
                drop(tcb);
                self.state_var.notify_all();
                self.teardown();
                Ok(())
            }
            State::SynReceived | State::Established => {
                let flags = SendFlags {
                    fin: true,
                    ack: true,
                    ..SendFlags::default()
                };
                self.transmit(&mut tcb, flags, &[])?;
                tcb.state = State::FinWait1;
                self.state_var.notify_all();
                let _ = self
                    .state_var
                    .wait_timeout_while(tcb, CLOSE_TIMEOUT, |t| {
                        !matches!(t.state, State::Closed | State::TimeWait)
                    })
                    .unwrap();
                Ok(())
            }
            State::CloseWait => {
                let flags = SendFlags {
                    fin: true,
                    ack: true,
                    ..SendFlags::default()
                };
                self.transmit(&mut tcb, flags, &[])?;
                tcb.state = State::LastAck;
                self.state_var.notify_all();
                let _ = self
                    .state_var
                    .wait_timeout_while(tcb, CLOSE_TIMEOUT, |t| t.state != State::Closed)
                    .unwrap();
                Ok(())
            }
            _ => Err(Error::Closing),
        }
    }

    fn teardown(&self) {
        let quad = self.quad();
        self.rtx.purge(quad);
        self.reassembly.clear();
        self.reassembly.close();
        self.accept_var.notify_all();
    }

    /// Forces CLOSED and releases everything and everyone attached.
    pub fn deinit(&self) {
        {
            let mut tcb = self.tcb.lock().unwrap();
            tcb.state = State::Closed;
            tcb.pending.clear();
        }
        self.state_var.notify_all();
        self.teardown();
    }
}
