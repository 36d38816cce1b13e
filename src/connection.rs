//! Per-flow state: the TCP control block.

use std::collections::VecDeque;

use crate::event::{EventFlags, Intent};
use crate::seq::SeqNum;
use crate::wire::{Domain, FourTuple};
use crate::wrb::WriteBuffer;

/// TCP connection states (RFC 793 §3.2), minus `Closed`/`Listen`/`CloseWait` which
/// this crate represents structurally: a `Closed` connection simply isn't present in
/// the connection table any more, `Listen` lives in the listener registry
/// ([`crate::table::ConnectionTable`]) rather than as a per-flow state, and
/// `CloseWait` is not reachable because, like the grounding source, the application
/// is forced to close as soon as a FIN arrives (`Established` goes straight to
/// `LastAck`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    LastAck,
    Closed,
}

/// Van Jacobson RTT estimator state plus the retransmission timer.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    /// Smoothed RTT estimate, scaled by 8 (`sa`).
    pub sa: i32,
    /// Smoothed mean deviation, scaled by 4 (`sv`).
    pub sv: i32,
    /// Current retransmission timeout.
    pub rto: i32,
    /// Ticks remaining until the current segment's RTO expires.
    pub timer: i32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        // Matches the grounding source's initial RTO of 3 ticks with sa/sv unset;
        // the first measured sample anneals this quickly via the VJ update.
        RttEstimator {
            sa: 0,
            sv: 4,
            rto: 3,
            timer: 3,
        }
    }
}

impl RttEstimator {
    /// Van Jacobson's update, run only when `nrtx == 0` (SPEC_FULL.md §4.2 step 7).
    /// Does not touch `timer` — callers always follow up with [`RttEstimator::reset_timer`]
    /// regardless of `nrtx`, matching the spec's separate "set timer := rto" step.
    pub fn sample(&mut self) {
        let mut m = self.rto - self.timer;
        m -= self.sa >> 3;
        self.sa += m;
        if m < 0 {
            m = -m;
        }
        m -= self.sv >> 2;
        self.sv += m;
        self.rto = (self.sa >> 3) + self.sv;
    }

    pub fn reset_timer(&mut self) {
        self.timer = self.rto;
    }
}

type EventHandler = Box<dyn FnMut(&mut dyn crate::wire::Device, &mut Connection, EventFlags) -> EventFlags>;

/// The TCP control block for one connection.
pub struct Connection {
    pub four_tuple: FourTuple,
    pub domain: Domain,
    pub state: State,

    /// Next sequence number expected from the peer.
    pub rcvseq: SeqNum,
    /// Next byte to send (mirrors `SND.NXT`; kept in sync with `isn + sent` under the
    /// canonical buffered model, see SPEC_FULL.md §9).
    pub sndseq: SeqNum,
    /// Initial send sequence number.
    pub isn: SeqNum,
    /// Highest sequence number ever scheduled for transmission.
    pub sndseq_max: SeqNum,

    /// Bytes outstanding, legacy unbuffered accounting. Derived on demand by
    /// [`Connection::unacked`] rather than stored redundantly; settable directly only
    /// for the handshake/FIN bookkeeping steps that the grounding source assigns it
    /// explicitly (e.g. `unacked := 1` after sending a FIN).
    unacked_override: Option<u32>,
    /// Bytes sent but not yet ACKed, buffered model.
    pub tx_unacked: u32,
    /// Cumulative bytes queued past `isn`.
    pub sent: u32,

    pub mss: u16,
    /// Peer's last-advertised receive window.
    pub snd_wnd: u16,
    /// Per-connection send-buffer cap in bytes; 0 disables back-pressure.
    pub snd_bufs: u32,
    /// Connection-level non-blocking mode, set once (the `fcntl`/`O_NONBLOCK`
    /// equivalent) independent of any one call's `SendFlags::DONTWAIT`.
    pub nonblocking: bool,

    pub rtt: RttEstimator,
    /// Connection-level retransmit counter (distinct from any one WRB's `nrtx`).
    pub nrtx: u8,
    /// Count of WRBs that exhausted MAXRTX and were dropped. Nonzero + `Established`
    /// means the timer layer should tear the connection down (SPEC_FULL.md §7).
    pub expired: u32,

    pub write_q: VecDeque<WriteBuffer>,
    pub unacked_q: VecDeque<WriteBuffer>,

    /// Posted (incremented) whenever a blocked producer should be woken.
    pub snd_sem: u32,

    /// Suppresses NEWDATA delivery to the application (`UIP_STOPPED` equivalent).
    pub stopped: bool,

    /// `Some` once the FIN's sequence number is known, for the "don't re-read past
    /// the FIN" special case in segment formation.
    pub closed_at: Option<SeqNum>,

    pub callback: Option<EventHandler>,
    pub callback_mask: EventFlags,

    /// Actions recorded by a callback to be applied by the driver loop after the
    /// event handler returns (SPEC_FULL.md §9 deferred-action note).
    pub pending_intents: Vec<Intent>,
}

impl Connection {
    pub fn new(four_tuple: FourTuple, domain: Domain, isn: SeqNum, mss: u16, snd_bufs: u32) -> Self {
        Connection {
            four_tuple,
            domain,
            state: State::SynSent,
            rcvseq: SeqNum::new(0),
            sndseq: isn,
            isn,
            sndseq_max: isn,
            unacked_override: None,
            tx_unacked: 0,
            sent: 0,
            mss,
            snd_wnd: 0,
            snd_bufs,
            nonblocking: false,
            rtt: RttEstimator::default(),
            nrtx: 0,
            expired: 0,
            write_q: VecDeque::new(),
            unacked_q: VecDeque::new(),
            snd_sem: 0,
            stopped: false,
            closed_at: None,
            callback: None,
            callback_mask: EventFlags::empty(),
            pending_intents: Vec::new(),
        }
    }

    /// `unackseq := isn + sent` under the canonical buffered model.
    pub fn unackseq(&self) -> SeqNum {
        self.isn.add(self.sent)
    }

    /// Legacy-style outstanding-byte count, derived from the buffered model unless a
    /// handshake/FIN step has set it explicitly via [`Connection::set_unacked`].
    pub fn unacked(&self) -> u32 {
        self.unacked_override
            .unwrap_or_else(|| self.unackseq().distance_from(self.sndseq))
    }

    pub fn set_unacked(&mut self, value: u32) {
        self.unacked_override = Some(value);
    }

    pub fn clear_unacked_override(&mut self) {
        self.unacked_override = None;
    }

    /// Post the send-buffer semaphore: wake one blocked producer.
    pub fn post_snd_sem(&mut self) {
        self.snd_sem += 1;
    }

    /// Total bytes still queued (awaiting transmission or awaiting ACK) — used for
    /// the producer's send-buffer cap check.
    pub fn inqueue_bytes(&self) -> u32 {
        let write_q: u32 = self.write_q.iter().map(|w| w.pktlen() as u32).sum();
        let unacked_q: u32 = self.unacked_q.iter().map(|w| w.pktlen() as u32).sum();
        write_q + unacked_q
    }

    /// Release every WRB on both queues, matching `psock_lost_connection`'s write
    /// buffer teardown. Does not itself post `snd_sem` or change `state` — callers
    /// (the disconnect path in `egress::on_event`) handle those.
    pub fn drain_queues(&mut self) {
        self.write_q.clear();
        self.unacked_q.clear();
        self.sent = 0;
        self.sndseq_max = self.isn;
    }

    /// Insert a WRB into a queue kept sorted ascending by `seqno` (modular
    /// comparison), mirroring `psock_insert_segment`.
    pub fn insert_sorted(queue: &mut VecDeque<WriteBuffer>, wrb: WriteBuffer) {
        let seqno = wrb
            .seqno()
            .expect("only fully-sent write buffers (with an assigned seqno) are sorted into a queue");
        let pos = queue
            .iter()
            .position(|existing| {
                existing
                    .seqno()
                    .map(|existing_seq| seqno.lt(existing_seq))
                    .unwrap_or(false)
            })
            .unwrap_or(queue.len());
        queue.insert(pos, wrb);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("four_tuple", &self.four_tuple)
            .field("state", &self.state)
            .field("rcvseq", &self.rcvseq)
            .field("sndseq", &self.sndseq)
            .field("isn", &self.isn)
            .field("tx_unacked", &self.tx_unacked)
            .field("sent", &self.sent)
            .field("mss", &self.mss)
            .field("snd_wnd", &self.snd_wnd)
            .field("nrtx", &self.nrtx)
            .field("expired", &self.expired)
            .field("write_q_len", &self.write_q.len())
            .field("unacked_q_len", &self.unacked_q.len())
            .finish()
    }
}
