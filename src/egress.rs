//! The buffered egress engine: ACK reconciliation, retransmission, and segmentation.
//!
//! `on_event` is the single entry point the device poll loop (or the ingress state
//! machine, for events it raises itself) invokes with a connection and a flag word.
//! It always runs ACK handling, then REXMIT handling, then segment formation, in that
//! fixed order (SPEC_FULL.md §5 ordering guarantee).

use crate::config::TcpConfig;
use crate::connection::{Connection, State};
use crate::event::{EventFlags, Intent};
use crate::seq::SeqNum;
use crate::wire::{Device, SegmentBuilder, TcpFlags};

/// Drive one egress cycle. `ack` is the peer's acknowledgment number carried by the
/// segment that raised this event; it is only consulted when `ACKDATA` is set.
pub fn on_event(
    dev: &mut dyn Device,
    conn: &mut Connection,
    cfg: &TcpConfig,
    mut flags: EventFlags,
    ack: SeqNum,
) -> EventFlags {
    if flags.is_disconnect() {
        conn.drain_queues();
        conn.post_snd_sem();
        conn.callback = None;
        if flags.contains(EventFlags::NETDOWN) {
            conn.state = State::Closed;
            conn.tx_unacked = 0;
        }
        return flags;
    }

    if flags.contains(EventFlags::ACKDATA) {
        reconcile_acks(conn, cfg, ack, flags.contains(EventFlags::NEWDATA), &mut flags);
    }

    if flags.contains(EventFlags::REXMIT) {
        rexmit(conn, cfg);
    }

    if conn.state == State::Established
        && flags.intersects(EventFlags::POLL | EventFlags::REXMIT)
        && !conn.write_q.is_empty()
        && conn.snd_wnd > 0
    {
        form_segment(dev, conn);
        flags.remove(EventFlags::POLL);
    }

    flags
}

/// Apply any [`crate::event::Intent`]s an application callback recorded during the
/// `on_event` call that just returned. Never called from inside `on_event` itself —
/// that is what makes this safe against the re-entrancy hazard named in
/// SPEC_FULL.md §9.
pub fn drain_intents(dev: &mut dyn Device, conn: &mut Connection, cfg: &TcpConfig) -> EventFlags {
    let intents = std::mem::take(&mut conn.pending_intents);
    let mut result = EventFlags::empty();
    for intent in intents {
        let flags = match intent {
            Intent::Close => EventFlags::CLOSE,
            Intent::Abort => EventFlags::ABORT,
        };
        result |= on_event(dev, conn, cfg, flags, conn.sndseq);
    }
    result
}

/// SPEC_FULL.md §4.4 "On ACKDATA": trim or release everything `ack` now covers, and
/// count duplicate ACKs toward a fast-retransmit trigger.
fn reconcile_acks(conn: &mut Connection, cfg: &TcpConfig, ack: SeqNum, newdata: bool, flags: &mut EventFlags) {
    let mut acked = 0u32;

    if let Some(head) = conn.write_q.front_mut() {
        if let Some(seqno) = head.seqno() {
            if ack.gt(seqno) {
                let trim = ack.distance_from(seqno).min(head.sent() as u32);
                head.trim_front(trim as usize);
                acked += trim;
            }
        }
    }

    loop {
        let Some(front) = conn.unacked_q.front() else {
            break;
        };
        let seqno = front
            .seqno()
            .expect("unacked_q entries always carry a seqno by construction");

        if ack.gt(seqno) {
            let lastseq = seqno.add(front.pktlen() as u32);
            if ack.ge(lastseq) {
                let wrb = conn.unacked_q.pop_front().unwrap();
                acked += wrb.pktlen() as u32;
            } else {
                let trim = ack.distance_from(seqno);
                conn.unacked_q.front_mut().unwrap().trim_front(trim as usize);
                acked += trim;
                break;
            }
        } else if ack == seqno {
            let len = conn.unacked_q.len();
            let front = conn.unacked_q.front_mut().unwrap();
            if newdata {
                front.reset_nack();
            } else {
                let nack = front.bump_nack();
                if nack == cfg.fast_retransmit_watermark {
                    flags.insert(EventFlags::REXMIT);
                } else if nack > cfg.fast_retransmit_watermark && nack as usize == len.saturating_sub(1) {
                    front.reset_nack();
                }
            }
            break;
        } else {
            break;
        }
    }

    conn.tx_unacked = conn.tx_unacked.saturating_sub(acked);
}

/// SPEC_FULL.md §4.4 "On REXMIT": rewind the write_q head if it was partially sent,
/// then drain unacked_q from the tail, re-queuing survivors at write_q's head so the
/// smallest-seqno WRB ends up at the very front.
fn rexmit(conn: &mut Connection, cfg: &TcpConfig) {
    if let Some(head) = conn.write_q.front_mut() {
        if head.sent() > 0 {
            let rolled = head.rewind_for_retransmit() as u32;
            conn.tx_unacked = conn.tx_unacked.saturating_sub(rolled);
            conn.sent = conn.sent.saturating_sub(rolled);
            if head.nrtx() >= cfg.maxrtx {
                conn.write_q.pop_front();
                conn.expired += 1;
            }
        }
    }

    while let Some(mut wrb) = conn.unacked_q.pop_back() {
        let rolled = wrb.rewind_for_retransmit() as u32;
        conn.tx_unacked = conn.tx_unacked.saturating_sub(rolled);
        conn.sent = conn.sent.saturating_sub(rolled);
        if wrb.nrtx() >= cfg.maxrtx {
            conn.expired += 1;
        } else {
            conn.write_q.push_front(wrb);
        }
    }
}

/// SPEC_FULL.md §4.4 "Segment formation".
fn form_segment(dev: &mut dyn Device, conn: &mut Connection) {
    let mss = conn.mss as usize;
    let snd_wnd = conn.snd_wnd as usize;

    let Some(head) = conn.write_q.front_mut() else {
        return;
    };
    let remaining = head.pktlen() - head.sent();
    let sndlen = remaining.min(mss).min(snd_wnd);
    if sndlen == 0 {
        return;
    }

    if head.seqno().is_none() {
        head.set_seqno(conn.isn.add(conn.sent));
    }
    let seqno = head.seqno().unwrap();
    let sndseq = seqno.add(head.sent() as u32);
    let payload = head.peek(head.sent(), sndlen);

    let builder = SegmentBuilder::new(conn.four_tuple.local, conn.four_tuple.remote);
    let raw = builder.build(sndseq, conn.rcvseq, conn.snd_wnd, TcpFlags::ack(), None, &payload);
    let _ = dev.send(&raw);

    head.mark_sent(sndlen);
    conn.tx_unacked += sndlen as u32;
    conn.sent += sndlen as u32;

    let end = sndseq.add(sndlen as u32);
    if end.gt(conn.sndseq_max) {
        conn.sndseq_max = end;
    }

    if head.is_fully_sent() {
        let wrb = conn.write_q.pop_front().unwrap();
        Connection::insert_sorted(&mut conn.unacked_q, wrb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Domain, Endpoint, FourTuple, RecordingDevice};
    use crate::wrb::WriteBuffer;
    use std::net::Ipv4Addr;

    fn four_tuple() -> FourTuple {
        FourTuple {
            local: Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 80),
            remote: Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 4000),
        }
    }

    fn established(isn: u32, mss: u16) -> Connection {
        let mut conn = Connection::new(four_tuple(), Domain::V4, SeqNum::new(isn), mss, 0);
        conn.state = State::Established;
        conn.snd_wnd = 65535;
        conn
    }

    fn acked_wrb(seqno: u32, len: usize) -> WriteBuffer {
        let mut wrb = WriteBuffer::new();
        wrb.set_seqno(SeqNum::new(seqno));
        wrb.append(&vec![0u8; len]);
        wrb.mark_sent(len);
        wrb
    }

    #[test]
    fn ackdata_releases_fully_acked_wrb_and_trims_partial() {
        let mut conn = established(1000, 536);
        conn.unacked_q.push_back(acked_wrb(1000, 500));
        conn.unacked_q.push_back(acked_wrb(1500, 500));
        conn.tx_unacked = 1000;

        let cfg = TcpConfig::default();
        let mut dev = RecordingDevice::default();
        on_event(&mut dev, &mut conn, &cfg, EventFlags::ACKDATA, SeqNum::new(1700));

        assert_eq!(conn.unacked_q.len(), 1);
        let remaining = conn.unacked_q.front().unwrap();
        assert_eq!(remaining.seqno(), Some(SeqNum::new(1700)));
        assert_eq!(remaining.pktlen(), 300);
        assert_eq!(conn.tx_unacked, 300);
    }

    #[test]
    fn triple_duplicate_ack_schedules_fast_retransmit() {
        let mut conn = established(1000, 536);
        conn.unacked_q.push_back(acked_wrb(1000, 500));
        conn.unacked_q.push_back(acked_wrb(1500, 500));
        conn.tx_unacked = 1000;
        conn.snd_wnd = 0; // keep segment formation out of this test

        let cfg = TcpConfig::default();
        let mut dev = RecordingDevice::default();
        for _ in 0..3 {
            on_event(&mut dev, &mut conn, &cfg, EventFlags::ACKDATA, SeqNum::new(1000));
        }

        // REXMIT rewinds the whole unacked_q (go-back-N, not per-segment SACK), so
        // both A and B move to write_q; the sorted re-insert keeps A (smaller seqno)
        // at the head.
        assert_eq!(conn.write_q.len(), 2);
        assert_eq!(conn.write_q.front().unwrap().seqno(), Some(SeqNum::new(1000)));
        assert_eq!(conn.write_q.front().unwrap().sent(), 0);
        assert_eq!(conn.write_q.front().unwrap().nrtx(), 1);
        assert!(conn.unacked_q.is_empty());
    }

    #[test]
    fn maxrtx_exhaustion_drops_wrb_and_marks_expired() {
        let mut conn = established(1000, 536);
        conn.unacked_q.push_back(acked_wrb(1000, 500));
        conn.tx_unacked = 500;
        conn.sent = 500;

        let cfg = TcpConfig {
            maxrtx: 3,
            ..TcpConfig::default()
        };
        let mut dev = RecordingDevice::default();

        for _ in 0..4 {
            on_event(&mut dev, &mut conn, &cfg, EventFlags::REXMIT, conn.sndseq);
        }

        assert!(conn.unacked_q.is_empty());
        assert!(conn.write_q.is_empty());
        assert_eq!(conn.expired, 1);
        assert_eq!(conn.tx_unacked, 0);
    }

    #[test]
    fn segment_formation_assigns_seqno_and_moves_to_unacked_q() {
        let mut conn = established(1000, 536);
        let mut wrb = WriteBuffer::new();
        wrb.append(b"hello");
        conn.write_q.push_back(wrb);

        let cfg = TcpConfig::default();
        let mut dev = RecordingDevice::default();
        let flags = on_event(&mut dev, &mut conn, &cfg, EventFlags::POLL, conn.sndseq);

        assert!(!flags.contains(EventFlags::POLL));
        assert_eq!(dev.sent.len(), 1);
        assert!(conn.write_q.is_empty());
        assert_eq!(conn.unacked_q.len(), 1);
        assert_eq!(conn.unacked_q.front().unwrap().seqno(), Some(SeqNum::new(1000)));
        assert_eq!(conn.tx_unacked, 5);
        assert_eq!(conn.sent, 5);
    }

    #[test]
    fn disconnect_drains_queues_and_posts_semaphore() {
        let mut conn = established(1000, 536);
        conn.write_q.push_back(acked_wrb(1000, 10));
        conn.unacked_q.push_back(acked_wrb(2000, 10));

        let cfg = TcpConfig::default();
        let mut dev = RecordingDevice::default();
        on_event(&mut dev, &mut conn, &cfg, EventFlags::ABORT, conn.sndseq);

        assert!(conn.write_q.is_empty());
        assert!(conn.unacked_q.is_empty());
        assert_eq!(conn.snd_sem, 1);
    }
}
