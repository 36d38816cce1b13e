//! The receive-path state machine: `tcp_input` and its per-state transition table.

use log::{debug, trace, warn};

use crate::config::TcpConfig;
use crate::connection::{Connection, State};
use crate::event::EventFlags;
use crate::table::ConnectionTable;
use crate::wire::{Device, Domain, FourTuple, Segment, SegmentBuilder, TcpFlags};

/// Advertised receive window this crate offers the peer. There is no flow-control
/// feedback loop from the application in this core (that lives above the `AppCallback`
/// boundary), so a single fixed value stands in for it, as in the grounding source's
/// `WINDOW_SIZE` constant.
const RCV_WINDOW: u16 = 4096;

/// Entry point from the IP layer: demultiplex `segment`, advance whichever
/// connection it belongs to (or start a new one), and hand any response segments to
/// `dev`.
pub fn tcp_input(table: &mut ConnectionTable, dev: &mut dyn Device, cfg: &TcpConfig, segment: &Segment) {
    if !segment.checksum_ok() {
        table.stats.chkerr += 1;
        table.stats.drop += 1;
        trace!("dropping segment with bad checksum");
        return;
    }
    table.stats.recv += 1;

    let ft = segment.four_tuple();
    let flags = segment.flags();

    if table.get(&ft).is_some() {
        // Step 3: a SYN on an established/half-established connection that isn't
        // still waiting on its own retransmitted SYN is always a protocol error.
        if flags.syn && table.get(&ft).unwrap().state != State::SynRcvd {
            warn!("unexpected SYN on an active connection, resetting");
            send_rst(dev, ft, segment);
            return;
        }

        let remove = {
            let conn = table.get_mut(&ft).unwrap();
            handle_existing(dev, cfg, segment, conn)
        };
        if remove {
            table.remove(&ft);
        }
        return;
    }

    if flags.syn && table.is_listening(ft.local.port) {
        accept_new_connection(table, dev, cfg, segment, ft);
    } else if flags.rst {
        table.stats.drop += 1;
    } else {
        table.stats.synrst += 1;
        send_rst(dev, ft, segment);
    }
}

/// Steps 4-8 of SPEC_FULL.md §4.2 for a segment matching an already-known connection.
/// Returns `true` if the connection just transitioned to `Closed` and should be
/// dropped from the table.
fn handle_existing(dev: &mut dyn Device, cfg: &TcpConfig, segment: &Segment, conn: &mut Connection) -> bool {
    let flags = segment.flags();
    let has_payload = !segment.payload.is_empty();

    // Step 4: window update.
    conn.snd_wnd = segment.tcp.window_size();

    // Step 5: RST handling.
    if flags.rst {
        conn.state = State::Closed;
        deliver_to_app(dev, conn, EventFlags::ABORT);
        return true;
    }

    // Step 6: out-of-order guard, with the two handshake special cases.
    let carries_data_or_synfin = has_payload || (flags.syn && flags.fin);
    let handshake_special = (conn.state == State::SynSent && flags.syn && flags.ack)
        || (conn.state == State::SynRcvd && flags.syn && !flags.ack);
    if carries_data_or_synfin && segment.seq() != conn.rcvseq && !handshake_special {
        send_ack(dev, conn);
        return false;
    }

    // Step 7: ACK reconciliation.
    let mut out_flags = EventFlags::empty();
    if flags.ack {
        let unackseq = conn.unackseq();
        if conn.sndseq != unackseq {
            let ackseq = segment.ack();
            if ackseq.le(unackseq) {
                if conn.nrtx == 0 {
                    conn.rtt.sample();
                }
                conn.rtt.reset_timer();
                conn.sndseq = ackseq;
                out_flags.insert(EventFlags::ACKDATA);
            } else if conn.state == State::Established {
                // Mirrors the original's `goto reset`: send an RST and stop, with no
                // state change and no callback — this is peer misbehavior, not a
                // local close.
                warn!("ACK beyond anything ever sent, resetting");
                send_rst_for(dev, conn);
                return false;
            }
        }
    }

    // Step 8: exhaustive per-state transition.
    match conn.state {
        State::SynRcvd => {
            if out_flags.contains(EventFlags::ACKDATA) {
                conn.state = State::Established;
                out_flags.insert(EventFlags::CONNECTED);
                if has_payload {
                    out_flags.insert(EventFlags::NEWDATA);
                }
                debug!("connection established (passive open)");
                let response = deliver_to_app(dev, conn, out_flags);
                if has_payload && response.contains(EventFlags::SNDACK) {
                    conn.rcvseq = conn.rcvseq.add(segment.payload.len() as u32);
                }
                send_ack(dev, conn);
            } else if flags.syn {
                send_synack(dev, conn);
            }
            false
        }

        State::SynSent => {
            if out_flags.contains(EventFlags::ACKDATA) && flags.syn && flags.ack {
                if let Some(mss) = segment.parsed_mss() {
                    conn.mss = mss.min(cfg.mss);
                }
                conn.rcvseq = segment.seq().add(1);
                conn.state = State::Established;
                out_flags.insert(EventFlags::CONNECTED | EventFlags::NEWDATA);
                debug!("connection established (active open)");
                deliver_to_app(dev, conn, out_flags);
                false
            } else {
                out_flags.insert(EventFlags::ABORT);
                conn.state = State::Closed;
                send_rst_for(dev, conn);
                deliver_to_app(dev, conn, out_flags);
                true
            }
        }

        State::Established => {
            if flags.fin && !conn.stopped {
                conn.rcvseq = conn.rcvseq.add(segment.payload.len() as u32 + 1);
                out_flags.insert(EventFlags::CLOSE);
                if has_payload {
                    out_flags.insert(EventFlags::NEWDATA);
                }
                conn.state = State::LastAck;
                // Our FIN consumes one sequence number, same trick used for the SYN
                // in `accept_new_connection`: fold it into `sent` so `unackseq`
                // reflects it, and mirror it in the legacy `unacked` counter.
                conn.sent += 1;
                conn.set_unacked(1);
                deliver_to_app(dev, conn, out_flags);
                send_finack(dev, conn);
            } else {
                if has_payload {
                    out_flags.insert(EventFlags::NEWDATA);
                }
                let response = deliver_to_app(dev, conn, out_flags);
                if response.contains(EventFlags::SNDACK) {
                    conn.rcvseq = conn.rcvseq.add(segment.payload.len() as u32);
                }
                send_ack(dev, conn);
            }
            false
        }

        State::LastAck => {
            if out_flags.contains(EventFlags::ACKDATA) {
                conn.state = State::Closed;
                out_flags.insert(EventFlags::CLOSE);
                deliver_to_app(dev, conn, out_flags);
                true
            } else {
                false
            }
        }

        State::FinWait1 => {
            if flags.fin {
                conn.rcvseq = conn.rcvseq.add(1);
                conn.state = if out_flags.contains(EventFlags::ACKDATA) {
                    State::TimeWait
                } else {
                    State::Closing
                };
                send_ack(dev, conn);
            } else if out_flags.contains(EventFlags::ACKDATA) {
                conn.state = State::FinWait2;
            }
            false
        }

        State::FinWait2 => {
            if flags.fin {
                conn.rcvseq = conn.rcvseq.add(1);
                conn.state = State::TimeWait;
                send_ack(dev, conn);
            }
            false
        }

        State::Closing => {
            if out_flags.contains(EventFlags::ACKDATA) {
                conn.state = State::TimeWait;
            }
            false
        }

        State::TimeWait => {
            send_ack(dev, conn);
            false
        }

        State::Closed => false,
    }
}

/// Step 2's new-connection branch: a SYN lands on a listening port with no existing
/// connection. Builds a half-open `SynRcvd` connection, replies SYN|ACK, and offers
/// it to the listener's accept queue.
fn accept_new_connection(table: &mut ConnectionTable, dev: &mut dyn Device, cfg: &TcpConfig, segment: &Segment, ft: FourTuple) {
    let isn = table.next_isn();
    let mss = segment.parsed_mss().map(|peer_mss| peer_mss.min(cfg.mss)).unwrap_or(cfg.mss);

    let mut conn = Connection::new(ft, Domain::V4, isn, mss, cfg.send_bufsize);
    conn.state = State::SynRcvd;
    conn.rcvseq = segment.seq().add(1);
    conn.snd_wnd = segment.tcp.window_size();
    // The SYN we are about to send consumes one sequence number; folding that into
    // `sent` means the first real data byte naturally gets seqno `isn + 1` out of
    // the buffered model, the same trick Established's FIN branch uses via `unacked`.
    conn.sent = 1;

    send_synack(dev, &conn);
    debug!("accepted SYN on port {}, mss={}", ft.local.port, mss);

    if table.offer(ft, conn).is_err() {
        table.stats.syndrop += 1;
    }
}

fn deliver_to_app(dev: &mut dyn Device, conn: &mut Connection, flags: EventFlags) -> EventFlags {
    if flags.is_empty() || !conn.callback_mask.intersects(flags) {
        return EventFlags::empty();
    }
    if let Some(mut cb) = conn.callback.take() {
        let result = cb(dev, conn, flags);
        conn.callback = Some(cb);
        result
    } else {
        EventFlags::empty()
    }
}

fn send_ack(dev: &mut dyn Device, conn: &Connection) {
    let builder = SegmentBuilder::new(conn.four_tuple.local, conn.four_tuple.remote);
    let raw = builder.build(conn.sndseq, conn.rcvseq, RCV_WINDOW, TcpFlags::ack(), None, &[]);
    let _ = dev.send(&raw);
}

fn send_synack(dev: &mut dyn Device, conn: &Connection) {
    let builder = SegmentBuilder::new(conn.four_tuple.local, conn.four_tuple.remote);
    let raw = builder.build(
        conn.isn,
        conn.rcvseq,
        RCV_WINDOW,
        TcpFlags::syn().and(TcpFlags::ack()),
        Some(conn.mss),
        &[],
    );
    let _ = dev.send(&raw);
}

fn send_finack(dev: &mut dyn Device, conn: &Connection) {
    let builder = SegmentBuilder::new(conn.four_tuple.local, conn.four_tuple.remote);
    let raw = builder.build(conn.sndseq, conn.rcvseq, RCV_WINDOW, TcpFlags::fin().and(TcpFlags::ack()), None, &[]);
    let _ = dev.send(&raw);
}

fn send_rst_for(dev: &mut dyn Device, conn: &Connection) {
    let builder = SegmentBuilder::new(conn.four_tuple.local, conn.four_tuple.remote);
    let raw = builder.build(conn.sndseq, conn.rcvseq, 0, TcpFlags::rst().and(TcpFlags::ack()), None, &[]);
    let _ = dev.send(&raw);
}

/// Build an RST for a segment that has no matching connection (RFC 793 §3.4).
fn send_rst(dev: &mut dyn Device, ft: FourTuple, segment: &Segment) {
    let builder = SegmentBuilder::new(ft.local, ft.remote);
    let (seq, ack, flags) = if segment.flags().ack {
        (segment.ack(), crate::seq::SeqNum::new(0), TcpFlags::rst())
    } else {
        (
            crate::seq::SeqNum::new(0),
            segment.seq().add(segment.seg_len()),
            TcpFlags::rst().and(TcpFlags::ack()),
        )
    };
    let raw = builder.build(seq, ack, 0, flags, None, &[]);
    let _ = dev.send(&raw);
}
