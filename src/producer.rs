//! The producer path: turning user bytes into queued write buffers.

use bitflags::bitflags;

use crate::config::TcpConfig;
use crate::connection::{Connection, State};
use crate::egress;
use crate::error::SendError;
use crate::event::{AppCallback, EventFlags, NullCallback};
use crate::wire::{Device, Endpoint};
use crate::wrb::WriteBuffer;

bitflags! {
    /// Flags accepted by [`tcp_send`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u8 {
        /// Never block, even if the connection has its own blocking mode.
        const DONTWAIT = 0b01;
    }
}

/// Stands in for ARP / IPv6 neighbor discovery: whether the peer's link-layer
/// address is known. Out of scope for this crate (SPEC_FULL.md §1); callers that
/// don't care wire up [`AlwaysResolved`].
pub trait NeighborResolver {
    fn is_resolved(&self, remote: Endpoint) -> bool;
}

#[derive(Debug, Default)]
pub struct AlwaysResolved;

impl NeighborResolver for AlwaysResolved {
    fn is_resolved(&self, _remote: Endpoint) -> bool {
        true
    }
}

/// A suspension point for the producer to wait on send-buffer capacity
/// (`conn.snd_sem`) or buffer-pool availability. See SPEC_FULL.md §5: no real
/// blocking happens inside this crate, so [`InlineWaiter`] is a no-op suitable for
/// tests and non-blocking callers. A kernel integration supplies a condvar-backed
/// waiter that releases the network lock before sleeping.
pub trait SendWaiter {
    fn wait(&mut self);
}

#[derive(Debug, Default)]
pub struct InlineWaiter;

impl SendWaiter for InlineWaiter {
    fn wait(&mut self) {}
}

/// `tcp_send(conn, buf, flags) -> Result<usize, SendError>` (SPEC_FULL.md §4.5).
///
/// Queues as much of `buf` as the send-buffer cap and buffer-pool space allow,
/// coalescing into the tail write buffer where SPEC_FULL.md §4.4's rule permits.
/// Partial progress always wins: if any bytes were queued before a later iteration
/// would have blocked or failed, that count is returned as `Ok` and the error is
/// deferred to the caller's next call.
pub fn tcp_send(
    dev: &mut dyn Device,
    conn: &mut Connection,
    cfg: &TcpConfig,
    resolver: &dyn NeighborResolver,
    buf: &[u8],
    flags: SendFlags,
    waiter: &mut dyn SendWaiter,
) -> Result<usize, SendError> {
    if conn.state == State::Closed {
        return Err(SendError::NotSocket);
    }

    if !matches!(
        conn.state,
        State::Established | State::FinWait1 | State::FinWait2
    ) {
        return Err(SendError::NotConnected);
    }

    if !resolver.is_resolved(conn.four_tuple.remote) {
        return Err(SendError::NetUnreachable);
    }

    // Step 4a: lazily install the egress callback subscribing to the egress-side
    // event vocabulary, the way `psock_send`'s first call installs its event
    // handler. Leaves an already-installed callback (e.g. one wired up at accept
    // time) alone.
    if conn.callback.is_none() {
        conn.callback = Some(Box::new(|_dev: &mut dyn Device, _conn: &mut Connection, flags: EventFlags| {
            NullCallback.on_event(flags)
        }));
        conn.callback_mask = EventFlags::ACKDATA | EventFlags::REXMIT | EventFlags::POLL | EventFlags::DISCONN_EVENTS;
    }

    let nonblock = conn.nonblocking || flags.contains(SendFlags::DONTWAIT);
    let mut remaining = buf;
    let mut queued = 0usize;

    while !remaining.is_empty() {
        if cfg.send_bufsize > 0 && conn.inqueue_bytes() >= cfg.send_bufsize {
            if nonblock {
                if queued > 0 {
                    break;
                }
                return Err(SendError::WouldBlock);
            }
            waiter.wait();
            continue;
        }

        let max_wrb = cfg.max_wrb_size(conn.mss) as usize;
        let coalesces = conn.write_q.back().is_some_and(|tail| {
            tail.sent() == 0
                && tail.nrtx() == 0
                && tail.pktlen() < max_wrb
                && tail.pktlen() % conn.mss as usize != 0
        });

        // Step 4c/d: a new WRB needs to come out of the (simulated) IOB pool.
        // `tcp_wrbuffer_tryalloc` failing surfaces as EAGAIN for a non-blocking
        // caller; `tcp_wrbuffer_alloc` failing in blocking mode (no separate
        // wait primitive is modeled for pool capacity, unlike `snd_sem` for
        // `send_bufsize`) surfaces as ENOMEM.
        if !coalesces && cfg.iob_pool_bytes > 0 && conn.inqueue_bytes() >= cfg.iob_pool_bytes {
            if queued > 0 {
                break;
            }
            return Err(if nonblock {
                SendError::WouldBlock
            } else {
                SendError::OutOfMemory
            });
        }

        let room = if coalesces {
            max_wrb - conn.write_q.back().unwrap().pktlen()
        } else {
            max_wrb
        };
        let take = remaining.len().min(room);

        if coalesces {
            conn.write_q.back_mut().unwrap().append(&remaining[..take]);
        } else {
            let mut wrb = WriteBuffer::new();
            wrb.append(&remaining[..take]);
            conn.write_q.push_back(wrb);
        }

        remaining = &remaining[take..];
        queued += take;
    }

    if queued > 0 {
        egress::on_event(dev, conn, cfg, EventFlags::POLL, conn.sndseq);
    }

    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::State;
    use crate::seq::SeqNum;
    use crate::wire::{Domain, FourTuple, RecordingDevice};
    use std::net::Ipv4Addr;

    fn established_conn(mss: u16, send_bufsize: u32) -> (Connection, TcpConfig) {
        let ft = FourTuple {
            local: Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 80),
            remote: Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 4000),
        };
        let mut conn = Connection::new(ft, Domain::V4, SeqNum::new(1000), mss, 0);
        conn.state = State::Established;
        conn.snd_wnd = 65535;
        let cfg = TcpConfig {
            mss,
            send_bufsize,
            ..TcpConfig::default()
        };
        (conn, cfg)
    }

    #[test]
    fn rejects_when_not_connected() {
        let (mut conn, cfg) = established_conn(536, 0);
        conn.state = State::SynSent;
        let mut dev = RecordingDevice::default();
        let mut waiter = InlineWaiter;
        let err = tcp_send(
            &mut dev,
            &mut conn,
            &cfg,
            &AlwaysResolved,
            b"hi",
            SendFlags::empty(),
            &mut waiter,
        )
        .unwrap_err();
        assert_eq!(err, SendError::NotConnected);
    }

    #[test]
    fn small_write_is_queued_and_transmitted_immediately() {
        let (mut conn, cfg) = established_conn(536, 0);
        let mut dev = RecordingDevice::default();
        let mut waiter = InlineWaiter;
        let n = tcp_send(
            &mut dev,
            &mut conn,
            &cfg,
            &AlwaysResolved,
            b"hello",
            SendFlags::empty(),
            &mut waiter,
        )
        .unwrap();

        assert_eq!(n, 5);
        assert_eq!(dev.sent.len(), 1);
        assert_eq!(conn.unacked_q.len(), 1);
        assert!(conn.write_q.is_empty());
    }

    #[test]
    fn second_small_write_coalesces_into_tail_before_it_is_sent() {
        let (mut conn, cfg) = established_conn(536, 0);
        conn.snd_wnd = 0; // block segment formation so the tail stays coalescable
        let mut dev = RecordingDevice::default();
        let mut waiter = InlineWaiter;

        tcp_send(
            &mut dev,
            &mut conn,
            &cfg,
            &AlwaysResolved,
            b"abc",
            SendFlags::empty(),
            &mut waiter,
        )
        .unwrap();
        tcp_send(
            &mut dev,
            &mut conn,
            &cfg,
            &AlwaysResolved,
            b"def",
            SendFlags::empty(),
            &mut waiter,
        )
        .unwrap();

        assert_eq!(conn.write_q.len(), 1);
        assert_eq!(conn.write_q.front().unwrap().pktlen(), 6);
    }

    #[test]
    fn nonblocking_write_returns_would_block_when_buffer_cap_is_full() {
        let (mut conn, cfg) = established_conn(536, 10);
        conn.snd_wnd = 0;
        let mut wrb = WriteBuffer::new();
        wrb.append(&[0u8; 10]);
        conn.write_q.push_back(wrb);

        let mut dev = RecordingDevice::default();
        let mut waiter = InlineWaiter;
        let err = tcp_send(
            &mut dev,
            &mut conn,
            &cfg,
            &AlwaysResolved,
            b"more",
            SendFlags::DONTWAIT,
            &mut waiter,
        )
        .unwrap_err();
        assert_eq!(err, SendError::WouldBlock);
    }

    #[test]
    fn rejects_when_socket_is_closed() {
        let (mut conn, cfg) = established_conn(536, 0);
        conn.state = State::Closed;
        let mut dev = RecordingDevice::default();
        let mut waiter = InlineWaiter;
        let err = tcp_send(
            &mut dev,
            &mut conn,
            &cfg,
            &AlwaysResolved,
            b"hi",
            SendFlags::empty(),
            &mut waiter,
        )
        .unwrap_err();
        assert_eq!(err, SendError::NotSocket);
    }

    #[test]
    fn connection_level_nonblocking_is_honored_without_dontwait() {
        let (mut conn, cfg) = established_conn(536, 10);
        conn.nonblocking = true;
        conn.snd_wnd = 0;
        let mut wrb = WriteBuffer::new();
        wrb.append(&[0u8; 10]);
        conn.write_q.push_back(wrb);

        let mut dev = RecordingDevice::default();
        let mut waiter = InlineWaiter;
        let err = tcp_send(
            &mut dev,
            &mut conn,
            &cfg,
            &AlwaysResolved,
            b"more",
            SendFlags::empty(),
            &mut waiter,
        )
        .unwrap_err();
        assert_eq!(err, SendError::WouldBlock);
    }

    #[test]
    fn first_write_lazily_installs_the_egress_callback() {
        let (mut conn, cfg) = established_conn(536, 0);
        assert!(conn.callback.is_none());
        let mut dev = RecordingDevice::default();
        let mut waiter = InlineWaiter;
        tcp_send(
            &mut dev,
            &mut conn,
            &cfg,
            &AlwaysResolved,
            b"hi",
            SendFlags::empty(),
            &mut waiter,
        )
        .unwrap();

        assert!(conn.callback.is_some());
        assert_eq!(
            conn.callback_mask,
            EventFlags::ACKDATA | EventFlags::REXMIT | EventFlags::POLL | EventFlags::DISCONN_EVENTS
        );
    }

    #[test]
    fn blocking_pool_exhaustion_returns_out_of_memory() {
        let (mut conn, mut cfg) = established_conn(536, 0);
        cfg.iob_pool_bytes = 10;
        conn.snd_wnd = 0;
        let mut wrb = WriteBuffer::new();
        wrb.append(&[0u8; 10]);
        conn.write_q.push_back(wrb);

        let mut dev = RecordingDevice::default();
        let mut waiter = InlineWaiter;
        let err = tcp_send(
            &mut dev,
            &mut conn,
            &cfg,
            &AlwaysResolved,
            b"more",
            SendFlags::empty(),
            &mut waiter,
        )
        .unwrap_err();
        assert_eq!(err, SendError::OutOfMemory);
    }
}
