//! Event flags exchanged between the ingress state machine, the egress engine, the
//! device poll loop, and the upper-layer (application) callback.

use bitflags::bitflags;

bitflags! {
    /// Flags carried into and out of the egress event handler and the upper-layer
    /// callback. A single word is reused for both directions, as in the grounding
    /// source, because the two vocabularies barely overlap in practice.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u16 {
        /// The device poll loop invites this connection to transmit.
        const POLL      = 0b0000_0000_0001;
        /// The incoming segment acknowledged previously unacknowledged data.
        const ACKDATA   = 0b0000_0000_0010;
        /// The incoming segment carried new data for the application.
        const NEWDATA   = 0b0000_0000_0100;
        /// A retransmission (RTO or fast-retransmit) has been requested.
        const REXMIT    = 0b0000_0000_1000;
        /// The peer has closed its end (FIN observed, or LAST_ACK completed).
        const CLOSE     = 0b0000_0001_0000;
        /// The connection aborted (RST, or a failed connection attempt).
        const ABORT     = 0b0000_0010_0000;
        /// The handshake completed; the connection is now ESTABLISHED.
        const CONNECTED = 0b0000_0100_0000;
        /// A retransmission timer expired with no progress.
        const TIMEDOUT  = 0b0000_1000_0000;
        /// The network device went down.
        const NETDOWN   = 0b0001_0000_0000;
        /// Returned by the application callback: the incoming bytes were consumed
        /// and `rcvseq` may be advanced.
        const SNDACK    = 0b0010_0000_0000;
    }
}

impl EventFlags {
    /// The disjunction of events that mean "this connection is going away" — the
    /// egress engine treats all of these identically (release queues, post the
    /// send semaphore, stop polling).
    pub const DISCONN_EVENTS: EventFlags = EventFlags::CLOSE
        .union(EventFlags::ABORT)
        .union(EventFlags::TIMEDOUT)
        .union(EventFlags::NETDOWN);

    pub fn is_disconnect(self) -> bool {
        self.intersects(Self::DISCONN_EVENTS)
    }
}

/// A deferred action recorded by a callback instead of being applied immediately.
///
/// The original's "network lock plus re-entrant callback" design is a classic
/// hazard: a callback invoked from inside `on_event` could turn around and call back
/// into the stack. Here, callbacks only ever push an `Intent`; the driver loop
/// applies intents after `on_event` has returned (see [`crate::egress::drain_intents`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Close,
    Abort,
}

/// The upper-layer (application) callback invoked by the ingress state machine.
///
/// Returns the subset of [`EventFlags`] that describes how the application responded
/// — in practice only [`EventFlags::SNDACK`] is meaningful as a return flag.
pub trait AppCallback {
    fn on_event(&mut self, flags: EventFlags) -> EventFlags;
}

/// An [`AppCallback`] that never has anything to send and always acknowledges
/// whatever data it was handed — useful for tests and for connections with no
/// registered application (e.g. a half-open accept queue entry).
#[derive(Debug, Default)]
pub struct NullCallback;

impl AppCallback for NullCallback {
    fn on_event(&mut self, flags: EventFlags) -> EventFlags {
        if flags.intersects(EventFlags::NEWDATA) {
            EventFlags::SNDACK
        } else {
            EventFlags::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconn_events_cover_close_abort_timedout_netdown() {
        assert!(EventFlags::CLOSE.is_disconnect());
        assert!(EventFlags::ABORT.is_disconnect());
        assert!(EventFlags::TIMEDOUT.is_disconnect());
        assert!(EventFlags::NETDOWN.is_disconnect());
        assert!(!EventFlags::POLL.is_disconnect());
        assert!(!EventFlags::ACKDATA.is_disconnect());
    }

    #[test]
    fn null_callback_acks_new_data() {
        let mut cb = NullCallback;
        assert_eq!(cb.on_event(EventFlags::NEWDATA), EventFlags::SNDACK);
        assert_eq!(cb.on_event(EventFlags::ACKDATA), EventFlags::empty());
    }
}
