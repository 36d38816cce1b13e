//! Connection table: 4-tuple demultiplexing and per-port accept queues.
//!
//! Minimal stand-in for the grounding source's `ConnectionManager` (`pending` +
//! `connections` maps guarded by a single mutex): ingress needs somewhere to look
//! up an active connection or a listener, but the thread/mutex/condvar machinery the
//! original used to make `accept()` block is out of scope here (see SPEC_FULL.md §5).

use std::collections::{HashMap, VecDeque};

use crate::connection::Connection;
use crate::error::TableError;
use crate::seq::SeqNum;
use crate::wire::FourTuple;

/// Stride the ISN counter advances by per accepted connection. The grounding
/// source bumps `g_tcp_sequence` on a timer tick; without a timer wheel here a
/// fixed per-accept stride gives each connection a distinct ISN instead.
const ISN_STRIDE: u32 = 64_000;

/// Counters mirroring `g_netstats.tcp.*` in the grounding source's drop/reject paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub recv: u64,
    pub drop: u64,
    pub chkerr: u64,
    pub synrst: u64,
    pub syndrop: u64,
}

/// 4-tuple keyed connection table plus a per-port accept queue.
#[derive(Default)]
pub struct ConnectionTable {
    pub connections: HashMap<FourTuple, Connection>,
    listeners: HashMap<u16, VecDeque<FourTuple>>,
    pub stats: Stats,
    next_isn: u32,
}

impl ConnectionTable {
    pub fn new() -> Self {
        ConnectionTable::default()
    }

    /// Hand out the next initial sequence number for a passively opened
    /// connection, then advance the counter so the next accept gets a distinct
    /// ISN (see DESIGN.md's Open Question decisions, item "ISN generation").
    pub fn next_isn(&mut self) -> SeqNum {
        let isn = SeqNum::new(self.next_isn);
        self.next_isn = self.next_isn.wrapping_add(ISN_STRIDE);
        isn
    }

    /// Register a listener on `port`. Mirrors `Interface::bind` in the grounding
    /// source, minus the thread-handle plumbing.
    pub fn listen(&mut self, port: u16) -> Result<(), TableError> {
        if self.listeners.contains_key(&port) {
            return Err(TableError::PortInUse(port));
        }
        self.listeners.insert(port, VecDeque::new());
        Ok(())
    }

    pub fn stop_listening(&mut self, port: u16) {
        self.listeners.remove(&port);
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.listeners.contains_key(&port)
    }

    pub fn get(&self, ft: &FourTuple) -> Option<&Connection> {
        self.connections.get(ft)
    }

    pub fn get_mut(&mut self, ft: &FourTuple) -> Option<&mut Connection> {
        self.connections.get_mut(ft)
    }

    pub fn insert(&mut self, conn: Connection) {
        self.connections.insert(conn.four_tuple, conn);
    }

    pub fn remove(&mut self, ft: &FourTuple) -> Option<Connection> {
        self.connections.remove(ft)
    }

    /// Offer a freshly accepted connection to its listener's accept queue. Called by
    /// ingress once a SYN has produced a viable half-open `Connection` (step 2 of
    /// SPEC_FULL.md §4.2).
    pub fn offer(&mut self, ft: FourTuple, conn: Connection) -> Result<(), TableError> {
        let port = ft.local.port;
        let queue = self
            .listeners
            .get_mut(&port)
            .ok_or(TableError::NoListener(port))?;
        self.connections.insert(ft, conn);
        queue.push_back(ft);
        Ok(())
    }

    /// Non-blocking accept: pop the oldest completed connection for `port`, if any.
    /// A connection only counts as "completed" once it has reached `Established`
    /// (ingress moves it out of `SynRcvd` before this is meaningful); callers that
    /// want blocking semantics implement their own `AcceptWaiter` around this.
    pub fn try_accept(&mut self, port: u16) -> Option<FourTuple> {
        let queue = self.listeners.get_mut(&port)?;
        let front = queue.front()?;
        let established = self
            .connections
            .get(front)
            .map(|c| c.state == crate::connection::State::Established)
            .unwrap_or(false);
        if established {
            queue.pop_front()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::SeqNum;
    use crate::wire::{Domain, Endpoint};
    use std::net::Ipv4Addr;

    fn four_tuple(remote_port: u16) -> FourTuple {
        FourTuple {
            local: Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 80),
            remote: Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), remote_port),
        }
    }

    #[test]
    fn listen_twice_on_same_port_fails() {
        let mut table = ConnectionTable::new();
        table.listen(80).unwrap();
        assert_eq!(table.listen(80), Err(TableError::PortInUse(80)));
    }

    #[test]
    fn offer_without_listener_fails() {
        let mut table = ConnectionTable::new();
        let ft = four_tuple(4000);
        let conn = Connection::new(ft, Domain::V4, SeqNum::new(0), 536, 0);
        assert_eq!(table.offer(ft, conn), Err(TableError::NoListener(80)));
    }

    #[test]
    fn try_accept_waits_for_established() {
        let mut table = ConnectionTable::new();
        table.listen(80).unwrap();
        let ft = four_tuple(4000);
        let conn = Connection::new(ft, Domain::V4, SeqNum::new(0), 536, 0);
        table.offer(ft, conn).unwrap();

        assert_eq!(table.try_accept(80), None);

        table.get_mut(&ft).unwrap().state = crate::connection::State::Established;
        assert_eq!(table.try_accept(80), Some(ft));
        assert_eq!(table.try_accept(80), None);
    }

    #[test]
    fn next_isn_advances_by_a_fixed_stride() {
        let mut table = ConnectionTable::new();
        let first = table.next_isn();
        let second = table.next_isn();
        assert_eq!(first, SeqNum::new(0));
        assert_eq!(second, SeqNum::new(ISN_STRIDE));
    }
}
