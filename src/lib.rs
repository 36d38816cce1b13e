//! Core of a small-footprint TCP implementation: the per-connection receive-path
//! state machine and the buffered write-queue egress engine.
//!
//! This crate deliberately stops at the protocol core. The link-layer driver, ARP,
//! the timer wheel, and the connection-table allocator policy are represented as
//! narrow traits (`wire::Device`, `producer::NeighborResolver`) or a minimal
//! in-memory collaborator (`table::ConnectionTable`) so the state machine and egress
//! engine can be exercised without a real kernel underneath them.

pub mod config;
pub mod connection;
pub mod egress;
pub mod error;
pub mod event;
pub mod ingress;
pub mod producer;
pub mod seq;
pub mod table;
pub mod wire;
pub mod wrb;

pub use config::TcpConfig;
pub use connection::{Connection, RttEstimator, State};
pub use egress::{drain_intents, on_event};
pub use error::{SendError, TableError};
pub use event::{AppCallback, EventFlags, Intent, NullCallback};
pub use ingress::tcp_input;
pub use producer::{tcp_send, AlwaysResolved, InlineWaiter, NeighborResolver, SendFlags, SendWaiter};
pub use seq::SeqNum;
pub use table::{ConnectionTable, Stats};
pub use wire::{Device, Domain, Endpoint, FourTuple, RecordingDevice, Segment, SegmentBuilder, TcpFlags, WireError};
pub use wrb::WriteBuffer;
