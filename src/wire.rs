//! IPv4/TCP wire framing: parsing received segments and building response segments.
//!
//! This reuses `etherparse`'s header types (as the grounding source does) instead of
//! hand-rolling a TCP/IP header layout or checksum routine.

use std::net::Ipv4Addr;

use etherparse::{IpNumber, Ipv4Header, Ipv4HeaderSlice, TcpHeader, TcpHeaderSlice};

use crate::seq::SeqNum;

pub const TTL: u8 = 64;
pub const DEFAULT_MTU: usize = 1500;

/// TCP option kind octets (RFC 793 §3.1).
mod opt {
    pub const END: u8 = 0;
    pub const NOOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const MSS_LEN: u8 = 4;
}

/// A device the egress engine can hand fully-formed IP/TCP segments to for
/// transmission. Stands in for the link-layer transmit driver, which is out of
/// scope for this crate (SPEC_FULL.md §1).
pub trait Device {
    fn send(&mut self, segment: &[u8]) -> std::io::Result<usize>;

    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }
}

/// A `Device` that records every segment it was asked to send, for use in tests.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    pub sent: Vec<Vec<u8>>,
}

impl Device for RecordingDevice {
    fn send(&mut self, segment: &[u8]) -> std::io::Result<usize> {
        self.sent.push(segment.to_vec());
        Ok(segment.len())
    }
}

/// IPv4 or IPv6. Carried as a tag only — segmentation and egress in this crate only
/// exercise IPv4 (see the Non-goals in SPEC_FULL.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Endpoint { addr, port }
    }
}

/// Connection-table key: (local endpoint, remote endpoint). Named analogously to
/// the grounding source's `Tcp4Tuple`, generalized to carry `local`/`remote` instead
/// of `src`/`dst` since the meaning of "source" flips between inbound and outbound
/// packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub local: Endpoint,
    pub remote: Endpoint,
}

/// The control-bit subset this crate cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    pub const fn syn() -> Self {
        TcpFlags {
            syn: true,
            ..Self::EMPTY
        }
    }
    pub const fn ack() -> Self {
        TcpFlags {
            ack: true,
            ..Self::EMPTY
        }
    }
    pub const fn rst() -> Self {
        TcpFlags {
            rst: true,
            ..Self::EMPTY
        }
    }
    pub const fn fin() -> Self {
        TcpFlags {
            fin: true,
            ..Self::EMPTY
        }
    }

    const EMPTY: Self = TcpFlags {
        syn: false,
        ack: false,
        fin: false,
        rst: false,
    };

    pub const fn and(mut self, other: Self) -> Self {
        self.syn |= other.syn;
        self.ack |= other.ack;
        self.fin |= other.fin;
        self.rst |= other.rst;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("not a TCP packet")]
    NotTcp,
    #[error("malformed IPv4 header: {0}")]
    BadIpv4(String),
    #[error("malformed TCP header: {0}")]
    BadTcp(String),
}

/// A received segment: parsed headers plus a view of the payload.
pub struct Segment<'a> {
    pub ip: Ipv4HeaderSlice<'a>,
    pub tcp: TcpHeaderSlice<'a>,
    pub payload: &'a [u8],
}

impl<'a> Segment<'a> {
    /// Parse a full IPv4 datagram (no link-layer framing) carrying a TCP segment.
    pub fn parse(buf: &'a [u8]) -> Result<Self, WireError> {
        let ip = Ipv4HeaderSlice::from_slice(buf)
            .map_err(|err| WireError::BadIpv4(err.to_string()))?;
        if ip.protocol() != IpNumber::TCP {
            return Err(WireError::NotTcp);
        }
        let ip_len = ip.slice().len();
        let tcp_raw = &buf[ip_len..];
        let tcp = TcpHeaderSlice::from_slice(tcp_raw)
            .map_err(|err| WireError::BadTcp(err.to_string()))?;
        let tcp_len = tcp.slice().len();
        let payload = &tcp_raw[tcp_len..];
        Ok(Segment { ip, tcp, payload })
    }

    pub fn four_tuple(&self) -> FourTuple {
        FourTuple {
            local: Endpoint::new(self.ip.destination_addr(), self.tcp.destination_port()),
            remote: Endpoint::new(self.ip.source_addr(), self.tcp.source_port()),
        }
    }

    pub fn seq(&self) -> SeqNum {
        SeqNum::new(self.tcp.sequence_number())
    }

    pub fn ack(&self) -> SeqNum {
        SeqNum::new(self.tcp.acknowledgment_number())
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags {
            syn: self.tcp.syn(),
            ack: self.tcp.ack(),
            fin: self.tcp.fin(),
            rst: self.tcp.rst(),
        }
    }

    /// `SEG.LEN`: payload bytes plus one for each of SYN/FIN present.
    pub fn seg_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.tcp.syn() {
            len += 1;
        }
        if self.tcp.fin() {
            len += 1;
        }
        len
    }

    /// Verify the TCP checksum (step 1 of ingress processing): recompute it with the
    /// checksum field zeroed and compare against the value the segment carried.
    pub fn checksum_ok(&self) -> bool {
        let mut header = self.tcp.to_header();
        let received = header.checksum;
        header.checksum = 0;
        match header.calc_checksum_ipv4(&self.ip.to_header(), self.payload) {
            Ok(expected) => expected == received,
            Err(_) => false,
        }
    }

    /// Walk the TCP options area per SPEC_FULL.md §4.2.1: END stops, NOOP advances
    /// one byte, MSS(4) reads the peer's proposed MSS, any other option is skipped by
    /// its length byte (zero length is treated as malformed and stops the walk).
    pub fn parsed_mss(&self) -> Option<u16> {
        let options = self.tcp.options();
        let mut i = 0usize;
        while i < options.len() {
            match options[i] {
                opt::END => break,
                opt::NOOP => i += 1,
                opt::MSS if i + 1 < options.len() && options[i + 1] == opt::MSS_LEN => {
                    if i + 3 < options.len() {
                        let value = u16::from_be_bytes([options[i + 2], options[i + 3]]);
                        return Some(value);
                    }
                    break;
                }
                _ => {
                    if i + 1 >= options.len() || options[i + 1] == 0 {
                        break;
                    }
                    i += options[i + 1] as usize;
                }
            }
        }
        None
    }
}

/// Builds outgoing IPv4/TCP segments for a fixed (local, remote) pair.
pub struct SegmentBuilder {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl SegmentBuilder {
    pub fn new(local: Endpoint, remote: Endpoint) -> Self {
        SegmentBuilder { local, remote }
    }

    /// Build a full IPv4 datagram carrying a TCP segment with the given sequence
    /// number, ack number, advertised window, flags, optional MSS option, and
    /// payload.
    pub fn build(
        &self,
        seq: SeqNum,
        ack: SeqNum,
        window: u16,
        flags: TcpFlags,
        mss: Option<u16>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut tcp = TcpHeader::new(self.local.port, self.remote.port, seq.value(), window);
        tcp.acknowledgment_number = ack.value();
        tcp.syn = flags.syn;
        tcp.ack = flags.ack;
        tcp.fin = flags.fin;
        tcp.rst = flags.rst;

        if let Some(mss) = mss {
            tcp.set_options(&[etherparse::TcpOptionElement::MaximumSegmentSize(mss)])
                .expect("a single MSS option always fits in the TCP option space");
        }

        let ip = Ipv4Header::new(
            (tcp.header_len() as usize + payload.len()) as u16,
            TTL,
            IpNumber::TCP,
            self.local.addr.octets(),
            self.remote.addr.octets(),
        )
        .expect("payload + header length fits in an IPv4 packet");

        tcp.checksum = tcp
            .calc_checksum_ipv4(&ip, payload)
            .expect("checksum computation over a freshly built header cannot fail");

        let mut out = Vec::with_capacity(ip.header_len() + tcp.header_len() as usize + payload.len());
        ip.write(&mut out).expect("writing to a Vec cannot fail");
        tcp.write(&mut out).expect("writing to a Vec cannot fail");
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> (Endpoint, Endpoint) {
        (
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 443),
            Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 51000),
        )
    }

    #[test]
    fn round_trip_build_then_parse() {
        let (local, remote) = endpoints();
        let builder = SegmentBuilder::new(local, remote);
        let raw = builder.build(
            SeqNum::new(1000),
            SeqNum::new(2000),
            4096,
            TcpFlags::syn().and(TcpFlags::ack()),
            Some(1460),
            b"payload",
        );

        let seg = Segment::parse(&raw).expect("should parse");
        assert_eq!(seg.seq(), SeqNum::new(1000));
        assert_eq!(seg.ack(), SeqNum::new(2000));
        assert!(seg.flags().syn && seg.flags().ack);
        assert_eq!(seg.payload, b"payload");
        assert!(seg.checksum_ok());
        assert_eq!(seg.parsed_mss(), Some(1460));
        // Built from local's perspective; four_tuple() is from the receiver's
        // perspective, so local/remote swap.
        let ft = seg.four_tuple();
        assert_eq!(ft.remote, local);
        assert_eq!(ft.local, remote);
    }

    #[test]
    fn option_walk_stops_at_end_and_skips_noop() {
        let (local, remote) = endpoints();
        let builder = SegmentBuilder::new(local, remote);
        let raw = builder.build(
            SeqNum::new(1),
            SeqNum::new(1),
            1024,
            TcpFlags::syn(),
            None,
            b"",
        );
        let seg = Segment::parse(&raw).unwrap();
        assert_eq!(seg.parsed_mss(), None);
    }

    #[test]
    fn seg_len_counts_syn_and_fin() {
        let (local, remote) = endpoints();
        let builder = SegmentBuilder::new(local, remote);
        let raw = builder.build(
            SeqNum::new(1),
            SeqNum::new(1),
            1024,
            TcpFlags::syn(),
            None,
            b"abc",
        );
        let seg = Segment::parse(&raw).unwrap();
        assert_eq!(seg.seg_len(), 4);
    }
}
