//! Demo binary wiring the core to a real TUN device.
//!
//! Generalizes the grounding source's `main.rs` packet loop: instead of a bare
//! `HashMap<Tcp4Tuple, TcpState>` with a stub `on_packet`, this drives the real
//! `ConnectionTable` / `tcp_input` entry point. Gated behind the `tun` feature since
//! it needs a real TUN device and is not exercised by the crate's test suite.

use std::os::unix::io::AsRawFd;

use nix::poll::{poll, PollFd, PollFlags};
use tcp_core::{ConnectionTable, Device, Segment, TcpConfig};

const MTU: usize = 1500;
const POLL_TIMEOUT_MS: i32 = 1000;

struct TunDevice<'a> {
    iface: &'a tun_tap::Iface,
}

impl Device for TunDevice<'_> {
    fn send(&mut self, segment: &[u8]) -> std::io::Result<usize> {
        self.iface.send(segment)
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(7000);

    let iface = tun_tap::Iface::without_packet_info("tun0", tun_tap::Mode::Tun)
        .expect("failed to create tun0 — are you running as root?");

    let mut table = ConnectionTable::new();
    table.listen(port).expect("port already bound");
    let cfg = TcpConfig::default();

    log::info!("listening on tun0:{}", port);

    let fd = iface.as_raw_fd();
    let mut buf = [0u8; MTU];

    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let ready = poll(&mut fds, POLL_TIMEOUT_MS).expect("poll failed");
        if ready == 0 {
            // Tick with nothing to read. This crate has no timer wheel of its own
            // (SPEC_FULL.md §1); a real integration would drive RTO expiry here.
            continue;
        }

        let nbytes = iface.recv(&mut buf)?;
        match Segment::parse(&buf[..nbytes]) {
            Ok(segment) => {
                let mut dev = TunDevice { iface: &iface };
                tcp_core::tcp_input(&mut table, &mut dev, &cfg, &segment);
            }
            Err(err) => {
                log::warn!("ignoring unparsable packet ({} bytes): {}", nbytes, err);
            }
        }
    }
}
