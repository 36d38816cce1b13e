//! Tunable knobs for the core, gathered in one place rather than scattered constants.

/// Configuration for a TCP connection or listener.
///
/// Defaults mirror the grounding source's `TCP_MSS` / `TCP_MAXRTX` /
/// `CONFIG_NET_TCP_FAST_RETRANSMIT_WATERMARK` / `CONFIG_NET_SEND_BUFSIZE` defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConfig {
    /// Platform maximum segment size, used to clamp any peer-advertised MSS option.
    pub mss: u16,
    /// Retransmit cap: a write buffer is dropped once `nrtx` reaches this value.
    pub maxrtx: u8,
    /// Duplicate-ACK threshold that triggers a fast retransmit.
    pub fast_retransmit_watermark: u8,
    /// Per-connection send-buffer cap in bytes. Zero disables back-pressure.
    pub send_bufsize: u32,
    /// Capacity of the (simulated) I/O buffer pool, used by `tcp_max_wrb_size`.
    pub iob_pool_bytes: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            mss: 536,
            maxrtx: 3,
            fast_retransmit_watermark: 3,
            send_bufsize: 0,
            iob_pool_bytes: 64 * 1024,
        }
    }
}

impl TcpConfig {
    /// `tcp_max_wrb_size(conn) := min(4*mss, IOB_POOL_BYTES / 2)`, rounded down to a
    /// multiple of `mss` when the result exceeds a single MSS.
    pub fn max_wrb_size(&self, mss: u16) -> u32 {
        let mss = mss as u32;
        let mut size = 4 * mss;
        let pool_half = self.iob_pool_bytes / 2;
        if size > pool_half {
            size = pool_half;
        }
        if size > mss {
            size -= size % mss;
        }
        size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_wrb_size_caps_at_four_segments() {
        let cfg = TcpConfig {
            iob_pool_bytes: 1_000_000,
            ..Default::default()
        };
        assert_eq!(cfg.max_wrb_size(500), 2000);
    }

    #[test]
    fn max_wrb_size_respects_pool_cap_and_rounds_to_mss() {
        let cfg = TcpConfig {
            iob_pool_bytes: 1000,
            ..Default::default()
        };
        // pool_half = 500, 4*mss = 2000 > 500 -> size = 500, rounded down to
        // a multiple of mss=300 -> 300
        assert_eq!(cfg.max_wrb_size(300), 300);
    }
}
