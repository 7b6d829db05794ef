//! Parsers for ping summaries and interface counters

/// Loss value meaning "no health target, nothing measured"
pub const LOSS_NOT_MEASURED: f64 = 200.0;

/// Average RTT in ms and loss in percent from `ping -c N` output
///
/// Total loss yields `(0, 100)`. Output without a summary yields `None`.
pub fn parse_ping_summary(output: &str) -> Option<(f64, f64)> {
    let loss = output
        .split(',')
        .map(str::trim)
        .find(|part| part.ends_with("packet loss"))
        .and_then(|part| part.split('%').next())
        .and_then(|pct| pct.trim().parse::<f64>().ok())?;
    if loss >= 100.0 {
        return Some((0.0, 100.0));
    }

    // rtt min/avg/max/mdev = 0.031/0.045/0.060/0.011 ms
    let avg = output
        .lines()
        .find(|l| l.contains("min/avg/max"))
        .and_then(|l| l.split('=').nth(1))
        .and_then(|values| values.trim().split('/').nth(1))
        .and_then(|avg| avg.trim().parse::<f64>().ok())
        .unwrap_or(0.0);
    Some((avg, loss))
}

/// Interface counters as reported by `ifconfig`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

impl Counters {
    /// Parse `rx_packets rx_bytes tx_packets tx_bytes`; anything else is zero
    pub fn parse(output: &str) -> Self {
        let fields: Vec<u64> = output
            .split_whitespace()
            .filter_map(|f| f.parse().ok())
            .collect();
        match fields.as_slice() {
            [rx_packets, rx_bytes, tx_packets, tx_bytes] => Self {
                rx_packets: *rx_packets,
                rx_bytes: *rx_bytes,
                tx_packets: *tx_packets,
                tx_bytes: *tx_bytes,
            },
            _ => Self::default(),
        }
    }
}

/// Bits per second between two byte counters over `secs`
pub fn rate_bps(old: u64, new: u64, secs: u64) -> f64 {
    (new as f64 - old as f64) * 8.0 / secs.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING_OK: &str = "--- 10.0.0.1 ping statistics ---\n\
        10 packets transmitted, 9 received, 10% packet loss, time 912ms\n\
        rtt min/avg/max/mdev = 0.310/0.452/0.601/0.080 ms\n";

    #[test]
    fn ping_summary_parses_loss_and_average() {
        assert_eq!(parse_ping_summary(PING_OK), Some((0.452, 10.0)));
        let lost = "10 packets transmitted, 0 received, 100% packet loss, time 9ms\n";
        assert_eq!(parse_ping_summary(lost), Some((0.0, 100.0)));
        assert_eq!(parse_ping_summary("connect: Network is unreachable"), None);
    }

    #[test]
    fn counters_need_four_fields() {
        let c = Counters::parse("120 4800\n80 3200\n");
        assert_eq!(c.rx_bytes, 4800);
        assert_eq!(c.tx_packets, 80);
        assert_eq!(Counters::parse("garbage"), Counters::default());
    }

    #[test]
    fn rate_is_bits_per_second() {
        assert_eq!(rate_bps(0, 600, 60), 80.0);
    }
}
