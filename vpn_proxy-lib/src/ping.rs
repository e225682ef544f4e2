use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::sync::LazyLock;

use crate::command::{CommandOps, Error as CommandError, Verbosity};

pub const DEFAULT_PACKETS: u32 = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("unparseable ping output")]
    Unparseable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub host: String,
    pub transmitted: u64,
    pub received: u64,
    pub packet_loss_pct: f64,
    pub time_ms: Option<u64>,
    pub rtt: Option<Rtt>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rtt {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub mdev: f64,
}

static HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--- (\S+) ping statistics ---").expect("static regex"));
static STATS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) packets transmitted, (\d+)(?: packets)? received, ([\d.]+)% packet loss(?:, time (\d+)ms)?")
        .expect("static regex")
});
static RTT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = ([\d.]+)/([\d.]+)/([\d.]+)/([\d.]+) ms")
        .expect("static regex")
});

/// Probe `host` with ICMP echoes bound to the tunnel interface.
///
/// ping exits non-zero on total loss but still prints its summary, so the
/// output of a failed run is parsed before giving up on it.
pub fn probe(ops: &impl CommandOps, iface: &str, host: &str, packets: u32) -> Result<Report, Error> {
    let count = packets.to_string();
    let argv = ["ping", "-c", &count, "-i", "0.4", "-W", "1", "-q", "-I", iface, host];
    let output = match ops.run(&argv, Verbosity::Debug) {
        Ok(output) => output,
        Err(CommandError::Failed { output, .. }) => output,
        Err(e) => return Err(e.into()),
    };
    parse(&output).ok_or(Error::Unparseable)
}

pub fn parse(output: &str) -> Option<Report> {
    let host = HOST.captures(output)?.get(1)?.as_str().to_string();
    let stats = STATS.captures(output)?;
    let rtt = RTT.captures(output).map(|caps| Rtt {
        min: caps[1].parse().unwrap_or(0.0),
        avg: caps[2].parse().unwrap_or(0.0),
        max: caps[3].parse().unwrap_or(0.0),
        mdev: caps[4].parse().unwrap_or(0.0),
    });
    Some(Report {
        host,
        transmitted: stats[1].parse().ok()?,
        received: stats[2].parse().ok()?,
        packet_loss_pct: stats[3].parse().ok()?,
        time_ms: stats.get(4).and_then(|m| m.as_str().parse().ok()),
        rtt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::mocks::MockCommands;

    const HEALTHY: &str = "\
PING 192.168.50.10 (192.168.50.10) 56(84) bytes of data.

--- 192.168.50.10 ping statistics ---
10 packets transmitted, 10 received, 0% packet loss, time 3606ms
rtt min/avg/max/mdev = 0.035/0.045/0.062/0.008 ms
";

    const LOSSY: &str = "\
PING 10.1.2.3 (10.1.2.3) 56(84) bytes of data.

--- 10.1.2.3 ping statistics ---
5 packets transmitted, 0 received, 100% packet loss, time 4099ms
";

    #[test]
    fn parses_a_healthy_summary() {
        let report = parse(HEALTHY).expect("parse healthy output");
        assert_eq!(report.host, "192.168.50.10");
        assert_eq!(report.transmitted, 10);
        assert_eq!(report.received, 10);
        assert_eq!(report.packet_loss_pct, 0.0);
        assert_eq!(report.time_ms, Some(3606));
        let rtt = report.rtt.expect("rtt line");
        assert_eq!(rtt.avg, 0.045);
    }

    #[test]
    fn total_loss_has_no_rtt_line() {
        let report = parse(LOSSY).expect("parse lossy output");
        assert_eq!(report.received, 0);
        assert_eq!(report.packet_loss_pct, 100.0);
        assert!(report.rtt.is_none());
    }

    #[test]
    fn garbage_is_unparseable() {
        assert!(parse("no ping here").is_none());
    }

    #[test]
    fn probe_runs_through_the_interface() -> anyhow::Result<()> {
        let mock = MockCommands::new();
        let report = probe(&mock, "vpn-proxy-tun1", "192.168.50.10", 10)?;
        assert_eq!(report.transmitted, 10);
        let history = mock.history();
        assert!(
            history
                .iter()
                .any(|cmd| cmd == "ping -c 10 -i 0.4 -W 1 -q -I vpn-proxy-tun1 192.168.50.10")
        );
        Ok(())
    }
}
