//! Opportunistic parsing of traffic-tool output.
//!
//! The tool prints a banner with the per-packet size, one line per reply
//! (carrying a sequence number) and a summary with the transmitted count
//! once it exits. Anything else is ignored; a line that does not parse
//! leaves the counters where they were.

use std::sync::LazyLock;

use regex::Regex;

/// `HPING 10.0.0.1 (eth0 10.0.0.1): icmp mode set, 28 headers + 0 data bytes`
static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^HPING\s+\S+.*?(\d+)\s+headers\s+\+\s+(\d+)\s+data\s+bytes").expect("valid regex")
});

/// `len=46 ip=10.0.0.1 ttl=64 id=1 icmp_seq=3 rtt=0.1 ms` or `flags=SA seq=3`
static SEQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:icmp_seq|seq)=(\d+)").expect("valid regex"));

/// `4 packets transmitted, 4 packets received, 0% packet loss`
static SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+packets\s+transmitted").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine {
    Header { header_bytes: u64, data_bytes: u64 },
    Reply { seq: u64 },
    Summary { transmitted: u64 },
    Other,
}

pub fn parse_line(line: &str) -> OutputLine {
    if let Some(caps) = HEADER_RE.captures(line) {
        if let (Ok(header_bytes), Ok(data_bytes)) = (caps[1].parse(), caps[2].parse()) {
            return OutputLine::Header {
                header_bytes,
                data_bytes,
            };
        }
    }
    if let Some(caps) = SUMMARY_RE.captures(line) {
        if let Ok(transmitted) = caps[1].parse() {
            return OutputLine::Summary { transmitted };
        }
    }
    if let Some(caps) = SEQ_RE.captures(line) {
        if let Ok(seq) = caps[1].parse() {
            return OutputLine::Reply { seq };
        }
    }
    OutputLine::Other
}

/// Running packet/byte totals for a job spanning several invocations.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    packet_bytes: u64,
    /// Totals from invocations that already finished.
    base_packets: u64,
    base_bytes: u64,
    current_packets: u64,
}

impl ProgressTracker {
    /// `estimated_packet_bytes` is used until the tool prints its banner.
    pub fn new(estimated_packet_bytes: u64) -> Self {
        Self {
            packet_bytes: estimated_packet_bytes,
            base_packets: 0,
            base_bytes: 0,
            current_packets: 0,
        }
    }

    /// Fold the current invocation into the base before starting the next.
    pub fn next_invocation(&mut self) {
        self.base_packets += self.current_packets;
        self.base_bytes += self.current_packets * self.packet_bytes;
        self.current_packets = 0;
    }

    /// Feed one line. Returns `true` if the totals moved.
    pub fn observe(&mut self, line: &str) -> bool {
        let before = self.packets_sent();
        match parse_line(line) {
            OutputLine::Header {
                header_bytes,
                data_bytes,
            } => {
                self.packet_bytes = header_bytes + data_bytes;
                return false;
            }
            OutputLine::Reply { seq } => {
                self.current_packets = self.current_packets.max(seq + 1);
            }
            OutputLine::Summary { transmitted } => {
                self.current_packets = self.current_packets.max(transmitted);
            }
            OutputLine::Other => {}
        }
        self.packets_sent() != before
    }

    /// Packets sent by the current invocation.
    pub fn current_packets(&self) -> u64 {
        self.current_packets
    }

    pub fn packets_sent(&self) -> u64 {
        self.base_packets + self.current_packets
    }

    pub fn bytes_sent(&self) -> u64 {
        self.base_bytes + self.current_packets * self.packet_bytes
    }
}
