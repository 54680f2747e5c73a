//! Rendering job parameters into an argument vector for the traffic tool.
//!
//! Arguments are discrete strings handed straight to the process spawn
//! primitive. No shell is involved at any point; [`CommandLine::display`]
//! exists for logs and dry-run output only.

use std::borrow::Cow;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::job::{JobSpec, TrafficType};

/// Upper bound on the `-c` count for a single invocation.
pub const MAX_PACKET_COUNT: u64 = 1_000_000;

/// Largest UDP/ICMP payload the tool can place in one IPv4 datagram.
const MAX_DATA_BYTES: u32 = 65_507;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("{0} traffic requires a destination port")]
    MissingDestinationPort(TrafficType),

    #[error("{0} traffic does not take ports")]
    UnexpectedPort(TrafficType),

    #[error("{field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("job has neither a duration nor a packet ceiling")]
    NoTermination,

    #[error("job has no hosts to address")]
    NoHosts,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> CommandError {
    CommandError::InvalidField {
        field,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// CommandLine
// ---------------------------------------------------------------------------

/// A program and its argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Shell-quoted rendering for humans. Never executed.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '='));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

/// One host's share of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub host: IpAddr,
    pub command: CommandLine,
    /// Packets this invocation may send.
    pub packet_limit: u64,
    /// Wall-clock budget for this invocation, when the job has a duration.
    pub time_limit: Option<Duration>,
}

// ---------------------------------------------------------------------------
// CommandBuilder
// ---------------------------------------------------------------------------

/// Deterministic renderer for a fixed tool binary.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: String,
}

impl CommandBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Render the invocation for one host.
    ///
    /// Re-checks every numeric field even though admission already did, and
    /// fails closed on anything out of range.
    pub fn build(
        &self,
        spec: &JobSpec,
        host: IpAddr,
        packet_limit: u64,
    ) -> Result<CommandLine, CommandError> {
        check_spec(spec)?;
        if packet_limit == 0 {
            return Err(invalid("max_packets", "must be positive"));
        }

        let mut args: Vec<String> = traffic_flags(spec.traffic_type)
            .iter()
            .map(|f| (*f).to_string())
            .collect();

        if let Some(dst) = spec.dst_port {
            args.push("-p".into());
            args.push(dst.to_string());
        }
        if let Some(src) = spec.src_port {
            args.push("-s".into());
            args.push(src.to_string());
            args.push("--keep".into());
        }

        let interval_us = (1_000_000 / spec.pps).max(1);
        args.push("-i".into());
        args.push(format!("u{interval_us}"));

        args.push("-c".into());
        args.push(packet_limit.min(MAX_PACKET_COUNT).to_string());

        if spec.packet_size > 0 {
            args.push("-d".into());
            args.push(spec.packet_size.to_string());
        }

        args.push("-t".into());
        args.push(spec.ttl.to_string());

        if let Some(iface) = &spec.iface {
            args.push("-I".into());
            args.push(iface.clone());
        }

        args.push(host.to_string());

        Ok(CommandLine {
            program: self.program.clone(),
            args,
        })
    }

    /// Split a job across its hosts.
    ///
    /// Duration and packet ceilings are divided evenly (rounding up) so the
    /// hosts run one after another within the job's overall budget.
    pub fn plan(&self, spec: &JobSpec, hosts: &[IpAddr]) -> Result<Vec<PlanStep>, CommandError> {
        check_spec(spec)?;
        if hosts.is_empty() {
            return Err(CommandError::NoHosts);
        }

        let n = hosts.len() as u64;
        let per_host_secs = spec.duration_secs.map(|d| d.div_ceil(n).max(1));
        let by_time = per_host_secs.map(|s| s.saturating_mul(u64::from(spec.pps)));
        let by_count = spec.max_packets.map(|m| m.div_ceil(n).max(1));

        let packet_limit = match (by_count, by_time) {
            (Some(c), Some(t)) => c.min(t),
            (Some(c), None) => c,
            (None, Some(t)) => t,
            (None, None) => return Err(CommandError::NoTermination),
        }
        .clamp(1, MAX_PACKET_COUNT);

        hosts
            .iter()
            .map(|&host| {
                Ok(PlanStep {
                    host,
                    command: self.build(spec, host, packet_limit)?,
                    packet_limit,
                    time_limit: per_host_secs.map(Duration::from_secs),
                })
            })
            .collect()
    }
}

fn traffic_flags(traffic: TrafficType) -> &'static [&'static str] {
    match traffic {
        TrafficType::Icmp => &["--icmp"],
        TrafficType::TcpSyn => &["-S"],
        TrafficType::TcpAck => &["-A"],
        TrafficType::TcpRst => &["-R"],
        TrafficType::Udp => &["--udp"],
    }
}

fn check_spec(spec: &JobSpec) -> Result<(), CommandError> {
    if spec.traffic_type.uses_ports() {
        if spec.dst_port.is_none() {
            return Err(CommandError::MissingDestinationPort(spec.traffic_type));
        }
    } else if spec.dst_port.is_some() || spec.src_port.is_some() {
        return Err(CommandError::UnexpectedPort(spec.traffic_type));
    }
    if spec.dst_port == Some(0) {
        return Err(invalid("dst_port", "must be between 1 and 65535"));
    }
    if spec.src_port == Some(0) {
        return Err(invalid("src_port", "must be between 1 and 65535"));
    }
    if spec.pps == 0 {
        return Err(invalid("pps", "must be positive"));
    }
    if spec.duration_secs == Some(0) {
        return Err(invalid("duration_secs", "must be positive"));
    }
    if spec.max_packets == Some(0) {
        return Err(invalid("max_packets", "must be positive"));
    }
    if spec.duration_secs.is_none() && spec.max_packets.is_none() {
        return Err(CommandError::NoTermination);
    }
    if spec.packet_size > MAX_DATA_BYTES {
        return Err(invalid("packet_size", "exceeds 65507 bytes"));
    }
    if spec.ttl == 0 {
        return Err(invalid("ttl", "must be between 1 and 255"));
    }
    if let Some(iface) = &spec.iface {
        let ok = !iface.is_empty()
            && iface.len() <= 15
            && iface
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !ok {
            return Err(invalid("iface", "not a valid interface name"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
