//! Static job-parameter validation.
//!
//! Field limits are declared with `validator` on [`JobSpec`]; the
//! cross-field rules below cover what a derive cannot express. All errors
//! surface as [`CoreError::Validation`] with a `field: message` list.

use std::sync::LazyLock;

use regex::Regex;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::error::CoreError;
use crate::job::JobSpec;
use crate::targets::parse_target;

/// Maximum length of a single tag.
const MAX_TAG_LEN: usize = 64;

/// Interface names as the kernel accepts them (IFNAMSIZ - 1).
static IFACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,15}$").expect("valid regex"));

// ---------------------------------------------------------------------------
// Custom field validators (referenced from the `JobSpec` derive)
// ---------------------------------------------------------------------------

/// Every target must parse as an address or CIDR.
pub fn validate_target_syntax(targets: &[String]) -> Result<(), ValidationError> {
    for target in targets {
        if let Err(reason) = parse_target(target) {
            let mut err = ValidationError::new("target_syntax");
            err.message = Some(reason.into());
            return Err(err);
        }
    }
    Ok(())
}

/// Tags must be non-blank and at most [`MAX_TAG_LEN`] characters.
pub fn validate_tags(tags: &[String]) -> Result<(), ValidationError> {
    if tags
        .iter()
        .any(|t| t.trim().is_empty() || t.chars().count() > MAX_TAG_LEN)
    {
        let mut err = ValidationError::new("tag_format");
        err.message = Some(format!("each tag must be 1-{MAX_TAG_LEN} characters").into());
        return Err(err);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Full check
// ---------------------------------------------------------------------------

/// Validate a submitted job spec.
///
/// Rules beyond the field limits:
/// - ICMP takes no ports; every other traffic type needs `dst_port`.
/// - Ports are 1-65535.
/// - At least one of `duration_secs` or `max_packets` is set.
/// - `iface`, when set, is a plausible interface name.
pub fn validate_job_spec(spec: &JobSpec) -> Result<(), CoreError> {
    let mut problems = match spec.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => describe(&errors),
    };

    if spec.traffic_type.uses_ports() {
        if spec.dst_port.is_none() {
            problems.push(format!(
                "dst_port: required for {} traffic",
                spec.traffic_type
            ));
        }
    } else if spec.dst_port.is_some() || spec.src_port.is_some() {
        problems.push(format!(
            "dst_port: ports are not accepted for {} traffic",
            spec.traffic_type
        ));
    }

    for (field, port) in [("dst_port", spec.dst_port), ("src_port", spec.src_port)] {
        if port == Some(0) {
            problems.push(format!("{field}: must be between 1 and 65535"));
        }
    }

    if spec.duration_secs.is_none() && spec.max_packets.is_none() {
        problems.push("duration_secs: a duration or max_packets ceiling is required".to_string());
    }

    if let Some(iface) = &spec.iface {
        if !IFACE_RE.is_match(iface) {
            problems.push("iface: must be 1-15 characters of [A-Za-z0-9._-]".to_string());
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(CoreError::Validation(problems.join("; ")))
    }
}

/// Flatten `validator` errors into sorted `field: message` strings.
fn describe(errors: &ValidationErrors) -> Vec<String> {
    let mut out: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter()
                .map(|e| {
                    let message = e
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string());
                    format!("{field}: {message}")
                })
                .collect::<Vec<_>>()
        })
        .collect();
    out.sort();
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
