//! End-to-end job lifecycle tests against a fake traffic tool.
//!
//! Each test installs a small shell script in place of the real tool so
//! supervision, ceilings, stop escalation and failure reporting run against
//! real child processes.

#![cfg(unix)]

mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use common::{
    admin_token, build_test_app, build_test_app_with_tool, expect_json, icmp_job, identity,
    operator_token, post_json, send, wait_for, wait_for_audit, wait_for_status, wait_for_terminal,
    ADMIN_ID, OPERATOR_ID,
};
use serde_json::json;
use stormforge_core::job::{JobSpec, JobStatus};
use stormforge_core::job_events::{AUDIT_JOB_FORCE_STOP, AUDIT_JOB_STOP, AUDIT_JOB_SUBMIT};
use stormforge_core::quota::QuotaLimits;
use stormforge_core::roles::{Identity, Role};
use stormforge_core::types::JobId;

/// Prints a banner, three replies and a summary, then exits cleanly.
const REPLIES: &str = r#"
echo "HPING 10.0.0.1 (eth0 10.0.0.1): icmp mode set, 28 headers + 0 data bytes"
echo "len=28 ip=10.0.0.1 ttl=64 id=1 icmp_seq=0 rtt=0.1 ms"
echo "len=28 ip=10.0.0.1 ttl=64 id=2 icmp_seq=1 rtt=0.1 ms"
echo "len=28 ip=10.0.0.1 ttl=64 id=3 icmp_seq=2 rtt=0.1 ms"
echo "3 packets transmitted, 3 packets received, 0% packet loss"
"#;

/// Prints a banner, then runs until signalled.
const SLEEPER: &str = r#"
echo "HPING 10.0.0.1 (eth0 10.0.0.1): icmp mode set, 28 headers + 0 data bytes"
exec sleep 30
"#;

/// Ignores SIGINT, so only the forced kill ends it.
const STUBBORN: &str = r#"
trap '' INT
echo "started"
while :; do sleep 1; done
"#;

const FAILING: &str = r#"
echo "hping3: socket: Operation not permitted" >&2
exit 1
"#;

fn operator() -> Identity {
    identity(OPERATOR_ID, Role::Operator)
}

fn spec(duration_secs: Option<u64>, max_packets: Option<u64>) -> JobSpec {
    JobSpec {
        name: "lifecycle".into(),
        targets: vec!["10.0.0.1".into()],
        traffic_type: stormforge_core::job::TrafficType::Icmp,
        dst_port: None,
        src_port: None,
        pps: 100,
        duration_secs,
        max_packets,
        packet_size: 0,
        ttl: 64,
        iface: None,
        dry_run: false,
        priority: Default::default(),
        tags: vec![],
    }
}

async fn submit_running(t: &common::TestApp, spec: JobSpec) -> JobId {
    let snapshot = t.orchestrator().submit(&operator(), spec).unwrap();
    let running = wait_for_status(t.orchestrator(), &operator(), snapshot.id, JobStatus::Running).await;
    assert!(running.pid.is_some());
    assert!(running.started_at.is_some());
    snapshot.id
}

// ---------------------------------------------------------------------------
// Natural completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_exit_completes_with_progress() {
    let t = build_test_app_with_tool(REPLIES).await;

    let snapshot = t.orchestrator().submit(&operator(), spec(None, Some(3))).unwrap();
    let done = wait_for_terminal(t.orchestrator(), &operator(), snapshot.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.counters.packets_sent, 3);
    assert_eq!(done.counters.bytes_sent, 84);
    assert_eq!(done.counters.output_lines, 5);
    assert!(done.pid.is_none());
    assert!(done.error_message.is_none());
    assert!(done.output_tail.last().unwrap().contains("packets transmitted"));

    // The recorder persists the terminal snapshot asynchronously.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if t.store
            .snapshot(snapshot.id)
            .is_some_and(|s| s.status == JobStatus::Completed)
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "snapshot never persisted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn hosts_run_sequentially_and_counters_accumulate() {
    let t = build_test_app_with_tool(REPLIES).await;
    let mut two_hosts = spec(None, Some(6));
    two_hosts.targets = vec!["10.0.0.1".into(), "10.0.0.2".into()];

    let snapshot = t.orchestrator().submit(&operator(), two_hosts).unwrap();
    assert_eq!(snapshot.hosts.len(), 2);
    let done = wait_for_terminal(t.orchestrator(), &operator(), snapshot.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.counters.packets_sent, 6);
    assert_eq!(done.counters.output_lines, 10);
}

#[tokio::test]
async fn duration_ceiling_completes_the_job() {
    let t = build_test_app_with_tool(SLEEPER).await;

    let snapshot = t.orchestrator().submit(&operator(), spec(Some(1), None)).unwrap();
    let done = wait_for(
        t.orchestrator(),
        &operator(),
        snapshot.id,
        Duration::from_secs(10),
        |s| s.status.is_terminal(),
    )
    .await;

    assert_eq!(done.status, JobStatus::Completed);
    assert!(!done.cancel_requested);
    assert!(done.completed_at.unwrap() >= done.started_at.unwrap());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_zero_exit_fails_with_stderr_tail() {
    let t = build_test_app_with_tool(FAILING).await;

    let snapshot = t.orchestrator().submit(&operator(), spec(Some(5), None)).unwrap();
    let done = wait_for_terminal(t.orchestrator(), &operator(), snapshot.id).await;

    assert_eq!(done.status, JobStatus::Failed);
    let message = done.error_message.unwrap();
    assert!(message.starts_with("exit code 1"), "{message}");
    assert!(message.contains("Operation not permitted"), "{message}");
}

#[tokio::test]
async fn missing_tool_fails_without_running() {
    let t = build_test_app().await;

    let snapshot = t.orchestrator().submit(&operator(), spec(Some(5), None)).unwrap();
    let done = wait_for_terminal(t.orchestrator(), &operator(), snapshot.id).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.started_at.is_none());
    assert!(done.error_message.is_some());
}

// ---------------------------------------------------------------------------
// Stop requests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn graceful_stop_cancels_running_job() {
    let t = build_test_app_with_tool(SLEEPER).await;
    let id = submit_running(&t, spec(Some(30), None)).await;

    let uri = format!("/api/v1/jobs/{id}/stop");
    let response = post_json(
        t.router(),
        &uri,
        &operator_token(),
        json!({ "reason": "maintenance window" }),
    )
    .await;
    let json = expect_json(response, StatusCode::ACCEPTED).await;
    assert_eq!(json["data"]["cancel_requested"], true);

    let done = wait_for_terminal(t.orchestrator(), &operator(), id).await;
    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(done.cancel_reason.as_deref(), Some("maintenance window"));
    assert!(done.pid.is_none());

    wait_for_audit(&t.store, AUDIT_JOB_SUBMIT).await;
    wait_for_audit(&t.store, AUDIT_JOB_STOP).await;
}

#[tokio::test]
async fn stop_without_body_uses_default_reason() {
    let t = build_test_app_with_tool(SLEEPER).await;
    let id = submit_running(&t, spec(Some(30), None)).await;

    let uri = format!("/api/v1/jobs/{id}/stop");
    let response = send(t.router(), Method::POST, &uri, Some(&operator_token()), None).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let done = wait_for_terminal(t.orchestrator(), &operator(), id).await;
    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(
        done.cancel_reason,
        Some(format!("stopped by user {OPERATOR_ID}"))
    );
}

#[tokio::test]
async fn process_ignoring_interrupt_is_killed_after_grace() {
    let t = build_test_app_with_tool(STUBBORN).await;
    let id = submit_running(&t, spec(Some(30), None)).await;

    t.orchestrator().stop(&operator(), id, false, None).unwrap();

    // Grace is one second in tests; the kill follows shortly after.
    let done = wait_for(
        t.orchestrator(),
        &operator(),
        id,
        Duration::from_secs(10),
        |s| s.status.is_terminal(),
    )
    .await;
    assert_eq!(done.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn force_stop_kills_immediately() {
    let t = build_test_app_with_tool(STUBBORN).await;
    let id = submit_running(&t, spec(Some(30), None)).await;

    let started = tokio::time::Instant::now();
    t.orchestrator()
        .stop(&operator(), id, true, Some("abort".into()))
        .unwrap();
    let done = wait_for_terminal(t.orchestrator(), &operator(), id).await;

    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(done.cancel_reason.as_deref(), Some("abort"));
    assert!(started.elapsed() < Duration::from_secs(1));
    wait_for_audit(&t.store, AUDIT_JOB_FORCE_STOP).await;
}

#[tokio::test]
async fn repeated_stop_requests_are_harmless() {
    let t = build_test_app_with_tool(SLEEPER).await;
    let id = submit_running(&t, spec(Some(30), None)).await;

    t.orchestrator().stop(&operator(), id, false, Some("first".into())).unwrap();
    let _ = t.orchestrator().stop(&operator(), id, true, Some("second".into()));

    let done = wait_for_terminal(t.orchestrator(), &operator(), id).await;
    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(done.cancel_reason.as_deref(), Some("first"));
}

// ---------------------------------------------------------------------------
// Emergency stop and quotas
// ---------------------------------------------------------------------------

#[tokio::test]
async fn emergency_stop_cancels_jobs_and_blocks_admission() {
    let t = build_test_app_with_tool(SLEEPER).await;
    let id = submit_running(&t, spec(Some(30), None)).await;

    let response = send(
        t.router(),
        Method::POST,
        "/api/v1/admin/emergency-stop",
        Some(&admin_token()),
        None,
    )
    .await;
    let json = expect_json(response, StatusCode::OK).await;
    assert_eq!(json["data"]["changed"], true);
    assert_eq!(json["data"]["signalled_jobs"], 1);
    assert_eq!(json["data"]["state"]["engaged"], true);
    assert_eq!(json["data"]["state"]["engaged_by"], ADMIN_ID);

    let done = wait_for_terminal(t.orchestrator(), &operator(), id).await;
    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(done.cancel_reason.as_deref(), Some("emergency stop"));

    let response = post_json(t.router(), "/api/v1/jobs", &operator_token(), icmp_job(5)).await;
    let json = expect_json(response, StatusCode::SERVICE_UNAVAILABLE).await;
    assert_eq!(json["code"], "SYSTEM_HALTED");
    assert_eq!(json["reason"], "system_halted");

    let response = send(
        t.router(),
        Method::DELETE,
        "/api/v1/admin/emergency-stop",
        Some(&admin_token()),
        None,
    )
    .await;
    let json = expect_json(response, StatusCode::OK).await;
    assert_eq!(json["data"]["state"]["engaged"], false);

    let response = post_json(t.router(), "/api/v1/jobs", &operator_token(), icmp_job(5)).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    t.orchestrator().shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn quota_slot_is_released_when_job_ends() {
    let t = build_test_app_with_tool(SLEEPER).await;
    let admin = identity(ADMIN_ID, Role::Admin);
    let limits = QuotaLimits {
        max_concurrent_jobs: 1,
        ..QuotaLimits::default()
    };
    t.orchestrator()
        .set_quota(&admin, OPERATOR_ID, limits)
        .await
        .unwrap();

    let id = submit_running(&t, spec(Some(30), None)).await;

    let response = post_json(t.router(), "/api/v1/jobs", &operator_token(), icmp_job(30)).await;
    let json = expect_json(response, StatusCode::TOO_MANY_REQUESTS).await;
    assert_eq!(json["reason"], "max_concurrent_jobs_exceeded");
    assert_eq!(t.orchestrator().quota_view(OPERATOR_ID).usage.running_jobs, 1);

    t.orchestrator().stop(&operator(), id, true, None).unwrap();
    wait_for_terminal(t.orchestrator(), &operator(), id).await;

    // The slot is handed back just after the terminal transition.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while t.orchestrator().quota_view(OPERATOR_ID).usage.running_jobs > 0 {
        assert!(tokio::time::Instant::now() < deadline, "quota never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = post_json(t.router(), "/api/v1/jobs", &operator_token(), icmp_job(30)).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    t.orchestrator().shutdown(Duration::from_secs(5)).await;
}

// ---------------------------------------------------------------------------
// Persistence failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_store_does_not_affect_jobs() {
    let t = build_test_app_with_tool(REPLIES).await;
    t.store.set_fail_writes(true);

    let mut dry = spec(Some(5), None);
    dry.dry_run = true;
    let dry = t.orchestrator().submit(&operator(), dry).unwrap();
    let real = t.orchestrator().submit(&operator(), spec(None, Some(3))).unwrap();

    let dry = wait_for_terminal(t.orchestrator(), &operator(), dry.id).await;
    assert_eq!(dry.status, JobStatus::Completed);
    assert_eq!(dry.counters.packets_sent, 0);

    let real = wait_for_terminal(t.orchestrator(), &operator(), real.id).await;
    assert_eq!(real.status, JobStatus::Completed);
    assert_eq!(real.counters.packets_sent, 3);
    assert!(real.error_message.is_none());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let usage = t.orchestrator().quota_view(OPERATOR_ID).usage;
        if usage.running_jobs == 0 && usage.reserved_pps == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "quota never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Let the recorder work through the queued writes, which all fail.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(t.store.audit_entries().is_empty());

    // The recorder drops failed writes in order and keeps going.
    t.store.set_fail_writes(false);
    let mut later = spec(Some(5), None);
    later.dry_run = true;
    let later = t.orchestrator().submit(&operator(), later).unwrap();
    let entry = wait_for_audit(&t.store, AUDIT_JOB_SUBMIT).await;
    assert_eq!(entry.resource_id, Some(later.id.to_string()));
    assert_eq!(t.store.audit_entries().len(), 1);
    assert!(t.store.snapshot(real.id).is_none());
}

#[tokio::test]
async fn shutdown_cancels_running_jobs() {
    let t = build_test_app_with_tool(SLEEPER).await;
    let id = submit_running(&t, spec(Some(30), None)).await;

    t.orchestrator().shutdown(Duration::from_secs(5)).await;

    let done = t.orchestrator().get(&operator(), id).unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);
    assert_eq!(done.cancel_reason.as_deref(), Some("server shutdown"));
}
