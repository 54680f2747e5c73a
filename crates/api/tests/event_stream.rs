//! Tests for job event delivery through orchestrator subscriptions.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{build_test_app, identity, ADMIN_ID, OPERATOR_ID, OTHER_OPERATOR_ID, VIEWER_ID};
use stormforge_core::error::CoreError;
use stormforge_core::job::{JobSpec, TrafficType};
use stormforge_core::roles::Role;
use stormforge_events::{Event, EventKind, Scope, Subscription};

fn dry_run() -> JobSpec {
    JobSpec {
        name: "events".into(),
        targets: vec!["10.0.0.1".into()],
        traffic_type: TrafficType::Icmp,
        dst_port: None,
        src_port: None,
        pps: 10,
        duration_secs: Some(5),
        max_packets: None,
        packet_size: 0,
        ttl: 64,
        iface: None,
        dry_run: true,
        priority: Default::default(),
        tags: vec![],
    }
}

/// Collect events until a terminal status update arrives.
async fn until_terminal(sub: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for events")
            .expect("subscription closed");
        let terminal = event.kind == EventKind::JobStatusUpdate
            && matches!(
                event.data["status"].as_str(),
                Some("completed" | "failed" | "cancelled")
            );
        events.push(event);
        if terminal {
            return events;
        }
    }
}

#[tokio::test]
async fn status_updates_arrive_in_sequence_order() {
    let t = build_test_app().await;
    let admin = identity(ADMIN_ID, Role::Admin);
    let mut sub = t.orchestrator().subscribe(&admin, Scope::Global).unwrap();

    let snapshot = t
        .orchestrator()
        .submit(&identity(OPERATOR_ID, Role::Operator), dry_run())
        .unwrap();
    let events = until_terminal(&mut sub).await;

    let seqs: Vec<u64> = events
        .iter()
        .filter(|e| e.job_id == Some(snapshot.id))
        .filter_map(|e| e.seq)
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
    assert_eq!(events[0].data["status"], "admitted");
    assert_eq!(events.last().unwrap().data["status"], "completed");
}

#[tokio::test]
async fn job_scope_receives_only_that_job() {
    let t = build_test_app().await;
    let operator = identity(OPERATOR_ID, Role::Operator);

    let first = t.orchestrator().submit(&operator, dry_run()).unwrap();
    let mut sub = t
        .orchestrator()
        .subscribe(&operator, Scope::Job(first.id))
        .unwrap();
    let _second = t.orchestrator().submit(&operator, dry_run()).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Some(event) = sub.try_recv() {
        assert_eq!(event.job_id, Some(first.id));
    }
}

#[tokio::test]
async fn global_subscribers_only_see_their_own_jobs() {
    let t = build_test_app().await;
    let other = identity(OTHER_OPERATOR_ID, Role::Operator);
    let viewer = identity(VIEWER_ID, Role::ReadOnly);
    let mut other_sub = t.orchestrator().subscribe(&other, Scope::Global).unwrap();
    let mut viewer_sub = t.orchestrator().subscribe(&viewer, Scope::Global).unwrap();
    let mut owner_sub = t
        .orchestrator()
        .subscribe(&identity(OPERATOR_ID, Role::Operator), Scope::Global)
        .unwrap();

    t.orchestrator()
        .submit(&identity(OPERATOR_ID, Role::Operator), dry_run())
        .unwrap();
    until_terminal(&mut owner_sub).await;

    assert!(other_sub.try_recv().is_none());
    assert!(viewer_sub.try_recv().is_none());
}

#[tokio::test]
async fn admin_actions_are_hidden_from_operators() {
    let t = build_test_app().await;
    let mut operator_sub = t
        .orchestrator()
        .subscribe(&identity(OPERATOR_ID, Role::Operator), Scope::Global)
        .unwrap();
    let mut admin_sub = t
        .orchestrator()
        .subscribe(&identity(ADMIN_ID, Role::Admin), Scope::Global)
        .unwrap();

    t.orchestrator()
        .engage_emergency_stop(&identity(ADMIN_ID, Role::Admin));

    let mut admin_kinds = Vec::new();
    while let Some(event) = admin_sub.try_recv() {
        admin_kinds.push(event.kind);
    }
    assert!(admin_kinds.contains(&EventKind::SystemEvent));
    assert!(admin_kinds.contains(&EventKind::AdminAction));

    let mut operator_kinds = Vec::new();
    while let Some(event) = operator_sub.try_recv() {
        operator_kinds.push(event.kind);
    }
    assert_eq!(operator_kinds, vec![EventKind::SystemEvent]);
}

#[tokio::test]
async fn job_scope_requires_view_rights() {
    let t = build_test_app().await;
    let snapshot = t
        .orchestrator()
        .submit(&identity(OPERATOR_ID, Role::Operator), dry_run())
        .unwrap();

    let result = t
        .orchestrator()
        .subscribe(&identity(OTHER_OPERATOR_ID, Role::Operator), Scope::Job(snapshot.id));
    assert_matches!(result, Err(CoreError::Forbidden(_)));

    let result = t.orchestrator().subscribe(
        &identity(OTHER_OPERATOR_ID, Role::Operator),
        Scope::Job(uuid::Uuid::new_v4()),
    );
    assert_matches!(result, Err(CoreError::NotFound { .. }));
}
