//! Scoped, bounded publish/subscribe for job and system events.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: an event
//! that does not fit drops the subscriber instead of stalling the
//! publisher, and the subscriber's stream ends once it has drained what was
//! already queued. Per-job ordering follows from callers publishing a
//! job's events while holding that job's registry lock, and from each queue
//! being FIFO.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stormforge_core::job::JobSnapshot;
use stormforge_core::job_events::{
    MSG_TYPE_ADMIN_ACTION, MSG_TYPE_CONNECTION_ESTABLISHED, MSG_TYPE_JOB_STATUS_UPDATE,
    MSG_TYPE_PONG, MSG_TYPE_SYSTEM_EVENT, MSG_TYPE_SYSTEM_STATS,
};
use stormforge_core::roles::{Identity, Role};
use stormforge_core::sync::{read, write};
use stormforge_core::types::{DbId, JobId, Timestamp};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStatusUpdate,
    SystemEvent,
    AdminAction,
    ConnectionEstablished,
    Pong,
    SystemStats,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::JobStatusUpdate => MSG_TYPE_JOB_STATUS_UPDATE,
            EventKind::SystemEvent => MSG_TYPE_SYSTEM_EVENT,
            EventKind::AdminAction => MSG_TYPE_ADMIN_ACTION,
            EventKind::ConnectionEstablished => MSG_TYPE_CONNECTION_ESTABLISHED,
            EventKind::Pong => MSG_TYPE_PONG,
            EventKind::SystemStats => MSG_TYPE_SYSTEM_STATS,
        }
    }
}

/// Wire envelope: `{type, job_id?, seq?, timestamp, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    /// Owner of the job the event is about. Used for visibility only.
    #[serde(skip)]
    pub owner_id: Option<DbId>,

    /// Per-job sequence number of status events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    pub timestamp: Timestamp,

    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            job_id: None,
            owner_id: None,
            seq: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach the job the event concerns.
    pub fn for_job(mut self, job_id: JobId, owner_id: DbId) -> Self {
        self.job_id = Some(job_id);
        self.owner_id = Some(owner_id);
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// A `job_status_update` carrying the full snapshot.
    pub fn job_status(snapshot: &JobSnapshot) -> Self {
        Event::new(EventKind::JobStatusUpdate)
            .for_job(snapshot.id, snapshot.owner_id)
            .with_seq(snapshot.seq)
            .with_data(serde_json::to_value(snapshot).unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Scope and visibility
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "job_id", rename_all = "snake_case")]
pub enum Scope {
    Global,
    Job(JobId),
}

/// Whether a subscriber with `viewer` identity on `scope` receives `event`.
///
/// Job scopes receive only that job's events. Global scopes filter by
/// role: admins see everything, operators everything but admin actions,
/// read-only viewers only status updates and stats. Non-admins only see
/// status updates for jobs they own.
pub fn is_visible(scope: Scope, viewer: &Identity, event: &Event) -> bool {
    if let Scope::Job(id) = scope {
        return event.job_id == Some(id);
    }

    let kind_allowed = match viewer.role {
        Role::Admin => true,
        Role::Operator => event.kind != EventKind::AdminAction,
        Role::ReadOnly => matches!(
            event.kind,
            EventKind::JobStatusUpdate | EventKind::SystemStats
        ),
    };
    if !kind_allowed {
        return false;
    }

    match event.owner_id {
        Some(owner) => viewer.can_view(owner),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct Slot {
    scope: Scope,
    viewer: Identity,
    sender: mpsc::Sender<Event>,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<u64, Slot>>,
    next_id: AtomicU64,
    buffer: usize,
    evicted: AtomicU64,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    /// Register a subscriber. The subscription removes itself when
    /// dropped.
    pub fn subscribe(self: &Arc<Self>, scope: Scope, viewer: Identity) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);
        write(&self.subscribers).insert(
            id,
            Slot {
                scope,
                viewer,
                sender,
            },
        );
        tracing::debug!(subscriber_id = id, ?scope, user_id = viewer.user_id, "Subscriber added");
        Subscription {
            id,
            scope,
            receiver,
            bus: Arc::downgrade(self),
            floor: None,
        }
    }

    /// Deliver `event` to every subscriber that may see it.
    ///
    /// Never blocks. Subscribers whose queue is full or closed are removed.
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: &Event) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subscribers = read(&self.subscribers);
            for (id, slot) in subscribers.iter() {
                if !is_visible(slot.scope, &slot.viewer, event) {
                    continue;
                }
                match slot.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(subscriber_id = id, "Subscriber queue full, dropping subscriber");
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut subscribers = write(&self.subscribers);
            for id in dead {
                if subscribers.remove(&id).is_some() {
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        delivered
    }

    pub fn unsubscribe(&self, id: u64) {
        if write(&self.subscribers).remove(&id).is_some() {
            tracing::debug!(subscriber_id = id, "Subscriber removed");
        }
    }

    pub fn is_subscribed(&self, id: u64) -> bool {
        read(&self.subscribers).contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        read(&self.subscribers).len()
    }

    /// Total subscribers dropped by `publish` since start.
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving end of one subscriber. Finite: ends when the bus drops it or
/// the bus goes away.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    scope: Scope,
    receiver: mpsc::Receiver<Event>,
    bus: Weak<EventBus>,
    /// Job events with a `seq` at or below this were already seen.
    floor: Option<(JobId, u64)>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let event = self.receiver.recv().await?;
            if !self.already_seen(&event) {
                return Some(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            let event = self.receiver.try_recv().ok()?;
            if !self.already_seen(&event) {
                return Some(event);
            }
        }
    }

    /// Skip this job's events up to and including `seq`, queued or not.
    ///
    /// Used after sending a snapshot taken once the subscription existed,
    /// so the stream continues from the snapshot without repeats.
    pub fn resume_after(&mut self, job_id: JobId, seq: u64) {
        self.floor = Some((job_id, seq));
    }

    fn already_seen(&self, event: &Event) -> bool {
        match (self.floor, event.job_id, event.seq) {
            (Some((job, floor)), Some(id), Some(seq)) => id == job && seq <= floor,
            _ => false,
        }
    }

    /// `true` once the bus has dropped this subscriber for falling behind.
    pub fn is_evicted(&self) -> bool {
        self.bus
            .upgrade()
            .is_some_and(|bus| !bus.is_subscribed(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Identity {
        Identity::new(1, Role::Admin)
    }

    fn job_event(job: JobId, owner: DbId, seq: u64) -> Event {
        Event::new(EventKind::JobStatusUpdate)
            .for_job(job, owner)
            .with_seq(seq)
    }

    #[tokio::test]
    async fn job_scope_receives_only_its_job_in_order() {
        let bus = Arc::new(EventBus::default());
        let x = uuid::Uuid::new_v4();
        let y = uuid::Uuid::new_v4();
        let mut sub = bus.subscribe(Scope::Job(x), admin());

        for seq in 1..=5 {
            bus.publish(&job_event(x, 1, seq));
            bus.publish(&job_event(y, 1, seq));
        }

        for expected in 1..=5 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.job_id, Some(x));
            assert_eq!(event.seq, Some(expected));
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn resume_after_skips_events_covered_by_a_snapshot() {
        let bus = Arc::new(EventBus::default());
        let job = uuid::Uuid::new_v4();
        let mut sub = bus.subscribe(Scope::Job(job), admin());

        // Queued between subscribing and taking the snapshot at seq 2.
        bus.publish(&job_event(job, 1, 1));
        bus.publish(&job_event(job, 1, 2));
        sub.resume_after(job, 2);
        bus.publish(&job_event(job, 1, 3));
        bus.publish(&Event::new(EventKind::JobStatusUpdate).for_job(job, 1));

        assert_eq!(sub.recv().await.unwrap().seq, Some(3));
        assert_eq!(sub.recv().await.unwrap().seq, None);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_subscriber_is_dropped_without_blocking_others() {
        let bus = Arc::new(EventBus::new(2));
        let job = uuid::Uuid::new_v4();
        let mut slow = bus.subscribe(Scope::Global, admin());
        let mut fast = bus.subscribe(Scope::Global, admin());

        for seq in 1..=3 {
            bus.publish(&job_event(job, 1, seq));
            // The fast subscriber keeps up.
            assert_eq!(fast.recv().await.unwrap().seq, Some(seq));
        }

        assert!(slow.is_evicted());
        assert!(!fast.is_evicted());
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.evicted_count(), 1);

        // The slow subscriber drains what was queued, then its stream ends.
        assert_eq!(slow.recv().await.unwrap().seq, Some(1));
        assert_eq!(slow.recv().await.unwrap().seq, Some(2));
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let bus = Arc::new(EventBus::default());
        let sub = bus.subscribe(Scope::Global, admin());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(&Event::new(EventKind::SystemEvent)), 0);
    }

    #[test]
    fn global_visibility_follows_role_and_ownership() {
        let operator = Identity::new(5, Role::Operator);
        let viewer = Identity::new(6, Role::ReadOnly);
        let job = uuid::Uuid::new_v4();

        let admin_action = Event::new(EventKind::AdminAction);
        let system = Event::new(EventKind::SystemEvent);
        let own = job_event(job, 5, 1);
        let others = job_event(job, 9, 1);

        assert!(is_visible(Scope::Global, &admin(), &admin_action));
        assert!(is_visible(Scope::Global, &admin(), &others));

        assert!(!is_visible(Scope::Global, &operator, &admin_action));
        assert!(is_visible(Scope::Global, &operator, &system));
        assert!(is_visible(Scope::Global, &operator, &own));
        assert!(!is_visible(Scope::Global, &operator, &others));

        assert!(!is_visible(Scope::Global, &viewer, &system));
        assert!(is_visible(
            Scope::Global,
            &viewer,
            &Event::new(EventKind::SystemStats)
        ));
        assert!(!is_visible(Scope::Global, &viewer, &own));
    }

    #[test]
    fn envelope_serializes_with_type_tag() {
        let job = uuid::Uuid::new_v4();
        let json = serde_json::to_value(
            job_event(job, 3, 7).with_data(serde_json::json!({"status": "running"})),
        )
        .unwrap();
        assert_eq!(json["type"], "job_status_update");
        assert_eq!(json["job_id"], job.to_string());
        assert_eq!(json["seq"], 7);
        assert_eq!(json["data"]["status"], "running");
        assert!(json.get("owner_id").is_none());

        let pong = serde_json::to_value(Event::new(EventKind::Pong)).unwrap();
        assert!(pong.get("job_id").is_none());
    }
}
