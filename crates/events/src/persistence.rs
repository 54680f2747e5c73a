//! Ordered, fire-and-forget persistence of job snapshots and audit entries.
//!
//! The engine hands records to a [`Recorder`] without awaiting storage. A
//! single [`JobRecorder`] task drains the queue and writes through a
//! [`JobStore`], so writes for one job land in the order they were made.
//! Storage failures are logged and never reach the engine.

use std::sync::Arc;

use stormforge_core::job::JobSnapshot;
use stormforge_db::models::audit::NewAuditEntry;
use stormforge_db::JobStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Record {
    Snapshot(Box<JobSnapshot>),
    Audit(NewAuditEntry),
}

/// Cheap, cloneable handle for queueing records.
#[derive(Debug, Clone)]
pub struct Recorder {
    sender: mpsc::UnboundedSender<Record>,
}

impl Recorder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Record>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn snapshot(&self, snapshot: JobSnapshot) {
        self.send(Record::Snapshot(Box::new(snapshot)));
    }

    pub fn audit(&self, entry: NewAuditEntry) {
        self.send(Record::Audit(entry));
    }

    fn send(&self, record: Record) {
        if self.sender.send(record).is_err() {
            tracing::debug!("Recorder closed, dropping record");
        }
    }
}

/// Background writer draining a [`Recorder`] queue.
pub struct JobRecorder;

impl JobRecorder {
    /// Run until every [`Recorder`] is dropped or `cancel` fires. On
    /// cancellation the queue is closed and whatever is already in it is
    /// still written.
    pub async fn run(
        store: Arc<dyn JobStore>,
        mut receiver: mpsc::UnboundedReceiver<Record>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    receiver.close();
                    let mut drained = 0usize;
                    while let Some(record) = receiver.recv().await {
                        Self::write(store.as_ref(), &record).await;
                        drained += 1;
                    }
                    tracing::info!(drained, "Job recorder stopping");
                    break;
                }
                record = receiver.recv() => {
                    match record {
                        Some(record) => Self::write(store.as_ref(), &record).await,
                        None => {
                            tracing::info!("Recorder channel closed, job recorder stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn write(store: &dyn JobStore, record: &Record) {
        match record {
            Record::Snapshot(snapshot) => {
                if let Err(e) = store.save_job_snapshot(snapshot).await {
                    tracing::error!(
                        error = %e,
                        job_id = %snapshot.id,
                        seq = snapshot.seq,
                        "Failed to persist job snapshot"
                    );
                }
            }
            Record::Audit(entry) => {
                if let Err(e) = store.append_audit(entry).await {
                    tracing::error!(
                        error = %e,
                        action = %entry.action,
                        "Failed to append audit entry"
                    );
                }
            }
        }
    }
}
