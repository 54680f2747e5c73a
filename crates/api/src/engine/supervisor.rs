//! Process supervision: one task per job, owning the live process.
//!
//! The supervisor is the only writer of a job's state after admission. Stop
//! requests reach it over the job's control channel; deadlines, output and
//! process exit are multiplexed in a single `select!` loop per invocation.
//! Hosts are run one after another, never more than one live process per
//! job.

use std::collections::VecDeque;
use std::future::Future;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use stormforge_core::command::{CommandBuilder, PlanStep};
use stormforge_core::halt::EmergencyStop;
use stormforge_core::hping::ProgressTracker;
use stormforge_core::job::{Job, JobStatus};
use stormforge_core::process::{self, StopMode};
use stormforge_core::types::JobId;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::engine::registry::{JobEntry, JobRegistry, StopCause, StopSignal};

/// Stderr lines kept for failure messages.
const STDERR_TAIL_LINES: usize = 5;

/// How long to keep draining output after the process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Buffered output lines between the pipe readers and the loop.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Time between SIGINT and SIGKILL.
    pub stop_grace: Duration,
    /// Time to wait for exit after SIGKILL before giving up.
    pub kill_wait: Duration,
    /// Minimum spacing of progress events.
    pub progress_interval: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(5),
            progress_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Why the current invocation is being stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Interrupt {
    /// Per-host time budget reached.
    StepLimit,
    /// Job-wide duration reached.
    JobLimit,
    Stop(StopCause),
}

/// How one invocation ended.
#[derive(Debug)]
enum StepOutcome {
    /// Move on to the next host.
    Finished,
    /// The job-wide duration is used up; skip the remaining hosts.
    DurationReached,
    Stopped(StopCause),
    Failed(String),
}

pub struct Supervisor {
    registry: Arc<JobRegistry>,
    builder: CommandBuilder,
    halt: Arc<EmergencyStop>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        registry: Arc<JobRegistry>,
        builder: CommandBuilder,
        halt: Arc<EmergencyStop>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            registry,
            builder,
            halt,
            settings,
        }
    }

    /// Claim `job_id` and start supervising it on `tasks`.
    ///
    /// Returns `false` if the job is unknown or already has a supervisor.
    pub fn launch(self: &Arc<Self>, job_id: JobId, tasks: &TaskTracker) -> bool {
        let Some((entry, control)) = self.registry.claim(job_id) else {
            tracing::warn!(job_id = %job_id, "Job already claimed or missing, not launching");
            return false;
        };
        let this = Arc::clone(self);
        tasks.spawn(async move { this.supervise(entry, control).await });
        true
    }

    async fn supervise(
        self: Arc<Self>,
        entry: Arc<JobEntry>,
        mut control: mpsc::UnboundedReceiver<StopSignal>,
    ) {
        let (spec, hosts) = entry.with_job(|job| (job.spec.clone(), job.hosts.clone()));
        let job_id = entry.id();

        let steps = match self.builder.plan(&spec, &hosts) {
            Ok(steps) => steps,
            Err(e) => {
                self.fail(&entry, format!("command rejected: {e}"));
                return;
            }
        };

        if spec.dry_run {
            for step in &steps {
                self.registry
                    .push_output(&entry, format!("dry run: {}", step.command.display()));
            }
            self.finish(&entry, JobStatus::Completed, |_| {});
            return;
        }

        // A stop that arrived between admission and now.
        if let Ok(signal) = control.try_recv() {
            self.cancel(&entry, signal.cause);
            return;
        }
        if self.halt.is_engaged() {
            self.cancel(&entry, StopCause::Emergency);
            return;
        }

        let job_deadline = spec
            .duration_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let packet_bytes = spec.traffic_type.header_bytes() + u64::from(spec.packet_size);
        let mut tracker = ProgressTracker::new(packet_bytes);
        let mut last_progress = Instant::now();

        for (index, step) in steps.iter().enumerate() {
            if index > 0 {
                if let Ok(signal) = control.try_recv() {
                    self.cancel(&entry, signal.cause);
                    return;
                }
                tracker.next_invocation();
            }
            tracing::debug!(
                job_id = %job_id,
                host = %step.host,
                command = %step.command.display(),
                "Starting invocation"
            );

            let outcome = self
                .run_step(
                    &entry,
                    step,
                    index,
                    job_deadline,
                    &mut tracker,
                    &mut control,
                    &mut last_progress,
                )
                .await;

            self.registry
                .progress(&entry, tracker.packets_sent(), tracker.bytes_sent(), false);

            match outcome {
                StepOutcome::Finished => continue,
                StepOutcome::DurationReached => break,
                StepOutcome::Stopped(cause) => {
                    self.cancel(&entry, cause);
                    return;
                }
                StepOutcome::Failed(message) => {
                    self.fail(&entry, message);
                    return;
                }
            }
        }

        self.finish(&entry, JobStatus::Completed, |_| {});
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        entry: &JobEntry,
        step: &PlanStep,
        index: usize,
        job_deadline: Option<Instant>,
        tracker: &mut ProgressTracker,
        control: &mut mpsc::UnboundedReceiver<StopSignal>,
        last_progress: &mut Instant,
    ) -> StepOutcome {
        let spawned = match process::spawn(&step.command) {
            Ok(spawned) => spawned,
            Err(e) => return StepOutcome::Failed(e.to_string()),
        };
        let pid = spawned.pid;
        let mut child = spawned.child;

        if index == 0 {
            if let Err(e) = self
                .registry
                .transition(entry, JobStatus::Running, |job| job.pid = Some(pid))
            {
                tracing::error!(error = %e, pid, "Job could not enter running, killing process");
                let _ = process::signal_group(pid, StopMode::Forced);
                let _ = child.wait().await;
                return StepOutcome::Failed(e.to_string());
            }
        } else {
            self.registry.set_pid(entry, pid);
        }

        let (line_tx, mut lines) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = spawned.stdout {
            tokio::spawn(read_lines(stdout, Stream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = spawned.stderr {
            tokio::spawn(read_lines(stderr, Stream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let step_deadline = step.time_limit.map(|limit| Instant::now() + limit);
        let mut deadline = match (step_deadline, job_deadline) {
            (Some(step), Some(job)) if job <= step => Some((job, Interrupt::JobLimit)),
            (Some(step), _) => Some((step, Interrupt::StepLimit)),
            (None, Some(job)) => Some((job, Interrupt::JobLimit)),
            (None, None) => None,
        };

        let mut interrupt: Option<Interrupt> = None;
        let mut escalate_at: Option<Instant> = None;
        let mut give_up_at: Option<Instant> = None;
        let mut stderr_tail: VecDeque<String> = VecDeque::new();
        let mut lines_open = true;
        let mut control_open = true;

        let exit = loop {
            tokio::select! {
                status = child.wait() => break status,

                line = lines.recv(), if lines_open => match line {
                    Some((stream, line)) => self.observe_line(
                        entry, stream, line, tracker, &mut stderr_tail, last_progress,
                    ),
                    None => lines_open = false,
                },

                signal = control.recv(), if control_open => match signal {
                    Some(signal) => {
                        let now = Instant::now();
                        if !matches!(interrupt, Some(Interrupt::Stop(_))) {
                            interrupt = Some(Interrupt::Stop(signal.cause));
                        }
                        if signal.force {
                            self.signal(pid, StopMode::Forced);
                            give_up_at.get_or_insert(now + self.settings.kill_wait);
                        } else if escalate_at.is_none() && give_up_at.is_none() {
                            self.signal(pid, StopMode::Graceful);
                            escalate_at = Some(now + self.settings.stop_grace);
                        }
                    }
                    None => control_open = false,
                },

                () = sleep_opt(deadline.as_ref().map(|(at, _)| *at)) => {
                    if let Some((_, reason)) = deadline.take() {
                        tracing::info!(job_id = %entry.id(), ?reason, "Ceiling reached, requesting graceful stop");
                        interrupt.get_or_insert(reason);
                        if escalate_at.is_none() && give_up_at.is_none() {
                            self.signal(pid, StopMode::Graceful);
                            escalate_at = Some(Instant::now() + self.settings.stop_grace);
                        }
                    }
                }

                () = sleep_opt(escalate_at.filter(|_| give_up_at.is_none())) => {
                    tracing::warn!(job_id = %entry.id(), pid, "Graceful stop ignored, killing process group");
                    self.signal(pid, StopMode::Forced);
                    give_up_at = Some(Instant::now() + self.settings.kill_wait);
                }

                () = sleep_opt(give_up_at) => {
                    tracing::error!(job_id = %entry.id(), pid, "Process survived SIGKILL");
                    return StepOutcome::Failed(
                        "termination_failed: process did not exit after forced termination".into(),
                    );
                }
            }
        };

        // Pick up whatever the readers still hold.
        while lines_open {
            match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, lines.recv()).await {
                Ok(Some((stream, line))) => {
                    self.observe_line(entry, stream, line, tracker, &mut stderr_tail, last_progress)
                }
                _ => lines_open = false,
            }
        }

        let status = match exit {
            Ok(status) => status,
            Err(e) => return StepOutcome::Failed(format!("failed to wait for process: {e}")),
        };

        match interrupt {
            Some(Interrupt::Stop(cause)) => StepOutcome::Stopped(cause),
            Some(Interrupt::JobLimit) => StepOutcome::DurationReached,
            Some(Interrupt::StepLimit) => StepOutcome::Finished,
            None if status.success() => StepOutcome::Finished,
            None => StepOutcome::Failed(exit_message(status, &stderr_tail)),
        }
    }

    fn observe_line(
        &self,
        entry: &JobEntry,
        stream: Stream,
        line: String,
        tracker: &mut ProgressTracker,
        stderr_tail: &mut VecDeque<String>,
        last_progress: &mut Instant,
    ) {
        if stream == Stream::Stderr {
            if stderr_tail.len() >= STDERR_TAIL_LINES {
                stderr_tail.pop_front();
            }
            stderr_tail.push_back(line.clone());
        }

        if tracker.observe(&line) {
            let publish = last_progress.elapsed() >= self.settings.progress_interval;
            if publish {
                *last_progress = Instant::now();
            }
            self.registry
                .progress(entry, tracker.packets_sent(), tracker.bytes_sent(), publish);
        }
        self.registry.push_output(entry, line);
    }

    fn signal(&self, pid: u32, mode: StopMode) {
        match process::signal_group(pid, mode) {
            Ok(true) => tracing::debug!(pid, ?mode, "Signalled process group"),
            Ok(false) => tracing::debug!(pid, ?mode, "Process group already gone"),
            Err(e) => tracing::warn!(error = %e, pid, "Failed to signal process group"),
        }
    }

    fn finish(&self, entry: &JobEntry, status: JobStatus, apply: impl FnOnce(&mut Job)) {
        if let Err(e) = self.registry.transition(entry, status, apply) {
            tracing::error!(error = %e, job_id = %entry.id(), "Unexpected job transition");
        }
    }

    fn cancel(&self, entry: &JobEntry, cause: StopCause) {
        self.finish(entry, JobStatus::Cancelled, |job| {
            job.cancel_requested = true;
            if job.cancel_reason.is_none() {
                job.cancel_reason = Some(cause.describe());
            }
        });
    }

    fn fail(&self, entry: &JobEntry, message: String) {
        self.finish(entry, JobStatus::Failed, |job| {
            job.error_message = Some(message);
        });
    }
}

fn exit_message(status: ExitStatus, stderr_tail: &VecDeque<String>) -> String {
    let mut message = match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    if !stderr_tail.is_empty() {
        message.push_str(": ");
        message.push_str(&stderr_tail.iter().cloned().collect::<Vec<_>>().join(" | "));
    }
    message
}

/// Sleep until `at`, or forever when there is nothing to wait for.
fn sleep_opt(at: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

async fn read_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, ?stream, "Output stream read failed");
                break;
            }
        }
    }
}
