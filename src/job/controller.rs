//! The single-job slot and its lifecycle.
//!
//! ```text
//!   Idle ──start()──▶ Running ──worker exit──▶ Idle
//!                        │
//!                     stop() only asks the worker to exit
//! ```
//!
//! Every transition and the broadcast that announces it happen under the
//! same lock, so an observer can never see a new run's `running` before the
//! previous run's `stopped`, and a `start` racing a pending stop is still
//! rejected with `JobAlreadyRunning`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::models::{FileSizes, JobConfig, JobOutcome, JobSnapshot, JobState, ObserverId};
use super::poller::FileSizePoller;
use super::progress::{WorkerLine, parse_line};
use super::worker::{Worker, WorkerControl, WorkerEvent};
use super::ws::{EventBus, WsMessage};
use crate::errors::JobError;

/// What to do when the worker writes to its diagnostic stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticPolicy {
    /// Forward as an `error` event and keep running.
    #[default]
    Forward,
    /// Forward, then ask the worker to stop.
    Terminate,
}

impl std::fmt::Display for DiagnosticPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagnosticPolicy::Forward => write!(f, "forward"),
            DiagnosticPolicy::Terminate => write!(f, "terminate"),
        }
    }
}

impl std::str::FromStr for DiagnosticPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "forward" => Ok(DiagnosticPolicy::Forward),
            "terminate" => Ok(DiagnosticPolicy::Terminate),
            _ => anyhow::bail!(
                "Invalid diagnostic policy '{}'. Valid values: forward, terminate",
                s
            ),
        }
    }
}

/// Result of a `stop()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running; nothing happened.
    NotRunning,
    /// The worker was asked to exit; the run ends when it does.
    TerminationRequested { run_id: u64 },
}

struct ActiveJob {
    run_id: u64,
    config: JobConfig,
    origin: ObserverId,
    started_at: DateTime<Utc>,
    control: Box<dyn WorkerControl>,
    poll_cancel: CancellationToken,
    last_count: Option<u64>,
    stop_requested: bool,
}

#[derive(Default)]
struct JobSlot {
    active: Option<ActiveJob>,
    last_outcome: Option<JobOutcome>,
    next_run_id: u64,
}

type SharedSlot = Arc<Mutex<JobSlot>>;

fn lock(slot: &SharedSlot) -> Result<MutexGuard<'_, JobSlot>, JobError> {
    slot.lock().map_err(|_| JobError::LockPoisoned)
}

/// Owns the single job slot. Drives the worker and the size poller and
/// decides what observers are told.
pub struct JobController {
    worker: Arc<dyn Worker>,
    bus: EventBus,
    poller: FileSizePoller,
    policy: DiagnosticPolicy,
    slot: SharedSlot,
}

impl JobController {
    pub fn new(
        worker: Arc<dyn Worker>,
        bus: EventBus,
        poller: FileSizePoller,
        policy: DiagnosticPolicy,
    ) -> Self {
        Self {
            worker,
            bus,
            poller,
            policy,
            slot: Arc::new(Mutex::new(JobSlot::default())),
        }
    }

    /// Start a run on behalf of `origin`. Returns the new run id.
    ///
    /// The worker is spawned and the slot marked running in one critical
    /// section, so two near-simultaneous starts cannot both succeed.
    pub fn start(&self, config: JobConfig, origin: ObserverId) -> Result<u64, JobError> {
        config.validate()?;

        let mut slot = lock(&self.slot)?;
        if slot.active.is_some() {
            return Err(JobError::JobAlreadyRunning);
        }

        let spawned = self.worker.spawn(&config)?;
        slot.next_run_id += 1;
        let run_id = slot.next_run_id;

        let poll_cancel = CancellationToken::new();
        let sizes = self.poller.spawn(poll_cancel.clone());

        tracing::info!(
            run_id,
            observer = %origin,
            charset_len = config.charset.chars().count(),
            min = config.min,
            max = config.max,
            pid = ?spawned.control.pid(),
            "Generation started"
        );

        slot.active = Some(ActiveJob {
            run_id,
            config,
            origin,
            started_at: Utc::now(),
            control: spawned.control,
            poll_cancel,
            last_count: None,
            stop_requested: false,
        });
        self.bus.broadcast(&WsMessage::Status {
            state: JobState::Running,
        });
        drop(slot);

        let run = RunContext {
            run_id,
            slot: Arc::clone(&self.slot),
            bus: self.bus.clone(),
            policy: self.policy,
        };
        tokio::spawn(run.pump(spawned.events, sizes));

        Ok(run_id)
    }

    /// Ask the running worker to exit. A no-op when idle.
    ///
    /// The slot is not cleared here; the run ends when the worker's exit is
    /// observed.
    pub fn stop(&self) -> Result<StopOutcome, JobError> {
        let mut slot = lock(&self.slot)?;
        let Some(job) = slot.active.as_mut() else {
            return Ok(StopOutcome::NotRunning);
        };
        job.stop_requested = true;
        job.control.terminate()?;
        tracing::info!(run_id = job.run_id, "Stop requested");
        Ok(StopOutcome::TerminationRequested { run_id: job.run_id })
    }

    pub fn state(&self) -> JobState {
        match self.slot.lock() {
            Ok(slot) if slot.active.is_some() => JobState::Running,
            _ => JobState::Idle,
        }
    }

    pub fn snapshot(&self) -> Result<JobSnapshot, JobError> {
        let slot = lock(&self.slot)?;
        let snapshot = match &slot.active {
            Some(job) => JobSnapshot {
                state: JobState::Running,
                run_id: Some(job.run_id),
                config: Some(job.config.clone()),
                started_at: Some(job.started_at),
                last_count: job.last_count,
                last_outcome: slot.last_outcome.clone(),
            },
            None => JobSnapshot {
                state: JobState::Idle,
                run_id: None,
                config: None,
                started_at: None,
                last_count: None,
                last_outcome: slot.last_outcome.clone(),
            },
        };
        Ok(snapshot)
    }

    /// Ask a running worker to exit ahead of process shutdown.
    pub fn shutdown(&self) {
        match self.stop() {
            Ok(StopOutcome::TerminationRequested { run_id }) => {
                tracing::info!(run_id, "Terminating worker for shutdown");
            }
            Ok(StopOutcome::NotRunning) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to terminate worker on shutdown"),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poller.interval()
    }
}

/// Per-run handle used by the event pump.
struct RunContext {
    run_id: u64,
    slot: SharedSlot,
    bus: EventBus,
    policy: DiagnosticPolicy,
}

impl RunContext {
    /// Consume worker events and size samples until the worker exits.
    ///
    /// Worker events win ties so an exit is never delayed behind a sample.
    async fn pump(
        self,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        mut sizes: mpsc::Receiver<FileSizes>,
    ) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(WorkerEvent::Stdout(line)) => self.on_output_line(&line),
                    Some(WorkerEvent::Stderr(text)) => self.on_diagnostic(&text),
                    Some(WorkerEvent::Exited(code)) => {
                        self.on_exit(code);
                        return;
                    }
                    None => {
                        tracing::warn!(run_id = self.run_id, "Worker event stream closed without exit");
                        self.on_exit(None);
                        return;
                    }
                },
                Some(sample) = sizes.recv() => self.on_file_sizes(sample),
            }
        }
    }

    /// Run `f` under the slot lock, only while this run is still the active one.
    fn with_active<F>(&self, f: F)
    where
        F: FnOnce(&mut ActiveJob, &EventBus),
    {
        let Ok(mut slot) = self.slot.lock() else {
            tracing::error!(run_id = self.run_id, "Job state lock poisoned");
            return;
        };
        if let Some(job) = slot.active.as_mut().filter(|j| j.run_id == self.run_id) {
            f(job, &self.bus);
        }
    }

    fn on_output_line(&self, line: &str) {
        match parse_line(line) {
            WorkerLine::Progress(count) => self.with_active(|job, bus| {
                if job.last_count.is_some_and(|last| count < last) {
                    tracing::debug!(run_id = job.run_id, count, last = ?job.last_count, "Ignoring regressed progress count");
                    return;
                }
                job.last_count = Some(count);
                bus.broadcast(&WsMessage::Progress { count });
            }),
            WorkerLine::Diagnostic(text) => {
                tracing::debug!(run_id = self.run_id, output = %text, "Worker output");
            }
        }
    }

    fn on_diagnostic(&self, text: &str) {
        let text = text.trim_end();
        if text.is_empty() {
            return;
        }
        tracing::warn!(run_id = self.run_id, stderr = %text, "Worker diagnostic");

        let policy = self.policy;
        self.with_active(|job, bus| {
            bus.send_to(
                job.origin,
                &WsMessage::Error {
                    message: text.to_string(),
                },
            );
            if policy == DiagnosticPolicy::Terminate && !job.stop_requested {
                job.stop_requested = true;
                if let Err(e) = job.control.terminate() {
                    tracing::warn!(run_id = job.run_id, error = %e, "Failed to terminate worker after diagnostic");
                }
            }
        });
    }

    fn on_file_sizes(&self, sizes: FileSizes) {
        self.with_active(|_, bus| bus.broadcast(&WsMessage::FileSizes(sizes)));
    }

    fn on_exit(&self, exit_code: Option<i32>) {
        let Ok(mut slot) = self.slot.lock() else {
            tracing::error!(run_id = self.run_id, "Job state lock poisoned, cannot finalize run");
            return;
        };
        if slot.active.as_ref().is_none_or(|j| j.run_id != self.run_id) {
            return;
        }
        let Some(job) = slot.active.take() else {
            return;
        };

        job.poll_cancel.cancel();
        let outcome = JobOutcome {
            run_id: job.run_id,
            config: job.config,
            started_at: job.started_at,
            finished_at: Utc::now(),
            exit_code,
            stop_requested: job.stop_requested,
            last_count: job.last_count,
        };
        tracing::info!(
            run_id = outcome.run_id,
            exit_code = ?exit_code,
            stop_requested = outcome.stop_requested,
            last_count = ?outcome.last_count,
            elapsed_ms = (outcome.finished_at - outcome.started_at).num_milliseconds(),
            "Generation finished"
        );
        slot.last_outcome = Some(outcome);

        self.bus.broadcast(&WsMessage::Status {
            state: JobState::Stopped,
        });
        self.bus.broadcast(&WsMessage::DownloadReady);
    }
}
