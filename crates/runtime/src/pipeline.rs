//! Orchestration loop.
//!
//! One loop owns the [`TaskScheduler`] and is the only writer of task state.
//! Ready tasks are dispatched onto a bounded worker pool; results come back
//! through the `JoinSet` and are applied to the scheduler in order of
//! completion.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use saga_config::{AppConfig, SchedulerConfig};
use saga_memory::ContinuityFinding;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::coordinator::{AgentCoordinator, TaskResult};
use crate::events::PipelineEvent;
use crate::message::TaskMessage;
use crate::roles::RoleError;
use crate::scheduler::{
    DeadlockReport, FailureOutcome, Progress, SchedulerError, TaskScheduler, UnitStatus,
};
use crate::task::{Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub target_units: u32,
    pub fanout_per_unit: u32,
    pub max_retries: u32,
    pub max_concurrency: usize,
}

impl PipelineConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            target_units: config.project.target_units,
            fanout_per_unit: config.scheduler.fanout_per_unit,
            max_retries: config.scheduler.max_retries,
            max_concurrency: config.scheduler.max_concurrency,
        }
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_retries: self.max_retries,
            fanout_per_unit: self.fanout_per_unit,
            max_concurrency: self.max_concurrency,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub units: BTreeMap<u32, UnitStatus>,
    /// Every finding observed, in the order they were reported.
    pub findings: Vec<ContinuityFinding>,
    pub progress: Progress,
    pub repairs: usize,
    pub deadlock: Option<DeadlockReport>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.deadlock.is_none()
            && self.units.values().all(|status| *status == UnitStatus::Done)
    }
}

type WorkerOutput = (TaskId, Result<TaskResult, RoleError>);

pub struct Pipeline {
    config: PipelineConfig,
    scheduler: TaskScheduler,
    coordinator: Arc<AgentCoordinator>,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
    findings: Vec<ContinuityFinding>,
    repairs: usize,
}

impl Pipeline {
    /// Expand the task graph for `config.target_units` units.
    pub fn new(config: PipelineConfig, coordinator: Arc<AgentCoordinator>) -> Result<Self, PipelineError> {
        let mut scheduler = TaskScheduler::new(&config.scheduler_config());
        scheduler.expand(config.target_units, config.fanout_per_unit)?;
        Ok(Self {
            config,
            scheduler,
            coordinator,
            events: None,
            findings: Vec::new(),
            repairs: 0,
        })
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Run until every unit is validated, the graph deadlocks, or `shutdown`
    /// fires.  Cancelled in-flight tasks are abandoned, never committed half
    /// way.
    #[instrument(skip_all, fields(units = self.config.target_units))]
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<RunReport, PipelineError> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut workers: JoinSet<WorkerOutput> = JoinSet::new();
        let mut in_flight: HashMap<TaskId, Task> = HashMap::new();
        let mut deadlock = None;
        let mut cancelled = false;

        info!(
            tasks = self.scheduler.len(),
            max_concurrency = self.config.max_concurrency,
            "pipeline started"
        );

        loop {
            if shutdown.is_cancelled() {
                cancelled = true;
                break;
            }

            while let Some(joined) = workers.try_join_next() {
                self.reap(joined, &mut in_flight)?;
            }

            while let Ok(permit) = permits.clone().try_acquire_owned() {
                let Some(task) = self.scheduler.next_ready() else {
                    break;
                };
                self.emit(PipelineEvent::TaskStarted {
                    task_id: task.id,
                    kind: task.kind,
                    unit_index: task.unit_index,
                });
                in_flight.insert(task.id, task.clone());

                let coordinator = self.coordinator.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    let outcome = AssertUnwindSafe(coordinator.dispatch(&task))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(RoleError::Interrupted("worker panicked".into())));
                    (task.id, outcome)
                });
            }

            if workers.is_empty() {
                if self.scheduler.is_complete() {
                    break;
                }
                if let Some(report) = self.scheduler.stall() {
                    error!(%report, "pipeline deadlocked");
                    self.emit(PipelineEvent::Deadlock(report.clone()));
                    deadlock = Some(report);
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(joined) = workers.join_next() => {
                    self.reap(joined, &mut in_flight)?;
                }
            }
        }

        if cancelled {
            warn!(in_flight = in_flight.len(), "pipeline cancelled");
            workers.abort_all();
            while let Some(joined) = workers.join_next().await {
                if joined.is_ok() {
                    self.reap(joined, &mut in_flight)?;
                }
            }
            for (id, _) in in_flight.drain() {
                self.scheduler.abandon(id, "cancelled")?;
            }
            self.emit(PipelineEvent::Cancelled);
        }

        let report = RunReport {
            units: self.scheduler.unit_report(),
            findings: self.findings.clone(),
            progress: self.scheduler.progress(),
            repairs: self.repairs,
            deadlock,
            cancelled,
        };
        info!(
            done = report.units.values().filter(|s| **s == UnitStatus::Done).count(),
            units = report.units.len(),
            repairs = report.repairs,
            findings = report.findings.len(),
            percent = report.progress.percent_complete,
            "pipeline finished"
        );
        Ok(report)
    }

    fn reap(
        &mut self,
        joined: Result<WorkerOutput, JoinError>,
        in_flight: &mut HashMap<TaskId, Task>,
    ) -> Result<(), PipelineError> {
        let (id, outcome) = match joined {
            Ok(output) => output,
            Err(err) => {
                // Workers catch their own panics, so only aborts land here.
                warn!(error = %err, "worker did not complete");
                return Ok(());
            }
        };
        let Some(task) = in_flight.remove(&id) else {
            warn!(task_id = %id, "result for a task that is not in flight");
            return Ok(());
        };
        let message = TaskMessage::request(&task);

        match outcome {
            Ok(result) => {
                self.scheduler.mark_done(id)?;
                for finding in &result.findings {
                    self.record_finding(finding.clone());
                }
                self.emit(PipelineEvent::TaskFinished(message.with_result(&result)));
            }
            Err(err) => {
                if let RoleError::Contradiction(findings) = &err {
                    for finding in findings {
                        self.record_finding(finding.clone());
                    }
                }
                let reason = format!("{}: {err}", err.code());
                match self.scheduler.mark_failed(id, reason)? {
                    FailureOutcome::Retrying { repair, failures } => {
                        self.repairs += 1;
                        self.emit(PipelineEvent::RepairScheduled {
                            failed: id,
                            repair,
                            failures,
                        });
                    }
                    FailureOutcome::Exhausted { failures } => {
                        self.emit(PipelineEvent::RetriesExhausted {
                            task_id: id,
                            failures,
                        });
                    }
                }
                self.emit(PipelineEvent::TaskFinished(message.with_error(&err)));
            }
        }
        Ok(())
    }

    fn record_finding(&mut self, finding: ContinuityFinding) {
        self.emit(PipelineEvent::Finding(finding.clone()));
        self.findings.push(finding);
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
