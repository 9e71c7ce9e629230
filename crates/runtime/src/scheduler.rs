//! Dependency-aware task scheduler.
//!
//! The whole graph is expanded up front.  A task becomes `ready` once every
//! dependency is satisfied, and a dependency is satisfied when the task, or
//! the latest repair standing in for it, is `done`.  Repairs never rewrite
//! existing `depends_on` sets; they extend a successor chain instead.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use saga_config::SchedulerConfig;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::task::{RepairLink, Task, TaskId, TaskKind, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("fanout_per_unit must be 2 or 3 (got {0})")]
    InvalidFanout(u32),

    #[error("task graph has already been expanded")]
    AlreadyExpanded,

    #[error("scheduler deadlock: {0}")]
    Deadlock(DeadlockReport),
}

/// What `mark_failed` did with the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A repair task was created and is ready.
    Retrying { repair: TaskId, failures: u32 },
    /// The retry budget is spent; dependents stay blocked.
    Exhausted { failures: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub id: TaskId,
    /// Planned task at the root of the repair chain, e.g. `write_unit(2)`.
    pub root: String,
    pub reason: String,
}

/// Remaining work is blocked behind failed tasks and nothing can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadlockReport {
    pub failed: Vec<FailedTask>,
    pub blocked: Vec<TaskId>,
}

impl fmt::Display for DeadlockReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) blocked behind", self.blocked.len())?;
        if self.failed.is_empty() {
            return f.write_str(" unfinished work");
        }
        for (n, failed) in self.failed.iter().enumerate() {
            let sep = if n == 0 { " " } else { "; " };
            write!(f, "{sep}{} ({})", failed.root, failed.reason)?;
        }
        Ok(())
    }
}

/// User-facing status of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Done,
    Failed { reason: String },
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::InProgress => f.write_str("in_progress"),
            Self::Done => f.write_str("done"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    /// Share of planned tasks whose work is done, directly or via a repair.
    pub percent_complete: f32,
}

#[derive(Debug)]
pub struct TaskScheduler {
    max_retries: u32,
    tasks: BTreeMap<TaskId, Task>,
    successor: HashMap<TaskId, TaskId>,
    units: BTreeMap<u32, Vec<TaskId>>,
    next_id: u64,
    expanded: bool,
}

impl TaskScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            tasks: BTreeMap::new(),
            successor: HashMap::new(),
            units: BTreeMap::new(),
            next_id: 1,
            expanded: false,
        }
    }

    /// Build the full graph: `plan`, both design tasks, then per unit
    /// `write_unit(i)` [→ `review_unit(i)`] → `validate_unit(i)`.
    /// `write_unit(i)` waits on both designs and on `validate_unit(i-1)`.
    pub fn expand(
        &mut self,
        target_units: u32,
        fanout_per_unit: u32,
    ) -> Result<Vec<TaskId>, SchedulerError> {
        if self.expanded {
            return Err(SchedulerError::AlreadyExpanded);
        }
        if !matches!(fanout_per_unit, 2 | 3) {
            return Err(SchedulerError::InvalidFanout(fanout_per_unit));
        }
        self.expanded = true;

        let plan = self.insert(TaskKind::Plan, None, []);
        let character = self.insert(TaskKind::DesignCharacter, None, [plan]);
        let world = self.insert(TaskKind::DesignWorld, None, [plan]);
        let mut created = vec![plan, character, world];

        let mut previous_validate: Option<TaskId> = None;
        for unit in 1..=target_units {
            let mut write_deps = vec![character, world];
            write_deps.extend(previous_validate);
            let write = self.insert(TaskKind::WriteUnit, Some(unit), write_deps);
            let mut chain = vec![write];

            let mut last = write;
            if fanout_per_unit == 3 {
                last = self.insert(TaskKind::ReviewUnit, Some(unit), [write]);
                chain.push(last);
            }
            let validate = self.insert(TaskKind::ValidateUnit, Some(unit), [last]);
            chain.push(validate);

            created.extend(&chain);
            self.units.insert(unit, chain);
            previous_validate = Some(validate);
        }

        self.refresh();
        info!(
            target_units,
            fanout_per_unit,
            tasks = created.len(),
            "task graph expanded"
        );
        Ok(created)
    }

    /// Claim the next ready task, lowest unit index first (unit-less tasks
    /// before any unit), then creation order.
    pub fn next_ready(&mut self) -> Option<Task> {
        let id = self
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Ready)
            .min_by_key(|task| (task.unit_index, task.id))
            .map(|task| task.id)?;
        let task = self.tasks.get_mut(&id)?;
        task.status = TaskStatus::InProgress;
        debug!(task_id = %id, task = %task.describe(), "task claimed");
        Some(task.clone())
    }

    pub fn mark_done(&mut self, id: TaskId) -> Result<(), SchedulerError> {
        let task = self.claimed(id, TaskStatus::Done)?;
        task.status = TaskStatus::Done;
        task.last_error = None;
        debug!(task_id = %id, task = %task.describe(), "task done");
        self.refresh();
        Ok(())
    }

    /// Fail a running task.  Below the retry cap this creates a fresh
    /// `repair_unit` task standing in for it.
    pub fn mark_failed(
        &mut self,
        id: TaskId,
        reason: impl Into<String>,
    ) -> Result<FailureOutcome, SchedulerError> {
        let max_retries = self.max_retries;
        let reason = reason.into();
        let task = self.claimed(id, TaskStatus::Failed)?;
        task.status = TaskStatus::Failed;
        task.attempt_count += 1;
        task.last_error = Some(reason.clone());

        let failures = task.attempt_count;
        let unit_index = task.unit_index;
        let target = task.effective_kind();
        let label = task.describe();

        if failures >= max_retries {
            warn!(
                task_id = %id,
                task = %label,
                failures,
                reason = %reason,
                "retry budget exhausted"
            );
            return Ok(FailureOutcome::Exhausted { failures });
        }

        let repair_id = self.allocate_id();
        let mut repair = Task::new(repair_id, TaskKind::RepairUnit, unit_index, []);
        repair.attempt_count = failures;
        repair.repair = Some(RepairLink { failed: id, target });
        self.tasks.insert(repair_id, repair);
        self.successor.insert(id, repair_id);
        self.refresh();

        warn!(
            task_id = %id,
            task = %label,
            repair_id = %repair_id,
            failures,
            reason = %reason,
            "task failed, repair scheduled"
        );
        Ok(FailureOutcome::Retrying {
            repair: repair_id,
            failures,
        })
    }

    /// Fail a task without spending a retry, e.g. on cancellation.
    pub fn abandon(&mut self, id: TaskId, reason: impl Into<String>) -> Result<(), SchedulerError> {
        let task = self.tasks.get_mut(&id).ok_or(SchedulerError::UnknownTask(id))?;
        if task.status.is_terminal() {
            return Err(SchedulerError::IllegalTransition {
                id,
                from: task.status,
                to: TaskStatus::Failed,
            });
        }
        let reason = reason.into();
        info!(task_id = %id, task = %task.describe(), reason = %reason, "task abandoned");
        task.status = TaskStatus::Failed;
        task.last_error = Some(reason);
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks in creation order, repairs included.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every planned task's work is done.
    pub fn is_complete(&self) -> bool {
        self.planned().all(|task| self.satisfied(task.id))
    }

    pub fn has_in_flight(&self) -> bool {
        self.tasks
            .values()
            .any(|task| task.status == TaskStatus::InProgress)
    }

    /// `Some` when work remains but nothing is ready or running.
    pub fn stall(&self) -> Option<DeadlockReport> {
        if self.is_complete()
            || self
                .tasks
                .values()
                .any(|task| matches!(task.status, TaskStatus::Ready | TaskStatus::InProgress))
        {
            return None;
        }

        let failed = self
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Failed && !self.successor.contains_key(&task.id))
            .map(|task| FailedTask {
                id: task.id,
                root: self.root_of(task.id).describe(),
                reason: task.last_error.clone().unwrap_or_default(),
            })
            .collect();
        let blocked = self
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .map(|task| task.id)
            .collect();
        Some(DeadlockReport { failed, blocked })
    }

    pub fn ensure_progress(&self) -> Result<(), SchedulerError> {
        match self.stall() {
            Some(report) => Err(SchedulerError::Deadlock(report)),
            None => Ok(()),
        }
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            total: self.tasks.len(),
            ..Progress::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::Ready => progress.ready += 1,
                TaskStatus::InProgress => progress.in_progress += 1,
                TaskStatus::Done => progress.done += 1,
                TaskStatus::Failed => progress.failed += 1,
            }
        }
        let planned = self.planned().count();
        if planned > 0 {
            let satisfied = self.planned().filter(|task| self.satisfied(task.id)).count();
            progress.percent_complete = satisfied as f32 * 100.0 / planned as f32;
        }
        progress
    }

    pub fn unit_status(&self, unit_index: u32) -> Option<UnitStatus> {
        let chain = self.units.get(&unit_index)?;
        if chain.iter().all(|id| self.satisfied(*id)) {
            return Some(UnitStatus::Done);
        }

        let mut started = false;
        for id in chain {
            let current = &self.tasks[&self.resolve(*id)];
            match current.status {
                TaskStatus::Failed => {
                    return Some(UnitStatus::Failed {
                        reason: current
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "failed".to_string()),
                    });
                }
                TaskStatus::Done | TaskStatus::InProgress | TaskStatus::Ready => {
                    started |= current.status != TaskStatus::Ready || current.is_repair();
                }
                TaskStatus::Pending => {}
            }
        }
        Some(if started {
            UnitStatus::InProgress
        } else {
            UnitStatus::Pending
        })
    }

    pub fn unit_report(&self) -> BTreeMap<u32, UnitStatus> {
        self.units
            .keys()
            .filter_map(|unit| self.unit_status(*unit).map(|status| (*unit, status)))
            .collect()
    }

    fn insert(
        &mut self,
        kind: TaskKind,
        unit_index: Option<u32>,
        depends_on: impl IntoIterator<Item = TaskId>,
    ) -> TaskId {
        let id = self.allocate_id();
        self.tasks
            .insert(id, Task::new(id, kind, unit_index, depends_on));
        id
    }

    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    fn claimed(&mut self, id: TaskId, to: TaskStatus) -> Result<&mut Task, SchedulerError> {
        let task = self.tasks.get_mut(&id).ok_or(SchedulerError::UnknownTask(id))?;
        if task.status != TaskStatus::InProgress {
            return Err(SchedulerError::IllegalTransition {
                id,
                from: task.status,
                to,
            });
        }
        Ok(task)
    }

    fn planned(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|task| !task.is_repair())
    }

    /// Latest task in `id`'s repair chain.
    fn resolve(&self, mut id: TaskId) -> TaskId {
        while let Some(next) = self.successor.get(&id) {
            id = *next;
        }
        id
    }

    fn root_of(&self, mut id: TaskId) -> &Task {
        while let Some(link) = self.tasks.get(&id).and_then(|task| task.repair) {
            id = link.failed;
        }
        &self.tasks[&id]
    }

    fn satisfied(&self, id: TaskId) -> bool {
        self.tasks
            .get(&self.resolve(id))
            .is_some_and(|task| task.status == TaskStatus::Done)
    }

    fn refresh(&mut self) {
        let promote: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| task.depends_on.iter().all(|dep| self.satisfied(*dep)))
            .map(|task| task.id)
            .collect();
        for id in promote {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.status = TaskStatus::Ready;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(max_retries: u32) -> TaskScheduler {
        TaskScheduler::new(&SchedulerConfig {
            max_retries,
            ..SchedulerConfig::default()
        })
    }

    fn find(s: &TaskScheduler, kind: TaskKind, unit: Option<u32>) -> TaskId {
        s.tasks()
            .find(|task| task.kind == kind && task.unit_index == unit)
            .map(|task| task.id)
            .unwrap()
    }

    fn deps(s: &TaskScheduler, id: TaskId) -> Vec<TaskId> {
        s.get(id).unwrap().depends_on.iter().copied().collect()
    }

    /// Claim and complete tasks until `stop` matches the next one, which is
    /// returned still claimed.
    fn run_until(s: &mut TaskScheduler, stop: impl Fn(&Task) -> bool) -> Task {
        loop {
            let task = s.next_ready().expect("a ready task");
            if stop(&task) {
                return task;
            }
            s.mark_done(task.id).unwrap();
        }
    }

    #[test]
    fn expand_three_units_builds_expected_graph() {
        let mut s = scheduler(3);
        let ids = s.expand(3, 2).unwrap();
        assert_eq!(ids.len(), 9);

        let shape: Vec<String> = s.tasks().map(Task::describe).collect();
        assert_eq!(
            shape,
            vec![
                "plan",
                "design_character",
                "design_world",
                "write_unit(1)",
                "validate_unit(1)",
                "write_unit(2)",
                "validate_unit(2)",
                "write_unit(3)",
                "validate_unit(3)",
            ]
        );

        let plan = find(&s, TaskKind::Plan, None);
        let character = find(&s, TaskKind::DesignCharacter, None);
        let world = find(&s, TaskKind::DesignWorld, None);
        assert!(deps(&s, plan).is_empty());
        assert_eq!(deps(&s, character), vec![plan]);
        assert_eq!(deps(&s, world), vec![plan]);

        for unit in 1..=3 {
            let write = find(&s, TaskKind::WriteUnit, Some(unit));
            let validate = find(&s, TaskKind::ValidateUnit, Some(unit));
            let mut expected = vec![character, world];
            if unit > 1 {
                expected.push(find(&s, TaskKind::ValidateUnit, Some(unit - 1)));
            }
            assert_eq!(deps(&s, write), expected);
            assert_eq!(deps(&s, validate), vec![write]);
        }

        assert_eq!(s.get(plan).unwrap().status, TaskStatus::Ready);
        assert_eq!(s.get(character).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn review_pass_sits_between_write_and_validate() {
        let mut s = scheduler(3);
        s.expand(1, 3).unwrap();
        let write = find(&s, TaskKind::WriteUnit, Some(1));
        let review = find(&s, TaskKind::ReviewUnit, Some(1));
        let validate = find(&s, TaskKind::ValidateUnit, Some(1));
        assert_eq!(deps(&s, review), vec![write]);
        assert_eq!(deps(&s, validate), vec![review]);
    }

    #[test]
    fn expand_rejects_bad_fanout_and_second_call() {
        let mut s = scheduler(3);
        assert!(matches!(s.expand(2, 4), Err(SchedulerError::InvalidFanout(4))));
        s.expand(2, 2).unwrap();
        assert!(matches!(s.expand(2, 2), Err(SchedulerError::AlreadyExpanded)));
    }

    #[test]
    fn next_write_never_starts_before_previous_validation() {
        let mut s = scheduler(3);
        s.expand(5, 3).unwrap();

        let mut finished: Vec<Task> = Vec::new();
        while let Some(task) = s.next_ready() {
            if task.kind == TaskKind::WriteUnit {
                let unit = task.unit_index.unwrap();
                if unit > 1 {
                    assert!(
                        finished
                            .iter()
                            .any(|t| t.kind == TaskKind::ValidateUnit && t.unit_index == Some(unit - 1)),
                        "write_unit({unit}) started before validate_unit({})",
                        unit - 1
                    );
                }
            }
            s.mark_done(task.id).unwrap();
            finished.push(task);
        }
        assert!(s.is_complete());
        assert_eq!(finished.len(), 3 + 5 * 3);
        assert_eq!(s.progress().percent_complete, 100.0);
    }

    #[test]
    fn designs_are_ready_together_after_plan() {
        let mut s = scheduler(3);
        s.expand(1, 2).unwrap();
        let plan = s.next_ready().unwrap();
        assert!(s.next_ready().is_none());
        s.mark_done(plan.id).unwrap();

        let first = s.next_ready().unwrap();
        let second = s.next_ready().unwrap();
        assert_eq!(first.kind, TaskKind::DesignCharacter);
        assert_eq!(second.kind, TaskKind::DesignWorld);
        assert!(s.next_ready().is_none());
    }

    #[test]
    fn exhausted_write_blocks_later_units_forever() {
        let mut s = scheduler(3);
        s.expand(3, 2).unwrap();
        let write2 = run_until(&mut s, |t| t.describe() == "write_unit(2)");

        let outcome = s.mark_failed(write2.id, "timeout").unwrap();
        let FailureOutcome::Retrying { repair: first, failures: 1 } = outcome else {
            panic!("first failure must schedule a repair, got {outcome:?}");
        };

        let repair = s.next_ready().unwrap();
        assert_eq!(repair.id, first);
        assert_eq!(repair.kind, TaskKind::RepairUnit);
        assert_eq!(repair.unit_index, Some(2));
        assert!(repair.depends_on.is_empty());
        assert_eq!(repair.effective_kind(), TaskKind::WriteUnit);
        let outcome = s.mark_failed(repair.id, "timeout").unwrap();
        assert!(matches!(outcome, FailureOutcome::Retrying { failures: 2, .. }));

        let repair = s.next_ready().unwrap();
        let outcome = s.mark_failed(repair.id, "malformed output").unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted { failures: 3 });

        assert!(s.next_ready().is_none());
        assert_eq!(
            s.tasks().filter(|t| t.kind == TaskKind::RepairUnit).count(),
            2
        );
        assert_eq!(s.get(write2.id).unwrap().status, TaskStatus::Failed);
        let write3 = find(&s, TaskKind::WriteUnit, Some(3));
        assert_eq!(s.get(write3).unwrap().status, TaskStatus::Pending);

        let report = s.stall().expect("graph is stalled");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].root, "write_unit(2)");
        assert_eq!(report.failed[0].reason, "malformed output");
        assert!(report.blocked.contains(&write3));
        assert!(matches!(s.ensure_progress(), Err(SchedulerError::Deadlock(_))));

        let units = s.unit_report();
        assert_eq!(units[&1], UnitStatus::Done);
        assert_eq!(
            units[&2],
            UnitStatus::Failed {
                reason: "malformed output".into()
            }
        );
        assert_eq!(units[&3], UnitStatus::Pending);
        assert_eq!(units[&2].to_string(), "failed: malformed output");
    }

    #[test]
    fn successful_repair_unblocks_dependents() {
        let mut s = scheduler(3);
        s.expand(2, 2).unwrap();
        let validate1 = run_until(&mut s, |t| t.describe() == "validate_unit(1)");
        s.mark_failed(validate1.id, "contradiction").unwrap();

        let repair = s.next_ready().unwrap();
        assert_eq!(repair.effective_kind(), TaskKind::ValidateUnit);
        let write2 = find(&s, TaskKind::WriteUnit, Some(2));
        assert_eq!(s.get(write2).unwrap().status, TaskStatus::Pending);
        assert_eq!(s.unit_status(1), Some(UnitStatus::InProgress));

        s.mark_done(repair.id).unwrap();
        assert_eq!(s.get(write2).unwrap().status, TaskStatus::Ready);
        assert_eq!(s.unit_status(1), Some(UnitStatus::Done));
        assert!(s.get(write2).unwrap().depends_on.contains(&validate1.id));
    }

    #[test]
    fn transitions_are_checked() {
        let mut s = scheduler(3);
        s.expand(1, 2).unwrap();
        let plan = find(&s, TaskKind::Plan, None);
        assert!(matches!(
            s.mark_done(plan),
            Err(SchedulerError::IllegalTransition { from: TaskStatus::Ready, .. })
        ));
        assert!(matches!(
            s.mark_done(TaskId(99)),
            Err(SchedulerError::UnknownTask(TaskId(99)))
        ));

        let claimed = s.next_ready().unwrap();
        s.mark_done(claimed.id).unwrap();
        assert!(s.mark_failed(claimed.id, "late").is_err());
    }

    #[test]
    fn abandon_spends_no_retry() {
        let mut s = scheduler(3);
        s.expand(1, 2).unwrap();
        let plan = s.next_ready().unwrap();
        s.abandon(plan.id, "cancelled").unwrap();
        assert!(s.next_ready().is_none());
        assert_eq!(s.get(plan.id).unwrap().attempt_count, 0);
        let report = s.stall().unwrap();
        assert_eq!(report.failed[0].reason, "cancelled");
        assert!(s.abandon(plan.id, "again").is_err());
    }

    #[test]
    fn progress_counts_statuses() {
        let mut s = scheduler(3);
        s.expand(1, 2).unwrap();
        let plan = s.next_ready().unwrap();
        s.mark_done(plan.id).unwrap();
        let progress = s.progress();
        assert_eq!(progress.total, 5);
        assert_eq!(progress.done, 1);
        assert_eq!(progress.ready, 2);
        assert_eq!(progress.pending, 2);
        assert!((progress.percent_complete - 20.0).abs() < 1e-4);
        assert!(s.stall().is_none());
    }
}
