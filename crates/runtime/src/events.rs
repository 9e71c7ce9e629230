use saga_memory::ContinuityFinding;
use serde::Serialize;

use crate::message::TaskMessage;
use crate::scheduler::DeadlockReport;
use crate::task::{TaskId, TaskKind};

/// Progress notifications emitted by the pipeline loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    TaskStarted {
        task_id: TaskId,
        kind: TaskKind,
        unit_index: Option<u32>,
    },
    /// Completed or failed; `error` is set on failure.
    TaskFinished(TaskMessage),
    /// Every finding is reported, including ones a later repair resolves.
    Finding(ContinuityFinding),
    RepairScheduled {
        failed: TaskId,
        repair: TaskId,
        failures: u32,
    },
    RetriesExhausted {
        task_id: TaskId,
        failures: u32,
    },
    Deadlock(DeadlockReport),
    Cancelled,
}
