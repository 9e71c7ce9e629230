use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Plan,
    DesignCharacter,
    DesignWorld,
    WriteUnit,
    ReviewUnit,
    ValidateUnit,
    RepairUnit,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::DesignCharacter => "design_character",
            Self::DesignWorld => "design_world",
            Self::WriteUnit => "write_unit",
            Self::ReviewUnit => "review_unit",
            Self::ValidateUnit => "validate_unit",
            Self::RepairUnit => "repair_unit",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Back-reference from a repair task to the task it stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairLink {
    /// The failed task this repair replaces.
    pub failed: TaskId,
    /// Kind of the task at the root of the repair chain, i.e. the work the
    /// repair has to redo.
    pub target: TaskKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub unit_index: Option<u32>,
    pub depends_on: BTreeSet<TaskId>,
    pub status: TaskStatus,
    /// Failures so far in this task's repair chain.
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        kind: TaskKind,
        unit_index: Option<u32>,
        depends_on: impl IntoIterator<Item = TaskId>,
    ) -> Self {
        Self {
            id,
            kind,
            unit_index,
            depends_on: depends_on.into_iter().collect(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            repair: None,
            last_error: None,
        }
    }

    /// The work this task performs: its own kind, or for a repair task the
    /// kind it redoes.
    pub fn effective_kind(&self) -> TaskKind {
        self.repair.map(|link| link.target).unwrap_or(self.kind)
    }

    pub fn is_repair(&self) -> bool {
        self.repair.is_some()
    }

    /// Short human label, e.g. `write_unit(3)` or `repair_unit(3)->validate_unit`.
    pub fn describe(&self) -> String {
        let mut label = match self.unit_index {
            Some(unit) => format!("{}({unit})", self.kind),
            None => self.kind.to_string(),
        };
        if let Some(link) = self.repair {
            label.push_str(&format!("->{}", link.target));
        }
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&TaskKind::DesignCharacter).unwrap();
        assert_eq!(json, "\"design_character\"");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }

    #[test]
    fn repair_task_reports_its_target() {
        let mut task = Task::new(TaskId(7), TaskKind::RepairUnit, Some(3), []);
        assert_eq!(task.effective_kind(), TaskKind::RepairUnit);
        task.repair = Some(RepairLink {
            failed: TaskId(5),
            target: TaskKind::ValidateUnit,
        });
        assert_eq!(task.effective_kind(), TaskKind::ValidateUnit);
        assert_eq!(task.describe(), "repair_unit(3)->validate_unit");
    }
}
