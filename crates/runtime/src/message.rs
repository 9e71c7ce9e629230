use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::coordinator::TaskResult;
use crate::roles::RoleError;
use crate::task::{Task, TaskId, TaskKind};

/// Interchange record between the coordinator and a role:
/// `{task_id, kind, unit_index, payload, result, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub unit_index: Option<u32>,
    pub payload: Map<String, Value>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl TaskMessage {
    pub fn request(task: &Task) -> Self {
        let mut payload = Map::new();
        payload.insert("attempt_count".into(), json!(task.attempt_count));
        payload.insert("depends_on".into(), json!(task.depends_on));
        if let Some(link) = task.repair {
            payload.insert("repair_of".into(), json!(link.failed));
            payload.insert("target".into(), json!(link.target));
        }
        Self {
            task_id: task.id,
            kind: task.kind,
            unit_index: task.unit_index,
            payload,
            result: None,
            error: None,
        }
    }

    pub fn with_result(mut self, result: &TaskResult) -> Self {
        self.result = Some(json!({
            "output": result.output,
            "findings": result.findings,
        }));
        self
    }

    pub fn with_error(mut self, error: &RoleError) -> Self {
        let mut body = json!({
            "code": error.code(),
            "message": error.to_string(),
            "transient": error.is_transient(),
        });
        if let RoleError::Contradiction(findings) = error {
            body["findings"] = json!(findings);
        }
        self.error = Some(body);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Output;
    use crate::task::RepairLink;
    use saga_llm::GenerationError;

    #[test]
    fn request_carries_repair_link() {
        let mut task = Task::new(TaskId(8), TaskKind::RepairUnit, Some(2), []);
        task.attempt_count = 1;
        task.repair = Some(RepairLink {
            failed: TaskId(5),
            target: TaskKind::WriteUnit,
        });
        let message = TaskMessage::request(&task);
        assert_eq!(message.payload["repair_of"], json!(5));
        assert_eq!(message.payload["target"], json!("write_unit"));
        assert_eq!(message.payload["attempt_count"], json!(1));
        assert!(message.result.is_none() && message.error.is_none());
    }

    #[test]
    fn error_body_is_structured() {
        let task = Task::new(TaskId(4), TaskKind::WriteUnit, Some(1), [TaskId(2), TaskId(3)]);
        let err = RoleError::Generation(GenerationError::RateLimited {
            provider: "openrouter".into(),
            retry_after: None,
        });
        let message = TaskMessage::request(&task).with_error(&err);
        let body = message.error.as_ref().unwrap();
        assert_eq!(body["code"], "rate_limited");
        assert_eq!(body["transient"], true);
        assert!(message.is_error());
        assert_eq!(message.payload["depends_on"], json!([2, 3]));
    }

    #[test]
    fn result_round_trips_through_json() {
        let task = Task::new(TaskId(4), TaskKind::WriteUnit, Some(1), []);
        let result = TaskResult {
            task_id: task.id,
            unit_index: Some(1),
            output: Output::Text("prose".into()),
            findings: Vec::new(),
        };
        let message = TaskMessage::request(&task).with_result(&result);
        assert_eq!(message.result.as_ref().unwrap()["output"]["value"], "prose");

        let json = serde_json::to_string(&message).unwrap();
        let back: TaskMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}
