pub mod context;
pub mod coordinator;
mod events;
pub mod ledger;
pub mod message;
pub mod pipeline;
pub mod roles;
pub mod scheduler;
pub mod task;

pub use context::{RoleContext, Services};
pub use coordinator::{AgentCoordinator, TaskResult};
pub use events::PipelineEvent;
pub use ledger::{DraftState, UnitDraft, UnitLedger};
pub use message::TaskMessage;
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, RunReport};
pub use roles::{Output, Role, RoleError, RoleKind, RoleOutput, RoleRegistry};
pub use scheduler::{
    DeadlockReport, FailedTask, FailureOutcome, Progress, SchedulerError, TaskScheduler, UnitStatus,
};
pub use task::{RepairLink, Task, TaskId, TaskKind, TaskStatus};
