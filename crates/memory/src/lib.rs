pub mod atoms;
pub mod error;
pub mod event_log;
pub mod retrieval;
pub mod schema;
pub mod store;
pub mod summarizer;
pub mod validator;

pub use atoms::{AssembledContext, AtomId, AtomTree, ContextSegment, LeafRejected, ThoughtAtom, UnitRange};
pub use error::StoreError;
pub use event_log::{FactEvent, FactEventLog, FactLogRecord};
pub use retrieval::ScoredFact;
pub use schema::{FactId, FactKind, FactRecord, Metadata, MetadataValue, PersistedFact};
pub use store::{FactAudit, KnowledgeStore};
pub use summarizer::{HierarchicalSummarizer, RecordOutcome, SummarizerConfig, SummarizerError};
pub use validator::{
    Acceptance, Assertion, AssertionStatus, CommitOutcome, ContinuityFinding, ContinuityValidator,
    Severity, ValidationReport, ValidatorConfig, ValidatorError, continuity_notes,
};
