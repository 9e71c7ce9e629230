use saga_llm::GenerationError;

use crate::schema::FactId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("embedding dimension mismatch: store holds {expected}-d vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("duplicate fact id {0}")]
    DuplicateId(FactId),

    #[error("unknown fact {0}")]
    UnknownFact(FactId),

    #[error("fact {id} is already superseded by {by}")]
    AlreadySuperseded { id: FactId, by: FactId },

    #[error("fact {0} cannot supersede itself")]
    SelfSupersede(FactId),

    #[error("embedding failed: {0}")]
    Embedding(#[from] GenerationError),

    #[error("fact log I/O failed: {0}")]
    Log(String),
}

impl StoreError {
    /// Integrity errors mean the store was misconfigured or misused.  They
    /// are fatal and never retried.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. }
                | Self::DuplicateId(_)
                | Self::UnknownFact(_)
                | Self::AlreadySuperseded { .. }
                | Self::SelfSupersede(_)
        )
    }
}
