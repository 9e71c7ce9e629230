use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use saga_llm::Embedder;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::event_log::{FactEvent, FactEventLog, FactLogRecord};
use crate::retrieval::{ScoredFact, rank};
use crate::schema::{FactId, FactKind, FactRecord, Metadata, PersistedFact, truncate_str};

/// A fact plus its supersession status, for audit queries.
#[derive(Debug, Clone, PartialEq)]
pub struct FactAudit {
    pub record: FactRecord,
    pub superseded_by: Option<FactId>,
}

#[derive(Debug, Default)]
struct StoreState {
    records: Vec<FactRecord>,
    index: HashMap<FactId, usize>,
    superseded_by: HashMap<FactId, FactId>,
    dimension: Option<usize>,
}

impl StoreState {
    fn check_dimension(&self, actual: usize) -> Result<(), StoreError> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(StoreError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    fn check_insert(&self, record: &FactRecord) -> Result<(), StoreError> {
        self.check_dimension(record.embedding.len())?;
        if self.index.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        Ok(())
    }

    fn insert(&mut self, record: FactRecord) -> Result<(), StoreError> {
        self.check_insert(&record)?;
        self.dimension.get_or_insert(record.embedding.len());
        self.index.insert(record.id, self.records.len());
        self.records.push(record);
        Ok(())
    }

    fn check_supersede(&self, old: FactId, new: FactId) -> Result<(), StoreError> {
        if old == new {
            return Err(StoreError::SelfSupersede(old));
        }
        if !self.index.contains_key(&new) {
            return Err(StoreError::UnknownFact(new));
        }
        self.check_replaceable(old)
    }

    /// `old` exists and has not been superseded yet.
    fn check_replaceable(&self, old: FactId) -> Result<(), StoreError> {
        if !self.index.contains_key(&old) {
            return Err(StoreError::UnknownFact(old));
        }
        if let Some(by) = self.superseded_by.get(&old) {
            return Err(StoreError::AlreadySuperseded { id: old, by: *by });
        }
        Ok(())
    }

    fn is_active(&self, id: &FactId) -> bool {
        !self.superseded_by.contains_key(id)
    }

    fn eligible<'a>(
        &'a self,
        kind: Option<FactKind>,
    ) -> impl Iterator<Item = (usize, &'a FactRecord)> + 'a {
        self.records
            .iter()
            .enumerate()
            .filter(move |(_, record)| self.is_active(&record.id))
            .filter(move |(_, record)| kind.is_none_or(|kind| record.kind == kind))
    }
}

/// Append-only fact store with cosine similarity search.
///
/// Records are never edited or removed.  `supersede` hides a record from
/// `search` while keeping it available to `get`/`audit`.  When opened over
/// a [`FactEventLog`] every mutation is appended to disk before it becomes
/// visible in memory.
pub struct KnowledgeStore {
    embedder: Arc<dyn Embedder>,
    state: RwLock<StoreState>,
    log: Option<FactEventLog>,
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore")
            .field("log", &self.log.as_ref().map(|log| log.path().to_path_buf()))
            .finish_non_exhaustive()
    }
}

impl KnowledgeStore {
    /// In-memory store.  `dimension` pins the embedding width up front;
    /// `None` lets the first record decide.
    pub fn new(embedder: Arc<dyn Embedder>, dimension: Option<usize>) -> Self {
        Self {
            embedder,
            state: RwLock::new(StoreState {
                dimension,
                ..StoreState::default()
            }),
            log: None,
        }
    }

    /// Open a store backed by a JSONL event log, replaying existing events.
    pub async fn open(
        path: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
        dimension: Option<usize>,
    ) -> Result<Self, StoreError> {
        let log = FactEventLog::new(path);
        info!(path = %log.path().display(), "loading knowledge store from fact log");
        let events = log
            .load()
            .map_err(|err| StoreError::Log(format!("{err:#}")))?;

        let mut state = StoreState {
            dimension,
            ..StoreState::default()
        };
        let mut supersessions = 0usize;
        for entry in events {
            match entry.event {
                FactEvent::Put { record } => state.insert(record)?,
                FactEvent::Supersede { old, new } => {
                    state.check_supersede(old, new)?;
                    state.superseded_by.insert(old, new);
                    supersessions += 1;
                }
            }
        }

        info!(
            facts = state.records.len(),
            supersessions,
            dimension = ?state.dimension,
            "knowledge store ready"
        );

        Ok(Self {
            embedder,
            state: RwLock::new(state),
            log: Some(log),
        })
    }

    /// Embed and store a new fact.  Duplicate content is legal.
    pub async fn put(
        &self,
        content: impl Into<String>,
        kind: FactKind,
        unit_index: Option<u32>,
        metadata: Metadata,
    ) -> Result<FactId, StoreError> {
        let content = content.into();
        let embedding = self.embedder.embed(&content).await?;
        let record = FactRecord::new(content, kind, unit_index, metadata, embedding);
        let id = record.id;
        self.import(record).await?;
        Ok(id)
    }

    /// Embed a fact without storing it, checking the embedding width against
    /// the store.  Lets callers do every fallible model call before they
    /// commit anything.
    pub async fn prepare(
        &self,
        content: impl Into<String>,
        kind: FactKind,
        unit_index: Option<u32>,
        metadata: Metadata,
    ) -> Result<FactRecord, StoreError> {
        let content = content.into();
        let embedding = self.embedder.embed(&content).await?;
        self.state.read().await.check_dimension(embedding.len())?;
        Ok(FactRecord::new(content, kind, unit_index, metadata, embedding))
    }

    /// Store an already-embedded record as-is.  Used for replication and by
    /// `put`; rejects duplicate ids and foreign embedding widths.
    pub async fn import(&self, record: FactRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_insert(&record)?;
        self.append(FactEvent::Put {
            record: record.clone(),
        })
        .await?;

        debug!(
            fact_id = %record.id,
            kind = %record.kind,
            unit_index = ?record.unit_index,
            preview = truncate_str(&record.content, 60),
            "fact stored"
        );
        state.insert(record)
    }

    /// Most similar non-superseded facts first, ties broken by recency.
    pub async fn search(
        &self,
        query: &str,
        kind: Option<FactKind>,
        top_k: usize,
    ) -> Result<Vec<FactRecord>, StoreError> {
        Ok(self
            .search_scored(query, kind, top_k)
            .await?
            .into_iter()
            .map(|hit| hit.record)
            .collect())
    }

    pub async fn search_scored(
        &self,
        query: &str,
        kind: Option<FactKind>,
        top_k: usize,
    ) -> Result<Vec<ScoredFact>, StoreError> {
        let has_candidates = self.state.read().await.eligible(kind).next().is_some();
        if top_k == 0 || !has_candidates {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(query).await?;
        let state = self.state.read().await;
        state.check_dimension(query_embedding.len())?;
        let hits = rank(state.eligible(kind), &query_embedding, top_k);
        debug!(kind = ?kind, top_k, hits = hits.len(), "fact search");
        Ok(hits)
    }

    /// Mark `old` as replaced by `new`.  Both must exist; a fact can be
    /// superseded only once.
    pub async fn supersede(&self, old: FactId, new: FactId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_supersede(old, new)?;
        self.append(FactEvent::Supersede { old, new }).await?;
        state.superseded_by.insert(old, new);
        info!(old = %old, new = %new, "fact superseded");
        Ok(())
    }

    /// Check, without changing anything, that each of `targets` exists and
    /// is still active, so a freshly stored record may supersede it.
    pub async fn check_replaceable(&self, targets: &[FactId]) -> Result<(), StoreError> {
        let state = self.state.read().await;
        targets
            .iter()
            .try_for_each(|old| state.check_replaceable(*old))
    }

    pub async fn get(&self, id: FactId) -> Option<FactRecord> {
        let state = self.state.read().await;
        state.index.get(&id).map(|&idx| state.records[idx].clone())
    }

    pub async fn audit(&self, id: FactId) -> Option<FactAudit> {
        let state = self.state.read().await;
        state.index.get(&id).map(|&idx| FactAudit {
            record: state.records[idx].clone(),
            superseded_by: state.superseded_by.get(&id).copied(),
        })
    }

    /// Every fact tagged with `unit_index`, superseded ones included, in
    /// insertion order.
    pub async fn records_for_unit(&self, unit_index: u32) -> Vec<FactRecord> {
        self.state
            .read()
            .await
            .records
            .iter()
            .filter(|record| record.unit_index == Some(unit_index))
            .cloned()
            .collect()
    }

    /// The full store as flat rows, in insertion order.
    pub async fn rows(&self) -> Vec<PersistedFact> {
        let state = self.state.read().await;
        state
            .records
            .iter()
            .map(|record| {
                PersistedFact::from_record(record, state.superseded_by.get(&record.id).copied())
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }

    pub async fn active_len(&self) -> usize {
        self.state.read().await.eligible(None).count()
    }

    pub async fn dimension(&self) -> Option<usize> {
        self.state.read().await.dimension
    }

    async fn append(&self, event: FactEvent) -> Result<(), StoreError> {
        match &self.log {
            Some(log) => log
                .append(&FactLogRecord::new(event))
                .await
                .map_err(|err| StoreError::Log(format!("{err:#}"))),
            None => Ok(()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
