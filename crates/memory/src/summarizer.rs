//! Hierarchical summarization over the unit sequence.
//!
//! `record_unit` appends a level-0 atom and, whenever a level fills up to
//! the fan-out, asks the [`Generator`] for a rollup summary.  The whole
//! cascade is transactional: if any summary call fails the tree is restored
//! to its state before the call, so the unit can simply be recorded again.

use std::sync::Arc;

use saga_config::MemoryConfig;
use saga_llm::{GenerationError, Generator};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::atoms::{AssembledContext, AtomId, AtomTree, LeafRejected, ThoughtAtom, UnitRange};
use crate::error::StoreError;
use crate::schema::{FactId, FactKind, Metadata};
use crate::store::KnowledgeStore;

pub const SUMMARY_SYSTEM_PROMPT: &str = "You condense serialized fiction into faithful summaries. \
Keep every named character, their state changes, locations, dates and unresolved threads. \
Never invent events.";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummarizerConfig {
    /// Atoms grouped under one parent.
    pub fanout: usize,
    /// Raw units kept verbatim at the head of every context.
    pub window: usize,
    pub temperature: f32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            fanout: 4,
            window: 2,
            temperature: 0.3,
        }
    }
}

impl From<&MemoryConfig> for SummarizerConfig {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            fanout: config.summary_fanout.max(2),
            window: config.raw_window,
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("unit {got} recorded out of order (expected unit {expected})")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("unit {unit} is the last representable unit index")]
    UnitIndexExhausted { unit: u32 },

    #[error("summary generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("level {level} rollup group is not a contiguous run of atoms")]
    BrokenGroup { level: u32 },
}

/// What one `record_unit` call added to the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub leaf: AtomId,
    /// Summary atoms created by the cascade, lowest level first, with the
    /// knowledge-store fact mirroring each.
    pub summaries: Vec<(AtomId, FactId)>,
}

pub struct HierarchicalSummarizer {
    config: SummarizerConfig,
    generator: Arc<dyn Generator>,
    store: Arc<KnowledgeStore>,
    tree: Mutex<AtomTree>,
}

impl HierarchicalSummarizer {
    pub fn new(
        config: SummarizerConfig,
        generator: Arc<dyn Generator>,
        store: Arc<KnowledgeStore>,
    ) -> Self {
        Self {
            config,
            generator,
            store,
            tree: Mutex::new(AtomTree::new()),
        }
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    /// Append `unit_index` and run any rollups it completes.
    pub async fn record_unit(
        &self,
        unit_index: u32,
        full_text: &str,
    ) -> Result<RecordOutcome, SummarizerError> {
        let mut tree = self.tree.lock().await;
        let checkpoint = tree.checkpoint();
        let leaf = tree
            .push_leaf(unit_index, full_text)
            .map_err(|rejected| match rejected {
                LeafRejected::OutOfOrder { expected } => SummarizerError::OutOfOrder {
                    expected,
                    got: unit_index,
                },
                LeafRejected::IndexExhausted { unit } => SummarizerError::UnitIndexExhausted { unit },
            })?;

        match self.roll_up(&mut tree).await {
            Ok(summaries) => {
                debug!(
                    unit_index,
                    leaf = %leaf,
                    rollups = summaries.len(),
                    atoms = tree.len(),
                    "unit recorded"
                );
                Ok(RecordOutcome { leaf, summaries })
            }
            Err(err) => {
                tree.rollback(checkpoint);
                Err(err)
            }
        }
    }

    async fn roll_up(&self, tree: &mut AtomTree) -> Result<Vec<(AtomId, FactId)>, SummarizerError> {
        let mut created = Vec::new();
        while let Some((level, group)) = tree.take_full_group(self.config.fanout) {
            let children: Vec<ThoughtAtom> = group
                .iter()
                .filter_map(|id| tree.get(*id).cloned())
                .collect();
            let ranges: Vec<UnitRange> = children.iter().map(|atom| atom.unit_range).collect();
            let range = UnitRange::tile(&ranges)
                .filter(|_| children.len() == group.len())
                .ok_or(SummarizerError::BrokenGroup { level })?;

            let summary = self.summarize_group(&children).await?;
            let atom_id = tree
                .push_parent(level, group, summary.clone())
                .ok_or(SummarizerError::BrokenGroup { level })?;

            let mut metadata = Metadata::new();
            metadata.insert("source".into(), "summary".into());
            metadata.insert("atom_id".into(), (atom_id.0 as i64).into());
            metadata.insert("level".into(), (level + 1).into());
            metadata.insert("range_start".into(), range.start.into());
            metadata.insert("range_end".into(), range.end.into());
            let fact_id = self
                .store
                .put(summary, FactKind::Other, Some(range.end), metadata)
                .await?;

            info!(atom = %atom_id, level = level + 1, %range, "summary rollup created");
            created.push((atom_id, fact_id));
        }
        Ok(created)
    }

    /// Summarize one contiguous group of sibling atoms.
    pub async fn summarize_group(&self, children: &[ThoughtAtom]) -> Result<String, GenerationError> {
        let ranges: Vec<UnitRange> = children.iter().map(|atom| atom.unit_range).collect();
        let covered = UnitRange::tile(&ranges).ok_or_else(|| {
            GenerationError::InvalidResponse("summary group is not contiguous".to_string())
        })?;

        let mut prompt = format!(
            "Summarize {covered} into a coherent and comprehensive summary. \
             Preserve facts that later chapters may depend on.\n"
        );
        for child in children {
            prompt.push_str(&format!("\n--- {} ---\n{}\n", child.unit_range, child.content.trim()));
        }

        self.generator
            .generate(&prompt, SUMMARY_SYSTEM_PROMPT, self.config.temperature)
            .await
    }

    /// Context for writing `unit_index` within `budget` characters.
    pub async fn get_context(&self, unit_index: u32, budget: usize) -> AssembledContext {
        self.tree
            .lock()
            .await
            .assemble(unit_index, self.config.window, budget)
    }

    /// Clone of the current tree, e.g. for export or inspection.
    pub async fn snapshot(&self) -> AtomTree {
        self.tree.lock().await.clone()
    }

    pub async fn atom(&self, id: AtomId) -> Option<ThoughtAtom> {
        self.tree.lock().await.get(id).cloned()
    }

    pub async fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.tree.lock().await)
    }

    pub async fn expected_unit(&self) -> Option<u32> {
        self.tree.lock().await.expected_unit()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use saga_llm::{HashingEmbedder, ScriptedGenerator};

    fn summarizer(generator: ScriptedGenerator, fanout: usize) -> (HierarchicalSummarizer, Arc<KnowledgeStore>) {
        let store = Arc::new(KnowledgeStore::new(Arc::new(HashingEmbedder::new(32)), None));
        let config = SummarizerConfig {
            fanout,
            window: 1,
            temperature: 0.0,
        };
        (
            HierarchicalSummarizer::new(config, Arc::new(generator), store.clone()),
            store,
        )
    }

    #[tokio::test]
    async fn rollup_creates_summary_atom_and_fact() {
        let generator = ScriptedGenerator::new().on("Summarize units 1-2", "Ada and Bo meet.");
        let (summarizer, store) = summarizer(generator, 2);

        let first = summarizer.record_unit(1, "Ada arrives.").await.unwrap();
        assert!(first.summaries.is_empty());
        let second = summarizer.record_unit(2, "Bo greets Ada.").await.unwrap();
        assert_eq!(second.summaries.len(), 1);

        let (atom_id, fact_id) = second.summaries[0];
        let atom = summarizer.atom(atom_id).await.unwrap();
        assert_eq!(atom.level, 1);
        assert_eq!(atom.unit_range, UnitRange { start: 1, end: 2 });
        assert_eq!(atom.content, "Ada and Bo meet.");

        let fact = store.get(fact_id).await.unwrap();
        assert_eq!(fact.kind, FactKind::Other);
        assert_eq!(fact.metadata["source"].as_str(), Some("summary"));
        assert_eq!(fact.metadata["range_end"].as_i64(), Some(2));
    }

    #[tokio::test]
    async fn failed_rollup_leaves_tree_untouched() {
        let generator = ScriptedGenerator::new().on_error(
            "Summarize",
            GenerationError::InvalidResponse("garbled".into()),
        );
        let (summarizer, store) = summarizer(generator, 2);
        summarizer.record_unit(1, "one").await.unwrap();
        let before = summarizer.snapshot().await;

        let err = summarizer.record_unit(2, "two").await.unwrap_err();
        assert!(matches!(err, SummarizerError::Generation(_)));
        let after = summarizer.snapshot().await;
        assert_eq!(after.atoms(), before.atoms());
        assert_eq!(summarizer.expected_unit().await, Some(2));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn out_of_order_record_is_an_error() {
        let (summarizer, _) = summarizer(ScriptedGenerator::new().with_fallback("s"), 3);
        summarizer.record_unit(1, "one").await.unwrap();
        let err = summarizer.record_unit(3, "three").await.unwrap_err();
        assert!(matches!(err, SummarizerError::OutOfOrder { expected: 2, got: 3 }));
    }

    #[tokio::test]
    async fn exhausted_unit_index_is_an_error() {
        let (summarizer, store) = summarizer(ScriptedGenerator::new().with_fallback("s"), 2);
        let err = summarizer.record_unit(u32::MAX, "last").await.unwrap_err();
        assert!(matches!(err, SummarizerError::UnitIndexExhausted { unit: u32::MAX }));
        assert!(summarizer.snapshot().await.is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn cascade_reaches_second_level() {
        let (summarizer, store) = summarizer(ScriptedGenerator::new().with_fallback("summary"), 2);
        let mut rollups = 0;
        for unit in 1..=4 {
            rollups += summarizer
                .record_unit(unit, &format!("unit {unit}"))
                .await
                .unwrap()
                .summaries
                .len();
        }
        // 1-2, 3-4, then 1-4.
        assert_eq!(rollups, 3);
        assert_eq!(store.len().await, 3);
        assert_eq!(summarizer.snapshot().await.top_level(), Some(2));
    }

    #[tokio::test]
    async fn context_for_first_unit_is_empty_but_valid() {
        let (summarizer, _) = summarizer(ScriptedGenerator::new(), 4);
        let context = summarizer.get_context(1, 500).await;
        assert!(context.is_empty());
        assert_eq!(context.unit_index, 1);
    }

    #[tokio::test]
    async fn summary_prompt_lists_children_in_order() {
        let generator = Arc::new(ScriptedGenerator::new().with_fallback("s"));
        let store = Arc::new(KnowledgeStore::new(Arc::new(HashingEmbedder::new(16)), None));
        let summarizer = HierarchicalSummarizer::new(
            SummarizerConfig {
                fanout: 3,
                ..SummarizerConfig::default()
            },
            generator.clone(),
            store,
        );
        for (unit, text) in [(1, "alpha"), (2, "beta"), (3, "gamma")] {
            summarizer.record_unit(unit, text).await.unwrap();
        }
        let prompts = generator.prompts();
        assert_eq!(prompts.len(), 1);
        let prompt = &prompts[0];
        assert!(prompt.starts_with("Summarize units 1-3"));
        let (a, b, c) = (
            prompt.find("alpha").unwrap(),
            prompt.find("beta").unwrap(),
            prompt.find("gamma").unwrap(),
        );
        assert!(a < b && b < c);
    }
}
