use std::collections::HashMap;
use std::sync::Arc;

use saga_memory::{ContinuityFinding, FactRecord, continuity_notes};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::context::{RoleContext, Services};
use crate::roles::{Output, RoleError, RoleKind, RoleRegistry};
use crate::task::{Task, TaskId, TaskKind};

/// Normalized result of one dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub unit_index: Option<u32>,
    pub output: Output,
    pub findings: Vec<ContinuityFinding>,
}

/// Routes tasks to roles and carries repair notes between a rejected
/// validation and the repair that answers it.
pub struct AgentCoordinator {
    services: Arc<Services>,
    roles: RoleRegistry,
    notes: Mutex<HashMap<u32, Vec<ContinuityFinding>>>,
}

impl AgentCoordinator {
    pub fn new(services: Arc<Services>, roles: RoleRegistry) -> Self {
        Self {
            services,
            roles,
            notes: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Roles that carry out `task`, in order.  Repairing a rejected
    /// validation means rewriting the draft and validating again.
    pub fn route(task: &Task, has_notes: bool) -> Vec<RoleKind> {
        match task.effective_kind() {
            TaskKind::ValidateUnit if task.is_repair() && has_notes => {
                vec![RoleKind::Writer, RoleKind::ContinuityChecker]
            }
            TaskKind::RepairUnit => vec![RoleKind::Writer, RoleKind::ContinuityChecker],
            kind => RoleKind::for_task_kind(kind).into_iter().collect(),
        }
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task = %task.describe()))]
    pub async fn dispatch(&self, task: &Task) -> Result<TaskResult, RoleError> {
        let notes = match task.unit_index {
            Some(unit) => self
                .notes
                .lock()
                .await
                .get(&unit)
                .map(|findings| continuity_notes(findings)),
            None => None,
        };
        let route = Self::route(task, notes.is_some());
        let context = self.context_for(task, notes).await?;

        let mut output = None;
        let mut findings = Vec::new();
        for kind in &route {
            let role = self.roles.get(*kind).ok_or(RoleError::Unregistered(*kind))?;
            debug!(role = %kind, "role handling task");
            match role.handle(task, &context).await {
                Ok(result) => {
                    findings.extend(result.findings);
                    output = Some(result.output);
                }
                Err(RoleError::Contradiction(rejected)) => {
                    if let Some(unit) = task.unit_index {
                        self.notes.lock().await.insert(unit, rejected.clone());
                    }
                    return Err(RoleError::Contradiction(rejected));
                }
                Err(err) => return Err(err),
            }
        }

        if route.contains(&RoleKind::ContinuityChecker) {
            if let Some(unit) = task.unit_index {
                self.notes.lock().await.remove(&unit);
            }
        }

        let output = output.ok_or(RoleError::Unregistered(RoleKind::Writer))?;
        Ok(TaskResult {
            task_id: task.id,
            unit_index: task.unit_index,
            output,
            findings,
        })
    }

    /// Repair brief currently held for `unit_index`.
    pub async fn notes_for(&self, unit_index: u32) -> Option<String> {
        self.notes
            .lock()
            .await
            .get(&unit_index)
            .map(|findings| continuity_notes(findings))
    }

    async fn context_for(&self, task: &Task, notes: Option<String>) -> Result<RoleContext, RoleError> {
        let services = &self.services;
        let mut context = RoleContext::bare(services.clone());
        context.notes = notes;

        let query = match task.unit_index {
            Some(unit) => {
                context.story = Some(
                    services
                        .summarizer
                        .get_context(unit, services.context_budget)
                        .await,
                );
                match services.ledger.synopsis(unit).await {
                    Some(synopsis) if !synopsis.is_empty() => synopsis,
                    _ => services
                        .ledger
                        .latest_draft(unit)
                        .await
                        .map(|draft| draft.text)
                        .unwrap_or_else(|| format!("unit {unit}")),
                }
            }
            None => services.project.premise.clone(),
        };

        if !query.trim().is_empty() {
            // Summaries already reach the writer through the story context.
            context.facts = services
                .store
                .search(&query, None, services.facts_per_prompt * 2)
                .await?
                .into_iter()
                .filter(|fact| !is_summary(fact))
                .take(services.facts_per_prompt)
                .collect();
        }
        Ok(context)
    }
}

fn is_summary(fact: &FactRecord) -> bool {
    fact.metadata
        .get("source")
        .and_then(|value| value.as_str())
        == Some("summary")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::{CHARACTER_PROMPT_HEAD, PLANNER_PROMPT_HEAD, REWRITE_PROMPT_HEAD, WRITE_PROMPT_HEAD};
    use crate::task::RepairLink;
    use saga_config::AppConfig;
    use saga_llm::{Embedder, GenerationError, HashingEmbedder, ScriptedGenerator};
    use saga_memory::validator::{EXTRACT_PROMPT_HEAD, JUDGE_PROMPT_HEAD};
    use saga_memory::{FactKind, KnowledgeStore, Metadata, Severity, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(generator: ScriptedGenerator) -> (AgentCoordinator, Arc<ScriptedGenerator>) {
        let mut config = AppConfig::default();
        config.project.title = "The Heron".into();
        config.project.premise = "A river barge crew smuggles a comet shard".into();
        config.project.target_units = 3;
        let generator = Arc::new(generator.with_fallback("summary"));
        let store = Arc::new(KnowledgeStore::new(Arc::new(HashingEmbedder::new(64)), None));
        let services = Arc::new(Services::new(&config, generator.clone(), store));
        (AgentCoordinator::new(services, RoleRegistry::standard()), generator)
    }

    fn task(id: u64, kind: TaskKind, unit: Option<u32>) -> Task {
        Task::new(TaskId(id), kind, unit, [])
    }

    #[tokio::test]
    async fn plan_stores_synopses_and_facts() {
        let (coordinator, _) = coordinator(ScriptedGenerator::new().on(
            PLANNER_PROMPT_HEAD,
            r#"{"outline":"A heist on the river.","units":[{"unit":1,"synopsis":"The crew boards."},{"unit":9,"synopsis":"out of range"}],"facts":[{"kind":"timeline","content":"The comet passes in spring"}]}"#,
        ));
        let result = coordinator
            .dispatch(&task(1, TaskKind::Plan, None))
            .await
            .unwrap();
        assert!(matches!(result.output, Output::Structured(_)));

        let services = coordinator.services();
        assert_eq!(services.ledger.outline().await.as_deref(), Some("A heist on the river."));
        assert_eq!(services.ledger.synopsis(1).await.as_deref(), Some("The crew boards."));
        assert!(services.ledger.synopsis(9).await.is_none());
        let facts = services.store.search("comet", None, 5).await.unwrap();
        assert_eq!(facts[0].kind, FactKind::Timeline);
    }

    #[tokio::test]
    async fn design_defaults_fact_kind_to_role() {
        let (coordinator, _) = coordinator(
            ScriptedGenerator::new()
                .on(CHARACTER_PROMPT_HEAD, r#"{"summary":"crew","facts":[{"content":"Ilse captains the Heron"}]}"#),
        );
        coordinator
            .dispatch(&task(2, TaskKind::DesignCharacter, None))
            .await
            .unwrap();
        let facts = coordinator
            .services()
            .store
            .search("Ilse", Some(FactKind::Character), 5)
            .await
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].metadata["source"].as_str(), Some("character_designer"));
    }

    /// Hashing embedder whose `fail_on`-th call (1-based) errors.
    struct FlakyEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait::async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on {
                return Err(GenerationError::Unavailable {
                    provider: "embedder".into(),
                    reason: "connection reset".into(),
                });
            }
            self.inner.embed(text).await
        }
    }

    #[tokio::test]
    async fn failed_design_stores_nothing_and_retry_stores_each_fact_once() {
        let embedder = Arc::new(FlakyEmbedder {
            inner: HashingEmbedder::new(64),
            calls: AtomicUsize::new(0),
            fail_on: 2,
        });
        let store = Arc::new(KnowledgeStore::new(embedder, None));
        let generator = Arc::new(ScriptedGenerator::new().on(
            CHARACTER_PROMPT_HEAD,
            r#"{"summary":"crew","facts":[{"content":"Ilse captains the Heron"},{"content":"Bo is the Heron's pilot"}]}"#,
        ));
        let services = Arc::new(Services::new(&AppConfig::default(), generator, store.clone()));
        let coordinator = AgentCoordinator::new(services, RoleRegistry::standard());
        let design = task(2, TaskKind::DesignCharacter, None);

        let err = coordinator.dispatch(&design).await.unwrap_err();
        assert!(matches!(err, RoleError::Store(StoreError::Embedding(_))));
        assert!(err.is_transient());
        assert!(store.is_empty().await);

        coordinator.dispatch(&design).await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn malformed_plan_is_reported_not_swallowed() {
        let (coordinator, _) = coordinator(ScriptedGenerator::new().on(PLANNER_PROMPT_HEAD, "no json here"));
        let err = coordinator
            .dispatch(&task(1, TaskKind::Plan, None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_response");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn write_then_validate_commits_unit() {
        let (coordinator, _) = coordinator(
            ScriptedGenerator::new()
                .on(WRITE_PROMPT_HEAD, "The crew boarded at dusk.")
                .on(EXTRACT_PROMPT_HEAD, "[]"),
        );
        let written = coordinator
            .dispatch(&task(4, TaskKind::WriteUnit, Some(1)))
            .await
            .unwrap();
        assert_eq!(written.output, Output::Text("The crew boarded at dusk.".into()));
        assert!(coordinator.services().ledger.canonical().await.is_empty());

        let validated = coordinator
            .dispatch(&task(5, TaskKind::ValidateUnit, Some(1)))
            .await
            .unwrap();
        assert_eq!(validated.unit_index, Some(1));
        assert_eq!(
            coordinator.services().ledger.canonical().await,
            vec![(1, "The crew boarded at dusk.".to_string())]
        );
        assert_eq!(coordinator.services().summarizer.expected_unit().await, Some(2));
    }

    #[tokio::test]
    async fn validate_without_draft_is_missing_artifact() {
        let (coordinator, _) = coordinator(ScriptedGenerator::new());
        let err = coordinator
            .dispatch(&task(5, TaskKind::ValidateUnit, Some(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, RoleError::MissingArtifact { unit_index: 2, .. }));
    }

    #[tokio::test]
    async fn rejected_validation_feeds_notes_into_rewrite() {
        let (coordinator, generator) = coordinator(
            ScriptedGenerator::new()
                .on(WRITE_PROMPT_HEAD, "Ilse drowned at dawn.")
                .on(REWRITE_PROMPT_HEAD, "Ilse swam ashore at dawn.")
                .on(EXTRACT_PROMPT_HEAD, r#"[{"kind":"character","content":"Ilse drowned"}]"#)
                .on(EXTRACT_PROMPT_HEAD, "[]")
                .on(
                    JUDGE_PROMPT_HEAD,
                    r#"{"verdict":"contradiction","fact":1,"explanation":"Ilse is alive in unit 3"}"#,
                ),
        );
        let alive = coordinator
            .services()
            .store
            .put("Ilse is alive and captains the Heron", FactKind::Character, None, Metadata::new())
            .await
            .unwrap();

        coordinator
            .dispatch(&task(4, TaskKind::WriteUnit, Some(1)))
            .await
            .unwrap();
        let validate = task(5, TaskKind::ValidateUnit, Some(1));
        let err = coordinator.dispatch(&validate).await.unwrap_err();
        let findings = match err {
            RoleError::Contradiction(findings) => findings,
            other => panic!("expected contradiction, got {other:?}"),
        };
        assert_eq!(findings[0].severity, Severity::Contradiction);
        assert_eq!(findings[0].fact_id, alive);
        assert!(coordinator.notes_for(1).await.unwrap().contains("Ilse is alive in unit 3"));

        let mut repair = task(6, TaskKind::RepairUnit, Some(1));
        repair.repair = Some(RepairLink {
            failed: validate.id,
            target: TaskKind::ValidateUnit,
        });
        assert_eq!(
            AgentCoordinator::route(&repair, true),
            vec![RoleKind::Writer, RoleKind::ContinuityChecker]
        );
        let repaired = coordinator.dispatch(&repair).await.unwrap();
        assert_eq!(repaired.output, Output::Text("Ilse swam ashore at dawn.".into()));
        assert!(coordinator.notes_for(1).await.is_none());

        let rewrite_prompt = generator
            .prompts()
            .into_iter()
            .find(|prompt| prompt.starts_with(REWRITE_PROMPT_HEAD))
            .unwrap();
        assert!(rewrite_prompt.contains("Ilse drowned at dawn."));
        assert!(rewrite_prompt.contains("[contradiction]"));

        let drafts = coordinator.services().ledger.drafts(1).await;
        assert_eq!(drafts.len(), 2);
        assert_eq!(
            coordinator.services().ledger.canonical().await,
            vec![(1, "Ilse swam ashore at dawn.".to_string())]
        );
    }

    #[tokio::test]
    async fn transient_failures_keep_their_code() {
        let (coordinator, _) = coordinator(ScriptedGenerator::new().on_error(
            WRITE_PROMPT_HEAD,
            GenerationError::Timeout {
                provider: "ollama".into(),
                after: std::time::Duration::from_secs(30),
            },
        ));
        let err = coordinator
            .dispatch(&task(4, TaskKind::WriteUnit, Some(1)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
        assert!(err.is_transient());
    }

    #[test]
    fn routing_follows_task_kind() {
        assert_eq!(
            AgentCoordinator::route(&task(1, TaskKind::ReviewUnit, Some(1)), false),
            vec![RoleKind::Editor]
        );
        let mut repair = task(9, TaskKind::RepairUnit, Some(1));
        repair.repair = Some(RepairLink {
            failed: TaskId(5),
            target: TaskKind::ValidateUnit,
        });
        assert_eq!(
            AgentCoordinator::route(&repair, false),
            vec![RoleKind::ContinuityChecker]
        );
        repair.repair = Some(RepairLink {
            failed: TaskId(4),
            target: TaskKind::WriteUnit,
        });
        assert_eq!(AgentCoordinator::route(&repair, false), vec![RoleKind::Writer]);
    }
}
