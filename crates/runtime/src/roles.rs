//! Role capabilities.
//!
//! Every role implements [`Role`]; the coordinator picks one by
//! [`RoleKind`] and never by concrete type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use saga_llm::{GenerationError, extract_json_output};
use saga_memory::{
    ContinuityFinding, FactKind, Metadata, StoreError, SummarizerError, ValidatorError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::RoleContext;
use crate::task::{Task, TaskId, TaskKind};

pub const PLANNER_PROMPT_HEAD: &str = "Plan the story";
pub const CHARACTER_PROMPT_HEAD: &str = "Design the principal characters";
pub const WORLD_PROMPT_HEAD: &str = "Design the world";
pub const WRITE_PROMPT_HEAD: &str = "Write unit";
pub const REWRITE_PROMPT_HEAD: &str = "Rewrite unit";
pub const EDIT_PROMPT_HEAD: &str = "Edit unit";

const PLANNER_SYSTEM_PROMPT: &str = "You are a story architect. You plan serialized fiction \
unit by unit. Reply with JSON only.";
const DESIGNER_SYSTEM_PROMPT: &str = "You design story bibles. Every fact you list becomes \
canon that later chapters must respect. Reply with JSON only.";
const WRITER_SYSTEM_PROMPT: &str = "You are a novelist writing one unit of a long serialized \
work. Stay consistent with the established facts and the story so far.";
const EDITOR_SYSTEM_PROMPT: &str = "You are a line editor. Tighten prose and fix continuity \
slips without changing what happens.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    Planner,
    CharacterDesigner,
    WorldBuilder,
    Writer,
    Editor,
    ContinuityChecker,
}

impl RoleKind {
    pub const ALL: [RoleKind; 6] = [
        RoleKind::Planner,
        RoleKind::CharacterDesigner,
        RoleKind::WorldBuilder,
        RoleKind::Writer,
        RoleKind::Editor,
        RoleKind::ContinuityChecker,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::CharacterDesigner => "character_designer",
            Self::WorldBuilder => "world_builder",
            Self::Writer => "writer",
            Self::Editor => "editor",
            Self::ContinuityChecker => "continuity_checker",
        }
    }

    /// Role responsible for a task kind.  `repair_unit` has no owner of its
    /// own; the coordinator routes it by the kind it repairs.
    pub fn for_task_kind(kind: TaskKind) -> Option<Self> {
        match kind {
            TaskKind::Plan => Some(Self::Planner),
            TaskKind::DesignCharacter => Some(Self::CharacterDesigner),
            TaskKind::DesignWorld => Some(Self::WorldBuilder),
            TaskKind::WriteUnit => Some(Self::Writer),
            TaskKind::ReviewUnit => Some(Self::Editor),
            TaskKind::ValidateUnit => Some(Self::ContinuityChecker),
            TaskKind::RepairUnit => None,
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Output {
    Text(String),
    Structured(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleOutput {
    pub output: Output,
    pub findings: Vec<ContinuityFinding>,
}

impl RoleOutput {
    fn text(text: impl Into<String>) -> Self {
        Self {
            output: Output::Text(text.into()),
            findings: Vec::new(),
        }
    }

    fn structured(value: serde_json::Value) -> Self {
        Self {
            output: Output::Structured(value),
            findings: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("{} contradiction(s) against stored facts", .0.iter().filter(|f| f.is_blocking()).count())]
    Contradiction(Vec<ContinuityFinding>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Summarizer(#[from] SummarizerError),

    #[error(transparent)]
    Validator(ValidatorError),

    #[error("unit {unit_index} has no {what} to work from")]
    MissingArtifact { unit_index: u32, what: &'static str },

    #[error("{0} carries no unit index")]
    MissingUnit(TaskId),

    #[error("no role registered as {0}")]
    Unregistered(RoleKind),

    #[error("worker interrupted: {0}")]
    Interrupted(String),
}

impl From<ValidatorError> for RoleError {
    fn from(err: ValidatorError) -> Self {
        match err {
            ValidatorError::Generation(err) => Self::Generation(err),
            ValidatorError::Store(err) => Self::Store(err),
            ValidatorError::Summarizer(err) => Self::Summarizer(err),
            other => Self::Validator(other),
        }
    }
}

impl RoleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Generation(err) => err.code(),
            Self::Contradiction(_) => "contradiction",
            Self::Store(err) if err.is_integrity() => "store_integrity",
            Self::Store(_) => "store",
            Self::Summarizer(_) => "summarizer",
            Self::Validator(_) => "validator",
            Self::MissingArtifact { .. } => "missing_artifact",
            Self::MissingUnit(_) => "missing_unit",
            Self::Unregistered(_) => "unregistered_role",
            Self::Interrupted(_) => "interrupted",
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Generation(err) => err.is_transient(),
            Self::Store(StoreError::Embedding(err)) => err.is_transient(),
            _ => false,
        }
    }
}

#[async_trait]
pub trait Role: Send + Sync {
    fn kind(&self) -> RoleKind;

    async fn handle(&self, task: &Task, context: &RoleContext) -> Result<RoleOutput, RoleError>;
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default, Clone)]
pub struct RoleRegistry {
    roles: HashMap<RoleKind, Arc<dyn Role>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All six built-in roles.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Planner));
        registry.register(Arc::new(CharacterDesigner));
        registry.register(Arc::new(WorldBuilder));
        registry.register(Arc::new(Writer));
        registry.register(Arc::new(Editor));
        registry.register(Arc::new(ContinuityChecker));
        registry
    }

    /// Register `role`, replacing any role of the same kind.
    pub fn register(&mut self, role: Arc<dyn Role>) {
        self.roles.insert(role.kind(), role);
    }

    pub fn get(&self, kind: RoleKind) -> Option<Arc<dyn Role>> {
        self.roles.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<RoleKind> {
        RoleKind::ALL
            .into_iter()
            .filter(|kind| self.roles.contains_key(kind))
            .collect()
    }
}

impl fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleRegistry")
            .field("roles", &self.kinds())
            .finish()
    }
}

// ── Structured replies ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SheetFact {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlannedUnit {
    unit: u32,
    synopsis: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanSheet {
    #[serde(default)]
    outline: String,
    #[serde(default)]
    units: Vec<PlannedUnit>,
    #[serde(default)]
    facts: Vec<SheetFact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DesignSheet {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    facts: Vec<SheetFact>,
}

fn parse_sheet<T: serde::de::DeserializeOwned>(role: RoleKind, response: &str) -> Result<T, RoleError> {
    extract_json_output(response).ok_or_else(|| {
        RoleError::Generation(GenerationError::InvalidResponse(format!(
            "{role} reply is not the expected JSON object"
        )))
    })
}

/// Embed every fact first and write only once all embeddings succeeded, so
/// a failed sheet leaves no partial canon behind for the retry to duplicate.
async fn store_sheet_facts(
    context: &RoleContext,
    facts: &[SheetFact],
    default_kind: FactKind,
    source: RoleKind,
) -> Result<usize, RoleError> {
    let store = &context.services.store;
    let mut prepared = Vec::with_capacity(facts.len());
    for fact in facts.iter().filter(|fact| !fact.content.trim().is_empty()) {
        let kind = FactKind::from_label(&fact.kind).unwrap_or(default_kind);
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), source.label().into());
        prepared.push(store.prepare(fact.content.trim(), kind, None, metadata).await?);
    }

    let stored = prepared.len();
    for record in prepared {
        store.import(record).await?;
    }
    Ok(stored)
}

fn require_unit(task: &Task) -> Result<u32, RoleError> {
    task.unit_index.ok_or(RoleError::MissingUnit(task.id))
}

fn story_bible(context: &RoleContext, prompt: &mut String) {
    if let Some(story) = context.story_block() {
        prompt.push_str("\n\nStory so far:\n");
        prompt.push_str(&story);
    }
    if let Some(facts) = context.facts_block() {
        prompt.push_str("\n\nEstablished facts:\n");
        prompt.push_str(&facts);
    }
}

// ── Roles ────────────────────────────────────────────────────────────────────

/// Outline plus one synopsis per unit.
pub struct Planner;

#[async_trait]
impl Role for Planner {
    fn kind(&self) -> RoleKind {
        RoleKind::Planner
    }

    async fn handle(&self, _task: &Task, context: &RoleContext) -> Result<RoleOutput, RoleError> {
        let services = &context.services;
        let project = &services.project;
        let prompt = format!(
            "{PLANNER_PROMPT_HEAD} \"{}\", a {} work in {} units.\nPremise: {}\n\n\
             Reply with a JSON object {{\"outline\": string, \
             \"units\": [{{\"unit\": number, \"synopsis\": string}}], \
             \"facts\": [{{\"kind\": \"plot\" | \"timeline\" | \"world\" | \"character\", \"content\": string}}]}}.",
            project.title, project.genre, project.target_units, project.premise
        );
        let response = services
            .generator
            .generate(&prompt, PLANNER_SYSTEM_PROMPT, services.temperature)
            .await?;
        let sheet: PlanSheet = parse_sheet(self.kind(), &response)?;

        services.ledger.set_outline(sheet.outline.trim()).await;
        let mut planned = 0;
        for unit in &sheet.units {
            if (1..=project.target_units).contains(&unit.unit) {
                services
                    .ledger
                    .set_synopsis(unit.unit, unit.synopsis.trim())
                    .await;
                planned += 1;
            }
        }
        let facts = store_sheet_facts(context, &sheet.facts, FactKind::Plot, self.kind()).await?;
        info!(planned, facts, "story planned");

        let value = serde_json::to_value(&sheet)
            .map_err(|err| GenerationError::InvalidResponse(err.to_string()))?;
        Ok(RoleOutput::structured(value))
    }
}

async fn design(
    role: RoleKind,
    head: &str,
    default_kind: FactKind,
    context: &RoleContext,
) -> Result<RoleOutput, RoleError> {
    let services = &context.services;
    let outline = services.ledger.outline().await.unwrap_or_default();
    let mut prompt = format!(
        "{head} for \"{}\" ({}).\nPremise: {}\nOutline: {}",
        services.project.title, services.project.genre, services.project.premise, outline
    );
    story_bible(context, &mut prompt);
    prompt.push_str(
        "\n\nReply with a JSON object {\"summary\": string, \
         \"facts\": [{\"kind\": string, \"content\": one self-contained sentence}]}.",
    );

    let response = services
        .generator
        .generate(&prompt, DESIGNER_SYSTEM_PROMPT, services.temperature)
        .await?;
    let sheet: DesignSheet = parse_sheet(role, &response)?;
    let facts = store_sheet_facts(context, &sheet.facts, default_kind, role).await?;
    info!(role = %role, facts, "design stored");

    let value = serde_json::to_value(&sheet)
        .map_err(|err| GenerationError::InvalidResponse(err.to_string()))?;
    Ok(RoleOutput::structured(value))
}

pub struct CharacterDesigner;

#[async_trait]
impl Role for CharacterDesigner {
    fn kind(&self) -> RoleKind {
        RoleKind::CharacterDesigner
    }

    async fn handle(&self, _task: &Task, context: &RoleContext) -> Result<RoleOutput, RoleError> {
        design(self.kind(), CHARACTER_PROMPT_HEAD, FactKind::Character, context).await
    }
}

pub struct WorldBuilder;

#[async_trait]
impl Role for WorldBuilder {
    fn kind(&self) -> RoleKind {
        RoleKind::WorldBuilder
    }

    async fn handle(&self, _task: &Task, context: &RoleContext) -> Result<RoleOutput, RoleError> {
        design(self.kind(), WORLD_PROMPT_HEAD, FactKind::World, context).await
    }
}

/// Drafts a unit, or rewrites the latest draft when repair notes exist.
pub struct Writer;

#[async_trait]
impl Role for Writer {
    fn kind(&self) -> RoleKind {
        RoleKind::Writer
    }

    async fn handle(&self, task: &Task, context: &RoleContext) -> Result<RoleOutput, RoleError> {
        let unit = require_unit(task)?;
        let services = &context.services;
        let title = &services.project.title;
        let synopsis = services.ledger.synopsis(unit).await;
        let previous = services.ledger.latest_draft(unit).await;

        let mut prompt = match (&context.notes, &previous) {
            (Some(notes), Some(draft)) => format!(
                "{REWRITE_PROMPT_HEAD} {unit} of \"{title}\" so it no longer conflicts with \
                 established facts.\n\n{notes}\nPrevious draft:\n{}",
                draft.text
            ),
            _ => format!("{WRITE_PROMPT_HEAD} {unit} of \"{title}\"."),
        };
        if let Some(synopsis) = synopsis.filter(|s| !s.is_empty()) {
            prompt.push_str(&format!("\n\nSynopsis: {synopsis}"));
        }
        story_bible(context, &mut prompt);
        prompt.push_str(&format!("\n\nReply with the prose of unit {unit} only."));

        let text = services
            .generator
            .generate(&prompt, WRITER_SYSTEM_PROMPT, services.temperature)
            .await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(GenerationError::InvalidResponse(format!("empty text for unit {unit}")).into());
        }

        let revision = services.ledger.record_draft(unit, text).await;
        debug!(unit_index = unit, revision, chars = text.chars().count(), "unit drafted");
        Ok(RoleOutput::text(text))
    }
}

/// Review pass between writing and validation.  A revised reply becomes a
/// new draft revision; an empty reply keeps the draft as is.
pub struct Editor;

#[async_trait]
impl Role for Editor {
    fn kind(&self) -> RoleKind {
        RoleKind::Editor
    }

    async fn handle(&self, task: &Task, context: &RoleContext) -> Result<RoleOutput, RoleError> {
        let unit = require_unit(task)?;
        let services = &context.services;
        let draft = services
            .ledger
            .latest_draft(unit)
            .await
            .ok_or(RoleError::MissingArtifact {
                unit_index: unit,
                what: "draft",
            })?;

        let mut prompt = format!(
            "{EDIT_PROMPT_HEAD} {unit} of \"{}\". Return the full revised text, or nothing \
             if no change is needed.\n\nDraft:\n{}",
            services.project.title, draft.text
        );
        if let Some(facts) = context.facts_block() {
            prompt.push_str("\n\nEstablished facts:\n");
            prompt.push_str(&facts);
        }

        let revised = match services
            .generator
            .generate(&prompt, EDITOR_SYSTEM_PROMPT, services.temperature)
            .await
        {
            Ok(text) => text.trim().to_string(),
            Err(GenerationError::InvalidResponse(_)) => String::new(),
            Err(err) => return Err(err.into()),
        };

        if revised.is_empty() || revised == draft.text {
            debug!(unit_index = unit, "editor kept draft");
            return Ok(RoleOutput::text(draft.text));
        }
        let revision = services.ledger.record_draft(unit, revised.as_str()).await;
        debug!(unit_index = unit, revision, "editor revised draft");
        Ok(RoleOutput::text(revised))
    }
}

/// Validates the latest draft and commits it when nothing contradicts
/// stored canon.
pub struct ContinuityChecker;

#[async_trait]
impl Role for ContinuityChecker {
    fn kind(&self) -> RoleKind {
        RoleKind::ContinuityChecker
    }

    async fn handle(&self, task: &Task, context: &RoleContext) -> Result<RoleOutput, RoleError> {
        let unit = require_unit(task)?;
        let services = &context.services;
        let draft = services
            .ledger
            .latest_draft(unit)
            .await
            .ok_or(RoleError::MissingArtifact {
                unit_index: unit,
                what: "draft",
            })?;

        let report = services.validator.review(unit, &draft.text).await?;
        if report.is_blocked() {
            warn!(
                unit_index = unit,
                revision = draft.revision,
                contradictions = report.contradictions().count(),
                "draft rejected"
            );
            return Err(RoleError::Contradiction(report.findings));
        }

        // The commit runs detached so that cancelling this worker cannot stop
        // it half way through.
        let findings = report.findings.clone();
        let validator = services.validator.clone();
        let ledger = services.ledger.clone();
        let text = draft.text.clone();
        let revision = draft.revision;
        let commit = tokio::spawn(async move {
            let outcome = validator.commit(unit, &text, &report).await?;
            ledger.mark_validated(unit, revision).await;
            Ok::<_, ValidatorError>(outcome)
        });
        let outcome = commit
            .await
            .map_err(|err| RoleError::Interrupted(err.to_string()))??;

        info!(
            unit_index = unit,
            revision,
            facts = outcome.stored.len(),
            findings = findings.len(),
            "unit validated"
        );
        Ok(RoleOutput {
            output: Output::Text(draft.text),
            findings,
        })
    }
}
