use std::sync::Arc;

use saga_config::{AppConfig, ProjectConfig};
use saga_llm::Generator;
use saga_memory::{
    AssembledContext, ContinuityValidator, FactRecord, HierarchicalSummarizer, KnowledgeStore,
    SummarizerConfig, ValidatorConfig,
};

use crate::ledger::UnitLedger;

/// Long-lived collaborators shared by every role.
///
/// Built once from [`AppConfig`]; nothing in the runtime reaches for global
/// state.
pub struct Services {
    pub project: ProjectConfig,
    pub temperature: f32,
    /// Character budget for assembled story context.
    pub context_budget: usize,
    /// Facts retrieved into each role prompt.
    pub facts_per_prompt: usize,
    pub generator: Arc<dyn Generator>,
    pub store: Arc<KnowledgeStore>,
    pub summarizer: Arc<HierarchicalSummarizer>,
    pub validator: Arc<ContinuityValidator>,
    pub ledger: Arc<UnitLedger>,
}

impl Services {
    pub fn new(config: &AppConfig, generator: Arc<dyn Generator>, store: Arc<KnowledgeStore>) -> Self {
        let summarizer = Arc::new(HierarchicalSummarizer::new(
            SummarizerConfig::from(&config.memory),
            generator.clone(),
            store.clone(),
        ));
        let validator = Arc::new(ContinuityValidator::new(
            ValidatorConfig::from(&config.memory),
            generator.clone(),
            store.clone(),
            summarizer.clone(),
        ));
        Self {
            project: config.project.clone(),
            temperature: config.llm.temperature,
            context_budget: config.memory.context_budget,
            facts_per_prompt: config.memory.search_top_k,
            generator,
            store,
            summarizer,
            validator,
            ledger: Arc::new(UnitLedger::new()),
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("project", &self.project.title)
            .field("context_budget", &self.context_budget)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// What a role sees for one dispatch.
pub struct RoleContext {
    pub services: Arc<Services>,
    /// Story so far, for unit tasks.
    pub story: Option<AssembledContext>,
    /// Stored facts relevant to the task, most similar first.
    pub facts: Vec<FactRecord>,
    /// Repair brief left by the last rejected validation of this unit.
    pub notes: Option<String>,
}

impl RoleContext {
    pub fn bare(services: Arc<Services>) -> Self {
        Self {
            services,
            story: None,
            facts: Vec::new(),
            notes: None,
        }
    }

    /// `- fact` lines for prompts, or `None` when nothing was retrieved.
    pub fn facts_block(&self) -> Option<String> {
        if self.facts.is_empty() {
            return None;
        }
        Some(
            self.facts
                .iter()
                .map(|fact| format!("- ({}) {}", fact.kind, fact.content))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    pub fn story_block(&self) -> Option<String> {
        self.story
            .as_ref()
            .filter(|story| !story.is_empty())
            .map(AssembledContext::render)
    }
}
