//! Continuity validation.
//!
//! A candidate unit is broken into factual assertions by the Generator.
//! Each assertion is checked against the nearest stored facts of the same
//! kind, and the Generator judges compatibility.  Only a unit with no
//! `contradiction` finding may be committed, and committing is the single
//! path by which a unit's facts and text reach the knowledge store and
//! summarizer.

use std::collections::HashSet;
use std::sync::Arc;

use saga_config::MemoryConfig;
use saga_llm::{GenerationError, Generator, extract_json_output};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::retrieval::ScoredFact;
use crate::schema::{FactId, FactKind, FactRecord, Metadata, truncate_str};
use crate::store::KnowledgeStore;
use crate::summarizer::{HierarchicalSummarizer, RecordOutcome, SummarizerError};

pub const EXTRACT_SYSTEM_PROMPT: &str = "You extract atomic continuity facts from fiction. \
Reply with JSON only.";
pub const JUDGE_SYSTEM_PROMPT: &str = "You are a continuity editor comparing a new assertion \
against established canon. Reply with JSON only.";

/// Marker that opens every extraction prompt.
pub const EXTRACT_PROMPT_HEAD: &str = "List the factual assertions";
/// Marker that opens every judgement prompt.
pub const JUDGE_PROMPT_HEAD: &str = "Judge whether the assertion";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatorConfig {
    /// Facts retrieved per assertion.
    pub top_k: usize,
    /// A compatible assertion scoring at least this against its best match
    /// is already known and is not stored again.
    pub known_threshold: f32,
    pub temperature: f32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            known_threshold: 0.92,
            temperature: 0.0,
        }
    }
}

impl From<&MemoryConfig> for ValidatorConfig {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            top_k: config.search_top_k.max(1),
            known_threshold: config.known_fact_threshold,
            ..Self::default()
        }
    }
}

/// Declaration order is severity order: `Contradiction` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Contradiction,
    Ambiguous,
    Ok,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Contradiction => "contradiction",
            Self::Ambiguous => "ambiguous",
            Self::Ok => "ok",
        }
    }

    fn from_verdict(verdict: &str) -> Option<Self> {
        match verdict.trim().to_lowercase().as_str() {
            "contradiction" | "contradicts" | "inconsistent" | "conflict" => {
                Some(Self::Contradiction)
            }
            "ambiguous" | "unclear" | "uncertain" => Some(Self::Ambiguous),
            "ok" | "consistent" | "compatible" | "supports" => Some(Self::Ok),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityFinding {
    pub unit_index: u32,
    pub fact_id: FactId,
    pub severity: Severity,
    pub explanation: String,
    /// Position of the assertion within the unit's text.
    pub assertion_index: usize,
    pub assertion: String,
}

impl ContinuityFinding {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Contradiction
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub kind: FactKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionStatus {
    /// Nothing comparable is stored yet; committed as a new fact.
    Novel,
    /// Compatible with and already covered by `fact_id`.
    Known { fact_id: FactId },
    /// Compatible, but updates `fact_id`; the new fact supersedes it.
    Supersedes { fact_id: FactId },
    /// Contradicts stored canon.
    Conflicting { fact_id: FactId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedAssertion {
    pub index: usize,
    pub assertion: Assertion,
    pub status: AssertionStatus,
    pub ambiguous: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub unit_index: u32,
    /// Ordered by severity, then by assertion order in the text.
    pub findings: Vec<ContinuityFinding>,
    pub assertions: Vec<ClassifiedAssertion>,
}

impl ValidationReport {
    pub fn is_blocked(&self) -> bool {
        self.findings.iter().any(ContinuityFinding::is_blocking)
    }

    pub fn contradictions(&self) -> impl Iterator<Item = &ContinuityFinding> {
        self.findings.iter().filter(|finding| finding.is_blocking())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    pub unit_index: u32,
    pub stored: Vec<FactId>,
    /// `(old, new)` pairs.
    pub superseded: Vec<(FactId, FactId)>,
    pub record: RecordOutcome,
}

/// Result of [`ContinuityValidator::accept`].
#[derive(Debug, Clone, PartialEq)]
pub enum Acceptance {
    Committed {
        report: ValidationReport,
        outcome: CommitOutcome,
    },
    Rejected(ValidationReport),
}

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Summarizer(#[from] SummarizerError),

    #[error("unit {unit_index} has {contradictions} unresolved contradiction(s)")]
    Blocked {
        unit_index: u32,
        contradictions: usize,
    },

    #[error("report is for unit {report} but commit was asked for unit {requested}")]
    UnitMismatch { report: u32, requested: u32 },
}

#[derive(Debug, Deserialize)]
struct RawAssertion {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    verdict: String,
    /// 1-based index into the facts listed in the prompt.
    #[serde(default)]
    fact: Option<usize>,
    #[serde(default)]
    supersedes: bool,
    #[serde(default)]
    explanation: String,
}

struct Verdict {
    severity: Severity,
    fact_id: FactId,
    similarity: f32,
    supersedes: bool,
    explanation: String,
}

pub struct ContinuityValidator {
    config: ValidatorConfig,
    generator: Arc<dyn Generator>,
    store: Arc<KnowledgeStore>,
    summarizer: Arc<HierarchicalSummarizer>,
}

impl ContinuityValidator {
    pub fn new(
        config: ValidatorConfig,
        generator: Arc<dyn Generator>,
        store: Arc<KnowledgeStore>,
        summarizer: Arc<HierarchicalSummarizer>,
    ) -> Self {
        Self {
            config,
            generator,
            store,
            summarizer,
        }
    }

    /// Findings for `candidate_text`, most severe first.
    pub async fn validate(
        &self,
        unit_index: u32,
        candidate_text: &str,
    ) -> Result<Vec<ContinuityFinding>, ValidatorError> {
        Ok(self.review(unit_index, candidate_text).await?.findings)
    }

    /// Full validation pass: findings plus how each assertion would be
    /// committed.
    pub async fn review(
        &self,
        unit_index: u32,
        candidate_text: &str,
    ) -> Result<ValidationReport, ValidatorError> {
        let assertions = self.extract_assertions(unit_index, candidate_text).await?;
        let mut findings = Vec::new();
        let mut classified = Vec::with_capacity(assertions.len());
        let mut claimed = HashSet::new();

        for (index, assertion) in assertions.into_iter().enumerate() {
            let hits = self
                .store
                .search_scored(&assertion.content, Some(assertion.kind), self.config.top_k)
                .await?;
            if hits.is_empty() {
                classified.push(ClassifiedAssertion {
                    index,
                    assertion,
                    status: AssertionStatus::Novel,
                    ambiguous: false,
                });
                continue;
            }

            let verdict = self.judge(&assertion, &hits).await?;
            let status = match verdict.severity {
                Severity::Contradiction => AssertionStatus::Conflicting {
                    fact_id: verdict.fact_id,
                },
                // One replacement per fact and unit; later updates to the
                // same fact are stored alongside it.
                Severity::Ok if verdict.supersedes => {
                    if claimed.insert(verdict.fact_id) {
                        AssertionStatus::Supersedes {
                            fact_id: verdict.fact_id,
                        }
                    } else {
                        AssertionStatus::Novel
                    }
                }
                Severity::Ok if verdict.similarity >= self.config.known_threshold => {
                    AssertionStatus::Known {
                        fact_id: verdict.fact_id,
                    }
                }
                _ => AssertionStatus::Novel,
            };

            if verdict.severity == Severity::Contradiction {
                warn!(
                    unit_index,
                    fact_id = %verdict.fact_id,
                    assertion = truncate_str(&assertion.content, 80),
                    "continuity contradiction"
                );
            }

            findings.push(ContinuityFinding {
                unit_index,
                fact_id: verdict.fact_id,
                severity: verdict.severity,
                explanation: verdict.explanation,
                assertion_index: index,
                assertion: assertion.content.clone(),
            });
            classified.push(ClassifiedAssertion {
                index,
                ambiguous: verdict.severity == Severity::Ambiguous,
                assertion,
                status,
            });
        }

        findings.sort_by_key(|finding| (finding.severity, finding.assertion_index));
        debug!(
            unit_index,
            assertions = classified.len(),
            findings = findings.len(),
            "validation pass complete"
        );

        Ok(ValidationReport {
            unit_index,
            findings,
            assertions: classified,
        })
    }

    /// Commit an accepted unit: novel facts go to the store, and the text goes
    /// to the summarizer.  All embedding and summary calls, and the check that
    /// every superseded fact is still active, happen before the first fact is
    /// written.
    pub async fn commit(
        &self,
        unit_index: u32,
        text: &str,
        report: &ValidationReport,
    ) -> Result<CommitOutcome, ValidatorError> {
        if report.unit_index != unit_index {
            return Err(ValidatorError::UnitMismatch {
                report: report.unit_index,
                requested: unit_index,
            });
        }
        if report.is_blocked() {
            return Err(ValidatorError::Blocked {
                unit_index,
                contradictions: report.contradictions().count(),
            });
        }

        let mut prepared: Vec<(FactRecord, Option<FactId>)> = Vec::new();
        let mut targets: Vec<FactId> = Vec::new();
        for item in &report.assertions {
            let replaces = match item.status {
                AssertionStatus::Novel => None,
                AssertionStatus::Supersedes { fact_id } if !targets.contains(&fact_id) => {
                    targets.push(fact_id);
                    Some(fact_id)
                }
                AssertionStatus::Supersedes { .. } => None,
                AssertionStatus::Known { .. } | AssertionStatus::Conflicting { .. } => continue,
            };
            let mut metadata = Metadata::new();
            metadata.insert("source".into(), "unit".into());
            metadata.insert("assertion_index".into(), (item.index as i64).into());
            if item.ambiguous {
                metadata.insert("ambiguous".into(), true.into());
            }
            let record = self
                .store
                .prepare(
                    item.assertion.content.clone(),
                    item.assertion.kind,
                    Some(unit_index),
                    metadata,
                )
                .await?;
            prepared.push((record, replaces));
        }

        self.store.check_replaceable(&targets).await?;
        let record = self.summarizer.record_unit(unit_index, text).await?;

        let mut stored = Vec::with_capacity(prepared.len());
        let mut superseded = Vec::new();
        for (fact, replaces) in prepared {
            let new_id = fact.id;
            self.store.import(fact).await?;
            if let Some(old_id) = replaces {
                self.store.supersede(old_id, new_id).await?;
                superseded.push((old_id, new_id));
            }
            stored.push(new_id);
        }

        info!(
            unit_index,
            facts = stored.len(),
            superseded = superseded.len(),
            "unit committed"
        );
        Ok(CommitOutcome {
            unit_index,
            stored,
            superseded,
            record,
        })
    }

    /// Review, then commit when nothing blocks.
    pub async fn accept(&self, unit_index: u32, text: &str) -> Result<Acceptance, ValidatorError> {
        let report = self.review(unit_index, text).await?;
        if report.is_blocked() {
            return Ok(Acceptance::Rejected(report));
        }
        let outcome = self.commit(unit_index, text, &report).await?;
        Ok(Acceptance::Committed { report, outcome })
    }

    async fn extract_assertions(
        &self,
        unit_index: u32,
        text: &str,
    ) -> Result<Vec<Assertion>, GenerationError> {
        let prompt = format!(
            "{EXTRACT_PROMPT_HEAD} made by unit {unit_index} below, in the order they appear.\n\
             Return a JSON array of objects {{\"kind\": one of character|plot|world|timeline|other, \
             \"content\": one self-contained sentence}}. Return [] if there are none.\n\n{text}"
        );
        let response = self
            .generator
            .generate(&prompt, EXTRACT_SYSTEM_PROMPT, self.config.temperature)
            .await?;
        let raw: Vec<RawAssertion> = extract_json_output(&response).ok_or_else(|| {
            GenerationError::InvalidResponse(format!(
                "assertion list is not a JSON array: {}",
                truncate_str(&response, 120)
            ))
        })?;

        Ok(raw
            .into_iter()
            .filter(|item| !item.content.trim().is_empty())
            .map(|item| Assertion {
                kind: FactKind::from_label(&item.kind).unwrap_or(FactKind::Other),
                content: item.content.trim().to_string(),
            })
            .collect())
    }

    async fn judge(
        &self,
        assertion: &Assertion,
        hits: &[ScoredFact],
    ) -> Result<Verdict, GenerationError> {
        let mut prompt = format!(
            "{JUDGE_PROMPT_HEAD} is compatible with the established {} facts.\n\
             Assertion: {}\n\nEstablished facts:\n",
            assertion.kind, assertion.content
        );
        for (n, hit) in hits.iter().enumerate() {
            let unit = hit
                .record
                .unit_index
                .map(|unit| format!(" (unit {unit})"))
                .unwrap_or_default();
            prompt.push_str(&format!("[{}]{unit} {}\n", n + 1, hit.record.content));
        }
        prompt.push_str(
            "\nReply with a JSON object {\"verdict\": \"contradiction\" | \"ambiguous\" | \"consistent\", \
             \"fact\": number of the most relevant fact, \"supersedes\": true if the assertion \
             legitimately updates that fact, \"explanation\": short reason}.",
        );

        let response = self
            .generator
            .generate(&prompt, JUDGE_SYSTEM_PROMPT, self.config.temperature)
            .await?;
        let raw: RawVerdict = extract_json_output(&response).ok_or_else(|| {
            GenerationError::InvalidResponse(format!(
                "verdict is not a JSON object: {}",
                truncate_str(&response, 120)
            ))
        })?;
        let severity = Severity::from_verdict(&raw.verdict).ok_or_else(|| {
            GenerationError::InvalidResponse(format!("unknown verdict '{}'", raw.verdict))
        })?;

        // Out-of-range references fall back to the top-ranked fact.
        let hit = raw
            .fact
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| hits.get(idx))
            .unwrap_or(&hits[0]);

        Ok(Verdict {
            severity,
            fact_id: hit.record.id,
            similarity: hit.similarity,
            supersedes: raw.supersedes && severity == Severity::Ok,
            explanation: raw.explanation.trim().to_string(),
        })
    }
}

/// Plain-text repair brief listing blocking findings first.
pub fn continuity_notes(findings: &[ContinuityFinding]) -> String {
    if findings.is_empty() {
        return "No continuity issues.".to_string();
    }
    let mut notes = String::from("Continuity issues to resolve:\n");
    for (n, finding) in findings.iter().enumerate() {
        notes.push_str(&format!(
            "{}. [{}] \"{}\" vs fact {}",
            n + 1,
            finding.severity.label(),
            finding.assertion,
            finding.fact_id
        ));
        if !finding.explanation.is_empty() {
            notes.push_str(&format!(": {}", finding.explanation));
        }
        notes.push('\n');
    }
    notes
}

// ── Tests ─────────────────────────────────────────────────────────────────────
