use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftState {
    Draft,
    Validated,
    /// A later validated draft of the same unit replaced this one.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitDraft {
    pub unit_index: u32,
    /// 1-based, increasing per unit.
    pub revision: u32,
    pub text: String,
    pub state: DraftState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize)]
struct LedgerState {
    outline: Option<String>,
    synopses: BTreeMap<u32, String>,
    drafts: BTreeMap<u32, Vec<UnitDraft>>,
}

/// Unit text keyed by `unit_index`.
///
/// Drafts are never edited.  Each write or revision adds a new revision, and
/// only validated revisions count as canonical text.
#[derive(Debug, Default)]
pub struct UnitLedger {
    state: RwLock<LedgerState>,
}

impl UnitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_outline(&self, outline: impl Into<String>) {
        self.state.write().await.outline = Some(outline.into());
    }

    pub async fn outline(&self) -> Option<String> {
        self.state.read().await.outline.clone()
    }

    pub async fn set_synopsis(&self, unit_index: u32, synopsis: impl Into<String>) {
        self.state
            .write()
            .await
            .synopses
            .insert(unit_index, synopsis.into());
    }

    pub async fn synopsis(&self, unit_index: u32) -> Option<String> {
        self.state.read().await.synopses.get(&unit_index).cloned()
    }

    /// Append a new draft revision for `unit_index`.
    pub async fn record_draft(&self, unit_index: u32, text: impl Into<String>) -> u32 {
        let mut state = self.state.write().await;
        let drafts = state.drafts.entry(unit_index).or_default();
        let revision = drafts.last().map_or(1, |draft| draft.revision + 1);
        drafts.push(UnitDraft {
            unit_index,
            revision,
            text: text.into(),
            state: DraftState::Draft,
            created_at: Utc::now(),
        });
        debug!(unit_index, revision, "draft recorded");
        revision
    }

    pub async fn latest_draft(&self, unit_index: u32) -> Option<UnitDraft> {
        self.state
            .read()
            .await
            .drafts
            .get(&unit_index)
            .and_then(|drafts| drafts.last())
            .cloned()
    }

    /// Mark `revision` validated.  Any earlier validated revision of the
    /// unit becomes superseded.  Returns `false` for an unknown revision.
    pub async fn mark_validated(&self, unit_index: u32, revision: u32) -> bool {
        let mut state = self.state.write().await;
        let Some(drafts) = state.drafts.get_mut(&unit_index) else {
            return false;
        };
        if !drafts.iter().any(|draft| draft.revision == revision) {
            return false;
        }
        for draft in drafts.iter_mut() {
            if draft.revision == revision {
                draft.state = DraftState::Validated;
            } else if draft.state == DraftState::Validated {
                draft.state = DraftState::Superseded;
            }
        }
        true
    }

    pub async fn drafts(&self, unit_index: u32) -> Vec<UnitDraft> {
        self.state
            .read()
            .await
            .drafts
            .get(&unit_index)
            .cloned()
            .unwrap_or_default()
    }

    /// Validated text per unit, in unit order.  Unvalidated drafts never
    /// appear here.
    pub async fn canonical(&self) -> Vec<(u32, String)> {
        self.state
            .read()
            .await
            .drafts
            .iter()
            .filter_map(|(unit, drafts)| {
                drafts
                    .iter()
                    .find(|draft| draft.state == DraftState::Validated)
                    .map(|draft| (*unit, draft.text.clone()))
            })
            .collect()
    }

    pub async fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.state.read().await)
    }
}
