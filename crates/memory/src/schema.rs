use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// What a fact is about.  Drives kind-restricted retrieval during
/// continuity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactKind {
    Character,
    Plot,
    World,
    Timeline,
    Other,
}

impl FactKind {
    pub const ALL: [FactKind; 5] = [
        FactKind::Character,
        FactKind::Plot,
        FactKind::World,
        FactKind::Timeline,
        FactKind::Other,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Plot => "plot",
            Self::World => "world",
            Self::Timeline => "timeline",
            Self::Other => "other",
        }
    }

    /// Parse a kind label, case-insensitively, accepting the loose synonyms
    /// models tend to produce.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "character" | "characters" | "person" | "people" => Some(Self::Character),
            "plot" | "story" | "event" => Some(Self::Plot),
            "world" | "setting" | "lore" | "rule" | "world_rule" => Some(Self::World),
            "timeline" | "time" | "date" | "chronology" => Some(Self::Timeline),
            "other" | "misc" | "summary" => Some(Self::Other),
            _ => None,
        }
    }
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactId(pub Uuid);

impl FactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FactId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Scalar metadata value.  Nested structures are deliberately not
/// representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for MetadataValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// One atomic, retrievable assertion.  Never edited after creation; the
/// store tracks supersession separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub id: FactId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub kind: FactKind,
    pub unit_index: Option<u32>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// SHA-256 hex of `kind` + `content`.
    pub content_hash: String,
}

impl FactRecord {
    pub fn new(
        content: impl Into<String>,
        kind: FactKind,
        unit_index: Option<u32>,
        metadata: Metadata,
        embedding: Vec<f32>,
    ) -> Self {
        let content = content.into();
        Self {
            id: FactId::new(),
            content_hash: content_hash(kind, &content),
            content,
            embedding,
            kind,
            unit_index,
            metadata,
            created_at: Utc::now(),
        }
    }
}

pub fn content_hash(kind: FactKind, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.label().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Flat row shape for a relational + vector backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedFact {
    pub id: FactId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub kind: FactKind,
    pub unit_index: Option<u32>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub superseded_by: Option<FactId>,
}

impl PersistedFact {
    pub fn from_record(record: &FactRecord, superseded_by: Option<FactId>) -> Self {
        Self {
            id: record.id,
            content: record.content.clone(),
            embedding: record.embedding.clone(),
            kind: record.kind,
            unit_index: record.unit_index,
            metadata: serde_json::to_value(&record.metadata).unwrap_or_default(),
            created_at: record.created_at,
            superseded_by,
        }
    }
}

/// Truncate `s` to at most `max_chars` Unicode scalar values.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
