use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::schema::{FactId, FactRecord};

/// One mutation of the knowledge store.  The log only ever grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FactEvent {
    Put { record: FactRecord },
    Supersede { old: FactId, new: FactId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactLogRecord {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event: FactEvent,
}

impl FactLogRecord {
    pub fn new(event: FactEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event,
        }
    }
}

/// Append-only JSONL file of [`FactLogRecord`]s.
#[derive(Debug, Clone)]
pub struct FactEventLog {
    path: PathBuf,
}

impl FactEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &FactLogRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        // fsync so a committed unit's facts survive a crash right after.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read every well-formed record.  Corrupt lines are skipped and copied
    /// to a `.corrupt` sidecar.
    pub fn load(&self) -> Result<Vec<FactLogRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut corrupt = Vec::new();

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<FactLogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt fact log line, skipping"
                    );
                    corrupt.push(line);
                }
            }
        }

        if !corrupt.is_empty() {
            let sidecar = self.path.with_extension("jsonl.corrupt");
            let mut body = corrupt.join("\n");
            body.push('\n');
            if let Err(err) = std::fs::write(&sidecar, body) {
                tracing::warn!(error = %err, path = %sidecar.display(), "could not write corrupt sidecar");
            }
            tracing::warn!(
                corrupt_lines = corrupt.len(),
                path = %self.path.display(),
                "fact log loaded with skipped lines"
            );
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FactKind, Metadata};

    fn put(content: &str) -> FactLogRecord {
        FactLogRecord::new(FactEvent::Put {
            record: FactRecord::new(content, FactKind::Plot, Some(1), Metadata::new(), vec![0.0, 1.0]),
        })
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("saga-fact-log-test-{}.jsonl", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn append_and_load_preserves_order() {
        let path = temp_path();
        let log = FactEventLog::new(&path);
        let first = put("The ferry sank");
        let FactEvent::Put { record } = &first.event else {
            unreachable!()
        };
        let old = record.id;
        log.append(&first).await.unwrap();
        log.append(&FactLogRecord::new(FactEvent::Supersede { old, new: FactId::new() }))
            .await
            .unwrap();

        let records = log.load().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].event, FactEvent::Put { .. }));
        assert!(matches!(records[1].event, FactEvent::Supersede { old: o, .. } if o == old));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_loads_empty() {
        let log = FactEventLog::new(temp_path());
        assert!(log.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let path = temp_path();
        let log = FactEventLog::new(&path);
        log.append(&put("one")).await.unwrap();
        {
            use std::io::Write as _;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{not json").unwrap();
        }
        log.append(&put("two")).await.unwrap();

        let records = log.load().unwrap();
        assert_eq!(records.len(), 2);
        let sidecar = path.with_extension("jsonl.corrupt");
        assert!(sidecar.exists());
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&sidecar);
    }
}
