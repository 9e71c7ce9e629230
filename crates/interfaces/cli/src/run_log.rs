//! Guard against replaying an earlier run's facts into a new one.
//!
//! `saga run` starts the story at unit 1, so a fact log that already holds
//! records would seed the new run with canon it never wrote.  Such a log is
//! refused unless `--fresh` asks for it to be archived first.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

/// Make `path` safe for a run that starts from unit 1.
///
/// Returns the archive path when an existing log was moved aside.
pub(crate) async fn prepare_run_log(path: &Path, fresh: bool) -> Result<Option<PathBuf>> {
    let len = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("inspecting fact log {}", path.display())),
    };
    if len == 0 {
        return Ok(None);
    }
    if !fresh {
        bail!(
            "fact log {} already holds facts from an earlier run; \
             pass --fresh to archive it and start a new story",
            path.display()
        );
    }

    let backup = next_backup_path(path).await?;
    tokio::fs::rename(path, &backup)
        .await
        .with_context(|| format!("archiving {} to {}", path.display(), backup.display()))?;
    info!(from = %path.display(), to = %backup.display(), "previous fact log archived");
    Ok(Some(backup))
}

/// First `<path>.bak.N` (N from 1) that does not exist yet.
async fn next_backup_path(path: &Path) -> Result<PathBuf> {
    let mut n: u32 = 1;
    loop {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".bak.{n}"));
        let candidate = PathBuf::from(name);
        if !tokio::fs::try_exists(&candidate)
            .await
            .with_context(|| format!("checking {}", candidate.display()))?
        {
            return Ok(candidate);
        }
        n = n
            .checked_add(1)
            .with_context(|| format!("no free backup name next to {}", path.display()))?;
    }
}
