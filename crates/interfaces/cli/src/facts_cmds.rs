use std::str::FromStr;

use anyhow::{Result, anyhow, bail};

use saga_memory::{FactId, FactKind, KnowledgeStore};

pub(crate) async fn run_facts_search(
    store: &KnowledgeStore,
    query: &str,
    kind: Option<&str>,
    top_k: usize,
) -> Result<()> {
    let kind = kind
        .map(|label| FactKind::from_label(label).ok_or_else(|| anyhow!("unknown fact kind '{label}'")))
        .transpose()?;

    if store.is_empty().await {
        println!("no facts stored yet");
        return Ok(());
    }

    let hits = store.search_scored(query, kind, top_k).await?;
    println!(
        "{} of {} active facts match \"{query}\"",
        hits.len(),
        store.active_len().await
    );
    for hit in hits {
        let unit = hit
            .record
            .unit_index
            .map(|unit| format!(", unit {unit}"))
            .unwrap_or_default();
        println!(
            "{:.3}  [{}] {}  ({}{unit})",
            hit.similarity, hit.record.kind, hit.record.content, hit.record.id
        );
    }
    Ok(())
}

pub(crate) async fn run_facts_audit(store: &KnowledgeStore, id: &str) -> Result<()> {
    let id = FactId::from_str(id.trim()).map_err(|err| anyhow!("invalid fact id '{id}': {err}"))?;
    let Some(audit) = store.audit(id).await else {
        bail!("no fact with id {id}");
    };

    let record = &audit.record;
    println!("id          : {}", record.id);
    println!("kind        : {}", record.kind);
    println!(
        "unit        : {}",
        record
            .unit_index
            .map(|unit| unit.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("created_at  : {}", record.created_at.to_rfc3339());
    println!("hash        : {}", record.content_hash);
    match audit.superseded_by {
        Some(by) => println!("status      : superseded by {by}"),
        None => println!("status      : active"),
    }
    if !record.metadata.is_empty() {
        println!("metadata    : {}", serde_json::to_string(&record.metadata)?);
    }
    println!("content     : {}", record.content);
    Ok(())
}
