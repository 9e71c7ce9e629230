//! Similarity ranking over fact embeddings.
//!
//! Order is fully determined by the inputs:
//! ```text
//! cosine similarity desc → created_at desc → insertion sequence desc
//! ```
//! so repeated searches over an unchanged store return identical results.
use tracing::trace;

use crate::schema::FactRecord;

/// A search hit with its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredFact {
    pub record: FactRecord,
    pub similarity: f32,
}

/// Cosine similarity in `[-1, 1]`.  Mismatched or zero vectors score `0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

/// Rank `(sequence, record)` candidates against `query` and keep `top_k`.
///
/// `sequence` is the record's insertion position and breaks ties between
/// records created in the same instant.
pub fn rank<'a>(
    candidates: impl IntoIterator<Item = (usize, &'a FactRecord)>,
    query: &[f32],
    top_k: usize,
) -> Vec<ScoredFact> {
    if top_k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(usize, &FactRecord, f32)> = candidates
        .into_iter()
        .map(|(seq, record)| (seq, record, cosine_similarity(&record.embedding, query)))
        .collect();

    scored.sort_by(|(l_seq, l, l_sim), (r_seq, r, r_sim)| {
        r_sim
            .total_cmp(l_sim)
            .then_with(|| r.created_at.cmp(&l.created_at))
            .then_with(|| r_seq.cmp(l_seq))
    });

    scored
        .into_iter()
        .take(top_k)
        .map(|(_, record, similarity)| {
            trace!(fact_id = %record.id, similarity, "ranked fact");
            ScoredFact {
                record: record.clone(),
                similarity,
            }
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::schema::{FactKind, Metadata};

    fn fact(content: &str, embedding: Vec<f32>, age_minutes: i64) -> FactRecord {
        let mut record = FactRecord::new(content, FactKind::Plot, None, Metadata::new(), embedding);
        record.created_at = Utc::now() - Duration::minutes(age_minutes);
        record
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn most_similar_first() {
        let near = fact("near", vec![1.0, 0.1], 10);
        let far = fact("far", vec![0.0, 1.0], 0);
        let ranked = rank([(0, &far), (1, &near)], &[1.0, 0.0], 5);
        assert_eq!(ranked[0].record.content, "near");
        assert_eq!(ranked[1].record.content, "far");
        assert!(ranked[0].similarity > ranked[1].similarity);
    }

    #[test]
    fn ties_prefer_most_recent() {
        let old = fact("old", vec![1.0, 0.0], 60);
        let new = fact("new", vec![1.0, 0.0], 1);
        let ranked = rank([(0, &old), (1, &new)], &[1.0, 0.0], 5);
        assert_eq!(ranked[0].record.content, "new");
    }

    #[test]
    fn identical_timestamps_fall_back_to_insertion_order() {
        let a = fact("a", vec![1.0], 5);
        let mut b = fact("b", vec![1.0], 5);
        b.created_at = a.created_at;
        let ranked = rank([(0, &a), (1, &b)], &[1.0], 5);
        assert_eq!(ranked[0].record.content, "b");
        let again = rank([(1, &b), (0, &a)], &[1.0], 5);
        assert_eq!(ranked, again);
    }

    #[test]
    fn top_k_truncates_and_zero_returns_nothing() {
        let facts: Vec<_> = (0..4).map(|i| fact(&i.to_string(), vec![1.0], i)).collect();
        let ranked = rank(facts.iter().enumerate(), &[1.0], 2);
        assert_eq!(ranked.len(), 2);
        assert!(rank(facts.iter().enumerate(), &[1.0], 0).is_empty());
    }
}
