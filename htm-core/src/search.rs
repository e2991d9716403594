//! Pure scoring functions for the retrieval pipeline.
//!
//! Hybrid retrieval combines:
//! 1. Vector similarity (semantic understanding)
//! 2. Full-text relevance (keyword matching)
//! 3. Tag overlap with the query (ontology signal)
//!
//! Scores from the store primitives are merged here with a weighted linear
//! combination. The engine uses the weighted sum throughout; reciprocal
//! rank fusion is not used.

use crate::config::SearchWeights;
use crate::types::{Node, SearchHit};
use std::collections::HashMap;

/// Cosine similarity between two vectors of equal length.
///
/// Returns 0.0 for mismatched lengths or zero-norm inputs.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Character-trigram similarity between two strings, in `[0, 1]`.
///
/// Jaccard overlap of padded lowercase trigram sets, the same measure
/// trigram database indexes rank by. Used for typo-tolerant tag search and
/// fuzzy content matching.
#[must_use]
pub fn trigram_similarity(a: &str, b: &str) -> f32 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return if a.eq_ignore_ascii_case(b) { 1.0 } else { 0.0 };
    }
    let shared = ta.iter().filter(|t| tb.contains(*t)).count();
    let union = ta.len() + tb.len() - shared;
    if union == 0 {
        return 0.0;
    }
    shared as f32 / union as f32
}

fn trigrams(text: &str) -> Vec<String> {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut grams = Vec::new();
    for word in normalized.split_whitespace() {
        let padded: Vec<char> = format!("  {word} ").chars().collect();
        for window in padded.windows(3) {
            let gram: String = window.iter().collect();
            if !grams.contains(&gram) {
                grams.push(gram);
            }
        }
    }
    grams
}

/// Relevance of `content` to `query` under naive stemmed token matching.
///
/// The in-process store's stand-in for database-native full-text ranking:
/// the fraction of query terms present in the content, weighted by term
/// frequency. Zero when no term matches.
#[must_use]
pub fn fulltext_score(content: &str, query: &str) -> f32 {
    let content_terms: Vec<String> = tokenize(content);
    let query_terms: Vec<String> = tokenize(query);
    if query_terms.is_empty() || content_terms.is_empty() {
        return 0.0;
    }

    let mut frequencies: HashMap<&str, usize> = HashMap::new();
    for term in &content_terms {
        *frequencies.entry(term.as_str()).or_insert(0) += 1;
    }

    let mut matched = 0usize;
    let mut weight = 0.0f32;
    for term in &query_terms {
        if let Some(count) = frequencies.get(term.as_str()) {
            matched += 1;
            weight += 1.0 + (*count as f32).ln();
        }
    }
    if matched == 0 {
        return 0.0;
    }
    let coverage = matched as f32 / query_terms.len() as f32;
    coverage * (weight / query_terms.len() as f32).min(2.0) / 2.0 + coverage * 0.5
}

/// Lowercase alphanumeric tokens with a light English suffix strip.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1)
        .map(stem)
        .collect()
}

// A porter-light pass: drop common inflection suffixes so "databases"
// matches "database". Not a full stemmer; the durable backend uses the
// database's own porter tokenizer.
fn stem(word: &str) -> String {
    for suffix in ["ing", "edly", "ed", "ies", "es", "s"] {
        if word.len() > suffix.len() + 2 {
            if let Some(stripped) = word.strip_suffix(suffix) {
                return stripped.to_string();
            }
        }
    }
    word.to_string()
}

/// Tag overlap boost for one candidate, in `[0, 1]`.
///
/// The fraction of the candidate's tags that either prefix-match a
/// query-derived tag or textually occur in the query.
#[must_use]
pub fn tag_boost(candidate_tags: &[String], query: &str, query_tags: &[String]) -> f32 {
    if candidate_tags.is_empty() {
        return 0.0;
    }
    let query_lower = query.to_lowercase();
    let matched = candidate_tags
        .iter()
        .filter(|tag| {
            query_tags
                .iter()
                .any(|qt| qt.starts_with(tag.as_str()) || tag.starts_with(qt.as_str()))
                || tag
                    .split(':')
                    .any(|segment| query_lower.contains(segment))
        })
        .count();
    matched as f32 / candidate_tags.len().max(1) as f32
}

/// One candidate entering the hybrid merge.
#[derive(Debug, Clone)]
pub struct HybridCandidate {
    /// The node under consideration.
    pub node: Node,
    /// Vector similarity, when the vector side produced this candidate.
    pub vector_score: f32,
    /// Full-text relevance, when the lexical side produced this candidate.
    pub fts_score: f32,
    /// Tag overlap boost.
    pub tag_boost: f32,
}

/// Merge vector and full-text result sets and rank by the weighted sum.
///
/// Candidates are merged by node id; a candidate missing from one side
/// contributes zero for that component. `combined = w_vec * max(vector,
/// fts) + w_tag * tag_boost` with the lexical score standing in for vector
/// similarity when it is the stronger signal, so an exact keyword match is
/// never buried by embedding noise. Ties break by recency. Truncated to
/// `limit`.
#[must_use]
pub fn merge_hybrid(
    candidates: Vec<HybridCandidate>,
    weights: SearchWeights,
    limit: usize,
) -> Vec<SearchHit> {
    let mut scored: Vec<(f32, Node)> = candidates
        .into_iter()
        .map(|c| {
            let semantic = c.vector_score.max(c.fts_score);
            let combined = weights.vector * semantic + weights.tag * c.tag_boost;
            (combined, c.node)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.created_at.cmp(&a.1.created_at))
    });
    scored.truncate(limit);
    scored
        .into_iter()
        .map(|(score, node)| SearchHit::new(node, score))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use chrono::Utc;

    fn node(id: i64, content: &str) -> Node {
        Node {
            id,
            content: content.to_string(),
            content_hash: crate::types::content_hash(content),
            token_count: 4,
            embedding: None,
            embedding_dimension: None,
            source_id: None,
            chunk_position: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_accessed: None,
            access_count: 0,
            deleted_at: None,
        }
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.2, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn cosine_handles_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn trigram_exact_match_is_one() {
        assert!((trigram_similarity("database", "database") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn trigram_typo_scores_high() {
        let score = trigram_similarity("databases", "databses");
        assert!(score > 0.3, "typo should keep shared trigrams, got {score}");
        assert!(trigram_similarity("databases", "xyz") < 0.05);
    }

    #[test]
    fn fulltext_matches_stemmed_terms() {
        let score = fulltext_score("PostgreSQL is a relational database", "databases");
        assert!(score > 0.0);
        assert_eq!(
            fulltext_score("Mongo is a document store", "PostgreSQL"),
            0.0
        );
    }

    #[test]
    fn tag_boost_counts_query_overlap() {
        let tags = vec!["code:rust".to_string(), "databases:postgres".to_string()];
        let boost = tag_boost(&tags, "how do we configure postgres", &[]);
        assert!((boost - 0.5).abs() < 1e-6);
        assert_eq!(tag_boost(&[], "anything", &[]), 0.0);
    }

    #[test]
    fn tag_boost_prefix_matches_query_tags() {
        let tags = vec!["code:rust:async".to_string()];
        let query_tags = vec!["code:rust".to_string()];
        assert!((tag_boost(&tags, "", &query_tags) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn merge_prefers_exact_lexical_match_over_vector_noise() {
        let candidates = vec![
            HybridCandidate {
                node: node(1, "PostgreSQL is relational"),
                vector_score: 0.4,
                fts_score: 0.9,
                tag_boost: 0.0,
            },
            HybridCandidate {
                node: node(2, "Mongo is a document store"),
                vector_score: 0.6,
                fts_score: 0.0,
                tag_boost: 0.0,
            },
        ];
        let hits = merge_hybrid(candidates, SearchWeights::default(), 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node.id, 1);
    }

    #[test]
    fn merge_truncates_and_orders_descending() {
        let candidates: Vec<HybridCandidate> = (1..=5)
            .map(|i| HybridCandidate {
                node: node(i, "x"),
                vector_score: i as f32 / 10.0,
                fts_score: 0.0,
                tag_boost: 0.0,
            })
            .collect();
        let hits = merge_hybrid(candidates, SearchWeights::default(), 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].node.id, 5);
        assert!(hits[0].score >= hits[1].score && hits[1].score >= hits[2].score);
    }
}
