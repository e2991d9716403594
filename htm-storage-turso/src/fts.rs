//! FTS5 virtual table for node content.
//!
//! The virtual table is synchronized with `nodes` via triggers so full-text
//! state never drifts from the source rows. Tokenizer: porter unicode61,
//! which gives English stemming ("databases" matches "database") and
//! Unicode-aware word breaks.

/// FTS5 table indexing node content; `node_id` is UNINDEXED and only
/// carried for joins.
pub const CREATE_NODES_FTS_TABLE: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS nodes_fts USING fts5(
    node_id UNINDEXED,
    content,
    tokenize='porter unicode61'
)
"#;

/// Triggers keeping `nodes_fts` in sync with `nodes`.
pub const CREATE_NODES_FTS_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS nodes_ai AFTER INSERT ON nodes BEGIN
    INSERT INTO nodes_fts(node_id, content) VALUES (new.id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS nodes_au AFTER UPDATE OF content ON nodes BEGIN
    UPDATE nodes_fts SET content = new.content WHERE node_id = new.id;
END;

CREATE TRIGGER IF NOT EXISTS nodes_ad AFTER DELETE ON nodes BEGIN
    DELETE FROM nodes_fts WHERE node_id = old.id;
END;
"#;

/// Build an FTS5 MATCH expression from free-form query text.
///
/// Terms are stripped to alphanumerics and OR-ed, so punctuation in user
/// queries can never escape into FTS syntax. Returns `None` when no
/// searchable term remains.
#[must_use]
pub fn match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Map a bm25 rank (lower is better, best matches most negative) onto a
/// `(0, 1]` relevance score.
#[must_use]
pub fn rank_to_score(rank: f64) -> f32 {
    let goodness = (-rank).max(0.0);
    (goodness / (1.0 + goodness)) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_expression_quotes_and_ors() {
        assert_eq!(
            match_expression("PostgreSQL indexes!"),
            Some("\"PostgreSQL\" OR \"indexes\"".to_string())
        );
    }

    #[test]
    fn match_expression_rejects_empty() {
        assert_eq!(match_expression("  ... "), None);
        assert_eq!(match_expression(""), None);
    }

    #[test]
    fn rank_scores_are_monotonic() {
        let strong = rank_to_score(-5.0);
        let weak = rank_to_score(-0.5);
        assert!(strong > weak);
        assert!(strong <= 1.0);
        assert!(rank_to_score(0.0) == 0.0);
    }
}
