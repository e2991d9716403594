//! Hierarchical tag ontology.
//!
//! Tag names are colon-delimited paths (`project:htm:search`) validated
//! against a closed grammar. The index materializes the ontology as a tree
//! for display, supplies a bounded sample to the tag extractor prompt, and
//! reaps tags no active node references.

use crate::error::Result;
use crate::store::Store;
use crate::types::Tag;
use rand::{Rng, RngExt};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Grammar every tag name must match: lowercase alphanumeric/hyphen
/// segments joined by colons.
pub const TAG_NAME_PATTERN: &str = "^[a-z0-9-]+(:[a-z0-9-]+)*$";

fn tag_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TAG_NAME_PATTERN).unwrap_or_else(|_| Regex::new("$^").unwrap()))
}

/// Whether `name` matches the tag grammar within the depth limit.
#[must_use]
pub fn is_valid_tag_name(name: &str, max_depth: usize) -> bool {
    if name.is_empty() || !tag_name_regex().is_match(name) {
        return false;
    }
    name.split(':').count() <= max_depth
}

/// One level of the materialized ontology tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagTree {
    /// Child segments, ordered by name.
    pub children: BTreeMap<String, TagTree>,
}

impl TagTree {
    /// Build a tree from tag names, optionally filtered to a prefix.
    ///
    /// The prefix matches whole segments: `"code"` keeps `code` and
    /// `code:rust` but not `codex`.
    #[must_use]
    pub fn build<'a>(names: impl IntoIterator<Item = &'a str>, prefix: Option<&str>) -> Self {
        let mut root = TagTree::default();
        for name in names {
            if let Some(prefix) = prefix {
                if name != prefix && !name.starts_with(&format!("{prefix}:")) {
                    continue;
                }
            }
            let mut cursor = &mut root;
            for segment in name.split(':') {
                cursor = cursor.children.entry(segment.to_string()).or_default();
            }
        }
        root
    }

    /// Render as an indented text tree.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        self.render_text_level(&mut out, 0);
        out
    }

    fn render_text_level(&self, out: &mut String, depth: usize) {
        for (name, child) in &self.children {
            out.push_str(&"  ".repeat(depth));
            out.push_str(name);
            out.push('\n');
            child.render_text_level(out, depth + 1);
        }
    }

    /// Render as a Mermaid flowchart.
    #[must_use]
    pub fn render_mermaid(&self) -> String {
        let mut out = String::from("flowchart TD\n");
        self.render_mermaid_level(&mut out, None);
        out
    }

    fn render_mermaid_level(&self, out: &mut String, parent: Option<&str>) {
        for (name, child) in &self.children {
            let path = match parent {
                Some(parent) => format!("{parent}:{name}"),
                None => name.clone(),
            };
            let node_id = path.replace([':', '-'], "_");
            out.push_str(&format!("    {node_id}[\"{name}\"]\n"));
            if let Some(parent) = parent {
                let parent_id = parent.replace([':', '-'], "_");
                out.push_str(&format!("    {parent_id} --> {node_id}\n"));
            }
            child.render_mermaid_level(out, Some(&path));
        }
    }

    /// Render as a minimal SVG listing, one line per tag path segment.
    #[must_use]
    pub fn render_svg(&self) -> String {
        let mut lines = Vec::new();
        self.collect_lines(&mut lines, 0);
        let height = lines.len() * 20 + 20;
        let mut out = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"640\" height=\"{height}\">\n"
        );
        for (i, (depth, name)) in lines.iter().enumerate() {
            let x = 10 + depth * 24;
            let y = 20 + i * 20;
            out.push_str(&format!(
                "  <text x=\"{x}\" y=\"{y}\" font-family=\"monospace\" font-size=\"14\">{name}</text>\n"
            ));
        }
        out.push_str("</svg>\n");
        out
    }

    fn collect_lines(&self, lines: &mut Vec<(usize, String)>, depth: usize) {
        for (name, child) in &self.children {
            lines.push((depth, name.clone()));
            child.collect_lines(lines, depth + 1);
        }
    }

    /// Number of distinct segments in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children
            .values()
            .map(|c| 1 + c.len())
            .sum()
    }

    /// Whether the tree has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// The shared tag ontology, always rederived from the store for freshness.
#[derive(Clone)]
pub struct TagIndex {
    store: Arc<dyn Store>,
    max_depth: usize,
    sample_size: usize,
}

impl TagIndex {
    /// Create an index over the store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, max_depth: usize, sample_size: usize) -> Self {
        Self {
            store,
            max_depth,
            sample_size,
        }
    }

    /// Whether `name` is acceptable under the configured depth limit.
    #[must_use]
    pub fn validate(&self, name: &str) -> bool {
        is_valid_tag_name(name, self.max_depth)
    }

    /// Materialize the active ontology as a tree.
    pub async fn tree(&self, prefix: Option<&str>) -> Result<TagTree> {
        let rows = self.store.tags_with_counts().await?;
        Ok(TagTree::build(
            rows.iter().map(|(tag, _)| tag.name.as_str()),
            prefix,
        ))
    }

    /// All active tags, newest first.
    pub async fn all(&self) -> Result<Vec<Tag>> {
        let rows = self.store.tags_with_counts().await?;
        Ok(rows.into_iter().map(|(tag, _)| tag).collect())
    }

    /// A recency- and popularity-weighted sample of active tag names.
    ///
    /// Bounded at the configured sample size so the extraction prompt stays
    /// small while anchoring the extractor to existing conventions.
    pub async fn ontology_sample(&self) -> Result<Vec<String>> {
        let rows = self.store.tags_with_counts().await?;
        Ok(weighted_sample(rows, self.sample_size, &mut rand::rng()))
    }

    /// Soft-delete tags with no active node references.
    pub async fn reap_orphans(&self) -> Result<usize> {
        let reaped = self.store.reap_orphan_tags().await?;
        if reaped > 0 {
            debug!(reaped, "reaped orphan tags");
        }
        Ok(reaped)
    }
}

/// Weighted reservoir sample (A-Res): weight = usage count plus a recency
/// bonus for the newest quartile, so popular and fresh names both surface.
fn weighted_sample<R: Rng>(rows: Vec<(Tag, u64)>, cap: usize, rng: &mut R) -> Vec<String> {
    if rows.len() <= cap {
        return rows.into_iter().map(|(tag, _)| tag.name).collect();
    }

    let recent_cutoff = rows.len() / 4;
    let mut keyed: Vec<(f64, String)> = rows
        .into_iter()
        .enumerate()
        .map(|(rank, (tag, count))| {
            // Rows arrive newest first; the newest quartile gets a bonus
            let recency_bonus = if rank < recent_cutoff { 2.0 } else { 0.0 };
            let weight = count as f64 + 1.0 + recency_bonus;
            let key = rng.random::<f64>().powf(1.0 / weight);
            (key, tag.name)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    keyed.truncate(cap);
    keyed.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn grammar_accepts_hierarchical_names() {
        assert!(is_valid_tag_name("code", 4));
        assert!(is_valid_tag_name("code:rust:async-await", 4));
        assert!(is_valid_tag_name("a-1:b-2", 4));
    }

    #[test]
    fn grammar_rejects_bad_names() {
        assert!(!is_valid_tag_name("", 4));
        assert!(!is_valid_tag_name("Code", 4));
        assert!(!is_valid_tag_name("has space", 4));
        assert!(!is_valid_tag_name("trailing:", 4));
        assert!(!is_valid_tag_name(":leading", 4));
        assert!(!is_valid_tag_name("a::b", 4));
        assert!(!is_valid_tag_name("über", 4));
    }

    #[test]
    fn grammar_enforces_depth() {
        assert!(is_valid_tag_name("a:b:c:d", 4));
        assert!(!is_valid_tag_name("a:b:c:d:e", 4));
        assert!(is_valid_tag_name("a:b:c:d:e", 5));
    }

    #[test]
    fn tree_assembles_nested_paths() {
        let tree = TagTree::build(
            ["code:rust", "code:ruby", "code:rust:async", "ops"],
            None,
        );
        assert_eq!(tree.children.len(), 2);
        let code = &tree.children["code"];
        assert_eq!(code.children.len(), 2);
        assert!(code.children["rust"].children.contains_key("async"));
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn tree_prefix_filter_matches_whole_segments() {
        let tree = TagTree::build(["code:rust", "codex:misc", "ops"], Some("code"));
        assert_eq!(tree.children.len(), 1);
        assert!(tree.children.contains_key("code"));
    }

    #[test]
    fn text_rendering_indents_by_depth() {
        let tree = TagTree::build(["code:rust", "ops"], None);
        assert_eq!(tree.render_text(), "code\n  rust\nops\n");
    }

    #[test]
    fn mermaid_rendering_links_parents() {
        let tree = TagTree::build(["code:rust"], None);
        let rendered = tree.render_mermaid();
        assert!(rendered.starts_with("flowchart TD\n"));
        assert!(rendered.contains("code[\"code\"]"));
        assert!(rendered.contains("code --> code_rust"));
    }

    #[test]
    fn svg_rendering_emits_one_text_per_segment() {
        let tree = TagTree::build(["code:rust", "ops"], None);
        let rendered = tree.render_svg();
        assert_eq!(rendered.matches("<text").count(), 3);
        assert!(rendered.starts_with("<svg"));
    }

    #[test]
    fn sample_returns_everything_under_cap() {
        let rows: Vec<(Tag, u64)> = (0..5)
            .map(|i| {
                (
                    Tag {
                        id: i,
                        name: format!("tag-{i}"),
                        created_at: Utc::now(),
                        deleted_at: None,
                    },
                    i as u64,
                )
            })
            .collect();
        let sample = weighted_sample(rows, 100, &mut rand::rng());
        assert_eq!(sample.len(), 5);
    }

    #[test]
    fn sample_is_capped_and_biased_to_popular() {
        let rows: Vec<(Tag, u64)> = (0..500)
            .map(|i| {
                (
                    Tag {
                        id: i,
                        name: format!("tag-{i}"),
                        created_at: Utc::now(),
                        deleted_at: None,
                    },
                    // Tag 250 is overwhelmingly popular
                    if i == 250 { 100_000 } else { 0 },
                )
            })
            .collect();
        let sample = weighted_sample(rows, 100, &mut rand::rng());
        assert_eq!(sample.len(), 100);
        assert!(sample.contains(&"tag-250".to_string()));
    }
}
