//! Loading files into memory as chunk nodes.
//!
//! A loaded file becomes a `FileSource` row plus one node per chunk.
//! Reloading is cheap: an unchanged content hash is skipped unless forced.
//! Unloading soft-deletes the chunks, so a reload restores them through the
//! normal dedup path.

use crate::error::{Error, Result};
use crate::long_term::LongTermMemory;
use crate::store::NewFileSource;
use crate::types::{content_hash, Metadata};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, info};

/// Soft target for chunk size; paragraphs merge up to this many tokens.
const CHUNK_TARGET_TOKENS: usize = 400;

/// Result of a load operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    /// The file source row id.
    pub source_id: i64,
    /// Chunk nodes written by this load.
    pub chunks_loaded: usize,
    /// True when the file was unchanged and left alone.
    pub skipped: bool,
}

/// Loads files and directories on behalf of one robot.
pub struct FileLoader {
    ltm: LongTermMemory,
    robot_id: i64,
}

impl FileLoader {
    /// Create a loader bound to a robot identity.
    #[must_use]
    pub fn new(ltm: LongTermMemory, robot_id: i64) -> Self {
        Self { ltm, robot_id }
    }

    /// Load one file, chunking its body into nodes.
    ///
    /// An unchanged file (same content hash) is skipped unless `force`.
    pub async fn load_file(&self, path: impl AsRef<Path>, force: bool) -> Result<LoadOutcome> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();
        let raw = tokio::fs::read_to_string(path).await?;
        let hash = content_hash(&raw);

        let store = self.ltm.store();
        if let Some(existing) = store.file_source_by_path(&path_str).await? {
            if existing.content_hash == hash && !force {
                debug!(path = %path_str, "file unchanged, skipping");
                return Ok(LoadOutcome {
                    source_id: existing.id,
                    chunks_loaded: 0,
                    skipped: true,
                });
            }
            // Changed or forced: drop the stale chunks before rewriting
            store.remove_file_source(&path_str).await?;
        }

        let mtime = file_mtime(path).await?;
        let (frontmatter, body) = split_frontmatter(&raw);
        let source = store
            .upsert_file_source(NewFileSource {
                path: path_str.clone(),
                content_hash: hash,
                mtime,
                frontmatter: frontmatter.clone(),
            })
            .await?;

        let chunks = chunk_body(&body, |text| self.ltm.config().token_counter.count(text));
        let mut loaded = 0;
        for (position, chunk) in chunks.iter().enumerate() {
            let mut metadata = frontmatter.clone();
            metadata.set("source_path", serde_json::json!(path_str));
            self.ltm
                .remember_chunk(self.robot_id, chunk, metadata, source.id, position)
                .await?;
            loaded += 1;
        }

        info!(path = %path_str, chunks = loaded, "file loaded");
        Ok(LoadOutcome {
            source_id: source.id,
            chunks_loaded: loaded,
            skipped: false,
        })
    }

    /// Load every matching file under a directory, recursively.
    ///
    /// `pattern` is a filename suffix (default `.md`).
    pub async fn load_directory(
        &self,
        path: impl AsRef<Path>,
        pattern: Option<&str>,
        force: bool,
    ) -> Result<Vec<LoadOutcome>> {
        let suffix = pattern.unwrap_or(".md").to_string();
        let mut pending = vec![path.as_ref().to_path_buf()];
        let mut files = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry_path);
                } else if entry_path.to_string_lossy().ends_with(&suffix) {
                    files.push(entry_path);
                }
            }
        }
        files.sort();

        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            outcomes.push(self.load_file(&file, force).await?);
        }
        Ok(outcomes)
    }

    /// Unload a file: soft-delete its chunk nodes and drop the source row.
    ///
    /// Returns the number of chunks removed.
    pub async fn unload_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let removed = self.ltm.store().remove_file_source(&path_str).await?;
        self.ltm.invalidate_cache();
        info!(path = %path_str, removed, "file unloaded");
        Ok(removed)
    }
}

async fn file_mtime(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await?;
    let modified = metadata
        .modified()
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Split an optional `---` frontmatter block off the top of the file.
///
/// Frontmatter is simple `key: value` lines; values that parse as JSON
/// scalars keep their type, everything else stays a string.
fn split_frontmatter(raw: &str) -> (Metadata, String) {
    let mut metadata = Metadata::new();
    let Some(rest) = raw.strip_prefix("---\n") else {
        return (metadata, raw.to_string());
    };
    let Some(end) = rest.find("\n---") else {
        return (metadata, raw.to_string());
    };

    for line in rest[..end].lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        let json = value
            .parse::<serde_json::Value>()
            .unwrap_or_else(|_| serde_json::json!(value));
        metadata.set(key, json);
    }

    let body = rest[end + 4..].trim_start_matches('\n').to_string();
    (metadata, body)
}

/// Split a body into paragraph-aligned chunks near the token target.
fn chunk_body(body: &str, count_tokens: impl Fn(&str) -> usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for paragraph in body.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let tokens = count_tokens(paragraph);
        if !current.is_empty() && current_tokens + tokens > CHUNK_TARGET_TOKENS {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_is_split_and_typed() {
        let raw = "---\ntitle: Notes\ncount: 3\n---\n\nBody text here.";
        let (meta, body) = split_frontmatter(raw);
        assert_eq!(meta.get("title"), Some(&serde_json::json!("Notes")));
        assert_eq!(meta.get("count"), Some(&serde_json::json!(3)));
        assert_eq!(body, "Body text here.");
    }

    #[test]
    fn missing_frontmatter_passes_body_through() {
        let raw = "Just a plain file.\n\nTwo paragraphs.";
        let (meta, body) = split_frontmatter(raw);
        assert!(meta.is_empty());
        assert_eq!(body, raw);
    }

    #[test]
    fn unterminated_frontmatter_is_treated_as_body() {
        let raw = "---\ntitle: Broken\nno closing fence";
        let (meta, body) = split_frontmatter(raw);
        assert!(meta.is_empty());
        assert_eq!(body, raw);
    }

    #[test]
    fn chunking_merges_small_paragraphs() {
        let body = "one\n\ntwo\n\nthree";
        let chunks = chunk_body(body, |_| 10);
        assert_eq!(chunks, vec!["one\n\ntwo\n\nthree".to_string()]);
    }

    #[test]
    fn chunking_splits_at_the_token_target() {
        let body = "first paragraph\n\nsecond paragraph\n\nthird paragraph";
        let chunks = chunk_body(body, |_| 300);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "first paragraph");
    }

    #[test]
    fn empty_body_yields_no_chunks() {
        assert!(chunk_body("", |_| 1).is_empty());
        assert!(chunk_body("\n\n\n\n", |_| 1).is_empty());
    }
}
