//! Common types shared across the memory engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

// ============================================================================
// Validation Constants
// ============================================================================

/// Maximum content size per node (1 MiB).
///
/// Prevents unbounded input strings from exhausting memory during hashing,
/// token counting, or storage operations.
pub const MAX_CONTENT_BYTES: usize = 1_048_576;

/// Fixed storage width for embeddings.
///
/// Vectors shorter than this are zero-padded with the original dimension
/// recorded; longer vectors are rejected.
pub const STORAGE_EMBEDDING_WIDTH: usize = 2000;

/// Maximum number of manual tags accepted by a single `remember` call.
pub const MAX_MANUAL_TAGS: usize = 1000;

/// Maximum hierarchy depth for tag names (`root:a:b:c`).
pub const DEFAULT_MAX_TAG_DEPTH: usize = 4;

/// Compute the SHA-256 hex digest of node content.
///
/// This is the deduplication key: two active nodes never share a hash.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Soft-delete filtering
// ============================================================================

/// Explicit soft-delete filter for store queries.
///
/// There is no hidden default scope: every query states which rows it wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveFilter {
    /// Rows with `deleted_at IS NULL`.
    #[default]
    Active,
    /// Rows with `deleted_at IS NOT NULL`.
    Deleted,
    /// All rows regardless of deletion state.
    All,
}

// ============================================================================
// Metadata
// ============================================================================

/// Opaque key-value metadata attached to a node or file source.
///
/// Persisted as a JSON map. Well-known keys get typed accessors; everything
/// else goes through [`Metadata::get`] / [`Metadata::set`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(pub HashMap<String, serde_json::Value>);

impl Metadata {
    /// Create an empty metadata map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an arbitrary metadata value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Set an arbitrary metadata value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    /// Whether this node was stored as a proposition.
    #[must_use]
    pub fn is_proposition(&self) -> bool {
        self.get("is_proposition")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Id of the node this content was derived from, if any.
    #[must_use]
    pub fn source_node_id(&self) -> Option<i64> {
        self.get("source_node_id").and_then(serde_json::Value::as_i64)
    }

    /// True when every `(key, value)` pair in `other` is present here.
    ///
    /// This is the containment predicate used by metadata search filters.
    #[must_use]
    pub fn contains(&self, other: &Metadata) -> bool {
        other.0.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, serde_json::Value>> for Metadata {
    fn from(map: HashMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A unit of remembered content.
///
/// Created on the first `remember` of a given content hash, asynchronously
/// enriched with an embedding and tags, soft-deletable and restorable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Monotonic row id.
    pub id: i64,
    /// The remembered text (at most [`MAX_CONTENT_BYTES`]).
    pub content: String,
    /// SHA-256 hex digest of `content`, unique among active nodes.
    pub content_hash: String,
    /// Token count of `content` under the configured counter.
    pub token_count: usize,
    /// Embedding padded to [`STORAGE_EMBEDDING_WIDTH`], when enriched.
    pub embedding: Option<Vec<f32>>,
    /// Original embedding dimension before padding.
    pub embedding_dimension: Option<usize>,
    /// File source this node was chunked from, if any.
    pub source_id: Option<i64>,
    /// Position of this chunk within its file source.
    pub chunk_position: Option<usize>,
    /// Opaque metadata map.
    pub metadata: Metadata,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Last time a read returned this node.
    pub last_accessed: Option<DateTime<Utc>>,
    /// Number of reads that returned this node.
    pub access_count: u64,
    /// Soft-delete marker; `None` means active.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Whether the node is active (not soft-deleted).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// A single hierarchical label, colon-delimited (`root:level1:...`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Monotonic row id.
    pub id: i64,
    /// Unique, case-sensitive name matching the tag grammar.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker; `None` means active.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Tag {
    /// First segment of the name.
    #[must_use]
    pub fn root(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }

    /// All but the last segment, or `None` for root tags.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.name.rfind(':').map(|idx| &self.name[..idx])
    }

    /// Number of segments.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.name.split(':').count()
    }

    /// Whether the tag is active (not soft-deleted).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Many-to-many association between a node and a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTag {
    /// Monotonic row id.
    pub id: i64,
    /// Node side of the association.
    pub node_id: i64,
    /// Tag side of the association.
    pub tag_id: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker; `None` means active.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// An agent identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Robot {
    /// Monotonic row id.
    pub id: i64,
    /// Unique robot name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time this robot performed any operation.
    pub last_active_at: DateTime<Utc>,
}

/// A robot's relationship to a node it has remembered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotNode {
    /// Monotonic row id.
    pub id: i64,
    /// Robot side of the association.
    pub robot_id: i64,
    /// Node side of the association.
    pub node_id: i64,
    /// First time this robot remembered the node.
    pub first_remembered_at: DateTime<Utc>,
    /// Most recent time this robot remembered the node.
    pub last_remembered_at: DateTime<Utc>,
    /// How many times this robot has remembered the node (at least 1).
    pub remember_count: u64,
    /// Whether the node is currently in this robot's working memory.
    pub in_working_memory: bool,
}

/// A file that was loaded into memory as chunk nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSource {
    /// Monotonic row id.
    pub id: i64,
    /// Unique filesystem path.
    pub path: String,
    /// SHA-256 hex digest of the file content at last sync.
    pub content_hash: String,
    /// File modification time at last sync.
    pub mtime: DateTime<Utc>,
    /// Parsed frontmatter, when the file carried any.
    pub frontmatter: Metadata,
    /// Last time the file was (re)loaded.
    pub last_synced_at: DateTime<Utc>,
}

// ============================================================================
// Search results
// ============================================================================

/// One scored row returned by a search primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// The matched node.
    pub node: Node,
    /// Strategy-specific relevance score, higher is better.
    pub score: f32,
}

impl SearchHit {
    /// Create a hit from a node and score.
    #[must_use]
    pub fn new(node: Node, score: f32) -> Self {
        Self { node, score }
    }
}

/// A tag matched by trigram similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMatch {
    /// The matched tag.
    pub tag: Tag,
    /// Trigram similarity to the query, in `[0, 1]`.
    pub similarity: f32,
}
