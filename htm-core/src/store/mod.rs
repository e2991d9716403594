//! Storage abstraction.
//!
//! One async trait for swappable persistence backends. The engine ships an
//! in-process [`MemoryStore`](memory::MemoryStore) for tests and inline
//! tools; the `htm-storage-turso` crate provides the durable Turso/libSQL
//! implementation. All operations are async so both styles fit behind the
//! same object.

pub mod memory;
pub mod timed;

use crate::error::Result;
use crate::types::{
    ActiveFilter, FileSource, Metadata, Node, Robot, RobotNode, SearchHit, Tag, TagMatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Fields for a node insert.
#[derive(Debug, Clone)]
pub struct NewNode {
    /// Node content.
    pub content: String,
    /// Precomputed SHA-256 hex digest of `content`.
    pub content_hash: String,
    /// Precomputed token count of `content`.
    pub token_count: usize,
    /// Opaque metadata.
    pub metadata: Metadata,
    /// Owning file source, for chunk nodes.
    pub source_id: Option<i64>,
    /// Chunk position within the file source.
    pub chunk_position: Option<usize>,
}

/// Fields for a file source upsert.
#[derive(Debug, Clone)]
pub struct NewFileSource {
    /// Filesystem path, unique.
    pub path: String,
    /// SHA-256 hex digest of the file content.
    pub content_hash: String,
    /// File modification time.
    pub mtime: DateTime<Utc>,
    /// Parsed frontmatter.
    pub frontmatter: Metadata,
}

/// Common filters for node search primitives.
///
/// Timeframe intervals are half-open `[start, end)` over `created_at` and
/// OR together; an empty list means no time filter.
#[derive(Debug, Clone, Default)]
pub struct NodeQuery {
    /// Maximum rows to return.
    pub limit: usize,
    /// Minimum similarity for score-ranked primitives.
    pub min_similarity: f32,
    /// OR-ed half-open `[start, end)` intervals over `created_at`.
    pub intervals: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    /// Metadata containment filter: every pair must be present on the node.
    pub metadata: Option<Metadata>,
}

impl NodeQuery {
    /// Query with a limit and no filters.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Whether `created_at` falls inside the configured intervals.
    #[must_use]
    pub fn matches_time(&self, created_at: DateTime<Utc>) -> bool {
        self.intervals.is_empty()
            || self
                .intervals
                .iter()
                .any(|(start, end)| created_at >= *start && created_at < *end)
    }

    /// Whether `metadata` satisfies the containment filter.
    #[must_use]
    pub fn matches_metadata(&self, metadata: &Metadata) -> bool {
        self.metadata
            .as_ref()
            .is_none_or(|filter| metadata.contains(filter))
    }
}

/// Ordered stream of pub/sub payloads for one channel subscription.
///
/// Payloads arrive in publication order. The stream ends when the backing
/// subscription lapses; subscribers are expected to resynchronize after a
/// lapse.
pub struct NotificationStream {
    rx: tokio::sync::mpsc::Receiver<String>,
}

impl NotificationStream {
    /// Wrap a receiver fed by the backend's delivery task.
    #[must_use]
    pub fn new(rx: tokio::sync::mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Receive the next payload, or `None` when the subscription lapsed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl futures::Stream for NotificationStream {
    type Item = String;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Unified persistence backend.
///
/// Implementations own every persistent row. All mutations are atomic per
/// call; upserts follow `INSERT ... ON CONFLICT DO UPDATE` semantics.
#[async_trait]
pub trait Store: Send + Sync {
    // ========== Nodes ==========

    /// Insert a node.
    ///
    /// # Errors
    ///
    /// [`crate::Error::DuplicateContent`] when an active node already has
    /// the same content hash; callers reuse that node instead.
    async fn insert_node(&self, new: NewNode) -> Result<Node>;

    /// Fetch a node by id under the given soft-delete filter.
    async fn node_by_id(&self, id: i64, filter: ActiveFilter) -> Result<Option<Node>>;

    /// Fetch a node by content hash under the given soft-delete filter.
    async fn node_by_hash(&self, hash: &str, filter: ActiveFilter) -> Result<Option<Node>>;

    /// Store a padded embedding and its original dimension.
    async fn set_embedding(&self, node_id: i64, padded: Vec<f32>, dimension: usize) -> Result<()>;

    /// Soft-delete a node (set `deleted_at`).
    async fn soft_delete_node(&self, id: i64) -> Result<()>;

    /// Restore a soft-deleted node.
    ///
    /// # Errors
    ///
    /// [`crate::Error::DuplicateContent`] when another active node now
    /// holds the same content hash.
    async fn restore_node(&self, id: i64) -> Result<Node>;

    /// Permanently delete a node and its associations.
    async fn purge_node(&self, id: i64) -> Result<()>;

    /// Batched access tracking: bump `access_count` and `last_accessed`.
    async fn record_access(&self, ids: &[i64]) -> Result<()>;

    /// Count nodes under the given soft-delete filter.
    async fn count_nodes(&self, filter: ActiveFilter) -> Result<usize>;

    // ========== Tags ==========

    /// Insert a tag or revive/return the existing row with this name.
    async fn upsert_tag(&self, name: &str) -> Result<Tag>;

    /// Fetch a tag by exact name.
    async fn tag_by_name(&self, name: &str, filter: ActiveFilter) -> Result<Option<Tag>>;

    /// All active tags with their active node counts, newest first.
    async fn tags_with_counts(&self) -> Result<Vec<(Tag, u64)>>;

    /// Soft-delete tags that no active node references. Returns how many.
    async fn reap_orphan_tags(&self) -> Result<usize>;

    // ========== Node-tag associations ==========

    /// Attach a tag to a node. Returns `false` when already attached.
    async fn attach_tag(&self, node_id: i64, tag_id: i64) -> Result<bool>;

    /// Active tags attached to a node.
    async fn tags_for_node(&self, node_id: i64) -> Result<Vec<Tag>>;

    /// Active nodes attached to any of the given tags, newest first.
    async fn nodes_for_tag_ids(&self, tag_ids: &[i64], limit: usize) -> Result<Vec<Node>>;

    // ========== Robots ==========

    /// Create or fetch a robot by name, updating `last_active_at`.
    async fn upsert_robot(&self, name: &str) -> Result<Robot>;

    /// Record a remember: create the robot_node row or bump its count.
    async fn record_remember(&self, robot_id: i64, node_id: i64) -> Result<RobotNode>;

    /// Fetch a robot_node row.
    async fn robot_node(&self, robot_id: i64, node_id: i64) -> Result<Option<RobotNode>>;

    /// Set the advisory working-memory flag on a robot_node row.
    async fn set_in_working_memory(&self, robot_id: i64, node_id: i64, present: bool)
        -> Result<()>;

    /// Node ids flagged in-working-memory for any of the given robots.
    async fn working_memory_node_ids(&self, robot_ids: &[i64]) -> Result<Vec<i64>>;

    // ========== File sources ==========

    /// Insert or update a file source row by path.
    async fn upsert_file_source(&self, new: NewFileSource) -> Result<FileSource>;

    /// Fetch a file source by path.
    async fn file_source_by_path(&self, path: &str) -> Result<Option<FileSource>>;

    /// Active chunk nodes belonging to a file source, by chunk position.
    async fn nodes_for_source(&self, source_id: i64) -> Result<Vec<Node>>;

    /// Remove a file source and soft-delete its chunk nodes.
    ///
    /// Returns the number of chunk nodes soft-deleted.
    async fn remove_file_source(&self, path: &str) -> Result<usize>;

    // ========== Search primitives (active nodes only) ==========

    /// Rank active embedded nodes by cosine similarity to `embedding`.
    async fn vector_search(&self, query: &NodeQuery, embedding: &[f32]) -> Result<Vec<SearchHit>>;

    /// Rank active nodes by full-text relevance to `text`.
    async fn fulltext_search(&self, query: &NodeQuery, text: &str) -> Result<Vec<SearchHit>>;

    /// Rank active nodes by trigram similarity of content to `text`.
    async fn content_similarity(&self, query: &NodeQuery, text: &str) -> Result<Vec<SearchHit>>;

    /// Rank active tags by trigram similarity of name to `text`.
    async fn tags_by_similarity(
        &self,
        text: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<TagMatch>>;

    // ========== Pub/sub ==========

    /// Publish a payload on a named channel.
    async fn notify(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a named channel.
    ///
    /// Payloads published after the subscription are delivered in
    /// publication order.
    async fn subscribe(&self, channel: &str) -> Result<NotificationStream>;
}
