//! In-process reference store.
//!
//! Backs unit tests, inline CLIs, and single-process deployments. The same
//! scoring functions the durable backend applies in Rust run here over
//! plain maps, so results are comparable across backends.

use super::{NewFileSource, NewNode, NodeQuery, NotificationStream, Store};
use crate::error::{Error, Result};
use crate::search::{cosine_similarity, fulltext_score, trigram_similarity};
use crate::types::{
    ActiveFilter, FileSource, Node, NodeTag, Robot, RobotNode, SearchHit, Tag, TagMatch,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Broadcast buffer per channel; a subscriber that falls further behind
/// than this lapses and must resynchronize.
const CHANNEL_CAPACITY: usize = 256;

fn matches_filter(deleted_at: Option<chrono::DateTime<Utc>>, filter: ActiveFilter) -> bool {
    match filter {
        ActiveFilter::Active => deleted_at.is_none(),
        ActiveFilter::Deleted => deleted_at.is_some(),
        ActiveFilter::All => true,
    }
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<i64, Node>,
    tags: HashMap<i64, Tag>,
    node_tags: Vec<NodeTag>,
    robots: HashMap<i64, Robot>,
    robot_nodes: HashMap<(i64, i64), RobotNode>,
    file_sources: HashMap<i64, FileSource>,
    next_node_id: i64,
    next_tag_id: i64,
    next_node_tag_id: i64,
    next_robot_id: i64,
    next_robot_node_id: i64,
    next_source_id: i64,
}

impl Inner {
    fn node_matches_query(&self, node: &Node, query: &NodeQuery) -> bool {
        node.is_active() && query.matches_time(node.created_at) && query.matches_metadata(&node.metadata)
    }

    fn active_tag_ids_for_node(&self, node_id: i64) -> Vec<i64> {
        self.node_tags
            .iter()
            .filter(|nt| nt.node_id == node_id && nt.deleted_at.is_none())
            .map(|nt| nt.tag_id)
            .collect()
    }
}

/// In-process [`Store`] over tokio-guarded maps with broadcast pub/sub.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    channels: parking_lot::Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn channel_sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_node(&self, new: NewNode) -> Result<Node> {
        let mut inner = self.inner.write().await;
        let collision = inner
            .nodes
            .values()
            .any(|n| n.is_active() && n.content_hash == new.content_hash);
        if collision {
            return Err(Error::DuplicateContent(new.content_hash));
        }

        inner.next_node_id += 1;
        let now = Utc::now();
        let node = Node {
            id: inner.next_node_id,
            content: new.content,
            content_hash: new.content_hash,
            token_count: new.token_count,
            embedding: None,
            embedding_dimension: None,
            source_id: new.source_id,
            chunk_position: new.chunk_position,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
            last_accessed: None,
            access_count: 0,
            deleted_at: None,
        };
        inner.nodes.insert(node.id, node.clone());
        debug!(node_id = node.id, "inserted node");
        Ok(node)
    }

    async fn node_by_id(&self, id: i64, filter: ActiveFilter) -> Result<Option<Node>> {
        let inner = self.inner.read().await;
        Ok(inner
            .nodes
            .get(&id)
            .filter(|n| matches_filter(n.deleted_at, filter))
            .cloned())
    }

    async fn node_by_hash(&self, hash: &str, filter: ActiveFilter) -> Result<Option<Node>> {
        let inner = self.inner.read().await;
        Ok(inner
            .nodes
            .values()
            .find(|n| n.content_hash == hash && matches_filter(n.deleted_at, filter))
            .cloned())
    }

    async fn set_embedding(&self, node_id: i64, padded: Vec<f32>, dimension: usize) -> Result<()> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| Error::node_not_found(node_id))?;
        node.embedding = Some(padded);
        node.embedding_dimension = Some(dimension);
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn soft_delete_node(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::node_not_found(id))?;
        node.deleted_at = Some(Utc::now());
        node.updated_at = Utc::now();
        Ok(())
    }

    async fn restore_node(&self, id: i64) -> Result<Node> {
        let mut inner = self.inner.write().await;
        let hash = inner
            .nodes
            .get(&id)
            .ok_or_else(|| Error::node_not_found(id))?
            .content_hash
            .clone();
        let collision = inner
            .nodes
            .values()
            .any(|n| n.id != id && n.is_active() && n.content_hash == hash);
        if collision {
            return Err(Error::DuplicateContent(hash));
        }
        let node = inner.nodes.get_mut(&id).ok_or_else(|| Error::node_not_found(id))?;
        node.deleted_at = None;
        node.updated_at = Utc::now();
        Ok(node.clone())
    }

    async fn purge_node(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.nodes.remove(&id).is_none() {
            return Err(Error::node_not_found(id));
        }
        inner.node_tags.retain(|nt| nt.node_id != id);
        inner.robot_nodes.retain(|(_, node_id), _| *node_id != id);
        Ok(())
    }

    async fn record_access(&self, ids: &[i64]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        for id in ids {
            if let Some(node) = inner.nodes.get_mut(id) {
                node.access_count += 1;
                node.last_accessed = Some(now);
            }
        }
        Ok(())
    }

    async fn count_nodes(&self, filter: ActiveFilter) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .nodes
            .values()
            .filter(|n| matches_filter(n.deleted_at, filter))
            .count())
    }

    async fn upsert_tag(&self, name: &str) -> Result<Tag> {
        let mut inner = self.inner.write().await;
        if let Some(tag) = inner.tags.values_mut().find(|t| t.name == name) {
            // Revive a soft-deleted row rather than duplicating the name
            tag.deleted_at = None;
            return Ok(tag.clone());
        }
        inner.next_tag_id += 1;
        let tag = Tag {
            id: inner.next_tag_id,
            name: name.to_string(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        inner.tags.insert(tag.id, tag.clone());
        Ok(tag)
    }

    async fn tag_by_name(&self, name: &str, filter: ActiveFilter) -> Result<Option<Tag>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tags
            .values()
            .find(|t| t.name == name && matches_filter(t.deleted_at, filter))
            .cloned())
    }

    async fn tags_with_counts(&self) -> Result<Vec<(Tag, u64)>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<(Tag, u64)> = inner
            .tags
            .values()
            .filter(|t| t.is_active())
            .map(|t| {
                let count = inner
                    .node_tags
                    .iter()
                    .filter(|nt| {
                        nt.tag_id == t.id
                            && nt.deleted_at.is_none()
                            && inner.nodes.get(&nt.node_id).is_some_and(Node::is_active)
                    })
                    .count() as u64;
                (t.clone(), count)
            })
            .collect();
        rows.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at));
        Ok(rows)
    }

    async fn reap_orphan_tags(&self) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let referenced: Vec<i64> = inner
            .node_tags
            .iter()
            .filter(|nt| {
                nt.deleted_at.is_none()
                    && inner.nodes.get(&nt.node_id).is_some_and(Node::is_active)
            })
            .map(|nt| nt.tag_id)
            .collect();
        let now = Utc::now();
        let mut reaped = 0;
        for tag in inner.tags.values_mut() {
            if tag.is_active() && !referenced.contains(&tag.id) {
                tag.deleted_at = Some(now);
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn attach_tag(&self, node_id: i64, tag_id: i64) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .node_tags
            .iter_mut()
            .find(|nt| nt.node_id == node_id && nt.tag_id == tag_id)
        {
            if existing.deleted_at.is_none() {
                return Ok(false);
            }
            existing.deleted_at = None;
            return Ok(true);
        }
        inner.next_node_tag_id += 1;
        let row = NodeTag {
            id: inner.next_node_tag_id,
            node_id,
            tag_id,
            created_at: Utc::now(),
            deleted_at: None,
        };
        inner.node_tags.push(row);
        Ok(true)
    }

    async fn tags_for_node(&self, node_id: i64) -> Result<Vec<Tag>> {
        let inner = self.inner.read().await;
        let tag_ids = inner.active_tag_ids_for_node(node_id);
        Ok(inner
            .tags
            .values()
            .filter(|t| t.is_active() && tag_ids.contains(&t.id))
            .cloned()
            .collect())
    }

    async fn nodes_for_tag_ids(&self, tag_ids: &[i64], limit: usize) -> Result<Vec<Node>> {
        let inner = self.inner.read().await;
        let mut node_ids: Vec<i64> = inner
            .node_tags
            .iter()
            .filter(|nt| nt.deleted_at.is_none() && tag_ids.contains(&nt.tag_id))
            .map(|nt| nt.node_id)
            .collect();
        node_ids.sort_unstable();
        node_ids.dedup();

        let mut nodes: Vec<Node> = node_ids
            .into_iter()
            .filter_map(|id| inner.nodes.get(&id))
            .filter(|n| n.is_active())
            .cloned()
            .collect();
        nodes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        nodes.truncate(limit);
        Ok(nodes)
    }

    async fn upsert_robot(&self, name: &str) -> Result<Robot> {
        let mut inner = self.inner.write().await;
        if let Some(robot) = inner.robots.values_mut().find(|r| r.name == name) {
            robot.last_active_at = Utc::now();
            return Ok(robot.clone());
        }
        inner.next_robot_id += 1;
        let now = Utc::now();
        let robot = Robot {
            id: inner.next_robot_id,
            name: name.to_string(),
            created_at: now,
            last_active_at: now,
        };
        inner.robots.insert(robot.id, robot.clone());
        Ok(robot)
    }

    async fn record_remember(&self, robot_id: i64, node_id: i64) -> Result<RobotNode> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        if let Some(row) = inner.robot_nodes.get_mut(&(robot_id, node_id)) {
            row.remember_count += 1;
            row.last_remembered_at = now;
            row.in_working_memory = true;
            return Ok(row.clone());
        }
        inner.next_robot_node_id += 1;
        let row = RobotNode {
            id: inner.next_robot_node_id,
            robot_id,
            node_id,
            first_remembered_at: now,
            last_remembered_at: now,
            remember_count: 1,
            in_working_memory: true,
        };
        inner.robot_nodes.insert((robot_id, node_id), row.clone());
        Ok(row)
    }

    async fn robot_node(&self, robot_id: i64, node_id: i64) -> Result<Option<RobotNode>> {
        let inner = self.inner.read().await;
        Ok(inner.robot_nodes.get(&(robot_id, node_id)).cloned())
    }

    async fn set_in_working_memory(
        &self,
        robot_id: i64,
        node_id: i64,
        present: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(row) = inner.robot_nodes.get_mut(&(robot_id, node_id)) {
            row.in_working_memory = present;
        }
        Ok(())
    }

    async fn working_memory_node_ids(&self, robot_ids: &[i64]) -> Result<Vec<i64>> {
        let inner = self.inner.read().await;
        let mut ids: Vec<i64> = inner
            .robot_nodes
            .values()
            .filter(|rn| rn.in_working_memory && robot_ids.contains(&rn.robot_id))
            .map(|rn| rn.node_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn upsert_file_source(&self, new: NewFileSource) -> Result<FileSource> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        if let Some(source) = inner.file_sources.values_mut().find(|f| f.path == new.path) {
            source.content_hash = new.content_hash;
            source.mtime = new.mtime;
            source.frontmatter = new.frontmatter;
            source.last_synced_at = now;
            return Ok(source.clone());
        }
        inner.next_source_id += 1;
        let source = FileSource {
            id: inner.next_source_id,
            path: new.path,
            content_hash: new.content_hash,
            mtime: new.mtime,
            frontmatter: new.frontmatter,
            last_synced_at: now,
        };
        inner.file_sources.insert(source.id, source.clone());
        Ok(source)
    }

    async fn file_source_by_path(&self, path: &str) -> Result<Option<FileSource>> {
        let inner = self.inner.read().await;
        Ok(inner.file_sources.values().find(|f| f.path == path).cloned())
    }

    async fn nodes_for_source(&self, source_id: i64) -> Result<Vec<Node>> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<Node> = inner
            .nodes
            .values()
            .filter(|n| n.is_active() && n.source_id == Some(source_id))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.chunk_position);
        Ok(nodes)
    }

    async fn remove_file_source(&self, path: &str) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let source_id = inner
            .file_sources
            .values()
            .find(|f| f.path == path)
            .map(|f| f.id)
            .ok_or_else(|| Error::NotFound(format!("file source {path}")))?;
        let now = Utc::now();
        let mut removed = 0;
        for node in inner.nodes.values_mut() {
            if node.source_id == Some(source_id) && node.is_active() {
                node.deleted_at = Some(now);
                removed += 1;
            }
        }
        inner.file_sources.retain(|_, f| f.id != source_id);
        Ok(removed)
    }

    async fn vector_search(&self, query: &NodeQuery, embedding: &[f32]) -> Result<Vec<SearchHit>> {
        let inner = self.inner.read().await;
        let mut hits: Vec<SearchHit> = inner
            .nodes
            .values()
            .filter(|n| inner.node_matches_query(n, query))
            .filter_map(|n| {
                let stored = n.embedding.as_ref()?;
                let score = cosine_similarity(stored, embedding);
                (score > 0.0 && score >= query.min_similarity)
                    .then(|| SearchHit::new(n.clone(), score))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.node.created_at.cmp(&a.node.created_at))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn fulltext_search(&self, query: &NodeQuery, text: &str) -> Result<Vec<SearchHit>> {
        let inner = self.inner.read().await;
        let mut hits: Vec<SearchHit> = inner
            .nodes
            .values()
            .filter(|n| inner.node_matches_query(n, query))
            .filter_map(|n| {
                let score = fulltext_score(&n.content, text);
                (score > 0.0).then(|| SearchHit::new(n.clone(), score))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.node.created_at.cmp(&a.node.created_at))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn content_similarity(&self, query: &NodeQuery, text: &str) -> Result<Vec<SearchHit>> {
        let inner = self.inner.read().await;
        let mut hits: Vec<SearchHit> = inner
            .nodes
            .values()
            .filter(|n| inner.node_matches_query(n, query))
            .filter_map(|n| {
                let score = trigram_similarity(&n.content, text);
                (score >= query.min_similarity && score > 0.0)
                    .then(|| SearchHit::new(n.clone(), score))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.node.created_at.cmp(&a.node.created_at))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn tags_by_similarity(
        &self,
        text: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<TagMatch>> {
        let inner = self.inner.read().await;
        let mut matches: Vec<TagMatch> = inner
            .tags
            .values()
            .filter(|t| t.is_active())
            .filter_map(|t| {
                let similarity = trigram_similarity(&t.name, text);
                (similarity >= min_similarity && similarity > 0.0).then(|| TagMatch {
                    tag: t.clone(),
                    similarity,
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let sender = self.channel_sender(channel);
        // No receivers is fine; the payload is simply unobserved
        let _ = sender.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NotificationStream> {
        let sender = self.channel_sender(channel);
        let mut broadcast_rx = sender.subscribe();
        let (tx, rx) = tokio::sync::mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    // A lagged subscriber has lost ordering; end the stream
                    // so the subscriber resynchronizes.
                    Err(broadcast::error::RecvError::Lagged(_))
                    | Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(NotificationStream::new(rx))
    }
}
