//! The [`Store`] trait implementation, delegating to the inherent
//! operations defined across the entity modules.

use crate::TursoStore;
use async_trait::async_trait;
use htm_core::store::NotificationStream;
use htm_core::{
    ActiveFilter, FileSource, NewFileSource, NewNode, Node, NodeQuery, Result, Robot, RobotNode,
    SearchHit, Store, Tag, TagMatch,
};

#[async_trait]
impl Store for TursoStore {
    async fn insert_node(&self, new: NewNode) -> Result<Node> {
        self.insert_node(new).await
    }

    async fn node_by_id(&self, id: i64, filter: ActiveFilter) -> Result<Option<Node>> {
        self.node_by_id(id, filter).await
    }

    async fn node_by_hash(&self, hash: &str, filter: ActiveFilter) -> Result<Option<Node>> {
        self.node_by_hash(hash, filter).await
    }

    async fn set_embedding(&self, node_id: i64, padded: Vec<f32>, dimension: usize) -> Result<()> {
        self.set_embedding(node_id, padded, dimension).await
    }

    async fn soft_delete_node(&self, id: i64) -> Result<()> {
        self.soft_delete_node(id).await
    }

    async fn restore_node(&self, id: i64) -> Result<Node> {
        self.restore_node(id).await
    }

    async fn purge_node(&self, id: i64) -> Result<()> {
        self.purge_node(id).await
    }

    async fn record_access(&self, ids: &[i64]) -> Result<()> {
        self.record_access(ids).await
    }

    async fn count_nodes(&self, filter: ActiveFilter) -> Result<usize> {
        self.count_nodes(filter).await
    }

    async fn upsert_tag(&self, name: &str) -> Result<Tag> {
        self.upsert_tag(name).await
    }

    async fn tag_by_name(&self, name: &str, filter: ActiveFilter) -> Result<Option<Tag>> {
        self.tag_by_name(name, filter).await
    }

    async fn tags_with_counts(&self) -> Result<Vec<(Tag, u64)>> {
        self.tags_with_counts().await
    }

    async fn reap_orphan_tags(&self) -> Result<usize> {
        self.reap_orphan_tags().await
    }

    async fn attach_tag(&self, node_id: i64, tag_id: i64) -> Result<bool> {
        self.attach_tag(node_id, tag_id).await
    }

    async fn tags_for_node(&self, node_id: i64) -> Result<Vec<Tag>> {
        self.tags_for_node(node_id).await
    }

    async fn nodes_for_tag_ids(&self, tag_ids: &[i64], limit: usize) -> Result<Vec<Node>> {
        self.nodes_for_tag_ids(tag_ids, limit).await
    }

    async fn upsert_robot(&self, name: &str) -> Result<Robot> {
        self.upsert_robot(name).await
    }

    async fn record_remember(&self, robot_id: i64, node_id: i64) -> Result<RobotNode> {
        self.record_remember(robot_id, node_id).await
    }

    async fn robot_node(&self, robot_id: i64, node_id: i64) -> Result<Option<RobotNode>> {
        self.robot_node(robot_id, node_id).await
    }

    async fn set_in_working_memory(
        &self,
        robot_id: i64,
        node_id: i64,
        present: bool,
    ) -> Result<()> {
        self.set_in_working_memory(robot_id, node_id, present).await
    }

    async fn working_memory_node_ids(&self, robot_ids: &[i64]) -> Result<Vec<i64>> {
        self.working_memory_node_ids(robot_ids).await
    }

    async fn upsert_file_source(&self, new: NewFileSource) -> Result<FileSource> {
        self.upsert_file_source(new).await
    }

    async fn file_source_by_path(&self, path: &str) -> Result<Option<FileSource>> {
        self.file_source_by_path(path).await
    }

    async fn nodes_for_source(&self, source_id: i64) -> Result<Vec<Node>> {
        self.nodes_for_source(source_id).await
    }

    async fn remove_file_source(&self, path: &str) -> Result<usize> {
        self.remove_file_source(path).await
    }

    async fn vector_search(&self, query: &NodeQuery, embedding: &[f32]) -> Result<Vec<SearchHit>> {
        self.vector_search(query, embedding).await
    }

    async fn fulltext_search(&self, query: &NodeQuery, text: &str) -> Result<Vec<SearchHit>> {
        self.fulltext_search(query, text).await
    }

    async fn content_similarity(&self, query: &NodeQuery, text: &str) -> Result<Vec<SearchHit>> {
        self.content_similarity(query, text).await
    }

    async fn tags_by_similarity(
        &self,
        text: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<TagMatch>> {
        self.tags_by_similarity(text, limit, min_similarity).await
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        self.notify(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<NotificationStream> {
        self.subscribe(channel).await
    }
}
