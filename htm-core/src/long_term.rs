//! Long-term memory: the durable write path and the retrieval pipeline.
//!
//! Writes deduplicate on content hash, persist synchronously, then enqueue
//! enrichment. Reads run over active nodes only and come in five shapes:
//! vector, full-text, hybrid, by-topic, and tag autocomplete. Reads that
//! return nodes to the caller bump access tracking in one batched store
//! call.

use crate::cache::{QueryCache, QueryKey};
use crate::config::HtmConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobRunner};
use crate::provider::EmbeddingService;
use crate::search::{merge_hybrid, tag_boost, HybridCandidate};
use crate::store::{NewNode, NodeQuery, Store};
use crate::tag::TagIndex;
use crate::timeframe::{self, Timeframe, TimeframeSpec};
use crate::types::{content_hash, ActiveFilter, Metadata, Node, SearchHit, TagMatch};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Which read path a recall uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchStrategy {
    /// Cosine similarity over embeddings.
    Vector,
    /// Database full-text relevance.
    Fulltext,
    /// Vector + full-text + tag overlap, weighted.
    #[default]
    Hybrid,
}

impl SearchStrategy {
    fn cache_name(self) -> &'static str {
        match self {
            SearchStrategy::Vector => "vector",
            SearchStrategy::Fulltext => "fulltext",
            SearchStrategy::Hybrid => "hybrid",
        }
    }
}

/// Options for a recall.
#[derive(Debug, Clone)]
pub struct RecallOptions {
    /// Read path.
    pub strategy: SearchStrategy,
    /// Maximum results.
    pub limit: usize,
    /// Time filter.
    pub timeframe: Option<TimeframeSpec>,
    /// Tags the caller already associates with the query (hybrid boost).
    pub query_tags: Vec<String>,
    /// Metadata containment filter.
    pub metadata: Option<Metadata>,
    /// Minimum similarity for the vector path.
    pub min_similarity: f32,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::default(),
            limit: 10,
            timeframe: None,
            query_tags: Vec::new(),
            metadata: None,
            min_similarity: 0.0,
        }
    }
}

/// Options for topic lookup.
#[derive(Debug, Clone)]
pub struct TopicOptions {
    /// Match only the exact tag name, not its children.
    pub exact: bool,
    /// Also include trigram-similar tag names.
    pub fuzzy: bool,
    /// Similarity floor for fuzzy matching.
    pub min_similarity: f32,
    /// Maximum results.
    pub limit: usize,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            exact: false,
            fuzzy: false,
            min_similarity: 0.3,
            limit: 10,
        }
    }
}

/// The durable memory engine shared by every robot.
#[derive(Clone)]
pub struct LongTermMemory {
    store: Arc<dyn Store>,
    config: Arc<HtmConfig>,
    embeddings: EmbeddingService,
    runner: Arc<dyn JobRunner>,
    cache: Arc<QueryCache>,
    tag_index: TagIndex,
}

impl LongTermMemory {
    /// Wire the engine from its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<HtmConfig>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let embeddings = EmbeddingService::new(&config);
        let cache = Arc::new(QueryCache::new(config.cache_size, config.cache_ttl));
        let tag_index = TagIndex::new(
            Arc::clone(&store),
            config.max_tag_depth,
            config.tag_ontology_sample_size,
        );
        Self {
            store,
            config,
            embeddings,
            runner,
            cache,
            tag_index,
        }
    }

    /// The tag index over this engine's store.
    #[must_use]
    pub fn tag_index(&self) -> &TagIndex {
        &self.tag_index
    }

    /// The underlying store handle.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Remember content for a robot.
    ///
    /// Deduplicates on content hash (an existing active node is reused and
    /// the robot's `remember_count` bumped), attaches manual tags, and
    /// enqueues enrichment. Returns the durable node; enrichment may land
    /// later, so readers tolerate a null embedding and an empty tag set.
    #[instrument(skip(self, content, metadata))]
    pub async fn remember(
        &self,
        robot_id: i64,
        content: &str,
        manual_tags: &[String],
        metadata: Option<Metadata>,
    ) -> Result<Node> {
        self.validate_remember(content, manual_tags)?;

        let hash = content_hash(content);
        let token_count = self.config.token_counter.count(content);

        let node = match self
            .store
            .insert_node(NewNode {
                content: content.to_string(),
                content_hash: hash.clone(),
                token_count,
                metadata: metadata.unwrap_or_default(),
                source_id: None,
                chunk_position: None,
            })
            .await
        {
            Ok(node) => node,
            Err(Error::DuplicateContent(_)) => {
                let existing = self
                    .store
                    .node_by_hash(&hash, ActiveFilter::Active)
                    .await?
                    .ok_or_else(|| {
                        Error::Storage("duplicate hash vanished during remember".into())
                    })?;
                debug!(node_id = existing.id, "deduplicated remember");
                existing
            }
            Err(e) => return Err(e),
        };

        self.store.record_remember(robot_id, node.id).await?;

        for name in manual_tags {
            let tag = self.store.upsert_tag(name).await?;
            self.store.attach_tag(node.id, tag.id).await?;
        }

        if node.embedding.is_none() {
            self.runner
                .submit(Job::GenerateEmbedding { node_id: node.id })
                .await?;
        }
        // The tag job itself skips nodes that already carry tags (manual
        // ones included), so a duplicate enqueue is a no-op.
        self.runner
            .submit(Job::GenerateTags { node_id: node.id })
            .await?;

        self.cache.invalidate_all();
        Ok(node)
    }

    /// Remember a file chunk: the same pipeline as [`Self::remember`] with
    /// source attribution and no manual tags.
    pub(crate) async fn remember_chunk(
        &self,
        robot_id: i64,
        content: &str,
        metadata: Metadata,
        source_id: i64,
        chunk_position: usize,
    ) -> Result<Node> {
        self.validate_remember(content, &[])?;

        let hash = content_hash(content);
        let token_count = self.config.token_counter.count(content);
        let node = match self
            .store
            .insert_node(NewNode {
                content: content.to_string(),
                content_hash: hash.clone(),
                token_count,
                metadata,
                source_id: Some(source_id),
                chunk_position: Some(chunk_position),
            })
            .await
        {
            Ok(node) => node,
            // An identical chunk already lives in memory; reuse it and
            // leave its original attribution alone.
            Err(Error::DuplicateContent(_)) => self
                .store
                .node_by_hash(&hash, ActiveFilter::Active)
                .await?
                .ok_or_else(|| Error::Storage("duplicate hash vanished during load".into()))?,
            Err(e) => return Err(e),
        };

        self.store.record_remember(robot_id, node.id).await?;
        if node.embedding.is_none() {
            self.runner
                .submit(Job::GenerateEmbedding { node_id: node.id })
                .await?;
        }
        self.runner
            .submit(Job::GenerateTags { node_id: node.id })
            .await?;
        self.cache.invalidate_all();
        Ok(node)
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &HtmConfig {
        &self.config
    }

    /// Drop every cached recall result.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }

    fn validate_remember(&self, content: &str, manual_tags: &[String]) -> Result<()> {
        if content.is_empty() {
            return Err(Error::Validation("content must not be empty".into()));
        }
        if content.len() > self.config.max_content_bytes {
            return Err(Error::Validation(format!(
                "content is {} bytes, limit is {}",
                content.len(),
                self.config.max_content_bytes
            )));
        }
        if manual_tags.len() > self.config.max_manual_tags {
            return Err(Error::Validation(format!(
                "{} manual tags exceed the limit of {}",
                manual_tags.len(),
                self.config.max_manual_tags
            )));
        }
        for name in manual_tags {
            if !self.tag_index.validate(name) {
                return Err(Error::Validation(format!(
                    "tag name {name:?} violates the tag grammar"
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Soft delete / restore / purge
    // ========================================================================

    /// Soft-delete a node.
    pub async fn forget(&self, node_id: i64) -> Result<()> {
        self.store.soft_delete_node(node_id).await?;
        self.cache.invalidate_all();
        Ok(())
    }

    /// Restore a soft-deleted node with its tag associations intact.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateContent`] when another active node now holds the
    /// same content hash.
    pub async fn restore(&self, node_id: i64) -> Result<Node> {
        let node = self.store.restore_node(node_id).await?;
        self.cache.invalidate_all();
        Ok(node)
    }

    /// Permanently delete a node. There is no way back.
    pub async fn purge(&self, node_id: i64) -> Result<()> {
        self.store.purge_node(node_id).await?;
        self.cache.invalidate_all();
        Ok(())
    }

    /// Fetch a node by id.
    pub async fn node(&self, node_id: i64, filter: ActiveFilter) -> Result<Option<Node>> {
        self.store.node_by_id(node_id, filter).await
    }

    // ========================================================================
    // Read paths
    // ========================================================================

    /// Recall with the configured strategy.
    pub async fn recall(&self, query: &str, options: &RecallOptions) -> Result<Vec<SearchHit>> {
        match options.strategy {
            SearchStrategy::Vector => self.search_vector(query, options).await,
            SearchStrategy::Fulltext => self.search_fulltext(query, options).await,
            SearchStrategy::Hybrid => self.search_hybrid(query, options).await,
        }
    }

    /// Rank by cosine similarity of the embedded query.
    pub async fn search_vector(
        &self,
        query: &str,
        options: &RecallOptions,
    ) -> Result<Vec<SearchHit>> {
        let (cleaned, frame) = self.resolve_timeframe(query, options)?;
        if let Some(hits) = self.cached(SearchStrategy::Vector, &cleaned, &frame, options) {
            return Ok(hits);
        }

        let (embedded, _) = self.embeddings.embed_padded(&cleaned).await?;
        let node_query = self.node_query(options.limit, options.min_similarity, &frame, options);
        let hits = self.store.vector_search(&node_query, &embedded).await?;

        self.finish(SearchStrategy::Vector, &cleaned, &frame, options, hits)
            .await
    }

    /// Rank by full-text relevance.
    pub async fn search_fulltext(
        &self,
        query: &str,
        options: &RecallOptions,
    ) -> Result<Vec<SearchHit>> {
        let (cleaned, frame) = self.resolve_timeframe(query, options)?;
        if let Some(hits) = self.cached(SearchStrategy::Fulltext, &cleaned, &frame, options) {
            return Ok(hits);
        }

        let node_query = self.node_query(options.limit, 0.0, &frame, options);
        let hits = self.store.fulltext_search(&node_query, &cleaned).await?;

        self.finish(SearchStrategy::Fulltext, &cleaned, &frame, options, hits)
            .await
    }

    /// Hybrid retrieval: vector and full-text candidates merged with a tag
    /// overlap boost under the configured weights.
    pub async fn search_hybrid(
        &self,
        query: &str,
        options: &RecallOptions,
    ) -> Result<Vec<SearchHit>> {
        let (cleaned, frame) = self.resolve_timeframe(query, options)?;
        if let Some(hits) = self.cached(SearchStrategy::Hybrid, &cleaned, &frame, options) {
            return Ok(hits);
        }

        let fan_out = options.limit.max(1) * self.config.hybrid_fan_out.max(1);
        let node_query = self.node_query(fan_out, 0.0, &frame, options);

        let vector_hits = match self.embeddings.embed_padded(&cleaned).await {
            Ok((embedded, _)) => self.store.vector_search(&node_query, &embedded).await?,
            // A dead embedder degrades hybrid to lexical rather than
            // failing the recall.
            Err(e) => {
                warn!(error = %e, "vector side unavailable, falling back to full-text only");
                Vec::new()
            }
        };
        let fts_hits = self.store.fulltext_search(&node_query, &cleaned).await?;

        let mut merged: HashMap<i64, HybridCandidate> = HashMap::new();
        for hit in vector_hits {
            merged.insert(
                hit.node.id,
                HybridCandidate {
                    node: hit.node,
                    vector_score: hit.score,
                    fts_score: 0.0,
                    tag_boost: 0.0,
                },
            );
        }
        for hit in fts_hits {
            merged
                .entry(hit.node.id)
                .and_modify(|c| c.fts_score = hit.score)
                .or_insert(HybridCandidate {
                    node: hit.node,
                    vector_score: 0.0,
                    fts_score: hit.score,
                    tag_boost: 0.0,
                });
        }

        let mut candidates: Vec<HybridCandidate> = Vec::with_capacity(merged.len());
        for (node_id, mut candidate) in merged {
            let tags: Vec<String> = self
                .store
                .tags_for_node(node_id)
                .await?
                .into_iter()
                .map(|t| t.name)
                .collect();
            candidate.tag_boost = tag_boost(&tags, &cleaned, &options.query_tags);
            candidates.push(candidate);
        }

        let hits = merge_hybrid(candidates, self.config.search_weights, options.limit);
        self.finish(SearchStrategy::Hybrid, &cleaned, &frame, options, hits)
            .await
    }

    /// Nodes filed under a topic tag, newest first.
    ///
    /// Without `exact`, children of the topic (`topic:*`) match too; with
    /// `fuzzy`, trigram-similar tag names join the matched set.
    pub async fn search_by_topic(
        &self,
        topic: &str,
        options: &TopicOptions,
    ) -> Result<Vec<SearchHit>> {
        let mut tag_ids = Vec::new();
        let prefix = format!("{topic}:");
        for (tag, _) in self.store.tags_with_counts().await? {
            let matched = if options.exact {
                tag.name == topic
            } else {
                tag.name == topic || tag.name.starts_with(&prefix)
            };
            if matched {
                tag_ids.push(tag.id);
            }
        }
        if options.fuzzy {
            for matched in self
                .store
                .tags_by_similarity(topic, options.limit.max(10), options.min_similarity)
                .await?
            {
                if !tag_ids.contains(&matched.tag.id) {
                    tag_ids.push(matched.tag.id);
                }
            }
        }
        if tag_ids.is_empty() {
            return Ok(Vec::new());
        }

        let nodes = self.store.nodes_for_tag_ids(&tag_ids, options.limit).await?;
        let hits: Vec<SearchHit> = nodes
            .into_iter()
            .map(|node| SearchHit::new(node, 1.0))
            .collect();
        self.record_access(&hits).await;
        Ok(hits)
    }

    /// Typo-tolerant tag autocomplete by trigram similarity.
    pub async fn search_tags(
        &self,
        query: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<TagMatch>> {
        self.store
            .tags_by_similarity(query, limit, min_similarity)
            .await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn resolve_timeframe(
        &self,
        query: &str,
        options: &RecallOptions,
    ) -> Result<(String, Option<Timeframe>)> {
        let resolved = timeframe::resolve(
            options.timeframe.as_ref(),
            query,
            self.config.week_start,
        )?;
        Ok((resolved.query, resolved.timeframe))
    }

    fn node_query(
        &self,
        limit: usize,
        min_similarity: f32,
        frame: &Option<Timeframe>,
        options: &RecallOptions,
    ) -> NodeQuery {
        NodeQuery {
            limit,
            min_similarity,
            intervals: frame.as_ref().map(|f| f.intervals.clone()).unwrap_or_default(),
            metadata: options.metadata.clone(),
        }
    }

    /// The cache only covers the parameters in its key; filtered recalls
    /// bypass it.
    fn cacheable(options: &RecallOptions) -> bool {
        options.metadata.is_none() && options.query_tags.is_empty()
    }

    fn cache_key(
        &self,
        strategy: SearchStrategy,
        query: &str,
        frame: &Option<Timeframe>,
        options: &RecallOptions,
    ) -> QueryKey {
        QueryKey::new(strategy.cache_name(), query)
            .with_timeframe(frame.clone())
            .with_limit(options.limit)
            .with_weights(
                self.config.search_weights.vector,
                self.config.search_weights.tag,
            )
    }

    fn cached(
        &self,
        strategy: SearchStrategy,
        query: &str,
        frame: &Option<Timeframe>,
        options: &RecallOptions,
    ) -> Option<Vec<SearchHit>> {
        if !Self::cacheable(options) {
            return None;
        }
        self.cache.get(&self.cache_key(strategy, query, frame, options))
    }

    async fn finish(
        &self,
        strategy: SearchStrategy,
        query: &str,
        frame: &Option<Timeframe>,
        options: &RecallOptions,
        hits: Vec<SearchHit>,
    ) -> Result<Vec<SearchHit>> {
        self.record_access(&hits).await;
        if Self::cacheable(options) {
            self.cache
                .put(&self.cache_key(strategy, query, frame, options), hits.clone());
        }
        Ok(hits)
    }

    /// Access tracking is eventually consistent: one batched call per read
    /// that returned nodes, and a failure never fails the read.
    async fn record_access(&self, hits: &[SearchHit]) {
        if hits.is_empty() {
            return;
        }
        let ids: Vec<i64> = hits.iter().map(|h| h.node.id).collect();
        if let Err(e) = self.store.record_access(&ids).await {
            warn!(error = %e, "access tracking update failed");
        }
    }
}
