//! Per-robot entry point.
//!
//! One [`Htm`] value per robot: it owns that robot's working memory and a
//! handle to the shared long-term memory. Robots are cheap; cooperating
//! processes construct one facade each over the same store.

use crate::config::{HtmConfig, JobBackend};
use crate::error::{Error, Result};
use crate::file_source::{FileLoader, LoadOutcome};
use crate::job::{Enricher, ExternalQueue, ExternalRunner, InlineRunner, JobRunner, ThreadRunner};
use crate::long_term::{LongTermMemory, RecallOptions, TopicOptions};
use crate::provider::{EmbeddingService, TagService};
use crate::store::Store;
use crate::tag::TagIndex;
use crate::types::{Metadata, Robot, SearchHit, TagMatch};
use crate::working_memory::{ContextStrategy, WorkingMemory};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Confirmation token required for permanent deletion.
pub const FORGET_CONFIRMATION: &str = "confirmed";

/// A robot's handle to the hive mind.
pub struct Htm {
    robot: Robot,
    ltm: LongTermMemory,
    working_memory: Arc<WorkingMemory>,
    runner: Arc<dyn JobRunner>,
    loader: FileLoader,
}

impl Htm {
    /// Create or look up the robot and initialize an empty working memory.
    ///
    /// The job backend comes from config; an `External` backend needs
    /// [`Htm::with_external_queue`].
    pub async fn new(robot_name: &str, store: Arc<dyn Store>, config: HtmConfig) -> Result<Self> {
        Self::build(robot_name, store, config, None, None).await
    }

    /// Like [`Htm::new`] with a working-memory budget override.
    pub async fn with_working_memory_size(
        robot_name: &str,
        store: Arc<dyn Store>,
        config: HtmConfig,
        working_memory_size_tokens: usize,
    ) -> Result<Self> {
        Self::build(
            robot_name,
            store,
            config,
            Some(working_memory_size_tokens),
            None,
        )
        .await
    }

    /// Like [`Htm::new`] for configs with an external job backend.
    pub async fn with_external_queue(
        robot_name: &str,
        store: Arc<dyn Store>,
        config: HtmConfig,
        queue: Arc<dyn ExternalQueue>,
    ) -> Result<Self> {
        Self::build(robot_name, store, config, None, Some(queue)).await
    }

    async fn build(
        robot_name: &str,
        store: Arc<dyn Store>,
        config: HtmConfig,
        working_memory_size: Option<usize>,
        external: Option<Arc<dyn ExternalQueue>>,
    ) -> Result<Self> {
        if robot_name.is_empty() {
            return Err(Error::Validation("robot name must not be empty".into()));
        }
        let config = Arc::new(config);
        // All database calls downstream of the facade share one ceiling
        let store: Arc<dyn Store> =
            Arc::new(crate::store::timed::TimedStore::new(store, config.db_timeout));
        let robot = store.upsert_robot(robot_name).await?;

        let enricher = Enricher::new(
            Arc::clone(&store),
            EmbeddingService::new(&config),
            TagService::new(&config),
            TagIndex::new(
                Arc::clone(&store),
                config.max_tag_depth,
                config.tag_ontology_sample_size,
            ),
        );
        let runner: Arc<dyn JobRunner> = match &config.job_backend {
            JobBackend::Inline => Arc::new(InlineRunner::new(enricher)),
            JobBackend::Thread => Arc::new(ThreadRunner::new(enricher, config.job_concurrency)),
            JobBackend::External(queue_name) => {
                let queue = external.ok_or_else(|| {
                    Error::Configuration(format!(
                        "job backend {queue_name:?} needs an external queue adapter"
                    ))
                })?;
                Arc::new(ExternalRunner::new(queue_name.clone(), queue))
            }
        };

        let working_memory = Arc::new(WorkingMemory::new(
            working_memory_size.unwrap_or(config.working_memory_size_tokens),
        ));
        let ltm = LongTermMemory::new(store, config, Arc::clone(&runner));
        let loader = FileLoader::new(ltm.clone(), robot.id);

        Ok(Self {
            robot,
            ltm,
            working_memory,
            runner,
            loader,
        })
    }

    /// This facade's robot identity.
    #[must_use]
    pub fn robot(&self) -> &Robot {
        &self.robot
    }

    /// This robot's working memory.
    #[must_use]
    pub fn working_memory(&self) -> &Arc<WorkingMemory> {
        &self.working_memory
    }

    /// The shared long-term memory engine.
    #[must_use]
    pub fn long_term(&self) -> &LongTermMemory {
        &self.ltm
    }

    /// The shared tag index.
    #[must_use]
    pub fn tag_index(&self) -> &TagIndex {
        self.ltm.tag_index()
    }

    // ========================================================================
    // Memory operations
    // ========================================================================

    /// Remember content; returns the node id.
    ///
    /// Persists durably, enqueues enrichment, and adds the node to this
    /// robot's working memory.
    #[instrument(skip(self, content, metadata), fields(robot = %self.robot.name))]
    pub async fn remember(
        &self,
        content: &str,
        tags: &[String],
        metadata: Option<Metadata>,
    ) -> Result<i64> {
        let node = self
            .ltm
            .remember(self.robot.id, content, tags, metadata)
            .await?;
        self.promote(node.id, &node.content, node.token_count, false)
            .await?;
        Ok(node.id)
    }

    /// Recall matching contents, promoting results into working memory.
    pub async fn recall(&self, query: &str, options: &RecallOptions) -> Result<Vec<String>> {
        let hits = self.recall_raw(query, options).await?;
        Ok(hits.into_iter().map(|h| h.node.content).collect())
    }

    /// Recall matching rows with scores, promoting results into working
    /// memory.
    pub async fn recall_raw(&self, query: &str, options: &RecallOptions) -> Result<Vec<SearchHit>> {
        let hits = self.ltm.recall(query, options).await?;
        for hit in &hits {
            self.promote(hit.node.id, &hit.node.content, hit.node.token_count, true)
                .await?;
        }
        Ok(hits)
    }

    /// Nodes filed under a topic tag.
    pub async fn recall_topic(&self, topic: &str, options: &TopicOptions) -> Result<Vec<SearchHit>> {
        self.ltm.search_by_topic(topic, options).await
    }

    /// Typo-tolerant tag autocomplete.
    pub async fn search_tags(
        &self,
        query: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<TagMatch>> {
        self.ltm.search_tags(query, limit, min_similarity).await
    }

    /// Forget a node.
    ///
    /// Without a confirmation token this is a soft delete, reversible with
    /// [`Htm::restore`]. Passing [`FORGET_CONFIRMATION`] deletes the row
    /// permanently.
    pub async fn forget(&self, node_id: i64, confirm: Option<&str>) -> Result<()> {
        match confirm {
            None => self.ltm.forget(node_id).await?,
            Some(FORGET_CONFIRMATION) => self.ltm.purge(node_id).await?,
            Some(other) => {
                return Err(Error::Validation(format!(
                    "unrecognized confirmation token {other:?}; permanent deletion requires {FORGET_CONFIRMATION:?}"
                )));
            }
        }
        if self.working_memory.remove(node_id) {
            self.ltm
                .store()
                .set_in_working_memory(self.robot.id, node_id, false)
                .await?;
        }
        Ok(())
    }

    /// Restore a soft-deleted node.
    pub async fn restore(&self, node_id: i64) -> Result<()> {
        self.ltm.restore(node_id).await?;
        Ok(())
    }

    /// Assemble this robot's working memory into a prompt-ready string.
    pub async fn create_context(
        &self,
        strategy: ContextStrategy,
        max_tokens: Option<usize>,
    ) -> String {
        let budget = max_tokens.unwrap_or_else(|| self.working_memory.max_tokens());
        self.working_memory.assemble_context(strategy, budget)
    }

    // ========================================================================
    // File sources
    // ========================================================================

    /// Load a file into memory as chunk nodes.
    pub async fn load_file(&self, path: impl AsRef<Path>, force: bool) -> Result<LoadOutcome> {
        self.loader.load_file(path, force).await
    }

    /// Load matching files under a directory.
    pub async fn load_directory(
        &self,
        path: impl AsRef<Path>,
        pattern: Option<&str>,
        force: bool,
    ) -> Result<Vec<LoadOutcome>> {
        self.loader.load_directory(path, pattern, force).await
    }

    /// Unload a file, soft-deleting its chunks.
    pub async fn unload_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        self.loader.unload_file(path).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drain enrichment jobs for at most `grace`, then stop workers.
    pub async fn shutdown(&self, grace: Duration) {
        self.runner.shutdown(grace).await;
    }

    /// Add or refresh a node in working memory, mirroring evictions to the
    /// advisory store flag.
    async fn promote(
        &self,
        node_id: i64,
        content: &str,
        token_count: usize,
        from_recall: bool,
    ) -> Result<()> {
        let evicted = self
            .working_memory
            .add(node_id, content, token_count, 1.0, from_recall);
        for evicted_id in evicted {
            self.ltm
                .store()
                .set_in_working_memory(self.robot.id, evicted_id, false)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobBackend;
    use crate::provider::testing::{HashEmbedder, SilentTagger};
    use crate::provider::HeuristicCounter;
    use crate::store::memory::MemoryStore;
    use crate::types::ActiveFilter;

    fn test_config() -> HtmConfig {
        HtmConfig::builder()
            .embedder(Arc::new(HashEmbedder))
            .tag_extractor(Arc::new(SilentTagger))
            .token_counter(Arc::new(HeuristicCounter))
            .job_backend(JobBackend::Inline)
            .build()
            .unwrap()
    }

    async fn facade(name: &str) -> (Htm, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let htm = Htm::new(name, store.clone(), test_config()).await.unwrap();
        (htm, store)
    }

    #[tokio::test]
    async fn remember_then_recall_round_trip() {
        let (htm, _) = facade("alpha").await;
        let node_id = htm.remember("the sky is blue", &[], None).await.unwrap();
        assert!(htm.working_memory().contains(node_id));

        let results = htm
            .recall("the sky is blue", &RecallOptions::default())
            .await
            .unwrap();
        assert_eq!(results, vec!["the sky is blue".to_string()]);
    }

    #[tokio::test]
    async fn recall_promotes_into_working_memory() {
        let store = Arc::new(MemoryStore::new());
        let writer = Htm::new("writer", store.clone(), test_config()).await.unwrap();
        let reader = Htm::new("reader", store.clone(), test_config()).await.unwrap();

        let node_id = writer.remember("shared knowledge", &[], None).await.unwrap();
        assert!(!reader.working_memory().contains(node_id));

        reader
            .recall("shared knowledge", &RecallOptions::default())
            .await
            .unwrap();
        assert!(reader.working_memory().contains(node_id));
        let entry = &reader
            .working_memory()
            .entries()
            .into_iter()
            .find(|e| e.node_id == node_id)
            .unwrap();
        assert!(entry.from_recall);
    }

    #[tokio::test]
    async fn forget_requires_the_exact_confirmation_token() {
        let (htm, store) = facade("alpha").await;
        let node_id = htm.remember("disposable", &[], None).await.unwrap();

        assert!(matches!(
            htm.forget(node_id, Some("yes please")).await,
            Err(Error::Validation(_))
        ));

        // Soft delete, then restore
        htm.forget(node_id, None).await.unwrap();
        assert!(store
            .node_by_id(node_id, ActiveFilter::Active)
            .await
            .unwrap()
            .is_none());
        htm.restore(node_id).await.unwrap();
        assert!(store
            .node_by_id(node_id, ActiveFilter::Active)
            .await
            .unwrap()
            .is_some());

        // Permanent delete leaves nothing behind
        htm.forget(node_id, Some(FORGET_CONFIRMATION)).await.unwrap();
        assert!(store
            .node_by_id(node_id, ActiveFilter::All)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn create_context_uses_working_memory() {
        let (htm, _) = facade("alpha").await;
        htm.remember("first fact", &[], None).await.unwrap();
        htm.remember("second fact", &[], None).await.unwrap();

        let context = htm.create_context(ContextStrategy::Recent, None).await;
        assert_eq!(context, "second fact\nfirst fact");
    }

    #[tokio::test]
    async fn two_facades_share_long_term_memory() {
        let store = Arc::new(MemoryStore::new());
        let alpha = Htm::new("alpha", store.clone(), test_config()).await.unwrap();
        let beta = Htm::new("beta", store.clone(), test_config()).await.unwrap();

        alpha.remember("hive mind fact", &[], None).await.unwrap();
        let results = beta
            .recall("hive mind fact", &RecallOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn file_load_and_unload() {
        let (htm, store) = facade("alpha").await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        tokio::fs::write(&path, "---\ntopic: testing\n---\n\nA note about files.")
            .await
            .unwrap();

        let outcome = htm.load_file(&path, false).await.unwrap();
        assert_eq!(outcome.chunks_loaded, 1);
        assert!(!outcome.skipped);

        // Unchanged reload is skipped
        let again = htm.load_file(&path, false).await.unwrap();
        assert!(again.skipped);

        let chunks = store.nodes_for_source(outcome.source_id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].metadata.get("topic"),
            Some(&serde_json::json!("testing"))
        );

        let removed = htm.unload_file(&path).await.unwrap();
        assert_eq!(removed, 1);
        let hits = htm
            .recall("note about files", &RecallOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
