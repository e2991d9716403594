//! Asynchronous enrichment jobs.
//!
//! Nodes are written first and enriched later: one job generates the
//! embedding, another extracts tags. Delivery is at-least-once and both
//! jobs are idempotent, so a duplicate run is a cheap no-op. Failures are
//! logged and terminal; they never abort the write that enqueued them.

use crate::error::{Error, Result};
use crate::provider::{EmbeddingService, TagService};
use crate::store::Store;
use crate::tag::TagIndex;
use crate::types::ActiveFilter;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Worker poll interval when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One enrichment job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Embed a node's content, unless already embedded.
    GenerateEmbedding {
        /// Target node.
        node_id: i64,
    },
    /// Extract and attach tags, unless the node already has tags.
    GenerateTags {
        /// Target node.
        node_id: i64,
    },
}

impl Job {
    /// Stable job name, used by external queue backends.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Job::GenerateEmbedding { .. } => "generate_embedding",
            Job::GenerateTags { .. } => "generate_tags",
        }
    }

    /// Job arguments as JSON, used by external queue backends.
    #[must_use]
    pub fn args(&self) -> serde_json::Value {
        match self {
            Job::GenerateEmbedding { node_id } | Job::GenerateTags { node_id } => {
                serde_json::json!({ "node_id": node_id })
            }
        }
    }
}

/// Performs enrichment jobs against the store.
#[derive(Clone)]
pub struct Enricher {
    store: Arc<dyn Store>,
    embeddings: EmbeddingService,
    tags: TagService,
    tag_index: TagIndex,
}

impl Enricher {
    /// Wire an enricher from its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        embeddings: EmbeddingService,
        tags: TagService,
        tag_index: TagIndex,
    ) -> Self {
        Self {
            store,
            embeddings,
            tags,
            tag_index,
        }
    }

    /// Run one job to completion.
    pub async fn perform(&self, job: &Job) -> Result<()> {
        match job {
            Job::GenerateEmbedding { node_id } => self.generate_embedding(*node_id).await,
            Job::GenerateTags { node_id } => self.generate_tags(*node_id).await,
        }
    }

    async fn generate_embedding(&self, node_id: i64) -> Result<()> {
        let Some(node) = self.store.node_by_id(node_id, ActiveFilter::Active).await? else {
            debug!(node_id, "embedding job: node gone, skipping");
            return Ok(());
        };
        if node.embedding.is_some() {
            debug!(node_id, "embedding job: already embedded, skipping");
            return Ok(());
        }
        let (padded, dimension) = self.embeddings.embed_padded(&node.content).await?;
        self.store.set_embedding(node_id, padded, dimension).await?;
        debug!(node_id, dimension, "embedding stored");
        Ok(())
    }

    async fn generate_tags(&self, node_id: i64) -> Result<()> {
        let Some(node) = self.store.node_by_id(node_id, ActiveFilter::Active).await? else {
            debug!(node_id, "tag job: node gone, skipping");
            return Ok(());
        };
        if !self.store.tags_for_node(node_id).await?.is_empty() {
            debug!(node_id, "tag job: tags already present, skipping");
            return Ok(());
        }

        let ontology = self.tag_index.ontology_sample().await?;
        let names = self
            .tags
            .extract_valid(&node.content, &ontology)
            .await
            .map_err(|e| match e {
                Error::Timeout(d) => Error::Timeout(d),
                other => Error::TagExtraction(other.to_string()),
            })?;

        for name in names {
            let tag = self.store.upsert_tag(&name).await?;
            self.store.attach_tag(node_id, tag.id).await?;
        }
        Ok(())
    }
}

/// Counters for queue monitoring.
#[derive(Debug, Clone, Default)]
pub struct JobStats {
    /// Total jobs submitted.
    pub submitted: u64,
    /// Total jobs that completed successfully.
    pub processed: u64,
    /// Total jobs that failed (terminal).
    pub failed: u64,
}

#[derive(Default)]
struct StatCounters {
    submitted: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> JobStats {
        JobStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Pluggable async job scheduling.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Submit a job. Never fails the caller on job failure.
    async fn submit(&self, job: Job) -> Result<()>;

    /// Drain in-flight work for at most `grace`, then stop workers.
    async fn shutdown(&self, grace: Duration);

    /// Queue counters.
    fn stats(&self) -> JobStats;
}

/// Runs each job synchronously in the calling task.
///
/// Used by tests, CLIs, and MCP STDIO servers where background workers are
/// unwelcome. Job failures are logged, not propagated.
pub struct InlineRunner {
    enricher: Enricher,
    stats: StatCounters,
}

impl InlineRunner {
    /// Create an inline runner.
    #[must_use]
    pub fn new(enricher: Enricher) -> Self {
        Self {
            enricher,
            stats: StatCounters::default(),
        }
    }
}

#[async_trait]
impl JobRunner for InlineRunner {
    async fn submit(&self, job: Job) -> Result<()> {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        match self.enricher.perform(&job).await {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(job = job.name(), error = %e, "enrichment job failed");
            }
        }
        Ok(())
    }

    async fn shutdown(&self, _grace: Duration) {}

    fn stats(&self) -> JobStats {
        self.stats.snapshot()
    }
}

/// In-process worker pool with bounded concurrency.
///
/// Workers poll a shared queue and stop on the shutdown flag. Jobs may
/// suspend on I/O without blocking other robots' progress.
pub struct ThreadRunner {
    queue: Arc<Mutex<VecDeque<Job>>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<StatCounters>,
}

impl ThreadRunner {
    /// Create the pool and spawn `concurrency` workers.
    #[must_use]
    pub fn new(enricher: Enricher, concurrency: usize) -> Self {
        let queue: Arc<Mutex<VecDeque<Job>>> = Arc::new(Mutex::new(VecDeque::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(StatCounters::default());

        for worker_id in 0..concurrency {
            let queue = Arc::clone(&queue);
            let shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let enricher = enricher.clone();
            tokio::spawn(async move {
                Self::worker_loop(worker_id, queue, enricher, stats, shutdown).await;
            });
        }

        info!(concurrency, "job workers started");
        Self {
            queue,
            shutdown,
            stats,
        }
    }

    async fn worker_loop(
        worker_id: usize,
        queue: Arc<Mutex<VecDeque<Job>>>,
        enricher: Enricher,
        stats: Arc<StatCounters>,
        shutdown: Arc<AtomicBool>,
    ) {
        debug!(worker_id, "job worker started");
        loop {
            if shutdown.load(Ordering::Acquire) {
                debug!(worker_id, "job worker shutting down");
                break;
            }

            let job = { queue.lock().await.pop_front() };
            match job {
                Some(job) => match enricher.perform(&job).await {
                    Ok(()) => {
                        stats.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        error!(worker_id, job = job.name(), error = %e, "enrichment job failed");
                    }
                },
                None => sleep(POLL_INTERVAL).await,
            }
        }
    }
}

#[async_trait]
impl JobRunner for ThreadRunner {
    async fn submit(&self, job: Job) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            warn!(job = job.name(), "job submitted after shutdown, dropping");
            return Ok(());
        }
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().await.push_back(job);
        Ok(())
    }

    async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.queue.lock().await.is_empty() || tokio::time::Instant::now() >= deadline {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
        self.shutdown.store(true, Ordering::Release);
        let dropped = self.queue.lock().await.len();
        if dropped > 0 {
            warn!(dropped, "job queue aborted with unprocessed jobs");
        }
    }

    fn stats(&self) -> JobStats {
        self.stats.snapshot()
    }
}

/// Adapter to an external queueing system.
///
/// The engine hands over `(job_name, args_json)`; the host's worker fleet
/// is expected to call back into an [`Enricher`].
#[async_trait]
pub trait ExternalQueue: Send + Sync {
    /// Enqueue a named job with JSON arguments.
    async fn enqueue(&self, queue: &str, name: &str, args: serde_json::Value) -> Result<()>;
}

/// Forwards jobs to a named external queue.
pub struct ExternalRunner {
    queue_name: String,
    queue: Arc<dyn ExternalQueue>,
    stats: StatCounters,
}

impl ExternalRunner {
    /// Create a runner that forwards to `queue` under `queue_name`.
    #[must_use]
    pub fn new(queue_name: String, queue: Arc<dyn ExternalQueue>) -> Self {
        Self {
            queue_name,
            queue,
            stats: StatCounters::default(),
        }
    }
}

#[async_trait]
impl JobRunner for ExternalRunner {
    async fn submit(&self, job: Job) -> Result<()> {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        match self
            .queue
            .enqueue(&self.queue_name, job.name(), job.args())
            .await
        {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(queue = %self.queue_name, job = job.name(), error = %e, "external enqueue failed");
                Ok(())
            }
        }
    }

    async fn shutdown(&self, _grace: Duration) {}

    fn stats(&self) -> JobStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HtmConfig;
    use crate::provider::testing::{FailingEmbedder, HashEmbedder, KeywordTagger};
    use crate::provider::{Embedder, HeuristicCounter};
    use crate::store::memory::MemoryStore;
    use crate::store::NewNode;
    use crate::types::content_hash;
    use std::sync::atomic::AtomicUsize;

    struct CountingEmbedder {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HashEmbedder.embed(text).await
        }
    }

    fn config_with(embedder: Arc<dyn Embedder>) -> HtmConfig {
        HtmConfig::builder()
            .embedder(embedder)
            .tag_extractor(Arc::new(KeywordTagger))
            .token_counter(Arc::new(HeuristicCounter))
            .build()
            .unwrap()
    }

    fn enricher_for(store: Arc<dyn Store>, config: &HtmConfig) -> Enricher {
        Enricher::new(
            Arc::clone(&store),
            EmbeddingService::new(config),
            TagService::new(config),
            TagIndex::new(store, config.max_tag_depth, config.tag_ontology_sample_size),
        )
    }

    async fn seed_node(store: &MemoryStore, content: &str) -> i64 {
        store
            .insert_node(NewNode {
                content: content.to_string(),
                content_hash: content_hash(content),
                token_count: 4,
                metadata: crate::types::Metadata::new(),
                source_id: None,
                chunk_position: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn embedding_job_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = config_with(Arc::new(CountingEmbedder {
            calls: Arc::clone(&calls),
        }));
        let store = Arc::new(MemoryStore::new());
        let node_id = seed_node(&store, "remember this").await;
        let enricher = enricher_for(store.clone(), &config);

        let job = Job::GenerateEmbedding { node_id };
        enricher.perform(&job).await.unwrap();
        enricher.perform(&job).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let node = store
            .node_by_id(node_id, ActiveFilter::Active)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.embedding.unwrap().len(), config.storage_embedding_width);
    }

    #[tokio::test]
    async fn tag_job_skips_when_tags_present() {
        let config = config_with(Arc::new(HashEmbedder));
        let store = Arc::new(MemoryStore::new());
        let node_id = seed_node(&store, "contains interesting keywords").await;

        // Manual tag attached before the job runs
        let tag = store.upsert_tag("manual").await.unwrap();
        store.attach_tag(node_id, tag.id).await.unwrap();

        let enricher = enricher_for(store.clone(), &config);
        enricher
            .perform(&Job::GenerateTags { node_id })
            .await
            .unwrap();

        let tags = store.tags_for_node(node_id).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "manual");
    }

    #[tokio::test]
    async fn tag_job_extracts_when_untagged() {
        let config = config_with(Arc::new(HashEmbedder));
        let store = Arc::new(MemoryStore::new());
        let node_id = seed_node(&store, "postgres indexes improve database retrieval").await;

        let enricher = enricher_for(store.clone(), &config);
        enricher
            .perform(&Job::GenerateTags { node_id })
            .await
            .unwrap();

        let tags = store.tags_for_node(node_id).await.unwrap();
        assert!(!tags.is_empty());
    }

    #[tokio::test]
    async fn inline_runner_swallows_job_failures() {
        let config = config_with(Arc::new(FailingEmbedder));
        let store = Arc::new(MemoryStore::new());
        let node_id = seed_node(&store, "will fail to embed").await;

        let runner = InlineRunner::new(enricher_for(store.clone(), &config));
        runner
            .submit(Job::GenerateEmbedding { node_id })
            .await
            .unwrap();

        let stats = runner.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.failed, 1);
        let node = store
            .node_by_id(node_id, ActiveFilter::Active)
            .await
            .unwrap()
            .unwrap();
        assert!(node.embedding.is_none());
    }

    #[tokio::test]
    async fn thread_runner_processes_and_drains() {
        let config = config_with(Arc::new(HashEmbedder));
        let store = Arc::new(MemoryStore::new());
        let first = seed_node(&store, "first fact").await;
        let second = seed_node(&store, "second fact").await;

        let runner = ThreadRunner::new(enricher_for(store.clone(), &config), 2);
        runner
            .submit(Job::GenerateEmbedding { node_id: first })
            .await
            .unwrap();
        runner
            .submit(Job::GenerateEmbedding { node_id: second })
            .await
            .unwrap();
        runner.shutdown(Duration::from_secs(5)).await;

        // Shutdown drains the queue, but the last pop may still be mid-flight
        for _ in 0..200 {
            if runner.stats().processed == 2 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }

        for id in [first, second] {
            let node = store
                .node_by_id(id, ActiveFilter::Active)
                .await
                .unwrap()
                .unwrap();
            assert!(node.embedding.is_some(), "node {id} not embedded");
        }
        assert_eq!(runner.stats().processed, 2);
    }

    #[tokio::test]
    async fn external_runner_forwards_name_and_args() {
        struct Recorder {
            seen: Arc<Mutex<Vec<(String, String, serde_json::Value)>>>,
        }

        #[async_trait]
        impl ExternalQueue for Recorder {
            async fn enqueue(
                &self,
                queue: &str,
                name: &str,
                args: serde_json::Value,
            ) -> Result<()> {
                self.seen
                    .lock()
                    .await
                    .push((queue.to_string(), name.to_string(), args));
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = ExternalRunner::new(
            "enrichment".to_string(),
            Arc::new(Recorder {
                seen: Arc::clone(&seen),
            }),
        );
        runner
            .submit(Job::GenerateTags { node_id: 9 })
            .await
            .unwrap();

        let recorded = seen.lock().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "enrichment");
        assert_eq!(recorded[0].1, "generate_tags");
        assert_eq!(recorded[0].2, serde_json::json!({ "node_id": 9 }));
    }
}
