//! Engine configuration.
//!
//! All tunables live in one explicit [`HtmConfig`] value handed to each
//! subsystem at construction. There are no process-wide singletons, so test
//! isolation needs no global resets.

use crate::error::{Error, Result};
use crate::provider::{Embedder, TagExtractor, TokenCounter};
use crate::types::{
    DEFAULT_MAX_TAG_DEPTH, MAX_CONTENT_BYTES, MAX_MANUAL_TAGS, STORAGE_EMBEDDING_WIDTH,
};
use std::sync::Arc;
use std::time::Duration;

/// Default number of worker tasks for the thread job backend.
pub const DEFAULT_JOB_CONCURRENCY: usize = 5;

/// Default ontology sample size shown to the tag extractor.
pub const DEFAULT_ONTOLOGY_SAMPLE_SIZE: usize = 100;

/// Default fan-out multiplier for hybrid search candidate fetches.
pub const DEFAULT_HYBRID_FAN_OUT: usize = 2;

/// Default query cache capacity (entries).
pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// Default query cache TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default per-robot working memory budget (tokens).
pub const DEFAULT_WORKING_MEMORY_TOKENS: usize = 128_000;

/// Which day a week starts on, for timeframe parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeekStart {
    /// Weeks run Sunday through Saturday.
    Sunday,
    /// Weeks run Monday through Sunday.
    #[default]
    Monday,
}

/// Async backend used for enrichment jobs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobBackend {
    /// Run jobs synchronously in the calling task. Used by tests and CLIs.
    Inline,
    /// In-process worker pool with bounded concurrency.
    #[default]
    Thread,
    /// Hand jobs to an external queue registered under this name.
    External(String),
}

/// Relative weights for hybrid search scoring.
///
/// Normalized so the weights sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchWeights {
    /// Weight for vector similarity.
    pub vector: f32,
    /// Weight for tag overlap boost.
    pub tag: f32,
}

impl SearchWeights {
    /// Create normalized weights.
    #[must_use]
    pub fn new(vector: f32, tag: f32) -> Self {
        let total = vector + tag;
        Self {
            vector: vector / total,
            tag: tag / total,
        }
    }

    /// Validate that both weights are in range and sum to 1.0.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vector) || !(0.0..=1.0).contains(&self.tag) {
            return Err(Error::Configuration(
                "search weights must be between 0.0 and 1.0".into(),
            ));
        }
        if (self.vector + self.tag - 1.0).abs() > 0.0001 {
            return Err(Error::Configuration(format!(
                "search weights must sum to 1.0 (got {} + {})",
                self.vector, self.tag
            )));
        }
        Ok(())
    }
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self::new(0.7, 0.3)
    }
}

/// Engine configuration.
///
/// Build with [`HtmConfig::builder`]. The embedding and tag extraction
/// callables are mandatory; everything else defaults per the table in the
/// crate docs.
#[derive(Clone)]
pub struct HtmConfig {
    /// Embedding callable.
    pub embedder: Arc<dyn Embedder>,
    /// Tag extraction callable.
    pub tag_extractor: Arc<dyn TagExtractor>,
    /// Token counting callable.
    pub token_counter: Arc<dyn TokenCounter>,
    /// Informational: dimension the embedder is expected to produce.
    pub embedding_dimensions: Option<usize>,
    /// Fixed storage width embeddings are padded to.
    pub storage_embedding_width: usize,
    /// Maximum node content size in bytes.
    pub max_content_bytes: usize,
    /// Maximum manual tags per `remember`.
    pub max_manual_tags: usize,
    /// Async backend for enrichment jobs.
    pub job_backend: JobBackend,
    /// Worker count for the thread job backend.
    pub job_concurrency: usize,
    /// Maximum tag hierarchy depth.
    pub max_tag_depth: usize,
    /// Ontology sample size shown to the tag extractor.
    pub tag_ontology_sample_size: usize,
    /// Hybrid search weights.
    pub search_weights: SearchWeights,
    /// Fan-out multiplier for hybrid candidate fetches.
    pub hybrid_fan_out: usize,
    /// Query cache capacity in entries. Zero disables the cache.
    pub cache_size: usize,
    /// Query cache TTL.
    pub cache_ttl: Duration,
    /// Per-robot working memory budget in tokens.
    pub working_memory_size_tokens: usize,
    /// Week start day for timeframe parsing.
    pub week_start: WeekStart,
    /// Timeout for one embedding call.
    pub embedding_timeout: Duration,
    /// Timeout for one tag extraction call.
    pub tag_extraction_timeout: Duration,
    /// Timeout for one database operation.
    pub db_timeout: Duration,
}

impl std::fmt::Debug for HtmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HtmConfig")
            .field("embedding_dimensions", &self.embedding_dimensions)
            .field("storage_embedding_width", &self.storage_embedding_width)
            .field("max_content_bytes", &self.max_content_bytes)
            .field("max_manual_tags", &self.max_manual_tags)
            .field("job_backend", &self.job_backend)
            .field("job_concurrency", &self.job_concurrency)
            .field("max_tag_depth", &self.max_tag_depth)
            .field("tag_ontology_sample_size", &self.tag_ontology_sample_size)
            .field("search_weights", &self.search_weights)
            .field("hybrid_fan_out", &self.hybrid_fan_out)
            .field("cache_size", &self.cache_size)
            .field("cache_ttl", &self.cache_ttl)
            .field(
                "working_memory_size_tokens",
                &self.working_memory_size_tokens,
            )
            .field("week_start", &self.week_start)
            .finish_non_exhaustive()
    }
}

impl HtmConfig {
    /// Start building a config.
    #[must_use]
    pub fn builder() -> HtmConfigBuilder {
        HtmConfigBuilder::default()
    }
}

/// Builder for [`HtmConfig`].
#[derive(Default)]
pub struct HtmConfigBuilder {
    embedder: Option<Arc<dyn Embedder>>,
    tag_extractor: Option<Arc<dyn TagExtractor>>,
    token_counter: Option<Arc<dyn TokenCounter>>,
    embedding_dimensions: Option<usize>,
    storage_embedding_width: Option<usize>,
    max_content_bytes: Option<usize>,
    max_manual_tags: Option<usize>,
    job_backend: Option<JobBackend>,
    job_concurrency: Option<usize>,
    max_tag_depth: Option<usize>,
    tag_ontology_sample_size: Option<usize>,
    search_weights: Option<SearchWeights>,
    hybrid_fan_out: Option<usize>,
    cache_size: Option<usize>,
    cache_ttl: Option<Duration>,
    working_memory_size_tokens: Option<usize>,
    week_start: Option<WeekStart>,
    embedding_timeout: Option<Duration>,
    tag_extraction_timeout: Option<Duration>,
    db_timeout: Option<Duration>,
}

impl HtmConfigBuilder {
    /// Set the embedding callable. Mandatory.
    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Set the tag extraction callable. Mandatory.
    #[must_use]
    pub fn tag_extractor(mut self, extractor: Arc<dyn TagExtractor>) -> Self {
        self.tag_extractor = Some(extractor);
        self
    }

    /// Set the token counter. Defaults to the cl100k_base BPE counter.
    #[must_use]
    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = Some(counter);
        self
    }

    /// Informational: expected embedder output dimension.
    #[must_use]
    pub fn embedding_dimensions(mut self, dims: usize) -> Self {
        self.embedding_dimensions = Some(dims);
        self
    }

    /// Set the job backend.
    #[must_use]
    pub fn job_backend(mut self, backend: JobBackend) -> Self {
        self.job_backend = Some(backend);
        self
    }

    /// Set the thread backend worker count.
    #[must_use]
    pub fn job_concurrency(mut self, workers: usize) -> Self {
        self.job_concurrency = Some(workers);
        self
    }

    /// Set the maximum tag depth.
    #[must_use]
    pub fn max_tag_depth(mut self, depth: usize) -> Self {
        self.max_tag_depth = Some(depth);
        self
    }

    /// Set the ontology sample size.
    #[must_use]
    pub fn tag_ontology_sample_size(mut self, size: usize) -> Self {
        self.tag_ontology_sample_size = Some(size);
        self
    }

    /// Set hybrid search weights.
    #[must_use]
    pub fn search_weights(mut self, weights: SearchWeights) -> Self {
        self.search_weights = Some(weights);
        self
    }

    /// Set the hybrid fan-out multiplier.
    #[must_use]
    pub fn hybrid_fan_out(mut self, fan_out: usize) -> Self {
        self.hybrid_fan_out = Some(fan_out);
        self
    }

    /// Set the query cache capacity. Zero disables caching.
    #[must_use]
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = Some(size);
        self
    }

    /// Set the query cache TTL.
    #[must_use]
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Set the working memory token budget.
    #[must_use]
    pub fn working_memory_size_tokens(mut self, tokens: usize) -> Self {
        self.working_memory_size_tokens = Some(tokens);
        self
    }

    /// Set the week start day.
    #[must_use]
    pub fn week_start(mut self, start: WeekStart) -> Self {
        self.week_start = Some(start);
        self
    }

    /// Set the embedding call timeout.
    #[must_use]
    pub fn embedding_timeout(mut self, timeout: Duration) -> Self {
        self.embedding_timeout = Some(timeout);
        self
    }

    /// Set the tag extraction call timeout.
    #[must_use]
    pub fn tag_extraction_timeout(mut self, timeout: Duration) -> Self {
        self.tag_extraction_timeout = Some(timeout);
        self
    }

    /// Set the database operation timeout.
    #[must_use]
    pub fn db_timeout(mut self, timeout: Duration) -> Self {
        self.db_timeout = Some(timeout);
        self
    }

    /// Validate and build the config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a mandatory callable is missing
    /// or a value is out of range.
    pub fn build(self) -> Result<HtmConfig> {
        let embedder = self
            .embedder
            .ok_or_else(|| Error::Configuration("embedding_generator is required".into()))?;
        let tag_extractor = self
            .tag_extractor
            .ok_or_else(|| Error::Configuration("tag_extractor is required".into()))?;
        let token_counter = match self.token_counter {
            Some(counter) => counter,
            None => Arc::new(crate::provider::Cl100kCounter::new()?),
        };

        let search_weights = self.search_weights.unwrap_or_default();
        search_weights.validate()?;

        let job_concurrency = self.job_concurrency.unwrap_or(DEFAULT_JOB_CONCURRENCY);
        if job_concurrency == 0 {
            return Err(Error::Configuration(
                "job_concurrency must be at least 1".into(),
            ));
        }

        let max_tag_depth = self.max_tag_depth.unwrap_or(DEFAULT_MAX_TAG_DEPTH);
        if max_tag_depth == 0 {
            return Err(Error::Configuration(
                "max_tag_depth must be at least 1".into(),
            ));
        }

        Ok(HtmConfig {
            embedder,
            tag_extractor,
            token_counter,
            embedding_dimensions: self.embedding_dimensions,
            storage_embedding_width: self
                .storage_embedding_width
                .unwrap_or(STORAGE_EMBEDDING_WIDTH),
            max_content_bytes: self.max_content_bytes.unwrap_or(MAX_CONTENT_BYTES),
            max_manual_tags: self.max_manual_tags.unwrap_or(MAX_MANUAL_TAGS),
            job_backend: self.job_backend.unwrap_or_default(),
            job_concurrency,
            max_tag_depth,
            tag_ontology_sample_size: self
                .tag_ontology_sample_size
                .unwrap_or(DEFAULT_ONTOLOGY_SAMPLE_SIZE),
            search_weights,
            hybrid_fan_out: self.hybrid_fan_out.unwrap_or(DEFAULT_HYBRID_FAN_OUT),
            cache_size: self.cache_size.unwrap_or(DEFAULT_CACHE_SIZE),
            cache_ttl: self.cache_ttl.unwrap_or(DEFAULT_CACHE_TTL),
            working_memory_size_tokens: self
                .working_memory_size_tokens
                .unwrap_or(DEFAULT_WORKING_MEMORY_TOKENS),
            week_start: self.week_start.unwrap_or_default(),
            embedding_timeout: self.embedding_timeout.unwrap_or(Duration::from_secs(120)),
            tag_extraction_timeout: self
                .tag_extraction_timeout
                .unwrap_or(Duration::from_secs(180)),
            db_timeout: self.db_timeout.unwrap_or(Duration::from_secs(30)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{HashEmbedder, KeywordTagger};
    use crate::provider::HeuristicCounter;

    fn builder() -> HtmConfigBuilder {
        HtmConfig::builder()
            .embedder(Arc::new(HashEmbedder))
            .tag_extractor(Arc::new(KeywordTagger))
            .token_counter(Arc::new(HeuristicCounter))
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = builder().build().unwrap();
        assert_eq!(config.storage_embedding_width, 2000);
        assert_eq!(config.max_content_bytes, 1_048_576);
        assert_eq!(config.max_manual_tags, 1000);
        assert_eq!(config.job_concurrency, 5);
        assert_eq!(config.max_tag_depth, 4);
        assert_eq!(config.tag_ontology_sample_size, 100);
        assert_eq!(config.hybrid_fan_out, 2);
        assert_eq!(config.cache_size, 1000);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.working_memory_size_tokens, 128_000);
        assert_eq!(config.embedding_timeout, Duration::from_secs(120));
        assert_eq!(config.tag_extraction_timeout, Duration::from_secs(180));
        assert_eq!(config.db_timeout, Duration::from_secs(30));
        assert!((config.search_weights.vector - 0.7).abs() < 0.001);
        assert!((config.search_weights.tag - 0.3).abs() < 0.001);
    }

    #[test]
    fn missing_embedder_is_a_configuration_error() {
        let result = HtmConfig::builder()
            .tag_extractor(Arc::new(KeywordTagger))
            .build();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn search_weights_normalize() {
        let weights = SearchWeights::new(2.0, 1.0);
        assert!((weights.vector - 0.6666667).abs() < 0.001);
        assert!((weights.tag - 0.3333333).abs() < 0.001);
        assert!(weights.validate().is_ok());
    }

    #[test]
    fn invalid_weights_rejected() {
        let weights = SearchWeights {
            vector: 1.5,
            tag: -0.5,
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn zero_job_concurrency_rejected() {
        let result = builder().job_concurrency(0).build();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
