//! Capability traits for the injected LLM callables and the services
//! wrapping them.
//!
//! The engine never talks to a model provider directly. It depends on three
//! single-method capabilities: an [`Embedder`], a [`TagExtractor`], and a
//! [`TokenCounter`]. Defaults are concrete types the caller may replace.

use crate::config::HtmConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Produces a dense vector for a piece of text.
///
/// Expected deterministic for a given text. Failures surface as
/// [`Error::Embedding`].
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into a dense vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Extracts hierarchical tag names for a piece of text.
///
/// The `ontology` slice is a bounded sample of existing tag names, shown to
/// anchor extraction to established conventions. Returned names are
/// validated by the engine; invalid ones are dropped with a warning.
#[async_trait]
pub trait TagExtractor: Send + Sync {
    /// Extract zero or more tag names for `text`.
    async fn extract(&self, text: &str, ontology: &[String]) -> Result<Vec<String>>;
}

/// Counts tokens in a piece of text.
pub trait TokenCounter: Send + Sync {
    /// Number of tokens in `text` under this counter's model.
    fn count(&self, text: &str) -> usize;
}

// ============================================================================
// Token counters
// ============================================================================

/// GPT-family BPE counter over the cl100k_base vocabulary. The default.
pub struct Cl100kCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl Cl100kCounter {
    /// Build the counter, loading the cl100k_base vocabulary.
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| Error::Configuration(format!("failed to load cl100k_base: {e}")))?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for Cl100kCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

/// Cheap chars/4 approximation for tests and offline use.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

// ============================================================================
// Embedding service
// ============================================================================

/// Wraps the injected [`Embedder`] with dimension padding and timeouts.
///
/// Vectors shorter than the storage width are zero-padded and the original
/// dimension is recorded; wider vectors fail with
/// [`Error::EmbeddingDimension`].
#[derive(Clone)]
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    storage_width: usize,
    timeout: Duration,
}

impl EmbeddingService {
    /// Build the service from config.
    #[must_use]
    pub fn new(config: &HtmConfig) -> Self {
        Self {
            embedder: Arc::clone(&config.embedder),
            storage_width: config.storage_embedding_width,
            timeout: config.embedding_timeout,
        }
    }

    /// Embed `text` and pad to the storage width.
    ///
    /// Returns the padded vector plus the original dimension.
    pub async fn embed_padded(&self, text: &str) -> Result<(Vec<f32>, usize)> {
        let raw = tokio::time::timeout(self.timeout, self.embedder.embed(text))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;
        self.pad(raw)
    }

    /// Pad a raw vector to the storage width, recording its dimension.
    pub fn pad(&self, mut raw: Vec<f32>) -> Result<(Vec<f32>, usize)> {
        let dim = raw.len();
        if dim == 0 {
            return Err(Error::Embedding("embedder returned an empty vector".into()));
        }
        if dim > self.storage_width {
            return Err(Error::EmbeddingDimension {
                got: dim,
                width: self.storage_width,
            });
        }
        raw.resize(self.storage_width, 0.0);
        Ok((raw, dim))
    }
}

// ============================================================================
// Tag service
// ============================================================================

/// Wraps the injected [`TagExtractor`] with ontology sampling, grammar
/// validation, and timeouts.
#[derive(Clone)]
pub struct TagService {
    extractor: Arc<dyn TagExtractor>,
    max_depth: usize,
    timeout: Duration,
}

impl TagService {
    /// Build the service from config.
    #[must_use]
    pub fn new(config: &HtmConfig) -> Self {
        Self {
            extractor: Arc::clone(&config.tag_extractor),
            max_depth: config.max_tag_depth,
            timeout: config.tag_extraction_timeout,
        }
    }

    /// Extract tags for `text`, keeping only names that pass the grammar.
    ///
    /// Invalid names are dropped with a warning; they never fail the
    /// enclosing write.
    pub async fn extract_valid(&self, text: &str, ontology: &[String]) -> Result<Vec<String>> {
        let raw = tokio::time::timeout(self.timeout, self.extractor.extract(text, ontology))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let mut valid = Vec::with_capacity(raw.len());
        for name in raw {
            if crate::tag::is_valid_tag_name(&name, self.max_depth) {
                if !valid.contains(&name) {
                    valid.push(name);
                }
            } else {
                warn!(tag = %name, "dropping tag name that violates the grammar");
            }
        }
        Ok(valid)
    }
}

// ============================================================================
// Deterministic offline providers
// ============================================================================

/// Deterministic offline providers for tests, CLIs, and examples.
///
/// These stand in for the LLM callables without network access. The hash
/// embedder maps character trigrams onto fixed buckets, so identical text
/// always embeds identically and shared trigrams yield nonzero similarity.
pub mod testing {
    use super::{Embedder, Error, Result, TagExtractor};
    use async_trait::async_trait;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    /// Dimension of [`HashEmbedder`] vectors.
    pub const HASH_EMBEDDER_DIM: usize = 256;

    /// Deterministic trigram-bucket embedder.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct HashEmbedder;

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut vector = vec![0.0f32; HASH_EMBEDDER_DIM];
            let lowered = text.to_lowercase();
            let chars: Vec<char> = lowered.chars().collect();
            for window in chars.windows(3) {
                let mut hasher = DefaultHasher::new();
                window.hash(&mut hasher);
                let bucket = (hasher.finish() as usize) % HASH_EMBEDDER_DIM;
                vector[bucket] += 1.0;
            }
            let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vector {
                    *v /= norm;
                }
            }
            Ok(vector)
        }
    }

    /// An embedder that always fails, for error-path tests.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::Embedding("provider unavailable".into()))
        }
    }

    /// Tags text with the lowercased words longer than five characters,
    /// capped at three tags.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct KeywordTagger;

    #[async_trait]
    impl TagExtractor for KeywordTagger {
        async fn extract(&self, text: &str, _ontology: &[String]) -> Result<Vec<String>> {
            let mut tags: Vec<String> = text
                .split_whitespace()
                .filter(|w| w.len() > 5)
                .map(|w| {
                    w.chars()
                        .filter(|c| c.is_ascii_alphanumeric())
                        .collect::<String>()
                        .to_lowercase()
                })
                .filter(|w| !w.is_empty())
                .collect();
            tags.dedup();
            tags.truncate(3);
            Ok(tags)
        }
    }

    /// An extractor that returns no tags.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SilentTagger;

    #[async_trait]
    impl TagExtractor for SilentTagger {
        async fn extract(&self, _text: &str, _ontology: &[String]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{HashEmbedder, HASH_EMBEDDER_DIM};
    use super::*;
    use crate::config::HtmConfig;

    fn test_config() -> HtmConfig {
        HtmConfig::builder()
            .embedder(Arc::new(HashEmbedder))
            .tag_extractor(Arc::new(testing::KeywordTagger))
            .token_counter(Arc::new(HeuristicCounter))
            .build()
            .unwrap()
    }

    #[test]
    fn heuristic_counter_rounds_up() {
        let counter = HeuristicCounter;
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder;
        let a = embedder.embed("PostgreSQL is relational").await.unwrap();
        let b = embedder.embed("PostgreSQL is relational").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HASH_EMBEDDER_DIM);
    }

    #[tokio::test]
    async fn embedding_service_pads_to_width() {
        let config = test_config();
        let service = EmbeddingService::new(&config);
        let (padded, dim) = service.embed_padded("hello world").await.unwrap();
        assert_eq!(padded.len(), config.storage_embedding_width);
        assert_eq!(dim, HASH_EMBEDDER_DIM);
        // Padding region is all zeros
        assert!(padded[dim..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn over_width_vector_is_rejected() {
        let config = test_config();
        let service = EmbeddingService::new(&config);
        let wide = vec![1.0f32; config.storage_embedding_width + 1];
        match service.pad(wide) {
            Err(Error::EmbeddingDimension { got, width }) => {
                assert_eq!(got, config.storage_embedding_width + 1);
                assert_eq!(width, config.storage_embedding_width);
            }
            other => panic!("expected EmbeddingDimension error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tag_service_drops_invalid_names() {
        struct MixedTagger;

        #[async_trait]
        impl TagExtractor for MixedTagger {
            async fn extract(&self, _: &str, _: &[String]) -> Result<Vec<String>> {
                Ok(vec![
                    "code:rust".to_string(),
                    "Bad Name".to_string(),
                    "a:b:c:d:e".to_string(), // too deep for default max depth 4
                    "databases".to_string(),
                ])
            }
        }

        let config = HtmConfig::builder()
            .embedder(Arc::new(HashEmbedder))
            .tag_extractor(Arc::new(MixedTagger))
            .token_counter(Arc::new(HeuristicCounter))
            .build()
            .unwrap();
        let service = TagService::new(&config);
        let tags = service.extract_valid("anything", &[]).await.unwrap();
        assert_eq!(tags, vec!["code:rust".to_string(), "databases".to_string()]);
    }
}
