#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::float_cmp)]

//! # HTM Core
//!
//! Durable, searchable episodic memory for cooperating LLM-driven agents
//! ("robots"). Robots write natural-language content; the engine stores it,
//! enriches it asynchronously (embedding + hierarchical tags), and serves
//! it back through hybrid retrieval, optionally filtered by time.
//!
//! ## Core Concepts
//!
//! - **Node**: one stored memory, deduplicated by content hash
//! - **Working memory**: per-robot token-bounded cache with hybrid
//!   importance + recency eviction
//! - **Long-term memory**: the shared durable store every robot reads
//! - **Tags**: hierarchical colon-delimited ontology, extracted by an
//!   injected LLM callable and validated against a closed grammar
//! - **Robot groups**: shared working memory with active/passive roles,
//!   failover, and pub/sub convergence
//!
//! ## Quick Start
//!
//! ```no_run
//! use htm_core::{Htm, HtmConfig, RecallOptions};
//! use htm_core::provider::testing::{HashEmbedder, KeywordTagger};
//! use htm_core::store::memory::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HtmConfig::builder()
//!         .embedder(Arc::new(HashEmbedder))
//!         .tag_extractor(Arc::new(KeywordTagger))
//!         .build()?;
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let htm = Htm::new("assistant", store, config).await?;
//!     htm.remember("PostgreSQL is our primary datastore", &[], None).await?;
//!
//!     let memories = htm.recall("what database do we use", &RecallOptions::default()).await?;
//!     println!("{memories:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! ### Primary APIs
//! - [`htm`]: the per-robot facade ([`Htm`])
//! - [`long_term`]: write pipeline and retrieval paths
//! - [`working_memory`]: the token-bounded cache
//! - [`group`]: shared working memory across robots
//!
//! ### Support Modules
//! - [`store`]: storage abstraction and the in-process reference backend
//! - [`provider`]: capability traits for the injected LLM callables
//! - [`job`]: asynchronous enrichment
//! - [`tag`]: the hierarchical ontology
//! - [`timeframe`]: the natural-language time grammar
//! - [`search`]: scoring primitives
//! - [`cache`]: recall result caching
//!
//! ## Error Handling
//!
//! Fallible operations return [`Result<T>`](Result) with the typed
//! [`Error`] taxonomy. Asynchronous enrichment failures are logged and
//! terminal; a node stays usable without an embedding or tags.

pub mod cache;
pub mod config;
pub mod error;
pub mod file_source;
pub mod group;
pub mod htm;
pub mod job;
pub mod long_term;
pub mod provider;
pub mod search;
pub mod store;
pub mod tag;
pub mod timeframe;
pub mod types;
pub mod working_memory;

// Re-export commonly used types
pub use cache::{CacheMetrics, QueryCache};
pub use config::{HtmConfig, HtmConfigBuilder, JobBackend, SearchWeights, WeekStart};
pub use error::{Error, Result};
pub use file_source::{FileLoader, LoadOutcome};
pub use group::{GroupEvent, GroupOp, GroupStatus, MemberRole, RobotGroup};
pub use htm::{Htm, FORGET_CONFIRMATION};
pub use job::{Enricher, ExternalQueue, Job, JobRunner, JobStats};
pub use long_term::{LongTermMemory, RecallOptions, SearchStrategy, TopicOptions};
pub use provider::{Embedder, EmbeddingService, TagExtractor, TagService, TokenCounter};
pub use store::{memory::MemoryStore, timed::TimedStore, NewFileSource, NewNode, NodeQuery, Store};
pub use tag::{TagIndex, TagTree};
pub use timeframe::{Timeframe, TimeframeSpec};
pub use types::{
    ActiveFilter, FileSource, Metadata, Node, NodeTag, Robot, RobotNode, SearchHit, Tag, TagMatch,
};
pub use working_memory::{ContextStrategy, WorkingMemory, WorkingMemoryEntry};
