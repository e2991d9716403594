//! Property tests over the engine invariants.

use htm_core::provider::testing::{HashEmbedder, SilentTagger};
use htm_core::provider::HeuristicCounter;
use htm_core::tag::is_valid_tag_name;
use htm_core::{
    ActiveFilter, EmbeddingService, Error, Htm, HtmConfig, JobBackend, MemoryStore, Store,
    WorkingMemory,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn test_config() -> HtmConfig {
    HtmConfig::builder()
        .embedder(Arc::new(HashEmbedder))
        .tag_extractor(Arc::new(SilentTagger))
        .token_counter(Arc::new(HeuristicCounter))
        .job_backend(JobBackend::Inline)
        .build()
        .unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Active content hashes stay unique no matter how contents repeat.
    #[test]
    fn hash_uniqueness(contents in proptest::collection::vec("[a-z ]{1,40}", 1..20)) {
        runtime().block_on(async {
            let store = Arc::new(MemoryStore::new());
            let htm = Htm::new("prop", store.clone(), test_config()).await.unwrap();

            for content in &contents {
                htm.remember(content, &[], None).await.unwrap();
            }

            let distinct: HashSet<&String> = contents.iter().collect();
            let active = store.count_nodes(ActiveFilter::Active).await.unwrap();
            prop_assert_eq!(active, distinct.len());
            Ok(())
        })?;
    }

    /// Remembering the same content N times yields one node with
    /// remember_count == N.
    #[test]
    fn idempotent_remember(content in "[a-z ]{1,40}", times in 1usize..6) {
        runtime().block_on(async {
            let store = Arc::new(MemoryStore::new());
            let htm = Htm::new("prop", store.clone(), test_config()).await.unwrap();

            let mut ids = HashSet::new();
            for _ in 0..times {
                ids.insert(htm.remember(&content, &[], None).await.unwrap());
            }
            prop_assert_eq!(ids.len(), 1);

            let node_id = *ids.iter().next().unwrap();
            let rn = store
                .robot_node(htm.robot().id, node_id)
                .await
                .unwrap()
                .unwrap();
            prop_assert_eq!(rn.remember_count, times as u64);
            prop_assert_eq!(store.count_nodes(ActiveFilter::Active).await.unwrap(), 1);
            Ok(())
        })?;
    }

    /// Padding always yields the storage width with the dimension recorded;
    /// over-width vectors are rejected.
    #[test]
    fn embedding_width(dim in 1usize..2500) {
        let config = test_config();
        let service = EmbeddingService::new(&config);
        let raw = vec![0.5f32; dim];
        match service.pad(raw) {
            Ok((padded, recorded)) => {
                prop_assert!(dim <= config.storage_embedding_width);
                prop_assert_eq!(padded.len(), config.storage_embedding_width);
                prop_assert_eq!(recorded, dim);
                prop_assert!(padded[dim..].iter().all(|v| *v == 0.0));
            }
            Err(Error::EmbeddingDimension { got, width }) => {
                prop_assert!(dim > config.storage_embedding_width);
                prop_assert_eq!(got, dim);
                prop_assert_eq!(width, config.storage_embedding_width);
            }
            Err(other) => prop_assert!(false, "unexpected error {other:?}"),
        }
    }

    /// Names from the valid grammar pass; corrupted ones fail.
    #[test]
    fn tag_grammar(segments in proptest::collection::vec("[a-z0-9-]{1,8}", 1..5)) {
        let name = segments.join(":");
        prop_assert!(is_valid_tag_name(&name, 4));
        let trailing_colon = format!("{}:", name);
        prop_assert!(!is_valid_tag_name(&trailing_colon, 4));
        let leading_colon = format!(":{}", name);
        prop_assert!(!is_valid_tag_name(&leading_colon, 4));
        prop_assert!(!is_valid_tag_name(&name.to_uppercase(), 4));
        // One level past the limit always fails
        let past_limit = format!("{}:extra", ["a"; 4].join(":"));
        prop_assert!(!is_valid_tag_name(&past_limit, 4));
    }

    /// The working-memory budget holds after any sequence of adds, and
    /// every eviction removes only entries no more important than what
    /// stays behind.
    #[test]
    fn working_memory_budget_and_eviction(
        adds in proptest::collection::vec((1usize..50, 0u32..10), 1..40)
    ) {
        let wm = WorkingMemory::new(100);
        for (i, (tokens, importance)) in adds.iter().enumerate() {
            let importance = *importance as f32;
            let evicted = wm.add(i as i64, format!("entry {i}"), *tokens, importance, false);
            prop_assert!(wm.current_tokens() <= 100);

            if !evicted.is_empty() {
                let retained_min = wm
                    .entries()
                    .iter()
                    .filter(|e| e.node_id != i as i64)
                    .map(|e| e.importance)
                    .fold(f32::INFINITY, f32::min);
                // All evicted entries predate this add; their importances
                // were recorded when added.
                for evicted_id in &evicted {
                    let evicted_importance = adds[*evicted_id as usize].1 as f32;
                    prop_assert!(
                        evicted_importance <= retained_min + f32::EPSILON,
                        "evicted {} > retained min {}",
                        evicted_importance,
                        retained_min
                    );
                }
            }
        }
    }
}
