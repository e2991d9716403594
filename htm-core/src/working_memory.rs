//! Per-robot working memory.
//!
//! A token-bounded, insertion-aware cache of node contents. Eviction is
//! hybrid importance + recency: the lowest-importance entries go first, and
//! among equals the oldest. Eviction never deletes a node from the store;
//! the caller is handed the evicted ids so it can clear the advisory
//! `robot_node.in_working_memory` flag.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// How [`WorkingMemory::assemble_context`] orders entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextStrategy {
    /// Most recently added or touched first.
    Recent,
    /// Importance descending, ties broken by recency.
    Important,
    /// `importance / (1 + hours_since_added)` descending.
    #[default]
    Balanced,
}

/// One cached entry.
#[derive(Debug, Clone)]
pub struct WorkingMemoryEntry {
    /// Backing node id.
    pub node_id: i64,
    /// Node content (working memory never owns the durable row).
    pub content: String,
    /// Token count of `content`.
    pub token_count: usize,
    /// Eviction weight, `>= 0`, default 1.0.
    pub importance: f32,
    /// When the entry was added.
    pub added_at: DateTime<Utc>,
    /// Whether a recall promoted this entry (vs a direct remember).
    pub from_recall: bool,
    // Monotonic counters give deterministic ordering when wall-clock
    // timestamps collide.
    added_seq: u64,
    touched_seq: u64,
}

#[derive(Default)]
struct WmInner {
    entries: HashMap<i64, WorkingMemoryEntry>,
    current_tokens: usize,
    next_seq: u64,
}

impl WmInner {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Evict in candidate order (ascending importance, oldest first among
    /// equals) until at least `needed` tokens are freed or the set is empty.
    fn evict_for(&mut self, needed: usize) -> Vec<i64> {
        let mut candidates: Vec<(f32, u64, i64, usize)> = self
            .entries
            .values()
            .map(|e| (e.importance, e.added_seq, e.node_id, e.token_count))
            .collect();
        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut evicted = Vec::new();
        let mut freed = 0usize;
        for (_, _, node_id, tokens) in candidates {
            if freed >= needed {
                break;
            }
            self.entries.remove(&node_id);
            self.current_tokens -= tokens;
            freed += tokens;
            evicted.push(node_id);
        }
        evicted
    }
}

/// Token-bounded per-robot cache, safe for concurrent use.
pub struct WorkingMemory {
    inner: Mutex<WmInner>,
    max_tokens: usize,
}

impl WorkingMemory {
    /// Create an empty working memory with the given token budget.
    #[must_use]
    pub fn new(max_tokens: usize) -> Self {
        Self {
            inner: Mutex::new(WmInner::default()),
            max_tokens,
        }
    }

    /// The configured token budget.
    #[must_use]
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Tokens currently held.
    #[must_use]
    pub fn current_tokens(&self) -> usize {
        self.inner.lock().current_tokens
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether a node is cached.
    #[must_use]
    pub fn contains(&self, node_id: i64) -> bool {
        self.inner.lock().entries.contains_key(&node_id)
    }

    /// Ids of all cached nodes.
    #[must_use]
    pub fn node_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Add a node, evicting until the budget fits.
    ///
    /// Returns the evicted node ids. Re-adding a cached node refreshes its
    /// recency and importance instead of duplicating it. An entry larger
    /// than the whole budget is refused (the budget invariant holds after
    /// every add).
    pub fn add(
        &self,
        node_id: i64,
        content: impl Into<String>,
        token_count: usize,
        importance: f32,
        from_recall: bool,
    ) -> Vec<i64> {
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get(&node_id) {
            let old_tokens = entry.token_count;
            let seq = inner.bump_seq();
            if let Some(entry) = inner.entries.get_mut(&node_id) {
                entry.importance = importance;
                entry.from_recall = from_recall;
                entry.touched_seq = seq;
                entry.token_count = token_count;
            }
            inner.current_tokens = inner.current_tokens - old_tokens + token_count;
            // A refresh that grew the entry can breach the budget
            if inner.current_tokens > self.max_tokens {
                let needed = inner.current_tokens - self.max_tokens;
                return inner.evict_for(needed);
            }
            return Vec::new();
        }

        if token_count > self.max_tokens {
            tracing::warn!(
                node_id,
                token_count,
                max_tokens = self.max_tokens,
                "node exceeds the whole working-memory budget, not caching"
            );
            return Vec::new();
        }

        let evicted = if inner.current_tokens + token_count > self.max_tokens {
            let needed = inner.current_tokens + token_count - self.max_tokens;
            inner.evict_for(needed)
        } else {
            Vec::new()
        };

        let seq = inner.bump_seq();
        inner.entries.insert(
            node_id,
            WorkingMemoryEntry {
                node_id,
                content: content.into(),
                token_count,
                importance,
                added_at: Utc::now(),
                from_recall,
                added_seq: seq,
                touched_seq: seq,
            },
        );
        inner.current_tokens += token_count;
        evicted
    }

    /// Move a node to the most-recently-used position.
    ///
    /// Returns `false` when the node is not cached.
    pub fn touch(&self, node_id: i64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&node_id) {
            return false;
        }
        let seq = inner.bump_seq();
        if let Some(entry) = inner.entries.get_mut(&node_id) {
            entry.touched_seq = seq;
        }
        true
    }

    /// Drop a node from the cache (group `removed` events, forget).
    ///
    /// Returns `false` when the node was not cached.
    pub fn remove(&self, node_id: i64) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(&node_id) {
            Some(entry) => {
                inner.current_tokens -= entry.token_count;
                true
            }
            None => false,
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_tokens = 0;
    }

    /// Snapshot of all entries, unordered.
    #[must_use]
    pub fn entries(&self) -> Vec<WorkingMemoryEntry> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Concatenate cached contents in strategy order, newline-joined,
    /// dropping whole entries that would push the total past `max_tokens`.
    #[must_use]
    pub fn assemble_context(&self, strategy: ContextStrategy, max_tokens: usize) -> String {
        let now = Utc::now();
        let mut entries = self.entries();

        match strategy {
            ContextStrategy::Recent => {
                entries.sort_by(|a, b| b.touched_seq.cmp(&a.touched_seq));
            }
            ContextStrategy::Important => {
                entries.sort_by(|a, b| {
                    b.importance
                        .partial_cmp(&a.importance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.touched_seq.cmp(&a.touched_seq))
                });
            }
            ContextStrategy::Balanced => {
                entries.sort_by(|a, b| {
                    let score = |e: &WorkingMemoryEntry| {
                        let hours = (now - e.added_at).num_seconds().max(0) as f32 / 3600.0;
                        e.importance / (1.0 + hours)
                    };
                    score(b)
                        .partial_cmp(&score(a))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.touched_seq.cmp(&a.touched_seq))
                });
            }
        }

        let mut total = 0usize;
        let mut parts: Vec<&str> = Vec::new();
        for entry in &entries {
            if total + entry.token_count > max_tokens {
                continue;
            }
            total += entry.token_count;
            parts.push(&entry.content);
        }
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_never_exceeded() {
        let wm = WorkingMemory::new(100);
        for i in 0..20 {
            wm.add(i, format!("entry {i}"), 30, 1.0, false);
            assert!(wm.current_tokens() <= 100);
        }
    }

    #[test]
    fn eviction_prefers_low_importance_then_age() {
        let wm = WorkingMemory::new(100);
        // [1, 1, 5, 5, 9] at 30 tokens each, then a sixth at importance 2.
        wm.add(1, "one", 30, 1.0, false);
        wm.add(2, "two", 30, 1.0, false);
        wm.add(3, "three", 30, 5.0, false);
        // Fourth add exceeds the budget: the oldest importance-1 entry goes.
        let evicted = wm.add(4, "four", 30, 5.0, false);
        assert_eq!(evicted, vec![1]);
        // Fifth add evicts the remaining importance-1 entry.
        let evicted = wm.add(5, "five", 30, 9.0, false);
        assert_eq!(evicted, vec![2]);
        // Sixth add: only importance-5s and the 9 remain; the oldest
        // importance-5 is evicted even though the newcomer is weaker.
        let evicted = wm.add(6, "six", 30, 2.0, false);
        assert_eq!(evicted, vec![3]);

        let mut ids = wm.node_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![4, 5, 6]);
        assert_eq!(wm.current_tokens(), 90);
    }

    #[test]
    fn eviction_monotonicity() {
        let wm = WorkingMemory::new(90);
        wm.add(1, "a", 30, 3.0, false);
        wm.add(2, "b", 30, 1.0, false);
        wm.add(3, "c", 30, 2.0, false);
        let evicted = wm.add(4, "d", 60, 5.0, false);

        // Every evicted importance <= every retained importance
        let retained: Vec<f32> = wm.entries().iter().map(|e| e.importance).collect();
        for id in &evicted {
            let evicted_importance = match id {
                1 => 3.0,
                2 => 1.0,
                3 => 2.0,
                _ => unreachable!(),
            };
            for r in &retained {
                assert!(
                    evicted_importance <= *r + f32::EPSILON,
                    "evicted importance {evicted_importance} > retained {r}"
                );
            }
        }
        assert!(wm.current_tokens() <= 90);
    }

    #[test]
    fn re_add_refreshes_instead_of_duplicating() {
        let wm = WorkingMemory::new(100);
        wm.add(1, "first", 30, 1.0, false);
        let evicted = wm.add(1, "first", 30, 4.0, true);
        assert!(evicted.is_empty());
        assert_eq!(wm.len(), 1);
        assert_eq!(wm.current_tokens(), 30);
        let entry = &wm.entries()[0];
        assert!((entry.importance - 4.0).abs() < f32::EPSILON);
        assert!(entry.from_recall);
    }

    #[test]
    fn oversized_entry_is_refused() {
        let wm = WorkingMemory::new(50);
        wm.add(1, "kept", 40, 1.0, false);
        let evicted = wm.add(2, "too big", 60, 9.0, false);
        assert!(evicted.is_empty());
        assert!(wm.contains(1));
        assert!(!wm.contains(2));
    }

    #[test]
    fn touch_changes_recent_order() {
        let wm = WorkingMemory::new(1000);
        wm.add(1, "alpha", 10, 1.0, false);
        wm.add(2, "beta", 10, 1.0, false);
        assert!(wm.touch(1));

        let context = wm.assemble_context(ContextStrategy::Recent, 1000);
        assert_eq!(context, "alpha\nbeta");
        assert!(!wm.touch(99));
    }

    #[test]
    fn important_strategy_orders_by_importance() {
        let wm = WorkingMemory::new(1000);
        wm.add(1, "low", 10, 1.0, false);
        wm.add(2, "high", 10, 9.0, false);
        wm.add(3, "mid", 10, 5.0, false);

        let context = wm.assemble_context(ContextStrategy::Important, 1000);
        assert_eq!(context, "high\nmid\nlow");
    }

    #[test]
    fn balanced_strategy_prefers_fresh_important_entries() {
        let wm = WorkingMemory::new(1000);
        wm.add(1, "old-important", 10, 5.0, false);
        wm.add(2, "new-important", 10, 5.0, false);
        // Same importance and effectively the same age: recency breaks the tie.
        let context = wm.assemble_context(ContextStrategy::Balanced, 1000);
        assert_eq!(context, "new-important\nold-important");
    }

    #[test]
    fn assemble_context_respects_token_budget() {
        let wm = WorkingMemory::new(1000);
        wm.add(1, "one", 40, 1.0, false);
        wm.add(2, "two", 40, 2.0, false);
        wm.add(3, "three", 40, 3.0, false);

        let context = wm.assemble_context(ContextStrategy::Important, 80);
        // Only the two most important fit
        assert_eq!(context, "three\ntwo");
    }

    #[test]
    fn remove_frees_tokens() {
        let wm = WorkingMemory::new(100);
        wm.add(1, "x", 30, 1.0, false);
        assert!(wm.remove(1));
        assert!(!wm.remove(1));
        assert_eq!(wm.current_tokens(), 0);
        assert!(wm.is_empty());
    }
}
