//! Drops candidates that were already ingested, before any LLM spend.
//!
//! The key is the exact `source_url`. A candidate is a duplicate if the store
//! already holds it or if an earlier candidate in the same cycle had the same
//! URL (the same story is often listed under two categories).

use crate::error::StoreError;
use crate::models::RawCandidate;
use crate::store::ArticleStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

pub struct DedupGate {
    store: Arc<dyn ArticleStore>,
    seen: Mutex<HashSet<String>>,
}

impl DedupGate {
    pub fn new(store: Arc<dyn ArticleStore>) -> Self {
        Self {
            store,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// `true` if the candidate must be skipped. Marks it seen otherwise.
    pub async fn is_duplicate(&self, candidate: &RawCandidate) -> Result<bool, StoreError> {
        let first_in_cycle = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(candidate.source_url.clone());
        if !first_in_cycle {
            return Ok(true);
        }
        self.store.exists_by_source_url(&candidate.source_url).await
    }

    /// Keep only new candidates, preserving order.
    ///
    /// A store failure for one candidate drops that candidate; a failing store
    /// must never let duplicates through to the rewriter.
    #[instrument(level = "info", skip_all, fields(candidates = candidates.len()))]
    pub async fn filter(&self, candidates: Vec<RawCandidate>) -> (Vec<RawCandidate>, DedupCounts) {
        let mut counts = DedupCounts::default();
        let mut fresh = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.is_duplicate(&candidate).await {
                Ok(false) => fresh.push(candidate),
                Ok(true) => {
                    debug!(url = %candidate.source_url, "Duplicate dropped");
                    counts.duplicates += 1;
                }
                Err(e) => {
                    warn!(url = %candidate.source_url, error = %e, "Dedup lookup failed; skipping");
                    counts.lookup_failures += 1;
                }
            }
        }
        info!(
            fresh = fresh.len(),
            duplicates = counts.duplicates,
            lookup_failures = counts.lookup_failures,
            "Dedup complete"
        );
        (fresh, counts)
    }

    /// Treat `urls` as already handled for this cycle.
    pub fn mark_seen<I: IntoIterator<Item = String>>(&self, urls: I) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(urls);
    }

    /// Forget the per-cycle seen set.
    pub fn reset(&self) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupCounts {
    pub duplicates: usize,
    pub lookup_failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{candidate, new_article};
    use crate::store::memory::MemoryArticleStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_persisted_url_is_duplicate() {
        let store = Arc::new(MemoryArticleStore::new());
        store
            .insert_if_absent(new_article("https://site/a", Utc::now()))
            .await
            .unwrap();
        let gate = DedupGate::new(store);

        assert!(gate.is_duplicate(&candidate("https://site/a", "X")).await.unwrap());
        assert!(!gate.is_duplicate(&candidate("https://site/b", "Y")).await.unwrap());
    }

    #[tokio::test]
    async fn test_repeat_within_cycle_is_duplicate() {
        let gate = DedupGate::new(Arc::new(MemoryArticleStore::new()));
        let (fresh, counts) = gate
            .filter(vec![
                candidate("https://site/a", "En economía"),
                candidate("https://site/b", "Otra"),
                candidate("https://site/a", "En política"),
            ])
            .await;

        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].title, "En economía");
        assert_eq!(counts.duplicates, 1);

        gate.mark_seen(["https://site/c".to_string()]);
        assert!(gate.is_duplicate(&candidate("https://site/c", "Z")).await.unwrap());

        gate.reset();
        assert!(!gate.is_duplicate(&candidate("https://site/a", "X")).await.unwrap());
    }

    #[tokio::test]
    async fn test_matching_is_exact() {
        let gate = DedupGate::new(Arc::new(MemoryArticleStore::new()));
        assert!(!gate.is_duplicate(&candidate("https://site/a", "X")).await.unwrap());
        assert!(!gate.is_duplicate(&candidate("https://site/a?utm=1", "X")).await.unwrap());
    }
}
