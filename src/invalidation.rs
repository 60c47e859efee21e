//! Invalidation Engine (C3). Executes a `PatternSpec` against the store
//! with bounded concurrency and batched deletes, isolating per-family
//! failures so siblings always run to completion.

use crate::event::{Family, InvalidationResult, PatternSpec};
use crate::store::StoreAdapter;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::warn;

pub struct InvalidationEngine {
    store: Arc<dyn StoreAdapter>,
    semaphore: Arc<Semaphore>,
    batch_size: usize,
}

struct FamilyOutcome {
    family: Family,
    keys_deleted: u64,
    failed: bool,
}

impl InvalidationEngine {
    pub fn new(store: Arc<dyn StoreAdapter>, max_concurrent_families: usize, batch_size: usize) -> Self {
        Self {
            store,
            semaphore: Arc::new(Semaphore::new(max_concurrent_families.max(1))),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn invalidate(&self, spec: &PatternSpec) -> InvalidationResult {
        let start = Instant::now();

        if spec.is_empty() {
            return InvalidationResult {
                invalidated_keys: 0,
                families_touched: Vec::new(),
                duration_ms: start.elapsed().as_millis() as u64,
                partial_failures: Vec::new(),
                fatal: None,
            };
        }

        let mut tasks = Vec::with_capacity(spec.len());
        for (family, globs) in spec.iter() {
            let family = *family;
            let globs = globs.clone();
            let store = self.store.clone();
            let semaphore = self.semaphore.clone();
            let batch_size = self.batch_size;
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_family(store, family, &globs, batch_size).await
            }));
        }

        let joined = futures_util::future::join_all(tasks).await;

        let mut invalidated_keys = 0u64;
        let mut families_touched = Vec::new();
        let mut partial_failures = Vec::new();

        for result in joined {
            match result {
                Ok(outcome) => {
                    invalidated_keys += outcome.keys_deleted;
                    families_touched.push(outcome.family);
                    if outcome.failed {
                        partial_failures.push(outcome.family);
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "invalidation family task panicked");
                }
            }
        }

        InvalidationResult {
            invalidated_keys,
            families_touched,
            duration_ms: start.elapsed().as_millis() as u64,
            partial_failures,
            fatal: None,
        }
    }
}

async fn run_family(
    store: Arc<dyn StoreAdapter>,
    family: Family,
    globs: &[String],
    batch_size: usize,
) -> FamilyOutcome {
    let mut keys_deleted = 0u64;
    let mut failed = false;

    for glob in globs {
        let keys = match store.scan_pattern(glob, batch_size).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(family = family.as_str(), pattern = glob, error = %err, "scan failed");
                failed = true;
                continue;
            }
        };

        if keys.is_empty() {
            continue;
        }

        for batch in keys.chunks(batch_size) {
            match store.delete_many(batch).await {
                Ok(n) => keys_deleted += n,
                Err(err) => {
                    warn!(family = family.as_str(), error = %err, "batch delete failed, falling back to per-key delete");
                    for key in batch {
                        match store.delete_many(std::slice::from_ref(key)).await {
                            Ok(n) => keys_deleted += n,
                            Err(err) => {
                                warn!(key, error = %err, "per-key delete failed");
                                failed = true;
                            }
                        }
                    }
                }
            }
        }
    }

    FamilyOutcome {
        family,
        keys_deleted,
        failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeStore;
    use std::time::Duration;

    async fn seed(store: &FakeStore, keys: &[&str]) {
        for key in keys {
            store.set_with_ttl(key, b"v", Duration::from_secs(60)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn empty_spec_is_a_success_noop() {
        let store = Arc::new(FakeStore::new());
        let engine = InvalidationEngine::new(store, 5, 1000);
        let spec = PatternSpec::new();
        let result = engine.invalidate(&spec).await;
        assert_eq!(result.invalidated_keys, 0);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn deletes_matching_keys_across_families() {
        let fake = FakeStore::new();
        seed(&fake, &["greeks:A:latest", "greeks:A:live", "chain:NIFTY:x"]).await;
        let store: Arc<dyn StoreAdapter> = Arc::new(fake);
        let engine = InvalidationEngine::new(store.clone(), 5, 1000);

        let mut spec = PatternSpec::new();
        spec.push(Family::Greeks, vec!["greeks:A:*".to_string()]);
        spec.push(Family::ChainData, vec!["chain:NIFTY:*".to_string()]);

        let result = engine.invalidate(&spec).await;
        assert_eq!(result.invalidated_keys, 3);
        assert_eq!(result.families_touched.len(), 2);
        assert!(result.partial_failures.is_empty());
    }

    #[tokio::test]
    async fn idempotent_invalidation_is_a_noop_second_time() {
        let fake = FakeStore::new();
        seed(&fake, &["greeks:A:latest"]).await;
        let store: Arc<dyn StoreAdapter> = Arc::new(fake);
        let engine = InvalidationEngine::new(store, 5, 1000);

        let mut spec = PatternSpec::new();
        spec.push(Family::Greeks, vec!["greeks:A:*".to_string()]);

        let first = engine.invalidate(&spec).await;
        let second = engine.invalidate(&spec).await;
        assert_eq!(first.invalidated_keys, 1);
        assert_eq!(second.invalidated_keys, 0);
        assert!(second.is_success());
    }

    #[tokio::test]
    async fn sequential_with_single_permit_still_correct() {
        let fake = FakeStore::new();
        seed(&fake, &["greeks:A:latest", "indicators:B:rsi:1m:x"]).await;
        let store: Arc<dyn StoreAdapter> = Arc::new(fake);
        let engine = InvalidationEngine::new(store, 1, 1000);

        let mut spec = PatternSpec::new();
        spec.push(Family::Greeks, vec!["greeks:A:*".to_string()]);
        spec.push(Family::Indicators, vec!["indicators:B:*".to_string()]);

        let result = engine.invalidate(&spec).await;
        assert_eq!(result.invalidated_keys, 2);
    }
}
