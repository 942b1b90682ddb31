//! Bounded-retry reset of every user collection.
//!
//! A reset runs one bulk mutation per collection concurrently and treats the
//! joined set as a single unit of work: if any collection fails, the whole
//! batch (enumeration included) is re-run after an exponential backoff.
//! Deleting all documents and dropping all indexes are idempotent, so a
//! re-run after partial success converges on the same end state.

use futures::future::join_all;
use mongokit_common::{MongoKitError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::collections::{list_resettable_resources, ResettableStore};

/// Backoff schedule for retrying a whole batch
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Multiplier applied to the delay after each failed retry
    pub backoff_factor: f64,
    /// Delay before the first retry
    pub min_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_factor: 2.0,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy that runs the operation once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed): `min(max_delay, min_delay * factor^retry)`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let delay_nanos = self.min_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        if !delay_nanos.is_finite() || delay_nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(delay_nanos.max(0.0).round() as u64)
    }

    /// Run `op` until it succeeds, fails fatally, or the attempt budget is spent.
    ///
    /// Fatal errors (`is_fatal`) are returned immediately. Exhaustion returns
    /// `RetryExhausted`; deciding whether that ends the process is left to
    /// the caller.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempts > 0 {
                        info!(operation, attempts = attempts + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_fatal() => {
                    error!(operation, error = %err, "fatal error, not retrying");
                    return Err(err);
                }
                Err(err) => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        error!(operation, attempts, error = %err, "retries exhausted");
                        return Err(MongoKitError::RetryExhausted {
                            operation: operation.to_string(),
                            attempts,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = self.delay_for_retry(attempts - 1);
                    warn!(
                        operation,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "batch failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Outcome of a successful reset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    /// Collections touched by the final, successful batch
    pub collections: Vec<String>,
    /// Documents removed by the final batch (always 0 for index resets)
    pub documents_deleted: u64,
}

/// Runs data and index resets against a store under a retry policy
pub struct ResetEngine<S: ResettableStore> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S: ResettableStore> ResetEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    pub fn with_policy(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delete every document in every user collection
    #[instrument(skip(self))]
    pub async fn reset_all_data(&self) -> Result<ResetReport> {
        self.policy
            .run("reset_all_data", || self.delete_batch())
            .await
    }

    /// Drop every secondary index in every user collection
    #[instrument(skip(self))]
    pub async fn reset_all_indexes(&self) -> Result<ResetReport> {
        self.policy
            .run("reset_all_indexes", || self.drop_indexes_batch())
            .await
    }

    async fn delete_batch(&self) -> Result<ResetReport> {
        let resources = list_resettable_resources(self.store.as_ref()).await?;
        let results = join_all(
            resources
                .iter()
                .map(|r| self.store.delete_all_documents(&r.handle)),
        )
        .await;

        let names = resources.into_iter().map(|r| r.name).collect::<Vec<_>>();
        let deleted = collect_batch(&names, results)?;
        Ok(ResetReport {
            documents_deleted: deleted.iter().sum(),
            collections: names,
        })
    }

    async fn drop_indexes_batch(&self) -> Result<ResetReport> {
        let resources = list_resettable_resources(self.store.as_ref()).await?;
        let results = join_all(
            resources
                .iter()
                .map(|r| self.store.drop_all_indexes(&r.handle)),
        )
        .await;

        let names = resources.into_iter().map(|r| r.name).collect::<Vec<_>>();
        collect_batch(&names, results)?;
        Ok(ResetReport {
            collections: names,
            documents_deleted: 0,
        })
    }
}

/// Fold per-collection results into one outcome for the batch.
///
/// A fatal error is passed through unchanged so it is not retried; any other
/// failure becomes a `Transient` error naming the first failing collection.
fn collect_batch<T>(names: &[String], results: Vec<Result<T>>) -> Result<Vec<T>> {
    let total = results.len();
    let mut values = Vec::with_capacity(total);
    let mut failures: Vec<(&str, MongoKitError)> = Vec::new();

    for (name, result) in names.iter().zip(results) {
        match result {
            Ok(value) => values.push(value),
            Err(err) => failures.push((name.as_str(), err)),
        }
    }

    if let Some(pos) = failures.iter().position(|(_, err)| err.is_fatal()) {
        return Err(failures.swap_remove(pos).1);
    }
    match failures.first() {
        None => Ok(values),
        Some((name, err)) => Err(MongoKitError::Transient(format!(
            "{} of {} collections failed, first {}: {}",
            failures.len(),
            total,
            name,
            err
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use bson::doc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        for i in 0..3 {
            store.insert("A", doc! { "n": i });
        }
        store.create_collection("B");
        store.insert("system.profile", doc! { "op": "query" });
        store
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.min_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u128> = (0..9).map(|n| policy.delay_for_retry(n).as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
        assert_eq!(policy.delay_for_retry(u32::MAX), policy.max_delay);
    }

    #[tokio::test]
    async fn test_reset_all_data_empties_collections() {
        let store = seeded_store();
        let engine = ResetEngine::new(Arc::new(store.clone()));

        let report = engine.reset_all_data().await.unwrap();

        assert_eq!(report.collections, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(report.documents_deleted, 3);
        assert_eq!(store.count("A"), 0);
        assert_eq!(store.count("B"), 0);
        assert_eq!(store.count("system.profile"), 1);
    }

    #[tokio::test]
    async fn test_reset_all_data_is_idempotent() {
        let store = seeded_store();
        let engine = ResetEngine::new(Arc::new(store.clone()));

        engine.reset_all_data().await.unwrap();
        let second = engine.reset_all_data().await.unwrap();

        assert_eq!(second.documents_deleted, 0);
        assert_eq!(store.count("A"), 0);
    }

    #[tokio::test]
    async fn test_reset_all_indexes_skips_system_collections() {
        let store = seeded_store();
        store.create_index("A", "n_1");
        store.create_index("system.profile", "ts_1");
        let engine = ResetEngine::new(Arc::new(store.clone()));

        engine.reset_all_indexes().await.unwrap();

        assert_eq!(store.indexes("A"), vec!["_id_".to_string()]);
        assert_eq!(
            store.indexes("system.profile"),
            vec!["_id_".to_string(), "ts_1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_zero_collections_succeeds() {
        let engine = ResetEngine::new(Arc::new(MemoryStore::new()));
        let report = engine.reset_all_data().await.unwrap();
        assert!(report.collections.is_empty());
        assert!(engine.reset_all_indexes().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_fourth_attempt_after_backoff() {
        let store = seeded_store();
        store.fail_next_batches(3);
        let engine = ResetEngine::new(Arc::new(store.clone()));

        let start = Instant::now();
        engine.reset_all_data().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(store.enumerations(), 4);
        assert_eq!(store.count("A"), 0);
        assert!(elapsed >= Duration::from_millis(70));
        assert!(elapsed < Duration::from_millis(75));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_retry_exhausted() {
        let store = seeded_store();
        store.fail_always();
        let engine = ResetEngine::new(Arc::new(store.clone()));

        let err = engine.reset_all_data().await.unwrap_err();

        match err {
            MongoKitError::RetryExhausted {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "reset_all_data");
                assert_eq!(attempts, 10);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(store.enumerations(), 10);
        assert_eq!(store.count("A"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failed_delete_reruns_whole_batch() {
        let store = seeded_store();
        store.insert("B", doc! { "n": 10 });
        store.insert("B", doc! { "n": 11 });
        store.fail_delete_on("B", 2);
        let engine = ResetEngine::new(Arc::new(store.clone()));

        let start = Instant::now();
        let report = engine.reset_all_data().await.unwrap();

        assert_eq!(store.enumerations(), 3);
        assert_eq!(store.mutation_calls("A"), 3);
        assert_eq!(store.mutation_calls("B"), 3);
        assert_eq!(store.mutation_calls("system.profile"), 0);
        assert_eq!(store.count("A"), 0);
        assert_eq!(store.count("B"), 0);
        // A was emptied by the first batch, so only B's documents remain for the last one
        assert_eq!(report.documents_deleted, 2);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failed_index_drop_reruns_whole_batch() {
        let store = seeded_store();
        store.create_index("A", "n_1");
        store.create_index("B", "m_1");
        store.fail_drop_indexes_on("A", 1);
        let engine = ResetEngine::new(Arc::new(store.clone()));

        let report = engine.reset_all_indexes().await.unwrap();

        assert_eq!(report.collections, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(store.enumerations(), 2);
        assert_eq!(store.mutation_calls("A"), 2);
        assert_eq!(store.mutation_calls("B"), 2);
        assert_eq!(store.indexes("A"), vec!["_id_".to_string()]);
        assert_eq!(store.indexes("B"), vec!["_id_".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_collection_failure_exhausts() {
        let store = seeded_store();
        store.fail_delete_on("A", u32::MAX);
        let engine = ResetEngine::new(Arc::new(store.clone()));

        let err = engine.reset_all_data().await.unwrap_err();

        match err {
            MongoKitError::RetryExhausted { attempts, last_error, .. } => {
                assert_eq!(attempts, 10);
                assert!(last_error.contains("1 of 2 collections failed, first A"));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(store.mutation_calls("B"), 10);
        assert_eq!(store.count("A"), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let err = policy
            .run("reset_all_data", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MongoKitError::ConnectionRefused("refused".to_string())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MongoKitError::ConnectionRefused(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy_runs_once() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::no_retry()
            .run("op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MongoKitError::Transient("boom".to_string())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MongoKitError::RetryExhausted { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collect_batch_prefers_fatal_error() {
        let names = vec!["a".to_string(), "b".to_string()];
        let results: Vec<Result<()>> = vec![
            Err(MongoKitError::MongoDB("boom".to_string())),
            Err(MongoKitError::ConnectionRefused("refused".to_string())),
        ];
        let err = collect_batch(&names, results).unwrap_err();
        assert!(matches!(err, MongoKitError::ConnectionRefused(_)));
    }

    #[test]
    fn test_collect_batch_names_first_failure() {
        let names = vec!["a".to_string(), "b".to_string()];
        let results: Vec<Result<u64>> = vec![Ok(1), Err(MongoKitError::MongoDB("boom".to_string()))];
        let err = collect_batch(&names, results).unwrap_err();
        assert_eq!(
            err,
            MongoKitError::Transient("1 of 2 collections failed, first b: MongoDB error: boom".to_string())
        );
    }
}
