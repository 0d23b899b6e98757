//! Idempotency ledger.
//!
//! One entry per idempotency key. `check_and_reserve` atomically inserts a
//! pending entry or reports the existing state; `commit` and `fail` move a
//! pending entry to its terminal state exactly once and accept identical
//! repeats.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tether_models::{IdempotencyKey, LedgerContext, LedgerEntry, LedgerStatus, Reservation};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::metrics;

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Reserve `key` for `owner`, or report its existing state.
    async fn check_and_reserve(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        context: &LedgerContext,
    ) -> StoreResult<Reservation>;

    /// Record success. Repeating with the same result is a no-op; a different
    /// result or a prior failure is a conflict.
    async fn commit(&self, key: &IdempotencyKey, result: &Value) -> StoreResult<()>;

    /// Record a terminal failure. Repeating with the same error is a no-op.
    async fn fail(&self, key: &IdempotencyKey, error: &str) -> StoreResult<()>;

    /// Give up a reservation without a terminal write; the entry stays
    /// pending and the next reservation takes it over immediately.
    async fn release(&self, key: &IdempotencyKey, owner: &str) -> StoreResult<()>;

    async fn get(&self, key: &IdempotencyKey) -> StoreResult<Option<LedgerEntry>>;
}

// =============================================================================
// Guarded side effects
// =============================================================================

/// Errors produced by a guarded effect.
pub trait EffectError: fmt::Display {
    /// Terminal failures are written to the ledger; anything else releases the
    /// reservation so the effect can be attempted again.
    fn is_terminal(&self) -> bool;
}

/// Result of a guarded effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Guarded {
    Executed(Value),
    /// The effect already ran; this is its recorded result
    Replayed(Value),
}

impl Guarded {
    pub fn is_replay(&self) -> bool {
        matches!(self, Guarded::Replayed(_))
    }

    pub fn into_value(self) -> Value {
        match self {
            Guarded::Executed(v) | Guarded::Replayed(v) => v,
        }
    }
}

#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error("Ledger error: {0}")]
    Store(StoreError),

    #[error("{key} is in progress elsewhere")]
    InProgress { key: String },

    #[error("{key} previously failed: {error}")]
    AlreadyFailed { key: String, error: String },

    #[error("{0}")]
    Effect(E),
}

/// Run `effect` at most once per key: reserve, run, then commit or fail.
pub async fn guard<F, Fut, E>(
    ledger: &dyn Ledger,
    key: &IdempotencyKey,
    owner: &str,
    context: &LedgerContext,
    effect: F,
) -> Result<Guarded, GuardError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, E>>,
    E: EffectError,
{
    match ledger
        .check_and_reserve(key, owner, context)
        .await
        .map_err(GuardError::Store)?
    {
        Reservation::Reserved => {}
        Reservation::AlreadySucceeded(value) => {
            debug!(idempotency_key = %key, "Replaying recorded result");
            return Ok(Guarded::Replayed(value));
        }
        Reservation::AlreadyFailed(error) => {
            return Err(GuardError::AlreadyFailed {
                key: key.to_string(),
                error,
            })
        }
        Reservation::InProgress { .. } => {
            return Err(GuardError::InProgress {
                key: key.to_string(),
            })
        }
    }

    match effect().await {
        Ok(value) => {
            ledger.commit(key, &value).await.map_err(GuardError::Store)?;
            Ok(Guarded::Executed(value))
        }
        Err(e) if e.is_terminal() => {
            if let Err(store_err) = ledger.fail(key, &e.to_string()).await {
                warn!(idempotency_key = %key, "Failed to record terminal failure: {}", store_err);
            }
            Err(GuardError::Effect(e))
        }
        Err(e) => {
            if let Err(store_err) = ledger.release(key, owner).await {
                warn!(idempotency_key = %key, "Failed to release reservation: {}", store_err);
            }
            Err(GuardError::Effect(e))
        }
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

pub struct InMemoryLedger {
    entries: Mutex<HashMap<IdempotencyKey, LedgerEntry>>,
    lease: chrono::Duration,
    retention: chrono::Duration,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl InMemoryLedger {
    pub fn new(lease: Duration, retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lease: to_chrono(lease),
            retention: to_chrono(retention),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.ledger_lease, config.ledger_retention)
    }

    /// Drop entries past their retention deadline. Returns how many.
    pub async fn purge_expired(&self, now: chrono::DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn finish(
        &self,
        key: &IdempotencyKey,
        status: LedgerStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        let entry = entries
            .entry(key.clone())
            .and_modify(|e| {
                if e.is_expired(now) {
                    *e = LedgerEntry::pending(key.clone(), "", self.lease, self.retention, LedgerContext::default());
                }
            })
            .or_insert_with(|| {
                LedgerEntry::pending(key.clone(), "", self.lease, self.retention, LedgerContext::default())
            });

        match entry.status {
            LedgerStatus::Pending => {
                entry.status = status;
                entry.result = result.cloned();
                entry.last_error = error.map(str::to_string);
                entry.owner = None;
                entry.lease_expires_at = None;
                entry.updated_at = now;
                Ok(())
            }
            existing if existing == status
                && entry.result.as_ref() == result
                && entry.last_error.as_deref() == error =>
            {
                Ok(())
            }
            existing => Err(StoreError::conflict(
                key.as_str(),
                format!("already {}, refusing {}", existing, status),
            )),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn check_and_reserve(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        context: &LedgerContext,
    ) -> StoreResult<Reservation> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        let reservation = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => match entry.status {
                LedgerStatus::Succeeded => {
                    Reservation::AlreadySucceeded(entry.result.clone().unwrap_or(Value::Null))
                }
                LedgerStatus::Failed => {
                    Reservation::AlreadyFailed(entry.last_error.clone().unwrap_or_default())
                }
                LedgerStatus::Pending if entry.is_leased_by_other(owner, now) => {
                    Reservation::InProgress {
                        lease_expires_at: entry.lease_expires_at.unwrap_or(now),
                    }
                }
                LedgerStatus::Pending => {
                    if entry.owner.as_deref() != Some(owner) {
                        entry.attempts += 1;
                    }
                    entry.owner = Some(owner.to_string());
                    entry.lease_expires_at = Some(now + self.lease);
                    entry.updated_at = now;
                    Reservation::Reserved
                }
            },
            _ => {
                entries.insert(
                    key.clone(),
                    LedgerEntry::pending(key.clone(), owner, self.lease, self.retention, context.clone()),
                );
                Reservation::Reserved
            }
        };

        metrics::record_reservation(reservation.as_str());
        Ok(reservation)
    }

    async fn commit(&self, key: &IdempotencyKey, result: &Value) -> StoreResult<()> {
        self.finish(key, LedgerStatus::Succeeded, Some(result), None)
            .await
    }

    async fn fail(&self, key: &IdempotencyKey, error: &str) -> StoreResult<()> {
        self.finish(key, LedgerStatus::Failed, None, Some(error)).await
    }

    async fn release(&self, key: &IdempotencyKey, owner: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.status == LedgerStatus::Pending && entry.owner.as_deref() == Some(owner) {
                entry.owner = None;
                entry.lease_expires_at = None;
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn get(&self, key: &IdempotencyKey) -> StoreResult<Option<LedgerEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(Utc::now()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::derive("test", &[s])
    }

    #[derive(Debug)]
    struct TestError {
        terminal: bool,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error (terminal: {})", self.terminal)
        }
    }

    impl EffectError for TestError {
        fn is_terminal(&self) -> bool {
            self.terminal
        }
    }

    #[tokio::test]
    async fn test_reserve_commit_replay() {
        let ledger = InMemoryLedger::default();
        let k = key("a");
        let ctx = LedgerContext::default();

        assert_eq!(ledger.check_and_reserve(&k, "w1", &ctx).await.unwrap(), Reservation::Reserved);
        ledger.commit(&k, &json!({"charged": 10})).await.unwrap();

        assert_eq!(
            ledger.check_and_reserve(&k, "w2", &ctx).await.unwrap(),
            Reservation::AlreadySucceeded(json!({"charged": 10}))
        );
        // identical terminal write is accepted
        ledger.commit(&k, &json!({"charged": 10})).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflicting_terminal_writes() {
        let ledger = InMemoryLedger::default();
        let k = key("a");
        ledger.check_and_reserve(&k, "w1", &LedgerContext::default()).await.unwrap();
        ledger.commit(&k, &json!(1)).await.unwrap();

        assert!(ledger.commit(&k, &json!(2)).await.unwrap_err().is_conflict());
        assert!(ledger.fail(&k, "boom").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_failed_entry_reports_error() {
        let ledger = InMemoryLedger::default();
        let k = key("a");
        let ctx = LedgerContext::default();
        ledger.check_and_reserve(&k, "w1", &ctx).await.unwrap();
        ledger.fail(&k, "card declined").await.unwrap();
        ledger.fail(&k, "card declined").await.unwrap();

        assert_eq!(
            ledger.check_and_reserve(&k, "w1", &ctx).await.unwrap(),
            Reservation::AlreadyFailed("card declined".to_string())
        );
    }

    #[tokio::test]
    async fn test_live_lease_blocks_other_owner() {
        let ledger = InMemoryLedger::new(Duration::from_secs(60), Duration::from_secs(3600));
        let k = key("a");
        let ctx = LedgerContext::default();
        ledger.check_and_reserve(&k, "w1", &ctx).await.unwrap();

        assert!(matches!(
            ledger.check_and_reserve(&k, "w2", &ctx).await.unwrap(),
            Reservation::InProgress { .. }
        ));
        // the holder may re-reserve
        assert_eq!(ledger.check_and_reserve(&k, "w1", &ctx).await.unwrap(), Reservation::Reserved);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let ledger = InMemoryLedger::new(Duration::ZERO, Duration::from_secs(3600));
        let k = key("a");
        let ctx = LedgerContext::default();
        ledger.check_and_reserve(&k, "w1", &ctx).await.unwrap();

        assert_eq!(ledger.check_and_reserve(&k, "w2", &ctx).await.unwrap(), Reservation::Reserved);
        let entry = ledger.get(&k).await.unwrap().unwrap();
        assert_eq!(entry.owner.as_deref(), Some("w2"));
        assert_eq!(entry.attempts, 2);
    }

    #[tokio::test]
    async fn test_release_lets_next_owner_in() {
        let ledger = InMemoryLedger::new(Duration::from_secs(60), Duration::from_secs(3600));
        let k = key("a");
        let ctx = LedgerContext::default();
        ledger.check_and_reserve(&k, "w1", &ctx).await.unwrap();
        ledger.release(&k, "w1").await.unwrap();

        assert_eq!(ledger.check_and_reserve(&k, "w2", &ctx).await.unwrap(), Reservation::Reserved);
        assert_eq!(ledger.get(&k).await.unwrap().unwrap().status, LedgerStatus::Pending);
    }

    #[tokio::test]
    async fn test_retention_expiry() {
        let ledger = InMemoryLedger::new(Duration::from_secs(60), Duration::ZERO);
        let k = key("a");
        ledger.check_and_reserve(&k, "w1", &LedgerContext::default()).await.unwrap();

        assert!(ledger.get(&k).await.unwrap().is_none());
        assert_eq!(ledger.purge_expired(Utc::now()).await, 1);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_guard_runs_effect_once() {
        let ledger = InMemoryLedger::default();
        let k = key("effect");
        let ctx = LedgerContext::default();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let result = guard(&ledger, &k, "w1", &ctx, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(json!("done"))
            })
            .await
            .unwrap();
            assert_eq!(result.into_value(), json!("done"));
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_transient_failure_releases() {
        let ledger = InMemoryLedger::default();
        let k = key("effect");
        let ctx = LedgerContext::default();

        let err = guard(&ledger, &k, "w1", &ctx, || async {
            Err::<Value, _>(TestError { terminal: false })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GuardError::Effect(_)));

        let retried = guard(&ledger, &k, "w2", &ctx, || async { Ok::<_, TestError>(json!(1)) })
            .await
            .unwrap();
        assert!(!retried.is_replay());
    }

    #[tokio::test]
    async fn test_guard_terminal_failure_sticks() {
        let ledger = InMemoryLedger::default();
        let k = key("effect");
        let ctx = LedgerContext::default();

        let _ = guard(&ledger, &k, "w1", &ctx, || async {
            Err::<Value, _>(TestError { terminal: true })
        })
        .await;

        let err = guard(&ledger, &k, "w1", &ctx, || async { Ok::<_, TestError>(json!(1)) })
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::AlreadyFailed { .. }));
    }
}
