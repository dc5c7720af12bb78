//! Idempotency records: at most one concurrent execution per key.
//!
//! The first caller for a key gets an [`IdempotencyGuard`] and runs the
//! request. Callers arriving while it is in flight get a [`Waiter`] on the
//! same outcome, and callers arriving after it completed get the cached
//! result. Records live in memory only and are lost on restart.

use crate::error::AiError;
use crate::types::ExecutionResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Idempotency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long settled records are kept
    pub retention_ms: u64,
    /// How long a record may stay in flight before it is considered dangling
    pub in_flight_timeout_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_ms: 600_000,
            in_flight_timeout_ms: 120_000,
        }
    }
}

impl IdempotencyConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_ms = retention.as_millis() as u64;
        self
    }

    pub fn with_in_flight_timeout(mut self, timeout: Duration) -> Self {
        self.in_flight_timeout_ms = timeout.as_millis() as u64;
        self
    }

    fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    fn in_flight_timeout(&self) -> Duration {
        Duration::from_millis(self.in_flight_timeout_ms)
    }
}

/// Status of an idempotency record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    InFlight,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
enum Outcome {
    Pending,
    Completed(ExecutionResult),
    Failed(AiError),
}

impl Outcome {
    fn status(&self) -> RecordStatus {
        match self {
            Outcome::Pending => RecordStatus::InFlight,
            Outcome::Completed(_) => RecordStatus::Completed,
            Outcome::Failed(_) => RecordStatus::Failed,
        }
    }
}

/// Settle a pending outcome. Settled outcomes never change again.
fn settle_outcome(tx: &watch::Sender<Outcome>, outcome: Outcome) -> bool {
    tx.send_if_modified(|current| {
        if matches!(current, Outcome::Pending) {
            *current = outcome;
            true
        } else {
            false
        }
    })
}

#[derive(Debug)]
struct Record {
    generation: u64,
    created_at: Instant,
    settled_at: Option<Instant>,
    tx: Arc<watch::Sender<Outcome>>,
}

impl Record {
    fn status(&self) -> RecordStatus {
        self.tx.borrow().status()
    }
}

/// Result of [`IdempotencyManager::acquire`]
#[derive(Debug)]
pub enum Acquired<'a> {
    /// First observation of the key; the holder must execute the run
    New(IdempotencyGuard<'a>),
    /// Another caller is executing; wait for its outcome
    InFlight(Waiter),
    /// A cached result within the retention window
    Completed(ExecutionResult),
}

/// In-memory table of idempotency records.
#[derive(Debug, Default)]
pub struct IdempotencyManager {
    config: IdempotencyConfig,
    records: DashMap<String, Record>,
    generations: AtomicU64,
    last_sweep: Mutex<Option<Instant>>,
}

impl IdempotencyManager {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            generations: AtomicU64::new(0),
            last_sweep: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    fn new_record(&self) -> (Record, Arc<watch::Sender<Outcome>>, u64) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (tx, _rx) = watch::channel(Outcome::Pending);
        let tx = Arc::new(tx);
        let record = Record {
            generation,
            created_at: Instant::now(),
            settled_at: None,
            tx: tx.clone(),
        };
        (record, tx, generation)
    }

    fn guard(&self, key: &str, tx: Arc<watch::Sender<Outcome>>, generation: u64) -> IdempotencyGuard<'_> {
        IdempotencyGuard {
            manager: self,
            key: key.to_string(),
            generation,
            tx,
            settled: false,
        }
    }

    /// Look up or create the record for `key`.
    ///
    /// Failed and expired records are replaced by a fresh in-flight record;
    /// the old record is left untouched for anyone still observing it. An
    /// in-flight record older than the in-flight timeout is failed with
    /// [`AiError::Cancelled`] and replaced the same way.
    ///
    /// At most once per retention window, expired records of every key are
    /// swept first, so the table stays bounded under distinct keys.
    pub fn acquire(&self, key: &str) -> Acquired<'_> {
        let now = Instant::now();
        self.sweep_if_due(now);
        match self.records.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let (record, tx, generation) = self.new_record();
                vacant.insert(record);
                Acquired::New(self.guard(key, tx, generation))
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get();
                match &*record.tx.borrow() {
                    Outcome::Completed(result) if !self.expired(record, now) => {
                        return Acquired::Completed(result.clone());
                    }
                    Outcome::Pending
                        if now.duration_since(record.created_at) < self.config.in_flight_timeout() =>
                    {
                        return Acquired::InFlight(Waiter {
                            key: key.to_string(),
                            rx: record.tx.subscribe(),
                            timeout: self.config.in_flight_timeout(),
                        });
                    }
                    _ => {}
                }

                if record.status() == RecordStatus::InFlight {
                    tracing::warn!(key, "in-flight idempotency record timed out, replacing");
                    settle_outcome(
                        &record.tx,
                        Outcome::Failed(AiError::cancelled("in-flight run timed out")),
                    );
                }
                let (record, tx, generation) = self.new_record();
                occupied.insert(record);
                Acquired::New(self.guard(key, tx, generation))
            }
        }
    }

    fn sweep_if_due(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| now.duration_since(at) < self.config.retention()) {
                return;
            }
            *last = Some(now);
        }
        let removed = self.purge_at(now);
        if removed > 0 {
            tracing::debug!(removed, "swept expired idempotency records");
        }
    }

    fn expired(&self, record: &Record, now: Instant) -> bool {
        record
            .settled_at
            .is_some_and(|at| now.duration_since(at) >= self.config.retention())
    }

    fn mark_settled(&self, key: &str, generation: u64) {
        if let Some(mut record) = self.records.get_mut(key) {
            if record.generation == generation {
                record.settled_at = Some(Instant::now());
            }
        }
    }

    /// Status of the current record for `key`
    pub fn status(&self, key: &str) -> Option<RecordStatus> {
        self.records.get(key).map(|r| r.status())
    }

    /// Remove the record for `key`, failing it first if it is still in flight
    pub fn evict(&self, key: &str) -> bool {
        match self.records.remove(key) {
            Some((_, record)) => {
                settle_outcome(
                    &record.tx,
                    Outcome::Failed(AiError::cancelled("idempotency record evicted")),
                );
                true
            }
            None => false,
        }
    }

    /// Drop settled records older than the retention window.
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(Instant::now())
    }

    fn purge_at(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !self.expired(record, now));
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every record, failing in-flight ones
    pub fn reset(&self) {
        for record in self.records.iter() {
            settle_outcome(
                &record.tx,
                Outcome::Failed(AiError::cancelled("idempotency table reset")),
            );
        }
        self.records.clear();
    }
}

/// Exclusive right to execute the run for one key.
///
/// Settle it with [`complete`](Self::complete) or [`fail`](Self::fail).
/// Dropping it unsettled (the run was cancelled or panicked) fails the
/// record with [`AiError::Cancelled`] so waiters are released.
#[must_use = "an idempotency guard must be completed or failed"]
#[derive(Debug)]
pub struct IdempotencyGuard<'a> {
    manager: &'a IdempotencyManager,
    key: String,
    generation: u64,
    tx: Arc<watch::Sender<Outcome>>,
    settled: bool,
}

impl IdempotencyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn complete(mut self, result: &ExecutionResult) {
        self.settle(Outcome::Completed(result.clone()));
    }

    pub fn fail(mut self, error: &AiError) {
        self.settle(Outcome::Failed(error.clone()));
    }

    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        if settle_outcome(&self.tx, outcome) {
            self.manager.mark_settled(&self.key, self.generation);
        }
    }
}

impl Drop for IdempotencyGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(key = %self.key, "idempotency guard dropped before settling");
            self.settle(Outcome::Failed(AiError::cancelled(
                "run dropped before completion",
            )));
        }
    }
}

/// Handle on another caller's in-flight run.
#[derive(Debug)]
pub struct Waiter {
    key: String,
    rx: watch::Receiver<Outcome>,
    timeout: Duration,
}

impl Waiter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the in-flight run to settle and share its outcome.
    pub async fn wait(mut self) -> Result<ExecutionResult, AiError> {
        let settled = self.rx.wait_for(|o| !matches!(o, Outcome::Pending));
        match tokio::time::timeout(self.timeout, settled).await {
            Err(_) => Err(AiError::cancelled(format!(
                "timed out waiting for in-flight run {}",
                self.key
            ))),
            Ok(Err(_)) => Err(AiError::cancelled("in-flight run disappeared")),
            Ok(Ok(outcome)) => match &*outcome {
                Outcome::Completed(result) => Ok(result.clone()),
                Outcome::Failed(err) => Err(err.clone()),
                Outcome::Pending => Err(AiError::cancelled("in-flight run disappeared")),
            },
        }
    }
}
