//! Top-level coordinator. Drives every batch through dispatch -> retry ->
//! persist -> checkpoint with a bounded worker pool.
//!
//! Workers complete out of order; the checkpoint is advanced by a single
//! writer task consuming committed-batch events, so concurrent completions
//! never race on the remaining-key set. A worker only pulls its next batch
//! after the writer acknowledges its previous one.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::chunk;
use crate::config::{EngineConfig, FlushPolicy};
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::model::{Batch, Checkpoint, ErrorKind, ItemState, JobSummary, Outcome, WorkItem};
use crate::persist::ResultPersistence;
use crate::remote::{RemoteError, RemoteService};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Job lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initializing,
    Running,
    Draining,
    Completed,
    Aborted,
    Cancelled,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Initializing => "initializing",
            JobState::Running => "running",
            JobState::Draining => "draining",
            JobState::Completed => "completed",
            JobState::Aborted => "aborted",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Terminal report for a run that ended without aborting.
#[derive(Debug)]
pub struct JobReport {
    pub state: JobState,
    pub summary: JobSummary,
}

/// Cooperative cancellation. In-flight batches finish; nothing new is
/// dispatched after `cancel`, and the job stays resumable.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A batch whose outcomes are durably recorded, ready to advance the
/// checkpoint.
struct BatchCommitted {
    index: usize,
    keys: Vec<String>,
    succeeded: usize,
    failed: usize,
    ack: oneshot::Sender<()>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns the worker pool and drives a job to a terminal state.
pub struct Orchestrator {
    config: EngineConfig,
    remote: Arc<dyn RemoteService>,
    store: Arc<dyn ResultPersistence>,
    checkpoints: Arc<CheckpointStore>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    cancel: CancelHandle,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        remote: Arc<dyn RemoteService>,
        store: Arc<dyn ResultPersistence>,
        checkpoints: CheckpointStore,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_second)?);
        let retry = RetryPolicy::new(config.max_retries, config.base_backoff, config.max_backoff);
        Ok(Self {
            config,
            remote,
            store,
            checkpoints: Arc::new(checkpoints),
            limiter,
            retry,
            cancel: CancelHandle {
                flag: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    /// Handle for requesting cooperative cancellation from outside the run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run a job to a terminal state.
    ///
    /// `items` is the full ordered input; when a checkpoint for `job_id`
    /// exists, only the outstanding items are resubmitted. Returns
    /// [`Error::Aborted`] when result persistence fails past its retry
    /// budget; everything committed before that stays checkpointed.
    pub async fn run(&self, job_id: &str, items: Vec<WorkItem>) -> Result<JobReport> {
        let started = Instant::now();
        info!(job_id, total = items.len(), state = %JobState::Initializing, "job starting");

        let checkpoint = self.load_or_create(job_id, &items)?;

        if checkpoint.is_complete() {
            let summary = summary_from(&checkpoint, started);
            self.checkpoints.archive(job_id)?;
            return Ok(JobReport {
                state: JobState::Completed,
                summary,
            });
        }

        let remaining = select_remaining(items, &checkpoint.remaining_item_keys);
        let batches = chunk::split(remaining, self.config.chunk_size)?;
        info!(
            job_id,
            remaining = checkpoint.remaining_item_keys.len(),
            batches = batches.len(),
            workers = self.config.max_workers,
            state = %JobState::Running,
            "dispatching"
        );

        // The writer is the only task that touches the snapshot while the
        // job runs; workers hand it committed batches over a channel.
        let (commit_tx, commit_rx) = mpsc::channel::<BatchCommitted>(self.config.max_workers);
        let writer = tokio::spawn(checkpoint_writer(
            commit_rx,
            checkpoint,
            Arc::clone(&self.checkpoints),
            self.config.flush_policy,
        ));

        let queue = Arc::new(Mutex::new(VecDeque::from(batches)));
        let abort_reason: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.max_workers {
            workers.spawn(
                Worker {
                    id: worker_id,
                    job_id: job_id.to_string(),
                    config: self.config.clone(),
                    remote: Arc::clone(&self.remote),
                    store: Arc::clone(&self.store),
                    limiter: Arc::clone(&self.limiter),
                    retry: self.retry.clone(),
                    cancel: self.cancel.clone(),
                    queue: Arc::clone(&queue),
                    commit_tx: commit_tx.clone(),
                    abort_reason: Arc::clone(&abort_reason),
                }
                .run(),
            );
        }
        drop(commit_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(job_id, "worker task failed: {e}");
            }
        }

        debug!(job_id, state = %JobState::Draining, "workers finished, flushing checkpoint");
        let checkpoint = match writer.await {
            Ok(Ok(checkpoint)) => checkpoint,
            Ok(Err(e)) => {
                return Err(Error::Aborted {
                    job_id: job_id.to_string(),
                    reason: format!("checkpoint write failed: {e}"),
                });
            }
            Err(e) => {
                return Err(Error::Other(format!("checkpoint writer task failed: {e}")));
            }
        };

        if let Some(reason) = take_reason(&abort_reason) {
            warn!(job_id, state = %JobState::Aborted, reason, "job aborted");
            return Err(Error::Aborted {
                job_id: job_id.to_string(),
                reason,
            });
        }

        let summary = summary_from(&checkpoint, started);
        if checkpoint.is_complete() {
            self.checkpoints.archive(job_id)?;
            info!(
                job_id,
                succeeded = summary.succeeded,
                failed = summary.failed,
                duplicates = summary.duplicates,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                state = %JobState::Completed,
                "job completed"
            );
            Ok(JobReport {
                state: JobState::Completed,
                summary,
            })
        } else {
            info!(
                job_id,
                processed = checkpoint.processed_count,
                remaining = checkpoint.remaining_item_keys.len(),
                state = %JobState::Cancelled,
                "job cancelled, checkpoint retained for resume"
            );
            Ok(JobReport {
                state: JobState::Cancelled,
                summary,
            })
        }
    }

    /// Resume from a saved checkpoint or build a fresh one. Either way the
    /// remaining-key set is cross-checked against the result store, so a
    /// key whose outcome is already durable is never dispatched again.
    fn load_or_create(&self, job_id: &str, items: &[WorkItem]) -> Result<Checkpoint> {
        if job_id.is_empty() || job_id.contains(['/', '\\']) {
            return Err(Error::Config(format!("invalid job id: {job_id:?}")));
        }

        // Key uniqueness within a job is mandatory.
        let mut seen = HashSet::with_capacity(items.len());
        for item in items {
            if !seen.insert(item.key.as_str()) {
                return Err(Error::Config(format!("duplicate item key: {}", item.key)));
            }
        }

        let mut checkpoint = match self.checkpoints.load(job_id)? {
            Some(checkpoint) => {
                if checkpoint.total_items != items.len() {
                    return Err(Error::Config(format!(
                        "item list has {} entries but checkpointed job {} expects {}",
                        items.len(),
                        job_id,
                        checkpoint.total_items
                    )));
                }
                info!(
                    job_id,
                    remaining = checkpoint.remaining_item_keys.len(),
                    "resuming from checkpoint"
                );
                checkpoint
            }
            None => Checkpoint::new(job_id, items.iter().map(|i| i.key.clone()).collect()),
        };

        // Defense in depth against a crash between persist and checkpoint
        // advance: the store, not the snapshot, decides what is outstanding.
        let unprocessed = self
            .store
            .unprocessed_keys(job_id, &checkpoint.remaining_item_keys)?;
        if unprocessed.len() != checkpoint.remaining_item_keys.len() {
            let already = checkpoint.remaining_item_keys.len() - unprocessed.len();
            info!(job_id, already, "dropping keys already recorded by the result store");
            let counts = self.store.counts(job_id)?;
            checkpoint.remaining_item_keys = unprocessed;
            checkpoint.processed_count =
                checkpoint.total_items - checkpoint.remaining_item_keys.len();
            checkpoint.succeeded_count = counts.succeeded;
            checkpoint.failed_count = counts.failed;
        }

        // Durable before anything dispatches, so a crash right after start
        // still resumes with the full key set.
        self.checkpoints.save(&checkpoint)?;
        Ok(checkpoint)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    id: usize,
    job_id: String,
    config: EngineConfig,
    remote: Arc<dyn RemoteService>,
    store: Arc<dyn ResultPersistence>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    cancel: CancelHandle,
    queue: Arc<Mutex<VecDeque<Batch>>>,
    commit_tx: mpsc::Sender<BatchCommitted>,
    abort_reason: Arc<Mutex<Option<String>>>,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() || self.job_aborted() {
                break;
            }
            let batch = match self.queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => break,
            };
            let Some(batch) = batch else { break };

            if let Err(reason) = self.process(batch).await {
                self.flag_abort(reason);
                break;
            }
        }
    }

    /// Dispatch one batch and see its outcomes all the way to a checkpoint
    /// acknowledgement. An `Err` here is job-fatal (storage gave out).
    async fn process(&self, mut batch: Batch) -> std::result::Result<(), String> {
        let index = batch.index;
        debug!(
            job_id = %self.job_id,
            batch = index,
            size = batch.items.len(),
            worker = self.id,
            "dispatching batch"
        );

        for item in &mut batch.items {
            item.transition(ItemState::Dispatched)
                .map_err(|e| format!("batch {index}: {e}"))?;
        }

        self.limiter.acquire().await;

        let attempts = Arc::new(AtomicU32::new(0));
        let submitted = {
            let remote = Arc::clone(&self.remote);
            let items: Arc<[WorkItem]> = Arc::from(batch.items.as_slice());
            let attempts = Arc::clone(&attempts);
            let timeout = self.config.submit_timeout;
            self.retry
                .run(move || {
                    let remote = Arc::clone(&remote);
                    let items = Arc::clone(&items);
                    attempts.fetch_add(1, Ordering::Relaxed);
                    async move {
                        match tokio::time::timeout(timeout, remote.submit(&items)).await {
                            Ok(result) => result,
                            Err(_) => Err(RemoteError::Transient(format!(
                                "submit timed out after {timeout:?}"
                            ))),
                        }
                    }
                })
                .await
        };
        batch.attempt = attempts.load(Ordering::Relaxed);

        let rows = match submitted {
            Ok(outcomes) => pair_outcomes(&batch.items, outcomes),
            Err(err) => {
                warn!(
                    job_id = %self.job_id,
                    batch = index,
                    attempts = batch.attempt,
                    "batch exhausted retries: {err}"
                );
                fail_all(&batch.items, &err)
            }
        };

        for (item, (_, outcome)) in batch.items.iter_mut().zip(rows.iter()) {
            item.transition(outcome.terminal_state())
                .map_err(|e| format!("batch {index}: {e}"))?;
        }

        self.persist(index, &rows).await?;

        let (succeeded, failed) = tally(&rows);
        let keys: Vec<String> = rows.into_iter().map(|(key, _)| key).collect();
        let (ack_tx, ack_rx) = oneshot::channel();
        let event = BatchCommitted {
            index,
            keys,
            succeeded,
            failed,
            ack: ack_tx,
        };
        if self.commit_tx.send(event).await.is_err() {
            return Err("checkpoint writer stopped".into());
        }
        if ack_rx.await.is_err() {
            return Err("checkpoint writer dropped the acknowledgement".into());
        }

        debug!(job_id = %self.job_id, batch = index, attempts = batch.attempt, "batch committed");
        Ok(())
    }

    /// One transaction for the whole batch, retried a bounded number of
    /// times. Nothing advances past a failed commit.
    async fn persist(
        &self,
        index: usize,
        rows: &[(String, Outcome)],
    ) -> std::result::Result<(), String> {
        let mut attempt = 0u32;
        loop {
            match self.store.upsert_batch(&self.job_id, rows) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.persist_retries {
                        error!(
                            job_id = %self.job_id,
                            batch = index,
                            attempts = attempt,
                            "result persistence failed: {e}"
                        );
                        return Err(format!(
                            "result persistence failed for batch {index} after {attempt} attempts: {e}"
                        ));
                    }
                    warn!(job_id = %self.job_id, batch = index, attempt, "retrying persistence: {e}");
                    tokio::time::sleep(self.config.base_backoff).await;
                }
            }
        }
    }

    fn job_aborted(&self) -> bool {
        self.abort_reason
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(true)
    }

    fn flag_abort(&self, reason: String) {
        if let Ok(mut slot) = self.abort_reason.lock() {
            slot.get_or_insert(reason);
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint writer
// ---------------------------------------------------------------------------

/// Consumes committed-batch events and rewrites the snapshot. Runs until
/// every worker has hung up, then makes a final flush if one is pending.
async fn checkpoint_writer(
    mut rx: mpsc::Receiver<BatchCommitted>,
    mut checkpoint: Checkpoint,
    store: Arc<CheckpointStore>,
    flush_policy: FlushPolicy,
) -> Result<Checkpoint> {
    let mut since_flush = 0u32;

    while let Some(event) = rx.recv().await {
        checkpoint.apply_committed(&event.keys, event.succeeded, event.failed);
        since_flush += 1;

        let flush = match flush_policy {
            FlushPolicy::EveryBatch => true,
            FlushPolicy::EveryBatches(n) => checkpoint.is_complete() || since_flush >= n,
        };
        if flush {
            store.save(&checkpoint)?;
            since_flush = 0;
        }

        debug!(
            job_id = %checkpoint.job_id,
            batch = event.index,
            processed = checkpoint.processed_count,
            remaining = checkpoint.remaining_item_keys.len(),
            "checkpoint advanced"
        );
        let _ = event.ack.send(());
    }

    if since_flush > 0 {
        store.save(&checkpoint)?;
    }
    Ok(checkpoint)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Keep the items whose keys are still outstanding, in input order.
fn select_remaining(items: Vec<WorkItem>, remaining_keys: &[String]) -> Vec<WorkItem> {
    let remaining: HashSet<&str> = remaining_keys.iter().map(String::as_str).collect();
    items
        .into_iter()
        .filter(|item| remaining.contains(item.key.as_str()))
        .collect()
}

/// Pair items with their outcomes at the one parsing boundary. A short
/// outcome list marks the unmatched tail failed; extras are dropped.
fn pair_outcomes(items: &[WorkItem], outcomes: Vec<Outcome>) -> Vec<(String, Outcome)> {
    if outcomes.len() != items.len() {
        warn!(
            expected = items.len(),
            got = outcomes.len(),
            "remote returned a mismatched outcome list"
        );
    }
    let mut outcomes = outcomes.into_iter();
    items
        .iter()
        .map(|item| {
            let outcome = outcomes.next().unwrap_or_else(|| Outcome::Failed {
                kind: ErrorKind::Fatal,
                message: "remote returned no outcome for this item".into(),
            });
            (item.key.clone(), outcome)
        })
        .collect()
}

/// Exhausted retries: every still-unresolved item fails with the last error.
fn fail_all(items: &[WorkItem], err: &RemoteError) -> Vec<(String, Outcome)> {
    items
        .iter()
        .map(|item| {
            (
                item.key.clone(),
                Outcome::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                },
            )
        })
        .collect()
}

fn tally(rows: &[(String, Outcome)]) -> (usize, usize) {
    let mut succeeded = 0;
    let mut failed = 0;
    for (_, outcome) in rows {
        match outcome {
            Outcome::Succeeded { .. } => succeeded += 1,
            Outcome::Failed { .. } => failed += 1,
            Outcome::Duplicate { .. } => {}
        }
    }
    (succeeded, failed)
}

fn summary_from(checkpoint: &Checkpoint, started: Instant) -> JobSummary {
    JobSummary {
        total: checkpoint.total_items,
        succeeded: checkpoint.succeeded_count,
        failed: checkpoint.failed_count,
        duplicates: checkpoint.duplicates(),
        elapsed: started.elapsed(),
    }
}

fn take_reason(slot: &Arc<Mutex<Option<String>>>) -> Option<String> {
    slot.lock().ok().and_then(|mut g| g.take())
}
