//! Core data model.
//!
//! A work item is one unit of input bound for the remote service. Items are
//! materialized once at job start, carry a stable unique key, and move
//! pending -> dispatched -> terminal. The checkpoint is the durable record
//! of which keys are still outstanding.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable key, unique within a job. Persistence and checkpointing are
    /// keyed on this.
    pub key: String,

    /// Payload handed to the remote service. The engine doesn't interpret it.
    pub payload: serde_json::Value,

    /// Current lifecycle state.
    pub state: ItemState,
}

impl WorkItem {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
            state: ItemState::Pending,
        }
    }

    /// Move to `to`, validating the transition table.
    pub fn transition(&mut self, to: ItemState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Item State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Materialized, waiting for a worker to pick up its batch.
    Pending,
    /// Handed to the remote service (possibly mid-retry).
    Dispatched,
    /// Accepted by the remote service. Terminal.
    Succeeded,
    /// Exhausted retries or rejected outright. Terminal.
    Failed,
    /// Remote service recognized a prior acceptance. Terminal.
    Duplicate,
}

impl ItemState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Pending, Dispatched)
                | (Dispatched, Succeeded)
                | (Dispatched, Failed)
                | (Dispatched, Duplicate)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemState::Succeeded | ItemState::Failed | ItemState::Duplicate
        )
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Pending => "pending",
            ItemState::Dispatched => "dispatched",
            ItemState::Succeeded => "succeeded",
            ItemState::Failed => "failed",
            ItemState::Duplicate => "duplicate",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A fixed-size group of work items dispatched together in one remote call.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position within the job's chunked item list.
    pub index: usize,
    /// Items in original input order.
    pub items: Vec<WorkItem>,
    /// Remote submission attempts consumed so far.
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Failure classification carried on `Outcome::Failed` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeout, connection reset, server unavailable.
    Transient,
    /// The server signalled throttling.
    RateLimited,
    /// Permanently malformed or rejected.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Terminal classification of a work item's submission result.
///
/// Produced at exactly one parsing boundary (the `RemoteService` impl);
/// everything inside the engine works with this tagged form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded {
        external_id: String,
        detail: Option<serde_json::Value>,
    },
    Duplicate {
        reason: String,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl Outcome {
    /// The item state this outcome retires an item into.
    pub fn terminal_state(&self) -> ItemState {
        match self {
            Outcome::Succeeded { .. } => ItemState::Succeeded,
            Outcome::Duplicate { .. } => ItemState::Duplicate,
            Outcome::Failed { .. } => ItemState::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Durable snapshot of job progress.
///
/// `remaining_item_keys` is always a safe-to-resume superset: a key is only
/// removed after its batch's outcomes are durably committed, so resuming
/// from any snapshot can resubmit but never skip an unprocessed item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_items: usize,
    pub processed_count: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    /// Keys not yet committed, in original input order.
    pub remaining_item_keys: Vec<String>,
}

impl Checkpoint {
    pub fn new(job_id: impl Into<String>, item_keys: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            created_at: now,
            updated_at: now,
            total_items: item_keys.len(),
            processed_count: 0,
            succeeded_count: 0,
            failed_count: 0,
            remaining_item_keys: item_keys,
        }
    }

    /// Advance past a committed batch: remove its keys and fold in tallies.
    ///
    /// Re-applying keys that were already removed is a no-op, so a batch
    /// resubmitted after a crash cannot inflate the counters.
    pub fn apply_committed(&mut self, keys: &[String], succeeded: usize, failed: usize) {
        let committed: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let before = self.remaining_item_keys.len();
        self.remaining_item_keys
            .retain(|k| !committed.contains(k.as_str()));
        if self.remaining_item_keys.len() == before {
            return;
        }
        self.processed_count = self.total_items - self.remaining_item_keys.len();
        self.succeeded_count += succeeded;
        self.failed_count += failed;
        self.updated_at = Utc::now();
    }

    /// Items recorded `Duplicate`. Derived, never stored.
    pub fn duplicates(&self) -> usize {
        self.processed_count - self.succeeded_count - self.failed_count
    }

    pub fn is_complete(&self) -> bool {
        self.remaining_item_keys.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Job Summary
// ---------------------------------------------------------------------------

/// Final tallies for a finished (or cancelled) run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub elapsed: std::time::Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_transitions_follow_lifecycle() {
        let mut item = WorkItem::new("k1", json!({}));
        assert_eq!(item.state, ItemState::Pending);

        item.transition(ItemState::Dispatched).unwrap();
        item.transition(ItemState::Succeeded).unwrap();
        assert!(item.state.is_terminal());

        // Terminal states have no exits.
        assert!(item.transition(ItemState::Dispatched).is_err());
    }

    #[test]
    fn pending_cannot_jump_to_terminal() {
        let mut item = WorkItem::new("k1", json!({}));
        let err = item.transition(ItemState::Succeeded).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::InvalidTransition { .. }
        ));
    }

    #[test]
    fn apply_committed_advances_and_derives_duplicates() {
        let keys: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
        let mut checkpoint = Checkpoint::new("job", keys.clone());

        checkpoint.apply_committed(&keys[..4], 2, 1);
        assert_eq!(checkpoint.processed_count, 4);
        assert_eq!(checkpoint.succeeded_count, 2);
        assert_eq!(checkpoint.failed_count, 1);
        assert_eq!(checkpoint.duplicates(), 1);
        assert_eq!(checkpoint.remaining_item_keys.len(), 6);
        assert!(!checkpoint.is_complete());
    }

    #[test]
    fn apply_committed_is_idempotent() {
        let keys: Vec<String> = (0..4).map(|i| format!("k{i}")).collect();
        let mut checkpoint = Checkpoint::new("job", keys.clone());

        checkpoint.apply_committed(&keys[..2], 2, 0);
        // Same batch again, as after a crash-recovery resubmission.
        checkpoint.apply_committed(&keys[..2], 2, 0);

        assert_eq!(checkpoint.processed_count, 2);
        assert_eq!(checkpoint.succeeded_count, 2);
    }

    #[test]
    fn remaining_keys_keep_input_order() {
        let keys: Vec<String> = (0..6).map(|i| format!("k{i}")).collect();
        let mut checkpoint = Checkpoint::new("job", keys.clone());

        checkpoint.apply_committed(&[keys[1].clone(), keys[3].clone()], 2, 0);
        assert_eq!(
            checkpoint.remaining_item_keys,
            vec!["k0", "k2", "k4", "k5"]
        );
    }

    #[test]
    fn outcome_serde_is_tagged() {
        let outcome = Outcome::Failed {
            kind: ErrorKind::RateLimited,
            message: "throttled".into(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["kind"], "rate_limited");
    }
}
