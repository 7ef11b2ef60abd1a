use crate::frontier::rule::is_genuine_extremity;
use crate::graph::{EventGraph, GraphError};
use crate::store::SqliteStore;

pub const CLEANUP_JOB_NAME: &str = "forward_extremities_cleanup";
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Where a cleanup run currently stands: `Running` carries the resumption
/// cursor of the last committed batch, `Done` means no marker is persisted
/// (either never started or completed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupState {
    Running { cursor: i64 },
    Done,
}

/// An extremity entry the job could not evaluate; it is left in the table and
/// surfaced to the operator instead of guessed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub room_id: String,
    pub event_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub examined: usize,
    /// `(room_id, event_id)` pairs removed in this batch's transaction.
    pub removed: Vec<(String, String)>,
    pub skipped: Vec<SkippedEntry>,
    pub done: bool,
}

/// Aggregate of a run-to-completion: what the CLI reports to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub batches: usize,
    pub examined: usize,
    pub removed: usize,
    pub skipped: Vec<SkippedEntry>,
}

pub fn cleanup_state(store: &SqliteStore) -> Result<CleanupState, GraphError> {
    Ok(match store.cleanup_cursor(CLEANUP_JOB_NAME)? {
        Some(cursor) => CleanupState::Running { cursor },
        None => CleanupState::Done,
    })
}

/// Runs one increment of the extremity cleanup job: picks up to `budget`
/// not-yet-visited extremity rows, re-validates each against the genuine
/// extremity rule, and commits the removals together with the advanced cursor
/// in a single transaction.
///
/// The graph traversal happens outside any write transaction, so a batch never
/// holds locks for the duration of a walk; insertions racing with an
/// evaluation can at worst produce a stale "genuine" verdict, which the
/// incremental insert path or the next run corrects.
///
/// Entries whose evaluation fails with `NotFound` or `Invariant` are left
/// untouched and reported; they never abort the rest of the batch. When no
/// rows remain past the cursor the progress marker is deleted and the report
/// says `done`.
pub fn run_cleanup_batch(store: &SqliteStore, budget: usize) -> Result<BatchReport, GraphError> {
    if budget == 0 {
        return Err(GraphError::Invariant(
            "cleanup batch budget must be at least 1".to_string(),
        ));
    }

    let cursor = store.cleanup_cursor(CLEANUP_JOB_NAME)?.unwrap_or(0);
    let rows = store.extremity_batch_after(cursor, budget)?;
    if rows.is_empty() {
        store.clear_cleanup_progress(CLEANUP_JOB_NAME)?;
        return Ok(BatchReport {
            examined: 0,
            removed: Vec::new(),
            skipped: Vec::new(),
            done: true,
        });
    }

    let mut removed = Vec::new();
    let mut skipped = Vec::new();
    let mut next_cursor = cursor;
    for row in &rows {
        next_cursor = next_cursor.max(row.rowid);
        match evaluate_entry(store, &row.event_id) {
            Ok(true) => {}
            Ok(false) => removed.push((row.room_id.clone(), row.event_id.clone())),
            Err(err @ (GraphError::NotFound(_) | GraphError::Invariant(_))) => {
                skipped.push(SkippedEntry {
                    room_id: row.room_id.clone(),
                    event_id: row.event_id.clone(),
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    store.commit_cleanup_batch(CLEANUP_JOB_NAME, next_cursor, &removed)?;
    Ok(BatchReport {
        examined: rows.len(),
        removed,
        skipped,
        done: false,
    })
}

/// An extremity row naming an event the graph cannot resolve is referential
/// inconsistency, not a verdict; check resolvability before applying the rule
/// (the rule itself would vacuously call an unknown event genuine).
fn evaluate_entry(store: &SqliteStore, event_id: &str) -> Result<bool, GraphError> {
    store.is_soft_failed(event_id)?;
    is_genuine_extremity(store, event_id)
}

/// Drives `run_cleanup_batch` until it reports done, aggregating the batch
/// reports. Used by the CLI and by tests; callers needing cancellation points
/// drive the batches themselves.
pub fn run_cleanup_to_completion(
    store: &SqliteStore,
    budget: usize,
) -> Result<CleanupReport, GraphError> {
    let mut report = CleanupReport::default();
    loop {
        let batch = run_cleanup_batch(store, budget)?;
        if batch.done {
            return Ok(report);
        }
        report.batches += 1;
        report.examined += batch.examined;
        report.removed += batch.removed.len();
        report.skipped.extend(batch.skipped);
    }
}
