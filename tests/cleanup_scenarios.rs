use std::path::Path;

use frontier::cleanup::{
    CLEANUP_JOB_NAME, CleanupState, cleanup_state, run_cleanup_batch, run_cleanup_to_completion,
};
use frontier::graph::Event;
use frontier::store::SqliteStore;

fn send(store: &SqliteStore, event_id: &str, prev: &[&str], soft_failed: bool) {
    store
        .insert_event(&Event {
            event_id: event_id.to_string(),
            room_id: "room".to_string(),
            prev_event_ids: prev.iter().map(|id| id.to_string()).collect(),
            soft_failed,
            received_at: "2026-08-27T00:00:00Z".to_string(),
        })
        .expect("insert event");
}

fn heads(store: &SqliteStore) -> Vec<String> {
    let mut heads = store.current_extremities("room").expect("heads");
    heads.sort();
    heads
}

fn open(path: &Path) -> SqliteStore {
    SqliteStore::open(path).expect("open store")
}

#[test]
fn live_frontier_skips_soft_failed_chain() {
    // A <- SF1 <- SF2 <- B with no forced entries: the incremental path alone
    // must leave exactly {B}.
    let store = SqliteStore::open_in_memory().expect("store");
    send(&store, "a", &[], false);
    send(&store, "sf1", &["a"], true);
    send(&store, "sf2", &["sf1"], true);
    send(&store, "b", &["sf2"], false);

    assert_eq!(heads(&store), vec!["b".to_string()]);
}

#[test]
fn basic_cleanup_removes_superseded_head() {
    // A <- SF1 <- B with A forced back into the extremity table.
    let store = SqliteStore::open_in_memory().expect("store");
    send(&store, "a", &[], false);
    send(&store, "sf1", &["a"], true);
    send(&store, "b", &["sf1"], false);

    store.add_extremity("room", "a").expect("force a");
    assert_eq!(heads(&store), vec!["a".to_string(), "b".to_string()]);

    let report = run_cleanup_to_completion(&store, 100).expect("cleanup");
    assert_eq!(report.removed, 1);
    assert_eq!(heads(&store), vec!["b".to_string()]);
}

#[test]
fn chain_of_fail_cleanup() {
    // A <- SF1 <- SF2 <- B with A forced.
    let store = SqliteStore::open_in_memory().expect("store");
    send(&store, "a", &[], false);
    send(&store, "sf1", &["a"], true);
    send(&store, "sf2", &["sf1"], true);
    send(&store, "b", &["sf2"], false);

    store.add_extremity("room", "a").expect("force a");
    assert_eq!(heads(&store), vec!["a".to_string(), "b".to_string()]);

    run_cleanup_to_completion(&store, 100).expect("cleanup");
    assert_eq!(heads(&store), vec!["b".to_string()]);
}

#[test]
fn forked_graph_cleanup() {
    //     A     B
    //    / \   /
    //  SF1   SF2
    //   |     |
    //  SF3    |
    //  / \    |
    // C    \  |
    //       SF4
    //
    // A is forced back in; B survives because its only forward path dead-ends
    // in soft-failed events, A goes because A -> SF1 -> SF3 -> C is real.
    let store = SqliteStore::open_in_memory().expect("store");
    send(&store, "a", &[], false);
    send(&store, "b", &["a"], false);
    send(&store, "sf1", &["a"], true);
    send(&store, "sf2", &["a", "b"], true);
    send(&store, "sf3", &["sf1"], true);
    send(&store, "sf4", &["sf2", "sf3"], true);
    send(&store, "c", &["sf3"], false);

    store.add_extremity("room", "a").expect("force a");
    assert_eq!(
        heads(&store),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );

    run_cleanup_to_completion(&store, 100).expect("cleanup");
    assert_eq!(heads(&store), vec!["b".to_string(), "c".to_string()]);
}

#[test]
fn cleanup_is_idempotent() {
    let store = SqliteStore::open_in_memory().expect("store");
    send(&store, "a", &[], false);
    send(&store, "sf1", &["a"], true);
    send(&store, "b", &["sf1"], false);
    store.add_extremity("room", "a").expect("force a");

    let first = run_cleanup_to_completion(&store, 100).expect("first run");
    assert_eq!(first.removed, 1);
    let after_first = heads(&store);

    let second = run_cleanup_to_completion(&store, 100).expect("second run");
    assert_eq!(second.removed, 0);
    assert!(second.skipped.is_empty());
    assert_eq!(heads(&store), after_first);
}

#[test]
fn interrupted_job_resumes_from_the_committed_cursor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("frontier.db");

    {
        let store = open(&db);
        send(&store, "a", &[], false);
        send(&store, "b", &["a"], false);
        send(&store, "sf1", &["a"], true);
        send(&store, "sf2", &["a", "b"], true);
        send(&store, "sf3", &["sf1"], true);
        send(&store, "sf4", &["sf2", "sf3"], true);
        send(&store, "c", &["sf3"], false);
        store.add_extremity("room", "a").expect("force a");

        // One committed batch of size 1, then drop the store mid-job.
        let batch = run_cleanup_batch(&store, 1).expect("first batch");
        assert!(!batch.done);
        assert_eq!(batch.examined, 1);
    }

    // A fresh handle picks up the persisted cursor and finishes with the same
    // frontier an uninterrupted run would produce.
    let store = open(&db);
    let resumed = cleanup_state(&store).expect("state");
    assert!(matches!(resumed, CleanupState::Running { cursor } if cursor > 0));
    assert_eq!(
        store.cleanup_cursor(CLEANUP_JOB_NAME).expect("cursor"),
        match resumed {
            CleanupState::Running { cursor } => Some(cursor),
            CleanupState::Done => None,
        }
    );

    run_cleanup_to_completion(&store, 1).expect("resume to completion");
    assert_eq!(heads(&store), vec!["b".to_string(), "c".to_string()]);
    assert_eq!(cleanup_state(&store).expect("state"), CleanupState::Done);
    assert_eq!(store.cleanup_cursor(CLEANUP_JOB_NAME).expect("cursor"), None);
}

#[test]
fn batch_budget_bounds_each_increment() {
    let store = SqliteStore::open_in_memory().expect("store");
    for i in 0..5 {
        send(&store, &format!("root-{i}"), &[], false);
    }

    let batch = run_cleanup_batch(&store, 2).expect("batch");
    assert_eq!(batch.examined, 2);
    assert!(!batch.done);
    // All five roots are leaves, so nothing is ever removed.
    let report = run_cleanup_to_completion(&store, 2).expect("finish");
    assert_eq!(report.removed, 0);
    assert_eq!(report.examined, 3);
    assert_eq!(heads(&store).len(), 5);
}

#[test]
fn unresolvable_entries_do_not_poison_the_batch() {
    let store = SqliteStore::open_in_memory().expect("store");
    send(&store, "a", &[], false);
    send(&store, "sf1", &["a"], true);
    send(&store, "b", &["sf1"], false);
    store.add_extremity("room", "a").expect("force a");
    store.add_extremity("room", "ghost").expect("force ghost");

    let report = run_cleanup_to_completion(&store, 100).expect("cleanup");
    assert_eq!(report.removed, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].event_id, "ghost");
    assert_eq!(report.skipped[0].room_id, "room");

    // The stale head was still removed, the unresolvable one kept as-is.
    assert_eq!(heads(&store), vec!["b".to_string(), "ghost".to_string()]);
}

#[test]
fn extremities_added_after_completion_wait_for_the_next_run() {
    let store = SqliteStore::open_in_memory().expect("store");
    send(&store, "a", &[], false);
    run_cleanup_to_completion(&store, 100).expect("first run");
    assert_eq!(cleanup_state(&store).expect("state"), CleanupState::Done);

    // A stale head forced in after completion is untouched until a new run.
    send(&store, "sf1", &["a"], true);
    send(&store, "b", &["sf1"], false);
    store.add_extremity("room", "a").expect("force a");
    assert_eq!(heads(&store), vec!["a".to_string(), "b".to_string()]);

    run_cleanup_to_completion(&store, 100).expect("second run");
    assert_eq!(heads(&store), vec!["b".to_string()]);
}
