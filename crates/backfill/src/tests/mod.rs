//! End-to-end scenarios driving the whole pipeline over the in-memory
//! store: empty spans, full scans, failure truncation, cancellation,
//! distributed leases, panic containment, and the fault-injection hooks.

use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    errors::{
        is_cancellation,
        reorg_error,
        ReorgError,
    },
    keys::{
        index_prefix,
        record_key,
        record_prefix,
        Key,
        KeyRange,
    },
    pause::{
        PauseClient,
        PauseController,
    },
    types::{
        ElementId,
        JobId,
        TableId,
    },
};
use kv::{
    memory::MemoryStore,
    Priority,
    Store,
};
use pretty_assertions::assert_eq;

use crate::{
    distributed::{
        TaskSink,
        TaskState,
    },
    driver::{
        wait_task_results,
        write_physical_table_records,
    },
    processor::TransformFactory,
    reorg::{
        BackfillKind,
        JobContext,
    },
    scheduler::BackfillScheduler,
    session::SessionPool,
    test_helpers::{
        reorg_for_table,
        seed_rows,
        FailingTransform,
        FlagController,
        IndexRowTransform,
        NoopTransform,
        PanickingTransform,
        TestEnv,
        TrackingFactory,
    },
    test_hooks,
    worker::BackfillTask,
};

fn index_entry_count(store: &MemoryStore, table_id: TableId) -> usize {
    store.scan_prefix(&index_prefix(table_id, 1)).len()
}

fn assert_monotone(history: &[Key]) {
    for pair in history.windows(2) {
        assert!(pair[0] <= pair[1], "persisted resume keys regressed: {history:?}");
    }
}

#[tokio::test]
async fn test_empty_span_returns_immediately() {
    let table = TableId(21);
    let t = TestEnv::for_index_backfill(MemoryStore::new(), table);

    let mut reorg = reorg_for_table(&t.store, 21, table, BackfillKind::AddIndex);
    reorg.start_key = Key::empty();
    reorg.end_key = Key::empty();
    let total = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();
    assert_eq!(total, 0);
    assert!(t.meta.history().is_empty());

    // A degenerate span [k, k) dispatches nothing either.
    let mut reorg = reorg_for_table(&t.store, 21, table, BackfillKind::AddIndex);
    reorg.end_key = reorg.start_key.clone();
    let total = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();
    assert_eq!(total, 0);
    assert!(t.meta.history().is_empty());
    assert_eq!(index_entry_count(&t.store, table), 0);
}

#[tokio::test]
async fn test_single_range_backfills_every_row() {
    let table = TableId(22);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..10_000);
    let t = TestEnv::for_index_backfill(store, table);
    t.vars.set_batch_size(256);
    t.vars.set_worker_count(1);

    let mut reorg = reorg_for_table(&t.store, 22, table, BackfillKind::AddIndex);
    let version_before = t.store.current_version().unwrap();
    let total = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();

    assert_eq!(total, 10_000);
    assert_eq!(index_entry_count(&t.store, table), 10_000);
    // 39 full batches of 256 plus the 16-row tail.
    let version_after = t.store.current_version().unwrap();
    assert_eq!(version_after.0 - version_before.0, 40);
    // The end was tightened to the last record, so the resume key is the
    // key right after it.
    assert_eq!(t.meta.last(), Some(record_key(table, 9_999).next()));
    assert_monotone(&t.meta.history());
}

#[tokio::test]
async fn test_three_regions_with_concurrent_workers() {
    let table = TableId(23);
    let store = MemoryStore::with_regions(vec![record_key(table, 100), record_key(table, 200)]);
    seed_rows(&store, table, 0..300);
    let t = TestEnv::for_index_backfill(store, table);
    t.vars.set_worker_count(3);

    let mut reorg = reorg_for_table(&t.store, 23, table, BackfillKind::AddIndex);
    let total = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();

    assert_eq!(total, 300);
    assert_eq!(index_entry_count(&t.store, table), 300);
    assert_eq!(t.meta.last(), Some(record_key(table, 299).next()));
}

#[tokio::test]
async fn test_middle_task_failure_truncates_the_resume_key() {
    let table = TableId(24);
    let store = MemoryStore::with_regions(vec![record_key(table, 10), record_key(table, 20)]);
    seed_rows(&store, table, 0..30);
    let factory = Arc::new(TransformFactory::new(Arc::new(FailingTransform::new(
        IndexRowTransform::new(table, 1),
        15,
    ))));
    let t = TestEnv::new(store.clone(), factory);
    t.vars.set_worker_count(1);

    let mut reorg = reorg_for_table(&t.store, 24, table, BackfillKind::AddIndex);
    let err = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("injected transform failure"));

    // Task 1 failed, so the durable resume key stops at task 0's excluded
    // end: the region boundary record that task 1 owns.
    let k0 = record_key(table, 10);
    assert_eq!(t.meta.last(), Some(k0.clone()));
    assert_eq!(reorg.curr_key, k0);

    // A second attempt picks up from the persisted key and finishes the
    // remainder; rewritten entries overwrite idempotently.
    let retry = TestEnv::new(store, Arc::new(TransformFactory::new(Arc::new(
        IndexRowTransform::new(table, 1),
    ))));
    let total = write_physical_table_records(&retry.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();
    assert_eq!(total, 20);
    assert_eq!(index_entry_count(&retry.store, table), 30);
    assert!(retry.meta.history().iter().all(|key| *key >= k0));
    assert_monotone(&retry.meta.history());
}

#[tokio::test]
async fn test_cancellation_mid_task_keeps_committed_batches() {
    let table = TableId(25);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..1_000);
    let t = TestEnv::for_index_backfill(store, table);
    let t = t.with_controller(Arc::new(FlagController::cancel_after(1)));
    t.vars.set_batch_size(256);
    t.vars.set_worker_count(1);

    let mut reorg = reorg_for_table(&t.store, 25, table, BackfillKind::AddIndex);
    let err = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap_err();
    assert!(is_cancellation(&err));

    // The first batch committed before the cancel, but the task as a whole
    // failed, so the resume key holds at the task's start.
    assert_eq!(index_entry_count(&t.store, table), 256);
    assert_eq!(t.meta.last(), Some(record_prefix(table)));
}

#[tokio::test]
async fn test_lease_refresh_publishes_advancing_progress() {
    let table = TableId(26);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..1_000);
    let t = TestEnv::for_index_backfill(store, table);
    let t = t.with_task_sink();
    t.vars.set_batch_size(100);
    t.vars.set_worker_count(1);
    t.vars.set_lease_interval(Duration::ZERO);

    let mut reorg = reorg_for_table(&t.store, 26, table, BackfillKind::AddIndex);
    let total = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();
    assert_eq!(total, 1_000);

    let sink = t.sink.as_ref().unwrap();
    let updates = sink.updates();
    assert!(!updates.is_empty());
    for update in &updates {
        assert_eq!(update.instance_id, "ddl-instance-1");
        assert_eq!(update.state, TaskState::Running);
    }
    for pair in updates.windows(2) {
        assert!(pair[0].curr_key < pair[1].curr_key);
    }

    let finishes = sink.finishes();
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].state, TaskState::Done);
    assert_eq!(finishes[0].row_count, 1_000);
    assert!(finishes[0].error.is_none());

    let persisted = sink.get_tasks(JobId(26)).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].state, TaskState::Done);
}

#[tokio::test]
async fn test_worker_panic_becomes_a_terminal_result() {
    let table = TableId(27);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..100);
    let factory = Arc::new(TransformFactory::new(Arc::new(PanickingTransform::new(
        IndexRowTransform::new(table, 1),
        50,
    ))));
    let t = TestEnv::new(store, factory);

    let mut reorg = reorg_for_table(&t.store, 27, table, BackfillKind::AddIndex);
    let err = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap_err();
    assert!(matches!(reorg_error(&err), Some(ReorgError::Panic(_))));
    // Nothing committed, nothing advanced.
    assert_eq!(t.meta.last(), Some(record_prefix(table)));
}

#[tokio::test]
async fn test_missing_job_turns_the_outcome_into_success() {
    let table = TableId(28);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..100);
    let factory = Arc::new(TransformFactory::new(Arc::new(FailingTransform::new(
        IndexRowTransform::new(table, 1),
        50,
    ))));
    let t = TestEnv::new(store, factory).with_task_sink();
    t.sink.as_ref().unwrap().set_job_missing(true);

    let mut reorg = reorg_for_table(&t.store, 28, table, BackfillKind::AddIndex);
    // The task itself fails, but finish_task reports the job gone: another
    // owner completed it, so the round succeeds without progress here.
    let total = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();
    assert_eq!(total, 0);
    assert_eq!(t.meta.last(), Some(record_prefix(table)));
    assert!(t.sink.as_ref().unwrap().finishes().is_empty());
}

#[tokio::test]
async fn test_ingest_kind_flushes_and_resets_the_backend() {
    let table = TableId(29);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..50);
    let t = TestEnv::for_index_backfill(store, table);
    let t = t.with_ingest();

    let mut reorg = reorg_for_table(&t.store, 29, table, BackfillKind::AddIndexIngest);
    let total = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();
    assert_eq!(total, 50);

    let ingest = t.ingest.as_ref().unwrap();
    assert_eq!(ingest.flushes(), vec![ElementId(29)]);
    assert_eq!(ingest.resets(), vec![ElementId(29)]);
}

#[tokio::test]
async fn test_in_flight_tasks_bounded_by_worker_count() {
    let table = TableId(30);
    let splits = (1..20).map(|i| record_key(table, i * 10)).collect();
    let store = MemoryStore::with_regions(splits);
    seed_rows(&store, table, 0..200);
    let tracking = Arc::new(TrackingFactory::new(Arc::new(TransformFactory::new(
        Arc::new(IndexRowTransform::new(table, 1)),
    ))));
    let t = TestEnv::new(store, tracking.clone());
    t.vars.set_worker_count(4);

    let mut reorg = reorg_for_table(&t.store, 30, table, BackfillKind::AddIndex);
    let total = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();
    assert_eq!(total, 200);
    assert!(tracking.max_active() >= 1);
    assert!(tracking.max_active() <= 4);
}

#[tokio::test]
async fn test_forced_worker_count_mismatch_fails_the_round() {
    let table = TableId(31);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..10);
    let t = TestEnv::for_index_backfill(store, table);

    let mut reorg = reorg_for_table(&t.store, 31, table, BackfillKind::AddIndex);
    test_hooks::set_worker_cnt_mismatch(Some(JobId(31)));
    let err = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap_err();
    test_hooks::set_worker_cnt_mismatch(None);
    assert!(err.to_string().contains("worker count"));
}

#[tokio::test]
async fn test_simulated_reorg_timeout_classifies_the_failure() {
    let table = TableId(32);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..10);
    let t = TestEnv::for_index_backfill(store, table);

    let mut reorg = reorg_for_table(&t.store, 32, table, BackfillKind::AddIndex);
    test_hooks::set_reorg_timeout(Some(JobId(32)));
    let err = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap_err();
    test_hooks::set_reorg_timeout(None);
    assert_eq!(reorg_error(&err), Some(&ReorgError::Timeout));
    assert!(is_cancellation(&err));
}

#[tokio::test]
async fn test_injected_record_error_is_retryable_from_the_start() {
    let table = TableId(33);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..50);
    let t = TestEnv::for_index_backfill(store, table);

    let mut reorg = reorg_for_table(&t.store, 33, table, BackfillKind::AddIndex);
    test_hooks::set_get_record_error(Some(table));
    let err = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("injected failure"));
    assert_eq!(t.meta.last(), Some(record_prefix(table)));
    test_hooks::set_get_record_error(None);

    let total = write_physical_table_records(&t.env, &mut reorg, PauseClient::new())
        .await
        .unwrap();
    assert_eq!(total, 50);
    assert_eq!(index_entry_count(&t.store, table), 50);
}

#[tokio::test]
async fn test_worker_count_change_converges_mid_round() {
    let table = TableId(35);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..24);
    let reorg = reorg_for_table(&store, 35, table, BackfillKind::AddIndex);
    let job = JobContext::from_reorg(&reorg, "ddl-instance-1".to_owned());

    let vars = crate::variables::ReorgVars::new();
    vars.set_worker_count(1);
    let shared: Arc<dyn Store> = Arc::new(store.clone());
    let mut scheduler = BackfillScheduler::new(
        shared.clone(),
        job,
        vars.clone(),
        Arc::new(FlagController::runnable()),
        Arc::new(TransformFactory::new(Arc::new(NoopTransform))),
        Arc::new(SessionPool::new(shared)),
        None,
        None,
    );
    scheduler.set_max_worker_size(6);
    scheduler.adjust_worker_size().await.unwrap();
    assert_eq!(scheduler.worker_count(), 1);

    let tasks: Vec<BackfillTask> = (0..24)
        .map(|id| BackfillTask {
            id,
            job_id: reorg.job_id,
            physical_table_id: table,
            range: KeyRange {
                start_key: record_key(table, id as i64),
                end_key: record_key(table, id as i64 + 1),
                end_include: false,
            },
            priority: Priority::Normal,
            persisted: None,
        })
        .collect();
    let batch_start = tasks[0].range.start_key.clone();
    for task in tasks {
        scheduler.dispatch(task).await.unwrap();
    }

    // The variable changes after dispatch, so only the periodic adjustment
    // inside wait_task_results can pick it up: with one worker the check
    // fires after four completions, well inside the round's 24 tasks.
    vars.set_worker_count(6);
    let (next_key, _added, err) = wait_task_results(&mut scheduler, 24, batch_start).await;
    assert!(err.is_none(), "round failed: {err:?}");
    assert_eq!(scheduler.worker_count(), 6);
    assert_eq!(next_key, record_key(table, 24));

    scheduler.close().await;
}

#[tokio::test]
async fn test_pause_breakpoint_holds_the_round() {
    let table = TableId(34);
    let store = MemoryStore::new();
    seed_rows(&store, table, 0..100);
    let t = TestEnv::for_index_backfill(store, table);
    let mut reorg = reorg_for_table(&t.store, 34, table, BackfillKind::AddIndex);

    let (mut controller, client) = PauseController::new(["backfill_before_round"]);
    let env = t.env.clone();
    let run = tokio::spawn(async move {
        let total = write_physical_table_records(&env, &mut reorg, client).await?;
        anyhow::Ok(total)
    });

    // While the driver is parked before its dispatch round, nothing has
    // been persisted yet; a variable change here lands before dispatch.
    let guard = controller.wait_for_blocked("backfill_before_round").await;
    assert!(guard.is_some());
    assert!(t.meta.history().is_empty());
    t.vars.set_worker_count(2);
    drop(guard);

    let total = run.await.unwrap().unwrap();
    assert_eq!(total, 100);
    assert_eq!(index_entry_count(&t.store, table), 100);
}
