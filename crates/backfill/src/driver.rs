//! The pipeline driver: repeatedly split the remainder of the table's key
//! span into region-aligned ranges, dispatch a round of tasks, collect the
//! results in order, and persist the resume key. The persist runs on every
//! return path, so a crash anywhere leaves the job resumable from the last
//! in-order success.

use std::{
    cmp,
    sync::{
        atomic::Ordering,
        Arc,
    },
    time::Instant,
};

use common::{
    keys::{
        record_prefix,
        Key,
        KeyRange,
    },
    knobs::{
        BACKFILL_TASK_CHAN_SIZE,
        DDL_SLOW_OPERATION_THRESHOLD,
    },
    pause::PauseClient,
};
use kv::Store;

use crate::{
    checkpoint::TaskCheckpoint,
    distributed::{
        PersistedTask,
        TaskSink,
        TaskState,
    },
    ingest::IngestBackend,
    metrics,
    processor::ProcessorFactory,
    reorg::{
        JobContext,
        JobController,
        ReorgInfo,
        ReorgMetaStore,
    },
    scheduler::BackfillScheduler,
    session::SessionPool,
    split::{
        end_key_of_region,
        split_ranges,
    },
    variables::ReorgVars,
    worker::BackfillTask,
};

/// Everything the pipeline borrows from its host: storage, sessions, the
/// per-kind processor factory, and the job scheduler's persistence and
/// cancellation surfaces.
#[derive(Clone)]
pub struct BackfillEnv {
    pub store: Arc<dyn Store>,
    pub sessions: Arc<SessionPool>,
    pub factory: Arc<dyn ProcessorFactory>,
    pub controller: Arc<dyn JobController>,
    pub meta: Arc<dyn ReorgMetaStore>,
    pub task_sink: Option<Arc<dyn TaskSink>>,
    pub ingest: Option<Arc<dyn IngestBackend>>,
    pub vars: ReorgVars,
    /// Identity published on distributed-task leases.
    pub instance_id: String,
}

/// Backfill the physical table described by `reorg`, returning the number
/// of rows added. Resumes from the persisted key inside `reorg`.
pub async fn write_physical_table_records(
    env: &BackfillEnv,
    reorg: &mut ReorgInfo,
    mut pause: PauseClient,
) -> anyhow::Result<u64> {
    if reorg.is_empty_span() {
        tracing::info!(
            "Backfill of table {} has an empty key span, nothing to do",
            reorg.physical_table_id
        );
        return Ok(0);
    }
    let _timer = metrics::backfill_timer();
    tracing::info!(
        "Starting {} backfill of table {} for job {}",
        reorg.kind,
        reorg.physical_table_id,
        reorg.job_id
    );

    let job = JobContext::from_reorg(reorg, env.instance_id.clone());
    let mut scheduler = BackfillScheduler::new(
        env.store.clone(),
        job,
        env.vars.clone(),
        env.controller.clone(),
        env.factory.clone(),
        env.sessions.clone(),
        env.task_sink.clone(),
        env.ingest.clone(),
    );
    let mut run = run_rounds(env, &mut scheduler, reorg, &mut pause).await;
    scheduler.close().await;
    pause.close("backfill_before_round");

    if reorg.kind.uses_ingest() {
        if let Some(ingest) = &env.ingest {
            if let Err(e) = ingest.reset(reorg.element.id).await {
                tracing::error!(
                    "Failed resetting ingest state for element {}: {e:#}",
                    reorg.element.id
                );
                if run.is_ok() {
                    run = Err(e);
                }
            }
        }
    }

    let total = run?;
    tracing::info!(
        "Backfill of table {} finished: {total} rows added",
        reorg.physical_table_id
    );
    Ok(total)
}

async fn run_rounds(
    env: &BackfillEnv,
    scheduler: &mut BackfillScheduler,
    reorg: &mut ReorgInfo,
    pause: &mut PauseClient,
) -> anyhow::Result<u64> {
    let mut start_key = reorg.resume_key();
    let end_key = reorg.end_key.clone();
    let mut total_added = 0u64;
    loop {
        if start_key >= end_key {
            break;
        }
        let ranges = split_ranges(
            &env.store,
            start_key.clone(),
            end_key.clone(),
            *BACKFILL_TASK_CHAN_SIZE,
        )
        .await?;
        let Some(last_range) = ranges.last() else {
            break;
        };
        let last_range_end = last_range.end_key.clone();

        pause.wait("backfill_before_round").await;
        scheduler.set_max_worker_size(ranges.len());
        scheduler.adjust_worker_size().await?;
        if reorg.kind.uses_ingest() {
            if let Some(ingest) = scheduler.ingest_backend() {
                // Bound the ingest buffers before taking on another round.
                ingest.flush(reorg.element.id).await?;
            }
        }

        let remains = handle_range_tasks(env, scheduler, reorg, &mut total_added, ranges).await?;
        start_key = match remains.first() {
            Some(range) => range.start_key.clone(),
            None => last_range_end.next(),
        };
        tracing::info!(
            "Backfill of table {} advanced to {start_key:?}: {} rows added so far",
            reorg.physical_table_id,
            scheduler.added_counter().load(Ordering::Relaxed)
        );
    }
    Ok(total_added)
}

/// Assemble up to a channel's worth of tasks from the round's ranges,
/// tightening each end to the last real record, then dispatch and wait.
/// Ranges past the cap are handed back for the next round.
async fn handle_range_tasks(
    env: &BackfillEnv,
    scheduler: &mut BackfillScheduler,
    reorg: &mut ReorgInfo,
    total_added: &mut u64,
    ranges: Vec<KeyRange>,
) -> anyhow::Result<Vec<KeyRange>> {
    let batch_len = cmp::min(ranges.len(), *BACKFILL_TASK_CHAN_SIZE);
    let prefix = record_prefix(reorg.physical_table_id);
    let mut tasks = Vec::with_capacity(batch_len);
    for (id, range) in ranges.iter().take(batch_len).enumerate() {
        let mut range = range.clone();
        let is_final = id == ranges.len() - 1;
        match end_key_of_region(
            &env.store,
            reorg.priority,
            &prefix,
            &range.start_key,
            &range.end_key,
        )? {
            Some(tight) => {
                // A tightened end is a real record and must be scanned
                // through; an untouched end is the next region's first key.
                let tightened = tight != range.end_key;
                range.end_include = tightened || is_final;
                if tightened {
                    range.end_key = tight;
                }
            },
            None => range.end_include = is_final,
        }
        let persisted = build_persisted_task(env, reorg, id, &range)?;
        tasks.push(BackfillTask {
            id,
            job_id: reorg.job_id,
            physical_table_id: reorg.physical_table_id,
            range,
            priority: reorg.priority,
            persisted,
        });
    }
    send_tasks_and_wait(env, scheduler, reorg, total_added, tasks).await?;
    Ok(ranges[batch_len..].to_vec())
}

fn build_persisted_task(
    env: &BackfillEnv,
    reorg: &ReorgInfo,
    id: usize,
    range: &KeyRange,
) -> anyhow::Result<Option<PersistedTask>> {
    if env.task_sink.is_none() {
        return Ok(None);
    }
    let now = env.store.oracle_time()?;
    let mut task = PersistedTask {
        id,
        job_id: reorg.job_id,
        ele_id: reorg.element.id,
        physical_table_id: reorg.physical_table_id,
        instance_id: String::new(),
        instance_lease: now,
        curr_key: range.start_key.clone(),
        row_count: 0,
        error: None,
        state: TaskState::Running,
    };
    task.renew_lease(&env.instance_id, now);
    Ok(Some(task))
}

/// Dispatch the round's tasks and collect exactly one result per task. The
/// in-order resume key is persisted before this returns, success or not.
async fn send_tasks_and_wait(
    env: &BackfillEnv,
    scheduler: &mut BackfillScheduler,
    reorg: &mut ReorgInfo,
    total_added: &mut u64,
    tasks: Vec<BackfillTask>,
) -> anyhow::Result<()> {
    let Some(first) = tasks.first() else {
        // An empty round still keeps the resume key durable.
        let resume = reorg.resume_key();
        reorg.update_reorg_meta(resume, env.meta.as_ref()).await?;
        return Ok(());
    };
    let started = Instant::now();
    let expected = tasks.len();
    let batch_start = first.range.start_key.clone();
    for task in tasks {
        scheduler.dispatch(task).await?;
    }
    let (next_key, added, first_err) = wait_task_results(scheduler, expected, batch_start).await;
    *total_added += added;

    reorg.update_reorg_meta(next_key.clone(), env.meta.as_ref()).await?;

    let elapsed = started.elapsed();
    if elapsed >= *DDL_SLOW_OPERATION_THRESHOLD {
        tracing::warn!("Slow backfill round: {expected} tasks took {elapsed:?}");
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    env.controller.is_reorg_runnable(reorg.job_id)?;
    tracing::info!("Backfill round persisted resume key {next_key:?} ({added} rows added)");
    Ok(())
}

/// Read one result per dispatched task. The first failure is kept, pending
/// tasks are drained off the queue, and results for tasks already in flight
/// are still collected so no completion is lost. Worker-count changes are
/// picked up every `worker_size * 4` completions.
pub(crate) async fn wait_task_results(
    scheduler: &mut BackfillScheduler,
    expected: usize,
    batch_start: Key,
) -> (Key, u64, Option<anyhow::Error>) {
    let mut checkpoint = TaskCheckpoint::new(batch_start);
    let mut added = 0u64;
    let mut first_err: Option<anyhow::Error> = None;
    let mut outstanding = expected;
    let mut completed = 0usize;
    while outstanding > 0 {
        let Some(result) = scheduler.recv_result().await else {
            if first_err.is_none() {
                first_err = Some(anyhow::anyhow!(
                    "result channel closed with {outstanding} tasks outstanding"
                ));
            }
            break;
        };
        outstanding -= 1;
        completed += 1;
        match result.error {
            Some(e) => {
                tracing::warn!("Backfill task {} failed: {e:#}", result.task_id);
                if first_err.is_none() {
                    first_err = Some(e);
                    let drained = scheduler.drain_tasks();
                    outstanding = outstanding.saturating_sub(drained);
                }
            },
            None => {
                checkpoint.update(result.task_id, result.next_key);
                added += result.added;
            },
        }
        if completed % (scheduler.worker_count().max(1) * 4) == 0 {
            if let Err(e) = scheduler.adjust_worker_size().await {
                if first_err.is_none() {
                    first_err = Some(e);
                    let drained = scheduler.drain_tasks();
                    outstanding = outstanding.saturating_sub(drained);
                }
            }
        }
    }
    (checkpoint.next_key().clone(), added, first_err)
}
