//! The backfill worker: pulls one range task at a time from the scheduler's
//! shared channel, walks it left to right in transactional batches, and
//! reports exactly one result per task. Batches re-read the live batch size,
//! renew the distributed-mode lease, and check the job's cancellation
//! predicate; a panic anywhere in the loop becomes a terminal result.

use std::{
    any::Any,
    sync::Arc,
    time::Instant,
};

use common::{
    errors::{
        is_job_not_found,
        ReorgError,
    },
    keys::{
        Key,
        KeyRange,
    },
    knobs::{
        DDL_SLOW_OPERATION_THRESHOLD,
        ROWS_PER_THROUGHPUT_LOG,
    },
    types::{
        JobId,
        TableId,
    },
};
use futures::FutureExt;
use kv::{
    Priority,
    Store,
};
use tokio::sync::{
    mpsc,
    watch,
};

use crate::{
    distributed::{
        PersistedTask,
        TaskSink,
        TaskState,
    },
    metrics,
    processor::RowProcessor,
    reorg::{
        JobContext,
        JobController,
    },
    test_hooks,
    variables::ReorgVars,
};

/// One range of one dispatch round. Immutable once dispatched; `id` is the
/// sequential index within the round's batch.
#[derive(Clone, Debug)]
pub struct BackfillTask {
    pub id: usize,
    pub job_id: JobId,
    pub physical_table_id: TableId,
    pub range: KeyRange,
    pub priority: Priority,
    /// Present in distributed mode; republished as the task advances.
    pub persisted: Option<PersistedTask>,
}

impl BackfillTask {
    pub fn excluded_end_key(&self) -> Key {
        self.range.excluded_end_key()
    }
}

/// Outcome of one task. `next_key` is the first key not processed.
#[derive(Debug)]
pub struct TaskResult {
    pub task_id: usize,
    pub added: u64,
    pub scanned: u64,
    pub next_key: Key,
    pub error: Option<anyhow::Error>,
}

pub(crate) struct BackfillWorker {
    id: usize,
    job: JobContext,
    processor: Box<dyn RowProcessor>,
    vars: ReorgVars,
    controller: Arc<dyn JobController>,
    task_sink: Option<Arc<dyn TaskSink>>,
    store: Arc<dyn Store>,
    cancel: watch::Receiver<bool>,
}

impl BackfillWorker {
    pub(crate) fn new(
        id: usize,
        job: JobContext,
        processor: Box<dyn RowProcessor>,
        vars: ReorgVars,
        controller: Arc<dyn JobController>,
        task_sink: Option<Arc<dyn TaskSink>>,
        store: Arc<dyn Store>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            job,
            processor,
            vars,
            controller,
            task_sink,
            store,
            cancel,
        }
    }

    /// Consume tasks until the first error, a cancel signal, or channel
    /// close. One `TaskResult` is written per task taken.
    pub(crate) async fn run(
        mut self,
        tasks: async_channel::Receiver<BackfillTask>,
        results: mpsc::Sender<TaskResult>,
    ) {
        tracing::info!("Backfill worker {} starting: {}", self.id, self.processor);
        loop {
            let task = tokio::select! {
                biased;
                _ = self.cancel.changed() => break,
                task = tasks.recv() => match task {
                    Ok(task) => task,
                    Err(_) => break,
                },
            };
            let result = self.handle_task(task).await;
            let failed = result.error.is_some();
            if results.send(result).await.is_err() {
                break;
            }
            if failed {
                break;
            }
        }
        tracing::info!("Backfill worker {} exiting", self.id);
    }

    async fn handle_task(&mut self, task: BackfillTask) -> TaskResult {
        let _timer = metrics::task_timer();
        let started = Instant::now();
        let mut result = TaskResult {
            task_id: task.id,
            added: 0,
            scanned: 0,
            next_key: task.range.start_key.clone(),
            error: None,
        };
        let mut persisted = task.persisted.clone();

        let barrier = std::panic::AssertUnwindSafe(self.batch_loop(
            &task,
            &mut result,
            &mut persisted,
        ))
        .catch_unwind();
        match barrier.await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => result.error = Some(e),
            Err(panic) => {
                let msg = panic_message(panic);
                tracing::error!("Backfill worker {} panicked on task {}: {msg}", self.id, task.id);
                result.error = Some(anyhow::Error::new(ReorgError::Panic(msg)));
            },
        }

        self.publish_terminal_state(&mut result, persisted).await;

        let elapsed = started.elapsed();
        if elapsed >= *DDL_SLOW_OPERATION_THRESHOLD {
            tracing::warn!(
                "Slow backfill task {} on worker {}: {} rows in {elapsed:?}",
                task.id,
                self.id,
                result.scanned
            );
        }
        metrics::log_task_finished(result.error.is_none());
        result
    }

    async fn batch_loop(
        &mut self,
        task: &BackfillTask,
        result: &mut TaskResult,
        persisted: &mut Option<PersistedTask>,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let mut range = task.range.clone();
        let mut last_lease_refresh = Instant::now();
        let mut last_logged_scanned = 0u64;
        loop {
            self.controller.is_reorg_runnable(self.job.job_id)?;
            if test_hooks::reorg_timeout_simulated(self.job.job_id) {
                return Err(anyhow::Error::new(ReorgError::Timeout));
            }

            let batch_size = self.vars.batch_size();
            let batch = self.processor.process_batch(&range, batch_size).await?;
            result.added += batch.added;
            result.scanned += batch.scanned;
            self.processor.add_metric(batch.added);
            for warning in &batch.warnings {
                tracing::debug!("Backfill warning on task {}: {warning}", task.id);
            }

            if result.scanned - last_logged_scanned >= *ROWS_PER_THROUGHPUT_LOG {
                let rate = result.scanned as f64 / started.elapsed().as_secs_f64();
                tracing::info!(
                    "Backfill worker {} task {}: {} rows scanned, {} added ({rate:.0} rows/s)",
                    self.id,
                    task.id,
                    result.scanned,
                    result.added
                );
                last_logged_scanned = result.scanned;
            }

            result.next_key = batch.next_key.clone();
            if let Some(p) = persisted.as_mut() {
                p.curr_key = batch.next_key.clone();
                p.row_count = result.added;
            }
            range.start_key = batch.next_key;
            if batch.done {
                break;
            }

            if let (Some(sink), Some(p)) = (self.task_sink.as_ref(), persisted.as_mut()) {
                if last_lease_refresh.elapsed() >= self.vars.lease_interval() {
                    let now = self.store.oracle_time()?;
                    p.renew_lease(&self.job.instance_id, now);
                    sink.update_task(p).await?;
                    last_lease_refresh = Instant::now();
                }
            }
        }
        Ok(())
    }

    /// Publish the task's terminal state in distributed mode. A sink
    /// reporting the job gone means another owner completed it, which turns
    /// the outcome into success.
    async fn publish_terminal_state(
        &self,
        result: &mut TaskResult,
        persisted: Option<PersistedTask>,
    ) {
        let Some((sink, mut p)) = self.task_sink.as_ref().zip(persisted) else {
            return;
        };
        p.curr_key = result.next_key.clone();
        p.row_count = result.added;
        match &result.error {
            None => {
                p.state = TaskState::Done;
                p.error = None;
            },
            Some(e) => {
                p.state = TaskState::Cancelled;
                p.error = Some(format!("{e:#}"));
            },
        }
        if let Err(e) = sink.finish_task(&p).await {
            if is_job_not_found(&e) {
                result.error = None;
            } else if result.error.is_none() {
                result.error = Some(e);
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
