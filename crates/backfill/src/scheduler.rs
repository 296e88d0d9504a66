//! Owner of the worker pool and its channels. Tasks flow through one shared
//! bounded queue, results come back on one shared channel, and the pool is
//! resized from the live worker-count variable, clamped to the number of
//! ranges in the pending round.

use std::{
    cmp,
    sync::{
        atomic::AtomicU64,
        Arc,
    },
};

use common::knobs::BACKFILL_TASK_CHAN_SIZE;
use kv::Store;
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    task::JoinHandle,
};

use crate::{
    distributed::TaskSink,
    ingest::IngestBackend,
    metrics,
    processor::{
        BackfillContext,
        ProcessorFactory,
    },
    reorg::{
        JobContext,
        JobController,
    },
    session::SessionPool,
    test_hooks,
    variables::ReorgVars,
    worker::{
        BackfillTask,
        BackfillWorker,
        TaskResult,
    },
};

struct WorkerHandle {
    id: usize,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct BackfillScheduler {
    store: Arc<dyn Store>,
    job: JobContext,
    vars: ReorgVars,
    controller: Arc<dyn JobController>,
    factory: Arc<dyn ProcessorFactory>,
    sessions: Arc<SessionPool>,
    task_sink: Option<Arc<dyn TaskSink>>,
    ingest: Option<Arc<dyn IngestBackend>>,
    added_counter: Arc<AtomicU64>,

    task_tx: async_channel::Sender<BackfillTask>,
    task_rx: async_channel::Receiver<BackfillTask>,
    result_tx: mpsc::Sender<TaskResult>,
    result_rx: mpsc::Receiver<TaskResult>,
    workers: Vec<WorkerHandle>,
    max_worker_size: usize,
    next_worker_id: usize,
}

impl BackfillScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        job: JobContext,
        vars: ReorgVars,
        controller: Arc<dyn JobController>,
        factory: Arc<dyn ProcessorFactory>,
        sessions: Arc<SessionPool>,
        task_sink: Option<Arc<dyn TaskSink>>,
        ingest: Option<Arc<dyn IngestBackend>>,
    ) -> Self {
        let (task_tx, task_rx) = async_channel::bounded(*BACKFILL_TASK_CHAN_SIZE);
        let (result_tx, result_rx) = mpsc::channel(*BACKFILL_TASK_CHAN_SIZE);
        Self {
            store,
            job,
            vars,
            controller,
            factory,
            sessions,
            task_sink,
            ingest,
            added_counter: Arc::new(AtomicU64::new(0)),
            task_tx,
            task_rx,
            result_tx,
            result_rx,
            workers: Vec::new(),
            max_worker_size: 0,
            next_worker_id: 0,
        }
    }

    /// Cap the pool at the parallelism the pending round can actually use.
    pub fn set_max_worker_size(&mut self, max: usize) {
        self.max_worker_size = max;
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn added_counter(&self) -> &Arc<AtomicU64> {
        &self.added_counter
    }

    pub fn ingest_backend(&self) -> Option<&Arc<dyn IngestBackend>> {
        self.ingest.as_ref()
    }

    /// Re-read the worker-count variable and grow or shrink the pool to
    /// `min(variable, max_worker_size)`. Shrinking waits for the surplus
    /// workers to finish their in-flight task, so no dispatched task is
    /// abandoned.
    pub async fn adjust_worker_size(&mut self) -> anyhow::Result<()> {
        let mut target = cmp::min(self.vars.worker_count(), self.max_worker_size);
        if let Some(divisor) = test_hooks::high_cpu_divisor(self.job.job_id) {
            target = cmp::max(target / divisor, 1);
            tracing::info!("Simulated high load: capping worker target at {target}");
        }
        if target != self.workers.len() {
            tracing::info!(
                "Adjusting backfill workers for job {}: {} -> {target}",
                self.job.job_id,
                self.workers.len()
            );
        }

        while self.workers.len() < target {
            self.spawn_worker()?;
        }
        if self.workers.len() > target {
            let surplus = self.workers.split_off(target);
            for handle in &surplus {
                let _ = handle.cancel.send(true);
            }
            for handle in surplus {
                tracing::info!("Retiring backfill worker {}", handle.id);
                let _ = handle.join.await;
            }
        }

        if test_hooks::worker_cnt_mismatch_forced(self.job.job_id) {
            anyhow::bail!(
                "backfill worker count {} does not match the expected size",
                self.workers.len()
            );
        }
        metrics::log_worker_count(self.workers.len());
        Ok(())
    }

    fn spawn_worker(&mut self) -> anyhow::Result<()> {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let session = self.sessions.acquire()?;
        let ctx = BackfillContext {
            store: self.store.clone(),
            job: self.job.clone(),
            vars: self.vars.clone(),
            added_counter: self.added_counter.clone(),
        };
        let processor = self.factory.make(ctx, session)?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let worker = BackfillWorker::new(
            id,
            self.job.clone(),
            processor,
            self.vars.clone(),
            self.controller.clone(),
            self.task_sink.clone(),
            self.store.clone(),
            cancel_rx,
        );
        let join = tokio::spawn(worker.run(self.task_rx.clone(), self.result_tx.clone()));
        self.workers.push(WorkerHandle {
            id,
            cancel: cancel_tx,
            join,
        });
        Ok(())
    }

    pub async fn dispatch(&self, task: BackfillTask) -> anyhow::Result<()> {
        self.task_tx
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("backfill task channel closed"))
    }

    pub async fn recv_result(&mut self) -> Option<TaskResult> {
        self.result_rx.recv().await
    }

    /// Pull undelivered tasks out of the queue after a failure; returns how
    /// many were cancelled before any worker saw them.
    pub fn drain_tasks(&self) -> usize {
        let mut drained = 0;
        while self.task_rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Cancel every worker, drain pending tasks, and tear the channels down.
    /// Closing the queue after the cancel signals means a worker blocked in
    /// `recv` wakes up either way, and nothing can send on a closed channel.
    pub async fn close(mut self) {
        self.drain_tasks();
        for handle in &self.workers {
            let _ = handle.cancel.send(true);
        }
        self.task_tx.close();
        for handle in self.workers.drain(..) {
            let _ = handle.join.await;
        }
    }
}
