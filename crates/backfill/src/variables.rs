//! Live copies of the configuration variables an operator may retune while a
//! reorg job runs. The scheduler re-reads the worker count on every
//! adjustment round and workers re-read the batch size before every batch,
//! so a change takes effect without restarting the job.

use std::{
    sync::{
        atomic::{
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use common::knobs::{
    DDL_REORG_BATCH_SIZE,
    DDL_REORG_WORKER_CNT,
    MAX_DDL_REORG_BATCH_SIZE,
    MAX_DDL_REORG_WORKER_CNT,
    MIN_DDL_REORG_BATCH_SIZE,
    UPDATE_INSTANCE_LEASE,
};

struct Inner {
    worker_cnt: AtomicUsize,
    batch_size: AtomicUsize,
    lease_interval_ms: AtomicU64,
}

/// Cloneable handle onto the variables; every clone observes every update.
#[derive(Clone)]
pub struct ReorgVars {
    inner: Arc<Inner>,
}

impl ReorgVars {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                worker_cnt: AtomicUsize::new(*DDL_REORG_WORKER_CNT),
                batch_size: AtomicUsize::new(*DDL_REORG_BATCH_SIZE),
                lease_interval_ms: AtomicU64::new(UPDATE_INSTANCE_LEASE.as_millis() as u64),
            }),
        }
    }

    /// Desired worker concurrency (`ddl_reorg_worker_cnt`), clamped to
    /// `[1, MAX_DDL_REORG_WORKER_CNT]`.
    pub fn worker_count(&self) -> usize {
        self.inner
            .worker_cnt
            .load(Ordering::Relaxed)
            .clamp(1, MAX_DDL_REORG_WORKER_CNT)
    }

    pub fn set_worker_count(&self, count: usize) {
        self.inner.worker_cnt.store(count, Ordering::Relaxed);
    }

    /// Rows per transactional batch (`ddl_reorg_batch_size`), clamped to
    /// `[MIN_DDL_REORG_BATCH_SIZE, MAX_DDL_REORG_BATCH_SIZE]`.
    pub fn batch_size(&self) -> usize {
        self.inner
            .batch_size
            .load(Ordering::Relaxed)
            .clamp(MIN_DDL_REORG_BATCH_SIZE, MAX_DDL_REORG_BATCH_SIZE)
    }

    pub fn set_batch_size(&self, size: usize) {
        self.inner.batch_size.store(size, Ordering::Relaxed);
    }

    /// Minimum interval between publishing a worker's instance lease.
    pub fn lease_interval(&self) -> Duration {
        Duration::from_millis(self.inner.lease_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_lease_interval(&self, interval: Duration) {
        self.inner
            .lease_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Default for ReorgVars {
    fn default() -> Self {
        Self::new()
    }
}
