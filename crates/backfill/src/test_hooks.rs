//! Fault-injection switches for tests. Each switch is keyed by the job or
//! table it targets so concurrently running tests cannot trip each other's
//! faults, and the whole module compiles to constant no-ops outside testing
//! builds.

#[cfg(any(test, feature = "testing"))]
mod hooks {
    use std::{
        sync::atomic::{
            AtomicI64,
            AtomicU64,
            Ordering,
        },
        time::Duration,
    };

    use common::types::{
        JobId,
        TableId,
    };

    // Sentinel 0 means "off"; tests use nonzero ids.
    static WORKER_CNT_MISMATCH_JOB: AtomicI64 = AtomicI64::new(0);
    static REORG_TIMEOUT_JOB: AtomicI64 = AtomicI64::new(0);
    static GET_RECORD_ERROR_TABLE: AtomicI64 = AtomicI64::new(0);
    static HIGH_CPU_JOB: AtomicI64 = AtomicI64::new(0);
    static HIGH_CPU_DIVISOR: AtomicU64 = AtomicU64::new(2);
    static SLOW_BATCH_MILLIS: AtomicU64 = AtomicU64::new(0);

    /// Make the scheduler report a worker-count mismatch for the job.
    pub fn set_worker_cnt_mismatch(job_id: Option<JobId>) {
        WORKER_CNT_MISMATCH_JOB.store(job_id.map_or(0, |j| j.0), Ordering::SeqCst);
    }

    pub fn worker_cnt_mismatch_forced(job_id: JobId) -> bool {
        WORKER_CNT_MISMATCH_JOB.load(Ordering::SeqCst) == job_id.0 && job_id.0 != 0
    }

    /// Make every runnable check of the job report a reorg timeout.
    pub fn set_reorg_timeout(job_id: Option<JobId>) {
        REORG_TIMEOUT_JOB.store(job_id.map_or(0, |j| j.0), Ordering::SeqCst);
    }

    pub fn reorg_timeout_simulated(job_id: JobId) -> bool {
        REORG_TIMEOUT_JOB.load(Ordering::SeqCst) == job_id.0 && job_id.0 != 0
    }

    /// Fail every batch that reads records of the table.
    pub fn set_get_record_error(table_id: Option<TableId>) {
        GET_RECORD_ERROR_TABLE.store(table_id.map_or(0, |t| t.0), Ordering::SeqCst);
    }

    pub fn get_record_error_injected(table_id: TableId) -> bool {
        GET_RECORD_ERROR_TABLE.load(Ordering::SeqCst) == table_id.0 && table_id.0 != 0
    }

    /// Simulate high CPU load for the job: the scheduler divides its worker
    /// target by `divisor`.
    pub fn set_high_cpu_load(job_id: Option<JobId>, divisor: usize) {
        HIGH_CPU_DIVISOR.store(divisor.max(1) as u64, Ordering::SeqCst);
        HIGH_CPU_JOB.store(job_id.map_or(0, |j| j.0), Ordering::SeqCst);
    }

    pub fn high_cpu_divisor(job_id: JobId) -> Option<usize> {
        if HIGH_CPU_JOB.load(Ordering::SeqCst) == job_id.0 && job_id.0 != 0 {
            Some(HIGH_CPU_DIVISOR.load(Ordering::SeqCst) as usize)
        } else {
            None
        }
    }

    /// Stretch every batch by the given delay. Global, timing-only.
    pub fn set_slow_batch(delay: Option<Duration>) {
        SLOW_BATCH_MILLIS.store(delay.map_or(0, |d| d.as_millis() as u64), Ordering::SeqCst);
    }

    pub fn slow_batch_delay() -> Option<Duration> {
        match SLOW_BATCH_MILLIS.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub use hooks::*;

#[cfg(not(any(test, feature = "testing")))]
mod hooks {
    use std::time::Duration;

    use common::types::{
        JobId,
        TableId,
    };

    pub fn worker_cnt_mismatch_forced(_job_id: JobId) -> bool {
        false
    }

    pub fn reorg_timeout_simulated(_job_id: JobId) -> bool {
        false
    }

    pub fn get_record_error_injected(_table_id: TableId) -> bool {
        false
    }

    pub fn high_cpu_divisor(_job_id: JobId) -> Option<usize> {
        None
    }

    pub fn slow_batch_delay() -> Option<Duration> {
        None
    }
}

#[cfg(not(any(test, feature = "testing")))]
pub use hooks::*;
