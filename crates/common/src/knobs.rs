//! Tunable limits and parameters for the backfill subsystem, fixed at
//! process start. Every knob can be overridden with an environment variable
//! of the same name (durations take a `_MS` or `_SECS` suffix as noted).
//!
//! The two values an operator retunes while a job is running
//! (`ddl_reorg_worker_cnt`, `ddl_reorg_batch_size`) are only *defaulted*
//! here; their live values are carried by `backfill`'s `ReorgVars`.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Capacity of the scheduler's shared task channel, and therefore the
/// maximum number of ranges dispatched in one round.
pub static BACKFILL_TASK_CHAN_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("BACKFILL_TASK_CHAN_SIZE", 1024));

/// Default worker concurrency (`ddl_reorg_worker_cnt`).
pub static DDL_REORG_WORKER_CNT: LazyLock<usize> =
    LazyLock::new(|| env_config("DDL_REORG_WORKER_CNT", 4));

/// Hard upper bound on worker concurrency, whatever the variable says.
pub const MAX_DDL_REORG_WORKER_CNT: usize = 128;

/// Default rows per transactional batch (`ddl_reorg_batch_size`).
pub static DDL_REORG_BATCH_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("DDL_REORG_BATCH_SIZE", 256));

/// Lower bound on the batch size; smaller settings are clamped up.
pub const MIN_DDL_REORG_BATCH_SIZE: usize = 32;

/// Upper bound on the batch size; larger settings are clamped down.
pub const MAX_DDL_REORG_BATCH_SIZE: usize = 10240;

/// Default minimum interval between publishing a worker's instance lease in
/// distributed mode (`UPDATE_INSTANCE_LEASE_MS`). Live value is carried by
/// `ReorgVars`.
pub static UPDATE_INSTANCE_LEASE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("UPDATE_INSTANCE_LEASE_MS", 25_000)));

/// How long a published instance lease remains valid
/// (`INSTANCE_LEASE_SECS`). Another instance may take over a task whose
/// lease expired.
pub static INSTANCE_LEASE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("INSTANCE_LEASE_SECS", 90)));

/// Operations slower than this are logged at warn
/// (`ddl_slow_operation_threshold`, `DDL_SLOW_OPERATION_THRESHOLD_MS`).
pub static DDL_SLOW_OPERATION_THRESHOLD: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("DDL_SLOW_OPERATION_THRESHOLD_MS", 300)));

/// Scanned-row interval between a worker's throughput logs.
pub static ROWS_PER_THROUGHPUT_LOG: LazyLock<u64> =
    LazyLock::new(|| env_config("ROWS_PER_THROUGHPUT_LOG", 90_000));

/// Total backoff budget for transient region-cache failures while splitting
/// a key span (`SPLIT_REGION_RETRY_BUDGET_SECS`).
pub static SPLIT_REGION_RETRY_BUDGET: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SPLIT_REGION_RETRY_BUDGET_SECS", 10)));

/// Initial backoff after a transient region-cache failure.
pub static SPLIT_REGION_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SPLIT_REGION_INITIAL_BACKOFF_MS", 50)));

/// Largest single backoff between region-cache retries.
pub static SPLIT_REGION_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SPLIT_REGION_MAX_BACKOFF_MS", 1_000)));
