//! Distributed-mode task records. When several instances share a backfill
//! job, each dispatched range carries a persisted task whose instance id,
//! lease, and current key are republished as the worker makes progress, so
//! another instance can take over a task whose lease expired.

use std::time::SystemTime;

use async_trait::async_trait;
use common::{
    keys::Key,
    knobs::INSTANCE_LEASE,
    types::{
        ElementId,
        JobId,
        TableId,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Done,
    Cancelled,
}

/// The durable per-task record of distributed mode.
#[derive(Clone, Debug)]
pub struct PersistedTask {
    /// Sequential index of the task within its dispatch round.
    pub id: usize,
    pub job_id: JobId,
    pub ele_id: ElementId,
    pub physical_table_id: TableId,
    pub instance_id: String,
    pub instance_lease: SystemTime,
    /// First key the owning worker has not yet processed.
    pub curr_key: Key,
    pub row_count: u64,
    pub error: Option<String>,
    pub state: TaskState,
}

impl PersistedTask {
    /// Claim the task for `instance_id` until `now + INSTANCE_LEASE`.
    pub fn renew_lease(&mut self, instance_id: &str, now: SystemTime) {
        if self.instance_id != instance_id {
            self.instance_id = instance_id.to_owned();
        }
        self.instance_lease = now + *INSTANCE_LEASE;
    }

    /// Whether the owning instance's claim has lapsed at `now` (per the
    /// store's oracle, not the local clock).
    pub fn lease_expired(&self, now: SystemTime) -> bool {
        now > self.instance_lease
    }
}

/// Storage for persisted tasks, implemented by the distributed job tables.
/// `finish_task` reporting "job not found" means another owner completed the
/// job; callers treat the task as succeeded.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn get_tasks(&self, job_id: JobId) -> anyhow::Result<Vec<PersistedTask>>;

    async fn update_task(&self, task: &PersistedTask) -> anyhow::Result<()>;

    async fn finish_task(&self, task: &PersistedTask) -> anyhow::Result<()>;
}
