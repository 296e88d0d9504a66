//! Durable schema-change context and the contracts binding the pipeline to
//! its host: the job scheduler persists the resume key through
//! `ReorgMetaStore` and answers the cooperative-cancellation predicate
//! through `JobController`.

use std::fmt;

use async_trait::async_trait;
use common::{
    keys::Key,
    types::{
        ElementId,
        JobId,
        TableId,
    },
};
use kv::{
    Priority,
    RequestSource,
    Version,
};

/// Which schema change a backfill serves. Selects the row processor; the
/// pipeline itself only looks at `uses_ingest` and the request source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackfillKind {
    AddIndex,
    AddIndexIngest,
    UpdateColumn,
    CleanupGlobalIndex,
    MergeTempIndex,
    ReorgPartition,
}

impl BackfillKind {
    /// Kinds that write through the bulk-ingest backend instead of the
    /// transactional path.
    pub fn uses_ingest(&self) -> bool {
        matches!(self, Self::AddIndexIngest)
    }

    pub fn request_source(&self) -> RequestSource {
        match self {
            Self::AddIndex | Self::AddIndexIngest => RequestSource::DdlAddIndex,
            Self::UpdateColumn => RequestSource::DdlModifyColumn,
            Self::CleanupGlobalIndex => RequestSource::DdlCleanupIndex,
            Self::MergeTempIndex => RequestSource::DdlMergeIndex,
            Self::ReorgPartition => RequestSource::DdlReorgPartition,
        }
    }
}

impl fmt::Display for BackfillKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AddIndex => "add index",
            Self::AddIndexIngest => "add index (ingest)",
            Self::UpdateColumn => "update column",
            Self::CleanupGlobalIndex => "cleanup global index",
            Self::MergeTempIndex => "merge temporary index",
            Self::ReorgPartition => "reorganize partition",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    Index,
    Column,
}

/// The index or column the job is currently building. A job may cover
/// several elements; the driver runs one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Element {
    pub id: ElementId,
    pub kind: ElementKind,
}

/// Durable context of one schema-change job over one physical table.
/// `curr_key` mirrors the most recently persisted resume key; only the
/// driver mutates it, through [`ReorgInfo::update_reorg_meta`].
#[derive(Clone, Debug)]
pub struct ReorgInfo {
    pub job_id: JobId,
    pub element: Element,
    pub kind: BackfillKind,
    pub priority: Priority,
    pub physical_table_id: TableId,
    /// Full key span of the physical table, `[start_key, end_key)`. Both
    /// empty means there is nothing to backfill.
    pub start_key: Key,
    pub end_key: Key,
    /// The fixed read version every batch scans at.
    pub snapshot_version: Version,
    pub curr_key: Key,
}

impl ReorgInfo {
    pub fn new(
        job_id: JobId,
        element: Element,
        kind: BackfillKind,
        priority: Priority,
        physical_table_id: TableId,
        start_key: Key,
        end_key: Key,
        snapshot_version: Version,
    ) -> Self {
        let curr_key = start_key.clone();
        Self {
            job_id,
            element,
            kind,
            priority,
            physical_table_id,
            start_key,
            end_key,
            snapshot_version,
            curr_key,
        }
    }

    pub fn is_empty_span(&self) -> bool {
        self.start_key.is_empty() && self.end_key.is_empty()
    }

    /// Where to resume scanning: the persisted key if there is one, else the
    /// start of the span.
    pub fn resume_key(&self) -> Key {
        if self.curr_key.is_empty() {
            self.start_key.clone()
        } else {
            self.curr_key.clone()
        }
    }

    /// Persist `next_key` as the new resume point. Runs on every return path
    /// of a dispatch round so a crash never loses in-order progress.
    pub async fn update_reorg_meta(
        &mut self,
        next_key: Key,
        meta: &dyn ReorgMetaStore,
    ) -> anyhow::Result<()> {
        meta.persist_next_key(self.job_id, self.element, &next_key)
            .await?;
        self.curr_key = next_key;
        Ok(())
    }
}

/// Persistence of the reorg job's resume key, owned by the job scheduler.
/// The write must be atomic with respect to crash recovery: after a restart
/// the driver resumes from exactly the last persisted key.
#[async_trait]
pub trait ReorgMetaStore: Send + Sync {
    async fn persist_next_key(
        &self,
        job_id: JobId,
        element: Element,
        next_key: &Key,
    ) -> anyhow::Result<()>;
}

/// Cooperative-cancellation predicate, consulted by every worker before each
/// batch and by the driver after each dispatch round.
pub trait JobController: Send + Sync {
    /// `Ok` while the job may keep running; a classified
    /// [`common::errors::ReorgError`] once it is cancelled, timed out, or
    /// ownership moved.
    fn is_reorg_runnable(&self, job_id: JobId) -> anyhow::Result<()>;
}

/// Immutable per-job parameters threaded from the driver to the scheduler
/// and every worker.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub job_id: JobId,
    pub element: Element,
    pub kind: BackfillKind,
    pub priority: Priority,
    pub physical_table_id: TableId,
    pub snapshot_version: Version,
    /// Identity this instance publishes on distributed-task leases.
    pub instance_id: String,
}

impl JobContext {
    pub fn from_reorg(reorg: &ReorgInfo, instance_id: String) -> Self {
        Self {
            job_id: reorg.job_id,
            element: reorg.element,
            kind: reorg.kind,
            priority: reorg.priority,
            physical_table_id: reorg.physical_table_id,
            snapshot_version: reorg.snapshot_version,
            instance_id,
        }
    }
}
