//! Contracts over the distributed key-value store the backfill pipeline runs
//! against: versioned snapshots with bounded iterators, transactional
//! sessions, the region map, and the timestamp oracle. Everything is object
//! safe so the pipeline stays generic over the real store and the in-memory
//! one used by tests.

use std::{
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use common::keys::Key;
use derive_more::Display;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// A timestamp assigned by the store's oracle. Snapshots taken at a version
/// observe exactly the transactions committed at or below it.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct Version(pub u64);

/// Reads at `MAX_VERSION` observe the latest committed state.
pub const MAX_VERSION: Version = Version(u64::MAX);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// The internal request source a snapshot serves, tagged onto every storage
/// request for observability and QoS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestSource {
    DdlAddIndex,
    DdlModifyColumn,
    DdlCleanupIndex,
    DdlMergeIndex,
    DdlReorgPartition,
}

impl RequestSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::DdlAddIndex => "ddl_add_index",
            Self::DdlModifyColumn => "ddl_modify_column",
            Self::DdlCleanupIndex => "ddl_cleanup_index",
            Self::DdlMergeIndex => "ddl_merge_index",
            Self::DdlReorgPartition => "ddl_reorg_partition",
        }
    }
}

/// Supplies the resource-group tag attached to a snapshot's requests.
pub trait ResourceGroupTagger: Send + Sync {
    fn tag(&self) -> Vec<u8>;
}

#[derive(Clone, Default)]
pub struct SnapshotOptions {
    pub priority: Priority,
    pub request_source: Option<RequestSource>,
    pub resource_group_tagger: Option<Arc<dyn ResourceGroupTagger>>,
}

/// A positioned iterator over a snapshot. `key`/`value` may only be called
/// while `valid()`; running off the end leaves the iterator invalid rather
/// than erroring.
pub trait KvIter: Send {
    fn valid(&self) -> bool;
    fn key(&self) -> &Key;
    fn value(&self) -> &[u8];
    fn next(&mut self) -> anyhow::Result<()>;
}

pub trait Snapshot: Send + Sync {
    /// Ascending iterator over `[lower, upper)`.
    fn iter(&self, lower: Key, upper: Key) -> anyhow::Result<Box<dyn KvIter>>;

    /// Descending iterator over `[lower, upper)`.
    fn iter_reverse(&self, lower: Key, upper: Key) -> anyhow::Result<Box<dyn KvIter>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Put { key: Key, value: Vec<u8> },
    Delete { key: Key },
}

impl Mutation {
    pub fn key(&self) -> &Key {
        match self {
            Self::Put { key, .. } => key,
            Self::Delete { key } => key,
        }
    }
}

/// A transactional handle onto the store. Each backfill worker owns one;
/// they are pooled and never shared.
#[async_trait]
pub trait Session: Send + Sync {
    /// Commit the mutations as a single transaction and return its commit
    /// version. Retry of recoverable conflicts happens below this call.
    async fn write(&mut self, mutations: Vec<Mutation>, priority: Priority)
        -> anyhow::Result<Version>;
}

/// One shard of the key space as reported by the region map. An empty
/// `end_key` means the region extends to the end of the key space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionRange {
    pub start_key: Key,
    pub end_key: Key,
}

pub trait RegionCache: Send + Sync {
    /// The regions intersecting `[start, end)`, in key order, at most
    /// `limit` of them.
    fn regions_in_range(&self, start: &Key, end: &Key, limit: usize)
        -> anyhow::Result<Vec<RegionRange>>;
}

/// A transient region-map lookup failure. Callers retry with bounded
/// backoff; anything else from the region cache is fatal to the job.
#[derive(Debug, Clone, Error)]
#[error("transient region cache failure: {0}")]
pub struct TransientRegionError(pub &'static str);

pub fn is_transient_region_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TransientRegionError>().is_some()
}

pub trait Store: Send + Sync + 'static {
    fn snapshot(&self, version: Version, opts: SnapshotOptions) -> anyhow::Result<Arc<dyn Snapshot>>;

    fn session(&self) -> anyhow::Result<Box<dyn Session>>;

    /// `None` for stores without a region map (in-memory, single node);
    /// such stores are scanned as a single range.
    fn region_cache(&self) -> Option<Arc<dyn RegionCache>> {
        None
    }

    fn current_version(&self) -> anyhow::Result<Version>;

    /// Wall clock of the store's timestamp oracle, for lease expiry math.
    fn oracle_time(&self) -> anyhow::Result<SystemTime>;
}
