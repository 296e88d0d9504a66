//! The per-kind row processor contract and the snapshot-scanning
//! transactional processor behind the non-ingest kinds. The pipeline only
//! needs `process_batch`; what one row turns into stays pluggable behind
//! [`RowTransform`].

use std::{
    fmt,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use common::keys::{
    record_prefix,
    Handle,
    Key,
    KeyRange,
};
use kv::{
    Mutation,
    Session,
    SnapshotOptions,
    Store,
    Version,
};

use crate::{
    metrics,
    reorg::JobContext,
    scan::iterate_snapshot,
    session::PooledSession,
    test_hooks,
    variables::ReorgVars,
};

/// Aggregate of one transactional batch.
#[derive(Clone, Debug)]
pub struct BatchOutcome {
    /// First key not yet processed; the range's resume point.
    pub next_key: Key,
    /// The processor reached or passed the range's excluded end key.
    pub done: bool,
    pub added: u64,
    pub scanned: u64,
    pub warnings: Vec<String>,
    /// Commit version of the batch's transaction, when anything was written.
    pub finish_version: Option<Version>,
}

/// One source row turned into the mutations implementing the schema change.
#[derive(Clone, Debug, Default)]
pub struct TransformedRow {
    pub mutations: Vec<Mutation>,
    pub warning: Option<String>,
}

impl From<Vec<Mutation>> for TransformedRow {
    fn from(mutations: Vec<Mutation>) -> Self {
        Self {
            mutations,
            warning: None,
        }
    }
}

/// Kind-specific row logic: what one row of the source table contributes to
/// the new physical representation. Implementations must be deterministic at
/// the job's snapshot version; recoverable write conflicts are retried below
/// the processor, not here.
pub trait RowTransform: Send + Sync {
    fn transform(
        &self,
        handle: Option<Handle>,
        key: &Key,
        value: &[u8],
    ) -> anyhow::Result<TransformedRow>;
}

/// Shared state threaded through every processor kind.
#[derive(Clone)]
pub struct BackfillContext {
    pub store: Arc<dyn Store>,
    pub job: JobContext,
    pub vars: ReorgVars,
    /// Rows added across all workers of the job, for progress reporting.
    pub added_counter: Arc<AtomicU64>,
}

/// Per-backfill-kind batch executor. Each worker owns one.
#[async_trait]
pub trait RowProcessor: Send + Sync + fmt::Display {
    /// In one transaction starting at `range.start_key`, consume up to
    /// `batch_size` rows, apply the kind's transformation, commit, and
    /// report the first key not processed. Commit failures fail the task;
    /// retryable conflicts are the implementation's business.
    async fn process_batch(
        &mut self,
        range: &KeyRange,
        batch_size: usize,
    ) -> anyhow::Result<BatchOutcome>;

    /// Publish rows written by a committed batch to progress accounting.
    fn add_metric(&self, added: u64);
}

/// Builds the processor for one worker; each gets its own session.
pub trait ProcessorFactory: Send + Sync {
    fn make(
        &self,
        ctx: BackfillContext,
        session: PooledSession,
    ) -> anyhow::Result<Box<dyn RowProcessor>>;
}

/// Snapshot-scanning processor for the transactional kinds: walk the record
/// space at the job's snapshot version, transform each row, commit the batch
/// through the worker's session.
pub struct TxnRowProcessor {
    ctx: BackfillContext,
    session: PooledSession,
    transform: Arc<dyn RowTransform>,
    prefix: Key,
}

impl TxnRowProcessor {
    pub fn new(
        ctx: BackfillContext,
        session: PooledSession,
        transform: Arc<dyn RowTransform>,
    ) -> Self {
        let prefix = record_prefix(ctx.job.physical_table_id);
        Self {
            ctx,
            session,
            transform,
            prefix,
        }
    }
}

impl fmt::Display for TxnRowProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} backfill of table {}",
            self.ctx.job.kind, self.ctx.job.physical_table_id
        )
    }
}

#[async_trait]
impl RowProcessor for TxnRowProcessor {
    async fn process_batch(
        &mut self,
        range: &KeyRange,
        batch_size: usize,
    ) -> anyhow::Result<BatchOutcome> {
        let _timer = metrics::batch_timer();
        if let Some(delay) = test_hooks::slow_batch_delay() {
            tokio::time::sleep(delay).await;
        }
        if test_hooks::get_record_error_injected(self.ctx.job.physical_table_id) {
            anyhow::bail!(
                "injected failure fetching a record of table {}",
                self.ctx.job.physical_table_id
            );
        }

        let mut outcome = BatchOutcome {
            next_key: range.start_key.clone(),
            done: false,
            added: 0,
            scanned: 0,
            warnings: Vec::new(),
            finish_version: None,
        };
        let mut mutations = Vec::new();
        let mut last_accessed: Option<Key> = None;
        let opts = SnapshotOptions {
            priority: self.ctx.job.priority,
            request_source: Some(self.ctx.job.kind.request_source()),
            resource_group_tagger: None,
        };
        let transform = &self.transform;
        iterate_snapshot(
            &self.ctx.store,
            self.ctx.job.snapshot_version,
            &self.prefix,
            &range.start_key,
            &range.end_key,
            opts,
            |handle, key, value| {
                let past_end = if range.end_include {
                    *key > range.end_key
                } else {
                    *key >= range.end_key
                };
                if past_end {
                    outcome.done = true;
                    return Ok(false);
                }
                let row = transform.transform(handle, key, value)?;
                outcome.scanned += 1;
                if !row.mutations.is_empty() {
                    outcome.added += 1;
                    mutations.extend(row.mutations);
                }
                if let Some(warning) = row.warning {
                    outcome.warnings.push(warning);
                }
                last_accessed = Some(key.clone());
                Ok(outcome.scanned < batch_size as u64)
            },
        )?;

        // Fewer rows than the batch holds means the range ran dry.
        if outcome.scanned < batch_size as u64 {
            outcome.done = true;
        }
        outcome.next_key = if outcome.done {
            range.excluded_end_key()
        } else {
            match &last_accessed {
                Some(key) => key.next(),
                None => range.start_key.clone(),
            }
        };

        if !mutations.is_empty() {
            let version = self
                .session
                .write(mutations, self.ctx.job.priority)
                .await?;
            outcome.finish_version = Some(version);
        }
        metrics::log_batch_rows(outcome.scanned);
        Ok(outcome)
    }

    fn add_metric(&self, added: u64) {
        self.ctx.added_counter.fetch_add(added, Ordering::Relaxed);
        metrics::log_rows_added(added);
    }
}

/// Factory handing every worker a [`TxnRowProcessor`] over the caller's
/// transformation. Ingest kinds reuse it for the scan-and-transform side;
/// their buffered file writing lives behind the driver's ingest backend.
pub struct TransformFactory {
    transform: Arc<dyn RowTransform>,
}

impl TransformFactory {
    pub fn new(transform: Arc<dyn RowTransform>) -> Self {
        Self { transform }
    }
}

impl ProcessorFactory for TransformFactory {
    fn make(
        &self,
        ctx: BackfillContext,
        session: PooledSession,
    ) -> anyhow::Result<Box<dyn RowProcessor>> {
        Ok(Box::new(TxnRowProcessor::new(
            ctx,
            session,
            self.transform.clone(),
        )))
    }
}
