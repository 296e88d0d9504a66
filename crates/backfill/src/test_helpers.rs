//! Recording doubles and fixtures for the pipeline's tests: an in-memory
//! meta store, a countdown cancellation controller, a persisted-task sink,
//! an ingest recorder, and row transforms that succeed, fail, or panic on
//! demand.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            AtomicI64,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use common::{
    errors::ReorgError,
    keys::{
        index_prefix,
        record_key,
        record_prefix,
        Handle,
        Key,
        KeyRange,
    },
    types::{
        ElementId,
        JobId,
        TableId,
    },
};
use kv::{
    memory::MemoryStore,
    Mutation,
    Priority,
    Store,
    Version,
};
use parking_lot::Mutex;

use crate::{
    distributed::{
        PersistedTask,
        TaskSink,
    },
    driver::BackfillEnv,
    ingest::IngestBackend,
    processor::{
        BackfillContext,
        BatchOutcome,
        ProcessorFactory,
        RowProcessor,
        RowTransform,
        TransformFactory,
        TransformedRow,
    },
    reorg::{
        BackfillKind,
        Element,
        ElementKind,
        JobContext,
        JobController,
        ReorgInfo,
        ReorgMetaStore,
    },
    session::{
        PooledSession,
        SessionPool,
    },
    variables::ReorgVars,
};

/// Records every persisted resume key, in order.
pub struct RecordingMetaStore {
    history: Mutex<Vec<Key>>,
}

impl RecordingMetaStore {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn history(&self) -> Vec<Key> {
        self.history.lock().clone()
    }

    pub fn last(&self) -> Option<Key> {
        self.history.lock().last().cloned()
    }
}

#[async_trait]
impl ReorgMetaStore for RecordingMetaStore {
    async fn persist_next_key(
        &self,
        _job_id: JobId,
        _element: Element,
        next_key: &Key,
    ) -> anyhow::Result<()> {
        self.history.lock().push(next_key.clone());
        Ok(())
    }
}

/// Stays runnable for a fixed number of checks, then reports the job
/// cancelled forever after.
pub struct FlagController {
    remaining_checks: AtomicI64,
}

impl FlagController {
    pub fn runnable() -> Self {
        Self {
            remaining_checks: AtomicI64::new(i64::MAX),
        }
    }

    pub fn cancel_after(checks: i64) -> Self {
        Self {
            remaining_checks: AtomicI64::new(checks),
        }
    }
}

impl JobController for FlagController {
    fn is_reorg_runnable(&self, _job_id: JobId) -> anyhow::Result<()> {
        if self.remaining_checks.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(anyhow::Error::new(ReorgError::Cancelled));
        }
        Ok(())
    }
}

/// In-memory persisted-task storage that records every publication.
pub struct MemoryTaskSink {
    tasks: Mutex<BTreeMap<usize, PersistedTask>>,
    updates: Mutex<Vec<PersistedTask>>,
    finishes: Mutex<Vec<PersistedTask>>,
    job_missing: AtomicBool,
}

impl MemoryTaskSink {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            updates: Mutex::new(Vec::new()),
            finishes: Mutex::new(Vec::new()),
            job_missing: AtomicBool::new(false),
        }
    }

    /// Make `finish_task` report the DDL job gone, as when another owner
    /// completed it.
    pub fn set_job_missing(&self, missing: bool) {
        self.job_missing.store(missing, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<PersistedTask> {
        self.updates.lock().clone()
    }

    pub fn finishes(&self) -> Vec<PersistedTask> {
        self.finishes.lock().clone()
    }
}

#[async_trait]
impl TaskSink for MemoryTaskSink {
    async fn get_tasks(&self, job_id: JobId) -> anyhow::Result<Vec<PersistedTask>> {
        Ok(self
            .tasks
            .lock()
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn update_task(&self, task: &PersistedTask) -> anyhow::Result<()> {
        self.updates.lock().push(task.clone());
        self.tasks.lock().insert(task.id, task.clone());
        Ok(())
    }

    async fn finish_task(&self, task: &PersistedTask) -> anyhow::Result<()> {
        if self.job_missing.load(Ordering::SeqCst) {
            return Err(anyhow::Error::new(ReorgError::JobNotFound));
        }
        self.finishes.lock().push(task.clone());
        self.tasks.lock().insert(task.id, task.clone());
        Ok(())
    }
}

/// Records flush/reset calls from the driver.
pub struct RecordingIngest {
    flushes: Mutex<Vec<ElementId>>,
    resets: Mutex<Vec<ElementId>>,
}

impl RecordingIngest {
    pub fn new() -> Self {
        Self {
            flushes: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
        }
    }

    pub fn flushes(&self) -> Vec<ElementId> {
        self.flushes.lock().clone()
    }

    pub fn resets(&self) -> Vec<ElementId> {
        self.resets.lock().clone()
    }
}

#[async_trait]
impl IngestBackend for RecordingIngest {
    async fn flush(&self, element_id: ElementId) -> anyhow::Result<()> {
        self.flushes.lock().push(element_id);
        Ok(())
    }

    async fn reset(&self, element_id: ElementId) -> anyhow::Result<()> {
        self.resets.lock().push(element_id);
        Ok(())
    }
}

/// Writes one index entry per row: the row's value followed by its handle,
/// under the element's index prefix.
pub struct IndexRowTransform {
    table_id: TableId,
    index_id: i64,
}

impl IndexRowTransform {
    pub fn new(table_id: TableId, index_id: i64) -> Self {
        Self { table_id, index_id }
    }

    pub fn entry_prefix(&self) -> Key {
        index_prefix(self.table_id, self.index_id)
    }
}

impl RowTransform for IndexRowTransform {
    fn transform(
        &self,
        handle: Option<Handle>,
        _key: &Key,
        value: &[u8],
    ) -> anyhow::Result<TransformedRow> {
        let Some(handle) = handle else {
            anyhow::bail!("index backfill expects record keys");
        };
        let mut entry = self.entry_prefix().into_bytes();
        entry.extend_from_slice(value);
        entry.extend_from_slice(&handle.to_be_bytes());
        Ok(vec![Mutation::Put {
            key: Key::new(entry),
            value: handle.to_be_bytes().to_vec(),
        }]
        .into())
    }
}

/// Delegates to an [`IndexRowTransform`] but fails at one handle.
pub struct FailingTransform {
    inner: IndexRowTransform,
    fail_at: Handle,
}

impl FailingTransform {
    pub fn new(inner: IndexRowTransform, fail_at: Handle) -> Self {
        Self { inner, fail_at }
    }
}

impl RowTransform for FailingTransform {
    fn transform(
        &self,
        handle: Option<Handle>,
        key: &Key,
        value: &[u8],
    ) -> anyhow::Result<TransformedRow> {
        if handle == Some(self.fail_at) {
            anyhow::bail!("injected transform failure at handle {}", self.fail_at);
        }
        self.inner.transform(handle, key, value)
    }
}

/// Delegates to an [`IndexRowTransform`] but panics at one handle.
pub struct PanickingTransform {
    inner: IndexRowTransform,
    panic_at: Handle,
}

impl PanickingTransform {
    pub fn new(inner: IndexRowTransform, panic_at: Handle) -> Self {
        Self { inner, panic_at }
    }
}

impl RowTransform for PanickingTransform {
    fn transform(
        &self,
        handle: Option<Handle>,
        key: &Key,
        value: &[u8],
    ) -> anyhow::Result<TransformedRow> {
        if handle == Some(self.panic_at) {
            panic!("synthetic panic at handle {}", self.panic_at);
        }
        self.inner.transform(handle, key, value)
    }
}

/// Produces no mutations; for tests that only exercise the pipeline.
pub struct NoopTransform;

impl RowTransform for NoopTransform {
    fn transform(
        &self,
        _handle: Option<Handle>,
        _key: &Key,
        _value: &[u8],
    ) -> anyhow::Result<TransformedRow> {
        Ok(TransformedRow::default())
    }
}

/// Wraps another factory and tracks the peak number of concurrently running
/// batches across all workers.
pub struct TrackingFactory {
    inner: Arc<dyn ProcessorFactory>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl TrackingFactory {
    pub fn new(inner: Arc<dyn ProcessorFactory>) -> Self {
        Self {
            inner,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl ProcessorFactory for TrackingFactory {
    fn make(
        &self,
        ctx: BackfillContext,
        session: PooledSession,
    ) -> anyhow::Result<Box<dyn RowProcessor>> {
        Ok(Box::new(TrackingProcessor {
            inner: self.inner.make(ctx, session)?,
            active: self.active.clone(),
            max_active: self.max_active.clone(),
        }))
    }
}

struct TrackingProcessor {
    inner: Box<dyn RowProcessor>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl fmt::Display for TrackingProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

#[async_trait]
impl RowProcessor for TrackingProcessor {
    async fn process_batch(
        &mut self,
        range: &KeyRange,
        batch_size: usize,
    ) -> anyhow::Result<BatchOutcome> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let result = self.inner.process_batch(range, batch_size).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn add_metric(&self, added: u64) {
        self.inner.add_metric(added);
    }
}

pub fn seed_rows(store: &MemoryStore, table_id: TableId, handles: std::ops::Range<i64>) {
    store.load(handles.map(|h| (record_key(table_id, h), format!("v{h:04}").into_bytes())));
}

pub fn test_job_context(job: i64) -> JobContext {
    JobContext {
        job_id: JobId(job),
        element: Element {
            id: ElementId(job),
            kind: ElementKind::Index,
        },
        kind: BackfillKind::AddIndex,
        priority: Priority::Normal,
        physical_table_id: TableId(1),
        snapshot_version: Version(1),
        instance_id: "ddl-instance-1".to_owned(),
    }
}

/// A reorg job covering the whole record space of `table_id`.
pub fn reorg_for_table(
    store: &MemoryStore,
    job: i64,
    table_id: TableId,
    kind: BackfillKind,
) -> ReorgInfo {
    let start = record_prefix(table_id);
    let end = start.prefix_next();
    let version = store.current_version().expect("memory store has a version");
    ReorgInfo::new(
        JobId(job),
        Element {
            id: ElementId(job),
            kind: ElementKind::Index,
        },
        kind,
        Priority::Normal,
        table_id,
        start,
        end,
        version,
    )
}

/// A full environment over recording doubles; mutate the optional pieces
/// with the `with_*` builders.
pub struct TestEnv {
    pub env: BackfillEnv,
    pub store: MemoryStore,
    pub meta: Arc<RecordingMetaStore>,
    pub controller: Arc<FlagController>,
    pub sink: Option<Arc<MemoryTaskSink>>,
    pub ingest: Option<Arc<RecordingIngest>>,
    pub vars: ReorgVars,
}

impl TestEnv {
    pub fn new(store: MemoryStore, factory: Arc<dyn ProcessorFactory>) -> Self {
        let meta = Arc::new(RecordingMetaStore::new());
        let controller = Arc::new(FlagController::runnable());
        let vars = ReorgVars::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let env = BackfillEnv {
            store: shared.clone(),
            sessions: Arc::new(SessionPool::new(shared)),
            factory,
            controller: controller.clone(),
            meta: meta.clone(),
            task_sink: None,
            ingest: None,
            vars: vars.clone(),
            instance_id: "ddl-instance-1".to_owned(),
        };
        Self {
            env,
            store,
            meta,
            controller,
            sink: None,
            ingest: None,
            vars,
        }
    }

    pub fn for_index_backfill(store: MemoryStore, table_id: TableId) -> Self {
        let factory = Arc::new(TransformFactory::new(Arc::new(IndexRowTransform::new(
            table_id, 1,
        ))));
        Self::new(store, factory)
    }

    pub fn with_controller(mut self, controller: Arc<FlagController>) -> Self {
        self.env.controller = controller.clone();
        self.controller = controller;
        self
    }

    pub fn with_task_sink(mut self) -> Self {
        let sink = Arc::new(MemoryTaskSink::new());
        self.env.task_sink = Some(sink.clone());
        self.sink = Some(sink);
        self
    }

    pub fn with_ingest(mut self) -> Self {
        let ingest = Arc::new(RecordingIngest::new());
        self.env.ingest = Some(ingest.clone());
        self.ingest = Some(ingest);
        self
    }
}
