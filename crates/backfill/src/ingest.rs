//! Seam onto the bulk-ingest backend used by ingest-mode index backfills.
//! The driver flushes buffered entries between dispatch rounds to bound
//! memory growth and resets per-element writer state when a table finishes;
//! the backend's file writing lives outside this crate.

use async_trait::async_trait;
use common::types::ElementId;

#[async_trait]
pub trait IngestBackend: Send + Sync {
    /// Flush entries buffered for the element to the backend's store.
    async fn flush(&self, element_id: ElementId) -> anyhow::Result<()>;

    /// Drop per-element writer state after the element's backfill finishes.
    async fn reset(&self, element_id: ElementId) -> anyhow::Result<()>;
}
