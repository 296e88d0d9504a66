//! Terminal error classifications of the backfill pipeline.
//!
//! A `ReorgError` rides inside an `anyhow` chain and is recovered by
//! downcast wherever the pipeline has to branch on the classification (the
//! worker's terminal publication, the driver's cancellation checks).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReorgError {
    #[error("reorg job is cancelled")]
    Cancelled,
    #[error("reorg job timed out")]
    Timeout,
    #[error("this instance is no longer the DDL owner")]
    NotOwner,
    #[error("backfill worker panicked: {0}")]
    Panic(String),
    #[error("no region covers an addressable key span")]
    InvalidSplitRegionRanges,
    #[error("DDL job not found")]
    JobNotFound,
}

/// The `ReorgError` classification of an error chain, if it carries one.
pub fn reorg_error(err: &anyhow::Error) -> Option<&ReorgError> {
    err.downcast_ref::<ReorgError>()
}

/// Whether the error is one of the cooperative-cancellation classifications
/// (cancelled, timed out, ownership lost).
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(
        reorg_error(err),
        Some(ReorgError::Cancelled | ReorgError::Timeout | ReorgError::NotOwner)
    )
}

pub fn is_job_not_found(err: &anyhow::Error) -> bool {
    matches!(reorg_error(err), Some(ReorgError::JobNotFound))
}
