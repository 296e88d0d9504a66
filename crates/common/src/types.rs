use derive_more::Display;

/// Identifier of a durable schema-change job.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct JobId(pub i64);

/// Identifier of a physical table: a non-partitioned table or a single
/// partition.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct TableId(pub i64);

/// Identifier of the index or column a job is currently backfilling.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct ElementId(pub i64);
