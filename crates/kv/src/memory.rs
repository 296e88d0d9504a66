//! In-memory `Store` for tests: an `imbl` ordered map whose cheap clones
//! serve as snapshots, an optional region map driven by explicit split
//! points, and injectable region-cache failures.

use std::{
    ops::Bound,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::SystemTime,
};

use async_trait::async_trait;
use common::keys::Key;
use imbl::OrdMap;
use parking_lot::RwLock;

use crate::{
    KvIter,
    Mutation,
    Priority,
    RegionCache,
    RegionRange,
    Session,
    Snapshot,
    SnapshotOptions,
    Store,
    TransientRegionError,
    Version,
};

struct MemoryInner {
    data: RwLock<OrdMap<Key, Vec<u8>>>,
    version: AtomicU64,
    splits: Vec<Key>,
    region_aware: bool,
    transient_failures: AtomicUsize,
    report_no_regions: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    /// A store without a region map; the splitter sees it as one range.
    pub fn new() -> Self {
        Self::build(Vec::new(), false)
    }

    /// A region-aware store sharded at the given split points.
    pub fn with_regions(mut splits: Vec<Key>) -> Self {
        splits.sort();
        splits.dedup();
        Self::build(splits, true)
    }

    fn build(splits: Vec<Key>, region_aware: bool) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                data: RwLock::new(OrdMap::new()),
                version: AtomicU64::new(1),
                splits,
                region_aware,
                transient_failures: AtomicUsize::new(0),
                report_no_regions: AtomicBool::new(false),
            }),
        }
    }

    pub fn load(&self, rows: impl IntoIterator<Item = (Key, Vec<u8>)>) {
        let mut data = self.inner.data.write();
        for (key, value) in rows {
            data.insert(key, value);
        }
        self.inner.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Make the next `n` region-cache lookups fail transiently.
    pub fn fail_next_region_lookups(&self, n: usize) {
        self.inner.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Make the region cache claim no region covers any span, simulating a
    /// region-map inconsistency.
    pub fn report_no_regions(&self, yes: bool) {
        self.inner.report_no_regions.store(yes, Ordering::SeqCst);
    }

    /// All live entries under `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &Key) -> Vec<(Key, Vec<u8>)> {
        let upper = prefix.prefix_next();
        self.inner
            .data
            .read()
            .range((Bound::Included(prefix.clone()), Bound::Excluded(upper)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Store for MemoryStore {
    fn snapshot(&self, _version: Version, _opts: SnapshotOptions) -> anyhow::Result<Arc<dyn Snapshot>> {
        Ok(Arc::new(MemorySnapshot {
            data: self.inner.data.read().clone(),
        }))
    }

    fn session(&self) -> anyhow::Result<Box<dyn Session>> {
        Ok(Box::new(MemorySession {
            store: self.clone(),
        }))
    }

    fn region_cache(&self) -> Option<Arc<dyn RegionCache>> {
        if !self.inner.region_aware {
            return None;
        }
        Some(Arc::new(MemoryRegionCache {
            inner: self.inner.clone(),
        }))
    }

    fn current_version(&self) -> anyhow::Result<Version> {
        Ok(Version(self.inner.version.load(Ordering::SeqCst)))
    }

    fn oracle_time(&self) -> anyhow::Result<SystemTime> {
        Ok(SystemTime::now())
    }
}

struct MemorySnapshot {
    data: OrdMap<Key, Vec<u8>>,
}

impl Snapshot for MemorySnapshot {
    fn iter(&self, lower: Key, upper: Key) -> anyhow::Result<Box<dyn KvIter>> {
        let entries = self
            .data
            .range((Bound::Included(lower), Bound::Excluded(upper)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(MemoryIter { entries, pos: 0 }))
    }

    fn iter_reverse(&self, lower: Key, upper: Key) -> anyhow::Result<Box<dyn KvIter>> {
        let mut entries: Vec<_> = self
            .data
            .range((Bound::Included(lower), Bound::Excluded(upper)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.reverse();
        Ok(Box::new(MemoryIter { entries, pos: 0 }))
    }
}

struct MemoryIter {
    entries: Vec<(Key, Vec<u8>)>,
    pos: usize,
}

impl KvIter for MemoryIter {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn key(&self) -> &Key {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }

    fn next(&mut self) -> anyhow::Result<()> {
        self.pos += 1;
        Ok(())
    }
}

struct MemorySession {
    store: MemoryStore,
}

#[async_trait]
impl Session for MemorySession {
    async fn write(
        &mut self,
        mutations: Vec<Mutation>,
        _priority: Priority,
    ) -> anyhow::Result<Version> {
        let inner = &self.store.inner;
        let mut data = inner.data.write();
        for mutation in mutations {
            match mutation {
                Mutation::Put { key, value } => {
                    data.insert(key, value);
                },
                Mutation::Delete { key } => {
                    data.remove(&key);
                },
            }
        }
        let version = inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Version(version))
    }
}

struct MemoryRegionCache {
    inner: Arc<MemoryInner>,
}

impl RegionCache for MemoryRegionCache {
    fn regions_in_range(
        &self,
        start: &Key,
        end: &Key,
        limit: usize,
    ) -> anyhow::Result<Vec<RegionRange>> {
        let failures = &self.inner.transient_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!(TransientRegionError("region cache refresh in flight"));
        }
        if self.inner.report_no_regions.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }

        let mut regions = Vec::new();
        let mut cursor = start.clone();
        for split in &self.inner.splits {
            if regions.len() >= limit {
                return Ok(regions);
            }
            if *split <= cursor {
                continue;
            }
            if *split >= *end {
                break;
            }
            regions.push(RegionRange {
                start_key: cursor,
                end_key: split.clone(),
            });
            cursor = split.clone();
        }
        if regions.len() < limit && cursor < *end {
            regions.push(RegionRange {
                start_key: cursor,
                end_key: end.clone(),
            });
        }
        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use common::{
        keys::{
            record_key,
            record_prefix,
        },
        types::TableId,
    };

    use super::*;
    use crate::MAX_VERSION;

    fn seeded_store(splits: Vec<Key>) -> MemoryStore {
        let store = MemoryStore::with_regions(splits);
        let table = TableId(1);
        store.load((0..10).map(|h| (record_key(table, h), vec![h as u8])));
        store
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let store = seeded_store(Vec::new());
        let snapshot = store
            .snapshot(MAX_VERSION, SnapshotOptions::default())
            .unwrap();
        store.load([(record_key(TableId(1), 100), vec![0])]);

        let prefix = record_prefix(TableId(1));
        let mut iter = snapshot.iter(prefix.clone(), prefix.prefix_next()).unwrap();
        let mut seen = 0;
        while iter.valid() {
            seen += 1;
            iter.next().unwrap();
        }
        assert_eq!(seen, 10);
    }

    #[test]
    fn test_reverse_iter_descends() {
        let store = seeded_store(Vec::new());
        let snapshot = store
            .snapshot(MAX_VERSION, SnapshotOptions::default())
            .unwrap();
        let prefix = record_prefix(TableId(1));
        let mut iter = snapshot
            .iter_reverse(prefix.clone(), prefix.prefix_next())
            .unwrap();
        assert!(iter.valid());
        assert_eq!(iter.key(), &record_key(TableId(1), 9));
        iter.next().unwrap();
        assert_eq!(iter.key(), &record_key(TableId(1), 8));
    }

    #[test]
    fn test_regions_respect_splits_and_limit() {
        let table = TableId(1);
        let store = seeded_store(vec![record_key(table, 3), record_key(table, 6)]);
        let cache = store.region_cache().unwrap();
        let prefix = record_prefix(table);

        let regions = cache
            .regions_in_range(&prefix, &prefix.prefix_next(), 16)
            .unwrap();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].start_key, prefix);
        assert_eq!(regions[0].end_key, record_key(table, 3));
        assert_eq!(regions[2].end_key, prefix.prefix_next());

        let truncated = cache
            .regions_in_range(&prefix, &prefix.prefix_next(), 2)
            .unwrap();
        assert_eq!(truncated.len(), 2);

        store.fail_next_region_lookups(1);
        let err = cache
            .regions_in_range(&prefix, &prefix.prefix_next(), 16)
            .unwrap_err();
        assert!(crate::is_transient_region_error(&err));
    }
}
