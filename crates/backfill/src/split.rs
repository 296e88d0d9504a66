//! Splitting a key span into ranges aligned with the store's regions, and
//! tightening a range's end to the last record that actually exists so
//! workers never scan past real data.

use std::{
    cmp,
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use common::{
    backoff::Backoff,
    errors::ReorgError,
    keys::{
        Key,
        KeyRange,
    },
    knobs::{
        SPLIT_REGION_INITIAL_BACKOFF,
        SPLIT_REGION_MAX_BACKOFF,
        SPLIT_REGION_RETRY_BUDGET,
    },
};
use kv::{
    is_transient_region_error,
    Priority,
    SnapshotOptions,
    Store,
    MAX_VERSION,
};

/// Split `[start, end)` into region-aligned sub-ranges, at most `limit` of
/// them. Stores without a region map get the input span back as one range;
/// spans longer than `limit` regions are truncated and the driver iterates.
pub async fn split_ranges(
    store: &Arc<dyn Store>,
    start: Key,
    end: Key,
    limit: usize,
) -> anyhow::Result<Vec<KeyRange>> {
    let Some(cache) = store.region_cache() else {
        return Ok(vec![KeyRange::new(start, end)]);
    };

    let deadline = Instant::now() + *SPLIT_REGION_RETRY_BUDGET;
    let mut backoff = Backoff::new(*SPLIT_REGION_INITIAL_BACKOFF, *SPLIT_REGION_MAX_BACKOFF);
    let regions = loop {
        match cache.regions_in_range(&start, &end, limit) {
            Ok(regions) => break regions,
            Err(e) if is_transient_region_error(&e) && Instant::now() < deadline => {
                let delay = backoff.fail(&mut rand::rng());
                tracing::info!(
                    "Transient region cache failure splitting [{start:?}, {end:?}), retry {} in \
                     {delay:?}: {e}",
                    backoff.failures()
                );
                tokio::time::sleep(delay).await;
            },
            Err(e) => return Err(e).context("loading regions for a backfill span"),
        }
    };

    let mut ranges = Vec::with_capacity(regions.len());
    for region in regions {
        let range_start = cmp::max(region.start_key, start.clone());
        let range_end = if region.end_key.is_empty() || region.end_key > end {
            end.clone()
        } else {
            region.end_key
        };
        if range_start >= range_end {
            continue;
        }
        ranges.push(KeyRange::new(range_start, range_end));
    }
    if ranges.is_empty() {
        // The span is addressable but no region covers it.
        return Err(anyhow::Error::new(ReorgError::InvalidSplitRegionRanges))
            .with_context(|| format!("splitting [{start:?}, {end:?})"));
    }
    Ok(ranges)
}

/// The largest existing key in `[start, end]` under `key_prefix`, found with
/// a reverse scan of the latest snapshot. `None` when the span holds no such
/// key; callers then fall back to the region's declared end.
///
/// The backfill reads at a fixed snapshot, so rows that land past the
/// returned key afterwards belong to the online write path, not to us.
pub fn end_key_of_region(
    store: &Arc<dyn Store>,
    priority: Priority,
    key_prefix: &Key,
    start: &Key,
    end: &Key,
) -> anyhow::Result<Option<Key>> {
    let snapshot = store.snapshot(
        MAX_VERSION,
        SnapshotOptions {
            priority,
            ..Default::default()
        },
    )?;
    let mut iter = snapshot.iter_reverse(start.clone(), end.next())?;
    while iter.valid() {
        if iter.key().has_prefix(key_prefix) {
            return Ok(Some(iter.key().clone()));
        }
        iter.next()?;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        errors::{
            reorg_error,
            ReorgError,
        },
        keys::{
            record_key,
            record_prefix,
            Key,
        },
        types::TableId,
    };
    use kv::{
        memory::MemoryStore,
        Priority,
        Store,
    };
    use proptest::prelude::*;

    use super::{
        end_key_of_region,
        split_ranges,
    };

    const TABLE: TableId = TableId(1);

    fn seeded(splits: Vec<Key>, handles: std::ops::Range<i64>) -> (Arc<dyn Store>, MemoryStore) {
        let store = if splits.is_empty() {
            MemoryStore::new()
        } else {
            MemoryStore::with_regions(splits)
        };
        store.load(handles.map(|h| (record_key(TABLE, h), vec![0])));
        (Arc::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_region_unaware_store_is_a_single_range() {
        let (store, _) = seeded(Vec::new(), 0..10);
        let prefix = record_prefix(TABLE);
        let ranges = split_ranges(&store, prefix.clone(), prefix.prefix_next(), 16)
            .await
            .unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start_key, prefix);
        assert_eq!(ranges[0].end_key, prefix.prefix_next());
    }

    #[tokio::test]
    async fn test_regions_are_clamped_contiguous_and_truncated() {
        let splits = vec![record_key(TABLE, 3), record_key(TABLE, 6), record_key(TABLE, 9)];
        let (store, _) = seeded(splits, 0..12);
        let start = record_key(TABLE, 1);
        let end = record_key(TABLE, 8);

        let ranges = split_ranges(&store, start.clone(), end.clone(), 16)
            .await
            .unwrap();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].start_key, start);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end_key, pair[1].start_key);
        }
        assert_eq!(ranges.last().unwrap().end_key, end);

        let truncated = split_ranges(&store, start, end, 2).await.unwrap();
        assert_eq!(truncated.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_lookup_failures_are_retried() {
        let (store, memory) = seeded(vec![record_key(TABLE, 5)], 0..10);
        memory.fail_next_region_lookups(2);
        let prefix = record_prefix(TABLE);
        let ranges = split_ranges(&store, prefix.clone(), prefix.prefix_next(), 16)
            .await
            .unwrap();
        assert_eq!(ranges.len(), 2);
    }

    #[tokio::test]
    async fn test_no_covering_region_is_fatal() {
        let (store, memory) = seeded(vec![record_key(TABLE, 5)], 0..10);
        memory.report_no_regions(true);
        let prefix = record_prefix(TABLE);
        let err = split_ranges(&store, prefix.clone(), prefix.prefix_next(), 16)
            .await
            .unwrap_err();
        assert_eq!(reorg_error(&err), Some(&ReorgError::InvalidSplitRegionRanges));
    }

    #[tokio::test]
    async fn test_end_key_of_region_finds_the_last_record() {
        let (store, _) = seeded(Vec::new(), 0..10);
        let prefix = record_prefix(TABLE);

        let tight = end_key_of_region(
            &store,
            Priority::Normal,
            &prefix,
            &prefix,
            &prefix.prefix_next(),
        )
        .unwrap();
        assert_eq!(tight, Some(record_key(TABLE, 9)));

        // A span past the data has no record to tighten to.
        let empty = end_key_of_region(
            &store,
            Priority::Normal,
            &prefix,
            &record_key(TABLE, 100),
            &prefix.prefix_next(),
        )
        .unwrap();
        assert_eq!(empty, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            failure_persistence: None, cases: 64, ..ProptestConfig::default()
        })]

        /// Region-aligned splitting never loses coverage: the ranges tile
        /// `[start, end)` exactly, whatever the split points.
        #[test]
        fn proptest_split_covers_span(splits in prop::collection::btree_set(0i64..100, 0..8)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async move {
                let splits = splits.into_iter().map(|h| record_key(TABLE, h)).collect();
                let (store, _) = seeded(splits, 0..100);
                let start = record_key(TABLE, 10);
                let end = record_key(TABLE, 90);
                let ranges = split_ranges(&store, start.clone(), end.clone(), 1024).await.unwrap();

                prop_assert_eq!(&ranges.first().unwrap().start_key, &start);
                prop_assert_eq!(&ranges.last().unwrap().end_key, &end);
                for pair in ranges.windows(2) {
                    prop_assert_eq!(&pair[0].end_key, &pair[1].start_key);
                    prop_assert!(pair[0].start_key < pair[0].end_key);
                }
                Ok(())
            })?;
        }
    }
}
