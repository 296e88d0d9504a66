//! Snapshot iteration over a prefix-bounded key span, feeding one callback
//! per row and skipping residual versions that belong to a row already
//! delivered.

use std::sync::Arc;

use common::keys::{
    decode_record_handle,
    is_record_prefix,
    Handle,
    Key,
};
use kv::{
    KvIter,
    SnapshotOptions,
    Store,
    Version,
};

/// Iterate the snapshot at `version` forward from `start` (or from `prefix`
/// when `start` is empty) up to but not including `end.prefix_next()` (or
/// `prefix.prefix_next()` when `end` is empty), invoking `f(handle, key,
/// value)` once per row.
///
/// `handle` is decoded when `prefix` denotes a record-key space, `None`
/// otherwise. `f` returning `Ok(false)` stops cleanly; after each delivered
/// row the iterator advances past every key sharing the row's key as a
/// prefix. Iteration also stops at the first key outside `prefix` and treats
/// iterator exhaustion as a clean end.
pub fn iterate_snapshot<F>(
    store: &Arc<dyn Store>,
    version: Version,
    prefix: &Key,
    start: &Key,
    end: &Key,
    opts: SnapshotOptions,
    mut f: F,
) -> anyhow::Result<()>
where
    F: FnMut(Option<Handle>, &Key, &[u8]) -> anyhow::Result<bool>,
{
    let lower = if start.is_empty() {
        prefix.clone()
    } else {
        start.clone()
    };
    let upper = if end.is_empty() {
        prefix.prefix_next()
    } else {
        end.prefix_next()
    };
    let record_space = is_record_prefix(prefix);

    let snapshot = store.snapshot(version, opts)?;
    let mut iter = snapshot.iter(lower, upper)?;
    while iter.valid() {
        let key = iter.key().clone();
        if !key.has_prefix(prefix) {
            break;
        }
        let handle = if record_space {
            decode_record_handle(prefix, &key)
        } else {
            None
        };
        if !f(handle, &key, iter.value())? {
            break;
        }
        next_until(iter.as_mut(), &key.prefix_next())?;
    }
    Ok(())
}

/// Advance the iterator to the first key at or past `bound`.
pub fn next_until(iter: &mut dyn KvIter, bound: &Key) -> anyhow::Result<()> {
    while iter.valid() && iter.key() < bound {
        iter.next()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        keys::{
            record_key,
            record_prefix,
            Key,
        },
        types::TableId,
    };
    use kv::{
        memory::MemoryStore,
        SnapshotOptions,
        Store,
        MAX_VERSION,
    };

    use super::iterate_snapshot;

    const TABLE: TableId = TableId(1);

    #[test]
    fn test_rows_delivered_once_with_handles() {
        let memory = MemoryStore::new();
        memory.load((0..5).map(|h| (record_key(TABLE, h), vec![h as u8])));
        // Residual versions under row 2's key must be skipped, and keys of
        // another table must never be delivered.
        memory.load([
            (record_key(TABLE, 2).next(), b"residual".to_vec()),
            (record_key(TableId(2), 0), b"other".to_vec()),
        ]);
        let store: Arc<dyn Store> = Arc::new(memory);

        let prefix = record_prefix(TABLE);
        let mut seen = Vec::new();
        iterate_snapshot(
            &store,
            MAX_VERSION,
            &prefix,
            &Key::empty(),
            &Key::empty(),
            SnapshotOptions::default(),
            |handle, _key, value| {
                seen.push((handle, value.to_vec()));
                Ok(true)
            },
        )
        .unwrap();

        let handles: Vec<_> = seen.iter().map(|(h, _)| h.unwrap()).collect();
        assert_eq!(handles, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_callback_false_stops_and_start_bounds() {
        let memory = MemoryStore::new();
        memory.load((0..10).map(|h| (record_key(TABLE, h), vec![h as u8])));
        let store: Arc<dyn Store> = Arc::new(memory);

        let prefix = record_prefix(TABLE);
        let mut seen = Vec::new();
        iterate_snapshot(
            &store,
            MAX_VERSION,
            &prefix,
            &record_key(TABLE, 4),
            &Key::empty(),
            SnapshotOptions::default(),
            |handle, _key, _value| {
                seen.push(handle.unwrap());
                Ok(seen.len() < 3)
            },
        )
        .unwrap();
        assert_eq!(seen, vec![4, 5, 6]);
    }
}
