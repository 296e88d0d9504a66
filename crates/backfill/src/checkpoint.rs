//! Collapses out-of-order task completions into the single monotone resume
//! key that is safe to persist.
//!
//! Tasks are numbered sequentially within a dispatch round, and task `i + 1`
//! scans keys strictly after task `i`, so the resume key may only advance to
//! a task's next key once every smaller-numbered task has succeeded. Early
//! completions are parked until the gap before them closes.

use std::collections::BTreeMap;

use common::keys::Key;

pub struct TaskCheckpoint {
    /// Lowest task id not yet observed.
    current: usize,
    next_key: Key,
    queued: BTreeMap<usize, Key>,
}

impl TaskCheckpoint {
    pub fn new(start_key: Key) -> Self {
        Self {
            current: 0,
            next_key: start_key,
            queued: BTreeMap::new(),
        }
    }

    /// Record task `id` completing with resume key `next`.
    pub fn update(&mut self, id: usize, next: Key) {
        if id != self.current {
            self.queued.insert(id, next);
            return;
        }
        self.next_key = next;
        self.current += 1;
        while let Some(next) = self.queued.remove(&self.current) {
            self.next_key = next;
            self.current += 1;
        }
    }

    /// The resume key covering exactly the longest prefix of completed
    /// tasks. Safe to persist once the round's results are all in.
    pub fn next_key(&self) -> &Key {
        &self.next_key
    }

    /// How many consecutive tasks from id 0 have completed.
    pub fn completed_prefix(&self) -> usize {
        self.current
    }
}
