use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

/// Ordering key of a queued input. Smaller keys are popped first.
///
/// The tuple compares coverage contribution descending, then size ascending,
/// then execution count ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriorityKey {
    pub coverage_contribution: Reverse<u64>,
    pub size: usize,
    pub execution_count: u64,
}

impl PriorityKey {
    pub fn new(coverage_contribution: u64, size: usize, execution_count: u64) -> Self {
        Self {
            coverage_contribution: Reverse(coverage_contribution),
            size,
            execution_count,
        }
    }
}

/// A queued reference to a corpus entry. Holds the content hash only, never
/// the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub input_hash: String,
    pub size: usize,
    pub coverage_contribution: u64,
    pub execution_count: u64,
}

impl QueueEntry {
    pub fn priority(&self) -> PriorityKey {
        PriorityKey::new(self.coverage_contribution, self.size, self.execution_count)
    }
}

/// Component-wise mean of the queued priority keys.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AveragePriority {
    pub coverage_contribution: f64,
    pub size: f64,
    pub execution_count: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueStats {
    pub queue_depth: usize,
    pub min_priority: Option<PriorityKey>,
    pub max_priority: Option<PriorityKey>,
    pub avg_priority: Option<AveragePriority>,
}

/// Priority work-list of corpus hashes.
///
/// Favors inputs that contributed the most coverage, then smaller inputs,
/// then inputs that have been executed the least. The ordered set plus the
/// hash index makes `update_priority` a remove/re-insert instead of a full
/// re-heapify.
#[derive(Debug, Default)]
pub struct QueueScheduler {
    ordered: BTreeSet<(PriorityKey, String)>,
    entries: HashMap<String, QueueEntry>,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `input_hash`. Returns `false` and leaves the queue untouched if
    /// the hash is already queued.
    pub fn add_input(
        &mut self,
        input_hash: &str,
        size: usize,
        coverage_contribution: u64,
        execution_count: u64,
    ) -> bool {
        if self.entries.contains_key(input_hash) {
            return false;
        }
        let entry = QueueEntry {
            input_hash: input_hash.to_string(),
            size,
            coverage_contribution,
            execution_count,
        };
        self.ordered.insert((entry.priority(), entry.input_hash.clone()));
        self.entries.insert(entry.input_hash.clone(), entry);
        true
    }

    /// Removes and returns the highest-priority hash, or `None` when empty.
    pub fn get_next(&mut self) -> Option<String> {
        let (_key, hash) = self.ordered.pop_first()?;
        self.entries.remove(&hash);
        Some(hash)
    }

    pub fn peek_next(&self) -> Option<&str> {
        self.ordered.first().map(|(_key, hash)| hash.as_str())
    }

    /// Re-keys a queued entry with a new execution count. Unknown hashes are
    /// ignored and reported with `false`.
    pub fn update_priority(&mut self, input_hash: &str, execution_count: u64) -> bool {
        let Some(entry) = self.entries.get_mut(input_hash) else {
            return false;
        };
        self.ordered
            .remove(&(entry.priority(), entry.input_hash.clone()));
        entry.execution_count = execution_count;
        self.ordered
            .insert((entry.priority(), entry.input_hash.clone()));
        true
    }

    pub fn contains(&self, input_hash: &str) -> bool {
        self.entries.contains_key(input_hash)
    }

    pub fn get(&self, input_hash: &str) -> Option<&QueueEntry> {
        self.entries.get(input_hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.entries.clear();
    }

    pub fn get_stats(&self) -> QueueStats {
        let queue_depth = self.entries.len();
        if queue_depth == 0 {
            return QueueStats::default();
        }
        let n = queue_depth as f64;
        let (coverage, size, execs) = self.entries.values().fold(
            (0f64, 0f64, 0f64),
            |(coverage, size, execs), entry| {
                (
                    coverage + entry.coverage_contribution as f64,
                    size + entry.size as f64,
                    execs + entry.execution_count as f64,
                )
            },
        );
        QueueStats {
            queue_depth,
            min_priority: self.ordered.first().map(|(key, _)| *key),
            max_priority: self.ordered.last().map(|(key, _)| *key),
            avg_priority: Some(AveragePriority {
                coverage_contribution: coverage / n,
                size: size / n,
                execution_count: execs / n,
            }),
        }
    }
}
