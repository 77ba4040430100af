//! Short-term task context cache with LRU eviction and TTL expiry.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::{DateTime, Utc};
use context_primitives::TaskId;
use tracing::debug;

use crate::clock::age;
use crate::record::TaskContext;

/// Configuration for the short-term store.
#[derive(Debug, Clone, Copy)]
pub struct ShortTermConfig {
    capacity: NonZeroUsize,
    ttl: Duration,
}

impl ShortTermConfig {
    /// Creates a configuration with the provided capacity and TTL.
    #[must_use]
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self { capacity, ttl }
    }

    /// Returns the configured capacity.
    #[must_use]
    pub const fn capacity(self) -> NonZeroUsize {
        self.capacity
    }

    /// Returns the configured TTL.
    #[must_use]
    pub const fn ttl(self) -> Duration {
        self.ttl
    }
}

impl Default for ShortTermConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(100).expect("non-zero"),
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug)]
struct Slot {
    context: TaskContext,
    stamp: u64,
}

/// Recency-ordered cache of task contexts.
///
/// `stamp` is a monotonically increasing recency counter; `order` maps stamps
/// back to task ids so the least-recently-used entry is always `order`'s first key.
#[derive(Debug)]
pub struct ShortTermStore {
    config: ShortTermConfig,
    slots: HashMap<TaskId, Slot>,
    order: BTreeMap<u64, TaskId>,
    next_stamp: u64,
}

impl ShortTermStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: ShortTermConfig) -> Self {
        Self {
            config,
            slots: HashMap::with_capacity(config.capacity().get()),
            order: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> ShortTermConfig {
        self.config
    }

    /// Inserts or replaces a context and marks it most recently used.
    ///
    /// Returns the contexts evicted to stay within capacity.
    pub fn store(&mut self, context: TaskContext) -> Vec<TaskContext> {
        let task_id = context.task_id().clone();
        let stamp = self.bump();
        if let Some(previous) = self.slots.insert(task_id.clone(), Slot { context, stamp }) {
            self.order.remove(&previous.stamp);
        }
        self.order.insert(stamp, task_id);

        let mut evicted = Vec::new();
        while self.slots.len() > self.config.capacity().get() {
            let Some((_, lru)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&lru) {
                debug!(task_id = %lru, "evicted least-recently-used task context");
                evicted.push(slot.context);
            }
        }
        evicted
    }

    /// Returns a context and marks it most recently used.
    pub fn get(&mut self, task_id: &TaskId) -> Option<TaskContext> {
        let stamp = self.bump();
        let slot = self.slots.get_mut(task_id)?;
        self.order.remove(&slot.stamp);
        slot.stamp = stamp;
        self.order.insert(stamp, task_id.clone());
        Some(slot.context.clone())
    }

    /// Returns a context without touching recency.
    #[must_use]
    pub fn peek(&self, task_id: &TaskId) -> Option<&TaskContext> {
        self.slots.get(task_id).map(|slot| &slot.context)
    }

    /// Returns whether `task_id` is cached.
    #[must_use]
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.slots.contains_key(task_id)
    }

    /// Returns up to `limit` contexts, most recently used first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<TaskContext> {
        self.iter_recent().take(limit).cloned().collect()
    }

    /// Iterates contexts from most to least recently used.
    pub fn iter_recent(&self) -> impl Iterator<Item = &TaskContext> {
        self.order
            .values()
            .rev()
            .filter_map(|task_id| self.slots.get(task_id).map(|slot| &slot.context))
    }

    /// Removes every context whose age since creation exceeds the TTL,
    /// regardless of recency. Returns the number removed.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.ttl();
        let expired: Vec<(TaskId, u64)> = self
            .slots
            .iter()
            .filter(|(_, slot)| age(now, slot.context.created_at()) > ttl)
            .map(|(task_id, slot)| (task_id.clone(), slot.stamp))
            .collect();

        for (task_id, stamp) in &expired {
            self.slots.remove(task_id);
            self.order.remove(stamp);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "expired short-term contexts");
        }
        expired.len()
    }

    /// Keeps only the most recently used `ceil(capacity / 2)` contexts.
    /// Returns the number discarded.
    pub fn compress(&mut self) -> usize {
        let keep = self.config.capacity().get().div_ceil(2);
        let mut removed = 0;
        while self.slots.len() > keep {
            let Some((_, lru)) = self.order.pop_first() else {
                break;
            };
            if self.slots.remove(&lru).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Number of cached contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Fraction of capacity in use, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        (self.slots.len() as f64 / self.config.capacity().get() as f64).clamp(0.0, 1.0)
    }

    fn bump(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn store(capacity: usize) -> ShortTermStore {
        ShortTermStore::new(ShortTermConfig::new(
            NonZeroUsize::new(capacity).unwrap(),
            Duration::from_secs(60),
        ))
    }

    fn context(id: &str, created_at: DateTime<Utc>) -> TaskContext {
        TaskContext::builder(TaskId::new(id).unwrap(), format!("task {id}"))
            .created_at(created_at)
            .build()
    }

    fn id(raw: &str) -> TaskId {
        TaskId::new(raw).unwrap()
    }

    #[test]
    fn overflow_evicts_only_the_oldest() {
        let clock = ManualClock::at_epoch();
        for capacity in 1..=6 {
            let mut memory = store(capacity);
            let mut evicted = Vec::new();
            for n in 0..=capacity {
                evicted.extend(memory.store(context(&format!("t{n}"), clock.now())));
            }
            assert_eq!(memory.len(), capacity);
            assert!(!memory.contains(&id("t0")));
            assert_eq!(evicted.len(), 1);
            assert_eq!(evicted[0].task_id().as_str(), "t0");
            for n in 1..=capacity {
                assert!(memory.contains(&id(&format!("t{n}"))));
            }
        }
    }

    #[test]
    fn read_promotes_entry() {
        let clock = ManualClock::at_epoch();
        let mut memory = store(3);
        for raw in ["t1", "t2", "t3"] {
            memory.store(context(raw, clock.now()));
        }
        assert!(memory.get(&id("t1")).is_some());
        memory.store(context("t4", clock.now()));

        assert!(memory.contains(&id("t1")));
        assert!(!memory.contains(&id("t2")));
        assert!(memory.contains(&id("t3")));
        assert!(memory.contains(&id("t4")));
    }

    #[test]
    fn recent_lists_most_recent_first_without_bumping() {
        let clock = ManualClock::at_epoch();
        let mut memory = store(4);
        for raw in ["a", "b", "c"] {
            memory.store(context(raw, clock.now()));
        }
        memory.get(&id("a"));
        let recent: Vec<_> = memory
            .recent(2)
            .into_iter()
            .map(|c| c.task_id().to_string())
            .collect();
        assert_eq!(recent, ["a", "c"]);
        // Listing does not change recency.
        let again: Vec<_> = memory
            .recent(10)
            .into_iter()
            .map(|c| c.task_id().to_string())
            .collect();
        assert_eq!(again, ["a", "c", "b"]);
    }

    #[test]
    fn replacing_keeps_a_single_entry() {
        let clock = ManualClock::at_epoch();
        let mut memory = store(2);
        memory.store(context("t1", clock.now()));
        memory.store(context("t1", clock.now()));
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.recent(5).len(), 1);
    }

    #[test]
    fn cleanup_removes_only_expired_entries() {
        let clock = ManualClock::at_epoch();
        let mut memory = store(10);
        memory.store(context("old", clock.now()));
        clock.advance(Duration::from_secs(30));
        for n in 0..5 {
            memory.store(context(&format!("young{n}"), clock.now()));
        }
        // Recently read, but created long ago: still expires.
        memory.get(&id("old"));
        clock.advance(Duration::from_secs(31));

        assert_eq!(memory.cleanup_expired(clock.now()), 1);
        assert!(!memory.contains(&id("old")));
        assert_eq!(memory.len(), 5);

        // Exactly at the TTL boundary is not expired.
        clock.advance(Duration::from_secs(29));
        assert_eq!(memory.cleanup_expired(clock.now()), 0);
    }

    #[test]
    fn compress_keeps_the_most_recent_half() {
        let clock = ManualClock::at_epoch();
        for capacity in [1_usize, 2, 5, 8] {
            let mut memory = store(capacity);
            for n in 0..capacity {
                memory.store(context(&format!("t{n}"), clock.now()));
            }
            memory.compress();
            let keep = capacity.div_ceil(2);
            assert_eq!(memory.len(), keep);
            let survivors: Vec<_> = memory
                .recent(capacity)
                .into_iter()
                .map(|c| c.task_id().to_string())
                .collect();
            let expected: Vec<_> = (capacity - keep..capacity)
                .rev()
                .map(|n| format!("t{n}"))
                .collect();
            assert_eq!(survivors, expected);
        }
    }

    #[test]
    fn utilization_stays_in_unit_range() {
        let clock = ManualClock::at_epoch();
        let mut memory = store(2);
        assert!(memory.utilization().abs() < f64::EPSILON);
        for n in 0..5 {
            memory.store(context(&format!("t{n}"), clock.now()));
            assert!((0.0..=1.0).contains(&memory.utilization()));
        }
        assert!((memory.utilization() - 1.0).abs() < f64::EPSILON);
    }
}
