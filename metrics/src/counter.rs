//! Sharded counter storage.
//!
//! A [`CounterGroup`] holds 64 shards of 16 slots each. Threads are assigned
//! a shard round-robin on first use, so concurrent increments from different
//! threads land on different cache lines.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Number of counter slots per group.
pub const SLOTS_PER_GROUP: usize = 16;

/// Number of shards per group. Must be a power of two.
const SHARDS: usize = 64;

/// One shard: 16 slots × 8 bytes = 128 bytes, aligned so two shards never
/// share a cache line.
#[repr(align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS_PER_GROUP],
}

/// Sharded storage for up to [`SLOTS_PER_GROUP`] counters.
///
/// The group is just storage; create [`Counter`]s referencing its slots.
pub struct CounterGroup {
    shards: [Shard; SHARDS],
}

impl CounterGroup {
    /// Create a new group with all slots zeroed. Usable in `static` context.
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        #[allow(clippy::declare_interior_mutable_const)]
        const SHARD: Shard = Shard {
            slots: [ZERO; SLOTS_PER_GROUP],
        };
        Self {
            shards: [SHARD; SHARDS],
        }
    }

    /// Sum a slot across all shards.
    fn sum(&self, slot: usize) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

/// Shard index for the current thread, assigned round-robin on first use.
#[inline]
fn shard_index() -> usize {
    thread_local! {
        static SHARD_ID: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARDS;
    }
    SHARD_ID.with(|id| *id)
}

/// A counter referencing one slot of a [`CounterGroup`].
///
/// Implements [`metriken::Metric`] so it can be registered with the
/// `#[metric]` attribute.
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    /// Create a counter for `slot` of `group`.
    ///
    /// Panics at compile time if `slot` is out of range.
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        assert!(slot < SLOTS_PER_GROUP);
        Self { group, slot }
    }

    /// Increment by one.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Increment by `n`.
    #[inline]
    pub fn add(&self, n: u64) {
        self.group.shards[shard_index()].slots[self.slot].fetch_add(n, Ordering::Relaxed);
    }

    /// Current value: the sum across all shards.
    pub fn value(&self) -> u64 {
        self.group.sum(self.slot)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}
