//! High-performance sharded metrics with metriken integration.
//!
//! This crate provides [`Counter`] and [`CounterGroup`] for high-throughput
//! metrics that avoid cache-line contention by using per-thread shards.
//!
//! # Overview
//!
//! A [`CounterGroup`] provides sharded storage for up to 16 counters.
//! Each thread writes to its own shard (selected by thread ID), so
//! counters in the same group don't cause false sharing.
//!
//! A [`Counter`] references a slot in a group and implements [`metriken::Metric`],
//! allowing it to be registered with the `#[metric]` attribute for Prometheus
//! exposition.
//!
//! # Example
//!
//! ```
//! use metrics::{Counter, CounterGroup};
//!
//! // Define named slot constants for clarity
//! mod slots {
//!     pub const SYSCALL_READ: usize = 0;
//!     pub const SYSCALL_WRITE: usize = 1;
//!     pub const READ_ALLOC_8K: usize = 2;
//!     pub const READ_ALLOC_64K: usize = 3;
//! }
//!
//! // Create counter groups (just storage)
//! static SYSCALL: CounterGroup = CounterGroup::new();
//! static ALLOC: CounterGroup = CounterGroup::new();
//!
//! // Create counters referencing group slots
//! static SYSCALL_READ: Counter = Counter::new(&SYSCALL, slots::SYSCALL_READ);
//! static SYSCALL_WRITE: Counter = Counter::new(&SYSCALL, slots::SYSCALL_WRITE);
//! static READ_ALLOC_8K: Counter = Counter::new(&ALLOC, slots::READ_ALLOC_8K);
//! static READ_ALLOC_64K: Counter = Counter::new(&ALLOC, slots::READ_ALLOC_64K);
//!
//! // Use in hot path
//! SYSCALL_READ.increment();
//! READ_ALLOC_64K.add(1);
//! ```
//!
//! # Memory Layout
//!
//! Each `CounterGroup` uses 8KB (64 shards × 128 bytes per shard). Each shard
//! holds 16 counter slots. This means:
//!
//! - One counter effectively uses ~512 bytes (8KB / 16)
//! - 5 groups with 16 counters each = 40KB total
//!
//! Compare to a naive sharded counter that uses 8KB per counter.

mod counter;

pub use counter::{Counter, CounterGroup};

// Re-export metriken for convenience
pub use metriken;
