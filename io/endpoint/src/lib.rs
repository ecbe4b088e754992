//! io-endpoint - POSIX stream-socket endpoint for an event-driven RPC runtime.
//!
//! This crate moves bytes across a connected stream socket with high
//! throughput and low tail latency. It sits between an edge-triggered I/O
//! readiness poller (below, consumed through the [`poller::EventHandle`]
//! seam) and an RPC framer (above, driving [`PosixEndpoint`]).
//!
//! # Features
//!
//! - **Edge-triggered read/write loops**: drains until EAGAIN, re-arms only
//!   when an edge was consumed
//! - **Adaptive buffering**: receive-buffer sizing follows observed
//!   throughput; `SO_RCVLOWAT` keeps wakeups aligned with frame boundaries
//! - **Zero-copy sends**: `MSG_ZEROCOPY` above a payload threshold, with
//!   completion reconciliation off the socket error queue and copy fallback
//! - **Write timestamps**: per-send kernel timings (scheduled/sent/acked)
//!   with `OPT_STATS` connection metrics delivered to caller sinks
//! - **Memory-pressure aware**: read buffers are charged to a quota and
//!   reclaimable under pressure

pub mod config;
pub mod endpoint;
pub mod error;
pub mod errqueue;
pub mod estimator;
pub mod iovec;
pub mod memory;
pub mod poller;
pub mod slice_buffer;
pub mod stats;
pub mod telemetry;
pub mod traced_buffer;
#[cfg(target_os = "linux")]
pub mod ulimit;
pub mod zerocopy;

// Public API re-exports
pub use config::{EndpointOptions, Features};
pub use endpoint::{
    PosixEndpoint, ReadArgs, ReadCallback, ReleaseFdCallback, WriteArgs, WriteCallback,
};
pub use error::{EndpointError, TransportStatus};
pub use memory::{MemoryQuota, ReclamationPass};
pub use poller::{EventHandle, Executor, OsInterface, PollerCallback, PosixInterface, SysError};
pub use slice_buffer::SliceBuffer;
pub use telemetry::{TelemetryInfo, WriteEvent, WriteEventSink};
