use std::sync::Arc;
use std::sync::OnceLock;

use crate::memory::MemoryQuota;

/// Configuration for a stream endpoint.
///
/// Built from an already-connected socket's options; the resource quota is
/// required, everything else has sensible defaults.
#[derive(Clone)]
pub struct EndpointOptions {
    /// Memory quota that read-buffer allocations are charged against.
    pub resource_quota: Arc<MemoryQuota>,
    /// Initial target read size in bytes. The adaptive sizer moves the target
    /// from here based on observed throughput.
    pub tcp_read_chunk_size: usize,
    /// Lower clamp for the adaptive target read size.
    pub tcp_min_read_chunk_size: usize,
    /// Upper clamp for the adaptive target read size.
    pub tcp_max_read_chunk_size: usize,
    /// Whether to attempt kernel zero-copy transmission (`MSG_ZEROCOPY`).
    /// Requires an error-tracking poller and a successful `SO_ZEROCOPY`
    /// negotiation at construction.
    pub tcp_tx_zero_copy_enabled: bool,
    /// Ceiling on concurrent zero-copy sends. Each in-flight send holds one
    /// record until the kernel acknowledges it on the error queue.
    pub tcp_tx_zerocopy_max_simultaneous_sends: usize,
    /// Writes at or below this many bytes always take the copy path; the
    /// page-pinning overhead of zero-copy only pays off above it.
    pub tcp_tx_zerocopy_send_bytes_threshold: usize,
    /// Feature flags. Defaults to the process-wide flags read once at
    /// startup; override for tests.
    pub features: Features,
}

impl EndpointOptions {
    /// Options with defaults, charging allocations to `resource_quota`.
    pub fn new(resource_quota: Arc<MemoryQuota>) -> Self {
        Self {
            resource_quota,
            tcp_read_chunk_size: 8192,
            tcp_min_read_chunk_size: 256,
            tcp_max_read_chunk_size: 4 * 1024 * 1024,
            tcp_tx_zero_copy_enabled: false,
            tcp_tx_zerocopy_max_simultaneous_sends: 4,
            tcp_tx_zerocopy_send_bytes_threshold: 16 * 1024,
            features: *Features::from_env(),
        }
    }
}

/// Process-wide feature flags, read once at startup.
///
/// The environment variables `IO_ENDPOINT_FRAME_SIZE_TUNING` and
/// `IO_ENDPOINT_RCVLOWAT` enable the corresponding tuning when set to `1` or
/// `true`. Values are cached on first read and never re-read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Align read completions with frame boundaries: reads only complete once
    /// `read_hint_bytes` have accumulated, staging partial data across edges.
    pub frame_size_tuning: bool,
    /// Adaptively set `SO_RCVLOWAT` so the kernel withholds readable wakeups
    /// until enough bytes are buffered.
    pub rcvlowat_tuning: bool,
}

impl Features {
    /// The process-wide flags, computed once from the environment.
    pub fn from_env() -> &'static Features {
        static FEATURES: OnceLock<Features> = OnceLock::new();
        FEATURES.get_or_init(|| Features {
            frame_size_tuning: env_flag("IO_ENDPOINT_FRAME_SIZE_TUNING"),
            rcvlowat_tuning: env_flag("IO_ENDPOINT_RCVLOWAT"),
        })
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    )
}
