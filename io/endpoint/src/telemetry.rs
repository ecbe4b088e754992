//! Write telemetry: per-send event sinks and the write-metric catalog.
//!
//! A caller that wants kernel timing for a write passes a [`WriteEventSink`]
//! in its write args. The endpoint forwards Scheduled/Sent/Acked events from
//! the socket error queue to the sink, attaching the connection metrics the
//! sink registered interest in.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stages of a send's life reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEvent {
    /// Passed to the NIC queueing discipline.
    Scheduled,
    /// Left the host.
    Sent,
    /// Acknowledged by the peer.
    Acked,
    /// No further events will be delivered for this sink.
    Closed,
}

/// A kernel or wall-clock instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventTime {
    pub secs: i64,
    pub nanos: u32,
}

impl EventTime {
    pub fn from_timespec(ts: &libc::timespec) -> Self {
        Self {
            secs: ts.tv_sec as i64,
            nanos: ts.tv_nsec as u32,
        }
    }

    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: elapsed.as_secs() as i64,
            nanos: elapsed.subsec_nanos(),
        }
    }
}

/// Write-metric catalog. Key order is the public contract; names never
/// change meaning at a given key.
pub const WRITE_METRIC_NAMES: &[&str] = &[
    "busy_usec",
    "rwnd_limited_usec",
    "sndbuf_limited_usec",
    "packet_sent",
    "packet_retx",
    "packet_delivered",
    "packet_delivered_ce",
    "bytes_sent",
    "bytes_retrans",
    "dsack_dups",
    "reord_seen",
    "pacing_rate",
    "delivery_rate",
    "delivery_rate_app_limited",
    "congestion_window",
    "snd_ssthresh",
    "reordering",
    "min_rtt",
    "srtt",
    "recurring_retrans",
    "sndq_size",
    "ca_state",
];

/// Metric keys, indexes into [`WRITE_METRIC_NAMES`].
pub mod keys {
    pub const BUSY_USEC: usize = 0;
    pub const RWND_LIMITED_USEC: usize = 1;
    pub const SNDBUF_LIMITED_USEC: usize = 2;
    pub const PACKET_SENT: usize = 3;
    pub const PACKET_RETX: usize = 4;
    pub const PACKET_DELIVERED: usize = 5;
    pub const PACKET_DELIVERED_CE: usize = 6;
    pub const BYTES_SENT: usize = 7;
    pub const BYTES_RETRANS: usize = 8;
    pub const DSACK_DUPS: usize = 9;
    pub const REORD_SEEN: usize = 10;
    pub const PACING_RATE: usize = 11;
    pub const DELIVERY_RATE: usize = 12;
    pub const DELIVERY_RATE_APP_LIMITED: usize = 13;
    pub const CONGESTION_WINDOW: usize = 14;
    pub const SND_SSTHRESH: usize = 15;
    pub const REORDERING: usize = 16;
    pub const MIN_RTT: usize = 17;
    pub const SRTT: usize = 18;
    pub const RECURRING_RETRANS: usize = 19;
    pub const SNDQ_SIZE: usize = 20;
    pub const CA_STATE: usize = 21;
}

/// Connection metrics extracted from a `SCM_TIMESTAMPING_OPT_STATS` message.
/// Fields the kernel did not report stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnMetrics {
    pub busy_usec: Option<u64>,
    pub rwnd_limited_usec: Option<u64>,
    pub sndbuf_limited_usec: Option<u64>,
    pub packet_sent: Option<u64>,
    pub packet_retx: Option<u64>,
    pub packet_delivered: Option<u64>,
    pub packet_delivered_ce: Option<u64>,
    pub bytes_sent: Option<u64>,
    pub bytes_retrans: Option<u64>,
    pub dsack_dups: Option<u64>,
    pub reord_seen: Option<u64>,
    pub pacing_rate: Option<u64>,
    pub delivery_rate: Option<u64>,
    pub delivery_rate_app_limited: Option<u64>,
    pub congestion_window: Option<u64>,
    pub snd_ssthresh: Option<u64>,
    pub reordering: Option<u64>,
    pub min_rtt: Option<u64>,
    pub srtt: Option<u64>,
    pub recurring_retrans: Option<u64>,
    pub sndq_size: Option<u64>,
    pub ca_state: Option<u64>,
}

impl ConnMetrics {
    fn get(&self, key: usize) -> Option<u64> {
        match key {
            keys::BUSY_USEC => self.busy_usec,
            keys::RWND_LIMITED_USEC => self.rwnd_limited_usec,
            keys::SNDBUF_LIMITED_USEC => self.sndbuf_limited_usec,
            keys::PACKET_SENT => self.packet_sent,
            keys::PACKET_RETX => self.packet_retx,
            keys::PACKET_DELIVERED => self.packet_delivered,
            keys::PACKET_DELIVERED_CE => self.packet_delivered_ce,
            keys::BYTES_SENT => self.bytes_sent,
            keys::BYTES_RETRANS => self.bytes_retrans,
            keys::DSACK_DUPS => self.dsack_dups,
            keys::REORD_SEEN => self.reord_seen,
            keys::PACING_RATE => self.pacing_rate,
            keys::DELIVERY_RATE => self.delivery_rate,
            keys::DELIVERY_RATE_APP_LIMITED => self.delivery_rate_app_limited,
            keys::CONGESTION_WINDOW => self.congestion_window,
            keys::SND_SSTHRESH => self.snd_ssthresh,
            keys::REORDERING => self.reordering,
            keys::MIN_RTT => self.min_rtt,
            keys::SRTT => self.srtt,
            keys::RECURRING_RETRANS => self.recurring_retrans,
            keys::SNDQ_SIZE => self.sndq_size,
            keys::CA_STATE => self.ca_state,
            _ => None,
        }
    }

    /// Collect the reported values for the keys in `set`, in key order.
    pub fn collect(&self, set: &MetricsSet) -> Vec<(usize, u64)> {
        set.keys()
            .iter()
            .filter_map(|&key| self.get(key).map(|v| (key, v)))
            .collect()
    }
}

/// A sparse, immutable set of metric keys a sink is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSet {
    keys: Vec<usize>,
}

impl MetricsSet {
    fn new(mut keys: Vec<usize>) -> Self {
        keys.retain(|&k| k < WRITE_METRIC_NAMES.len());
        keys.sort_unstable();
        keys.dedup();
        Self { keys }
    }

    /// The keys in this set, sorted.
    pub fn keys(&self) -> &[usize] {
        &self.keys
    }

    /// True if `key` is in the set.
    pub fn contains(&self, key: usize) -> bool {
        self.keys.binary_search(&key).is_ok()
    }
}

/// Immutable catalog of write metrics and factory for sparse sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryInfo;

impl TelemetryInfo {
    /// All metric keys.
    pub fn all_write_metrics(&self) -> Vec<usize> {
        (0..WRITE_METRIC_NAMES.len()).collect()
    }

    /// Name for a key.
    pub fn metric_name(&self, key: usize) -> Option<&'static str> {
        WRITE_METRIC_NAMES.get(key).copied()
    }

    /// Key for a name.
    pub fn metric_key(&self, name: &str) -> Option<usize> {
        WRITE_METRIC_NAMES.iter().position(|&n| n == name)
    }

    /// Build a sparse set from `keys`. Unknown keys are dropped.
    pub fn metrics_set(&self, keys: &[usize]) -> Arc<MetricsSet> {
        Arc::new(MetricsSet::new(keys.to_vec()))
    }

    /// A set containing every metric.
    pub fn full_metrics_set(&self) -> Arc<MetricsSet> {
        Arc::new(MetricsSet::new(self.all_write_metrics()))
    }
}

/// Receives write events, with the metric values the sink asked for.
pub struct WriteEventSink {
    interest: Arc<MetricsSet>,
    cb: Box<dyn FnMut(WriteEvent, EventTime, &[(usize, u64)]) + Send>,
}

impl WriteEventSink {
    /// A sink interested in the metrics of `interest`.
    pub fn new(
        interest: Arc<MetricsSet>,
        cb: impl FnMut(WriteEvent, EventTime, &[(usize, u64)]) + Send + 'static,
    ) -> Self {
        Self {
            interest,
            cb: Box::new(cb),
        }
    }

    /// Deliver one event.
    pub(crate) fn record(&mut self, event: WriteEvent, time: EventTime, metrics: Option<&ConnMetrics>) {
        let values = metrics
            .map(|m| m.collect(&self.interest))
            .unwrap_or_default();
        (self.cb)(event, time, &values);
    }
}

impl std::fmt::Debug for WriteEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteEventSink")
            .field("interest", &self.interest)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_round_trip() {
        let info = TelemetryInfo;
        for key in info.all_write_metrics() {
            let name = info.metric_name(key).unwrap();
            assert_eq!(info.metric_key(name), Some(key));
        }
        assert_eq!(info.metric_name(WRITE_METRIC_NAMES.len()), None);
        assert_eq!(info.metric_key("no_such_metric"), None);
    }

    #[test]
    fn test_metrics_set_drops_unknown_keys() {
        let info = TelemetryInfo;
        let set = info.metrics_set(&[keys::SRTT, 9999, keys::SRTT, keys::BUSY_USEC]);
        assert_eq!(set.keys(), &[keys::BUSY_USEC, keys::SRTT]);
        assert!(set.contains(keys::SRTT));
        assert!(!set.contains(keys::MIN_RTT));
    }

    #[test]
    fn test_collect_sparse_values() {
        let info = TelemetryInfo;
        let set = info.metrics_set(&[keys::MIN_RTT, keys::DELIVERY_RATE]);
        let metrics = ConnMetrics {
            min_rtt: Some(1200),
            srtt: Some(1500),
            ..Default::default()
        };
        // delivery_rate was not reported; only min_rtt comes back.
        assert_eq!(metrics.collect(&set), vec![(keys::MIN_RTT, 1200)]);
    }

    #[test]
    fn test_sink_filters_by_interest() {
        let info = TelemetryInfo;
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = std::sync::Arc::clone(&seen);
        let mut sink = WriteEventSink::new(
            info.metrics_set(&[keys::SRTT]),
            move |event, _time, values| {
                seen2.lock().push((event, values.to_vec()));
            },
        );
        let metrics = ConnMetrics {
            srtt: Some(42),
            min_rtt: Some(7),
            ..Default::default()
        };
        sink.record(WriteEvent::Acked, EventTime::default(), Some(&metrics));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, WriteEvent::Acked);
        assert_eq!(seen[0].1, vec![(keys::SRTT, 42)]);
    }
}
