//! Pending sends awaiting kernel timestamps.
//!
//! An entry is registered *before* its sendmsg is issued, so a timestamp
//! arriving on the error queue can never race ahead of the registration.
//! Entries are keyed by the zero-based offset of the send's last byte in the
//! socket's OPT_ID space; the kernel reports the acknowledged watermark in
//! `ee_data`.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::errqueue::{
    SCM_TSTAMP_ACK, SCM_TSTAMP_SCHED, SCM_TSTAMP_SND, ScmTimestamping, SockExtendedErr,
};
use crate::telemetry::{ConnMetrics, EventTime, WriteEvent, WriteEventSink};

struct TracedBuffer {
    seq_no: u32,
    sink: WriteEventSink,
}

/// Ordered queue of sends whose timestamps have not fully arrived.
#[derive(Default)]
pub struct TracedBufferList {
    entries: Mutex<VecDeque<TracedBuffer>>,
}

impl TracedBufferList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a send ending at byte offset `seq_no`. Must happen before
    /// the corresponding sendmsg.
    pub fn add_new_entry(&self, seq_no: u32, sink: WriteEventSink) {
        self.entries.lock().push_back(TracedBuffer { seq_no, sink });
    }

    /// Dispatch one timestamp control message.
    ///
    /// Every entry at or below the reported watermark receives the event;
    /// an acknowledgement also retires the entry.
    pub fn process_timestamp(
        &self,
        serr: &SockExtendedErr,
        opt_stats: Option<&ConnMetrics>,
        tss: &ScmTimestamping,
    ) {
        let event = match serr.ee_info {
            SCM_TSTAMP_SCHED => WriteEvent::Scheduled,
            SCM_TSTAMP_SND => WriteEvent::Sent,
            SCM_TSTAMP_ACK => WriteEvent::Acked,
            _ => return,
        };
        let time = EventTime::from_timespec(&tss.ts[0]);
        let mut entries = self.entries.lock();
        match event {
            WriteEvent::Acked => {
                while entries
                    .front()
                    .is_some_and(|entry| entry.seq_no <= serr.ee_data)
                {
                    let mut entry = entries.pop_front().expect("front checked");
                    entry.sink.record(WriteEvent::Acked, time, opt_stats);
                }
            }
            event => {
                for entry in entries.iter_mut() {
                    if entry.seq_no > serr.ee_data {
                        break;
                    }
                    entry.sink.record(event, time, opt_stats);
                }
            }
        }
    }

    /// Deliver a terminal event to every pending entry, plus `remaining` (a
    /// sink that was installed but whose send never went out).
    pub fn shutdown(&self, remaining: Option<WriteEventSink>) {
        let time = EventTime::now();
        let drained: VecDeque<TracedBuffer> = std::mem::take(&mut *self.entries.lock());
        for mut entry in drained {
            entry.sink.record(WriteEvent::Closed, time, None);
        }
        if let Some(mut sink) = remaining {
            sink.record(WriteEvent::Closed, time, None);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
