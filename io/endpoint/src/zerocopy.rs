//! Zero-copy send bookkeeping.
//!
//! Each `MSG_ZEROCOPY` send pins the payload pages until the kernel reports
//! completion on the socket error queue, tagged with a per-socket sequence
//! number. A [`ZerocopySendRecord`] owns the payload for one write and its
//! send position; the [`ZerocopySendCtx`] is a bounded pool of records with
//! the sequence-number lookup table and the out-of-pinned-memory state
//! machine.
//!
//! Record lifetime: `prepare_for_sends` gives the caller one reference; every
//! `note_send` adds one for the kernel's pending acknowledgement. A record
//! returns to the pool when the count reaches zero, so exactly one of
//! `undo_send` (failed syscall) or `release_send_record` (error-queue
//! completion) must balance each `note_send`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::iovec::{self, IovPlan, OutOffset};
use crate::slice_buffer::SliceBuffer;

#[derive(Default)]
struct RecordInner {
    buf: SliceBuffer,
    off: OutOffset,
}

/// Payload and send position for one in-flight zero-copy write.
pub struct ZerocopySendRecord {
    idx: usize,
    refs: AtomicUsize,
    inner: Mutex<RecordInner>,
}

impl ZerocopySendRecord {
    fn new(idx: usize) -> Self {
        Self {
            idx,
            refs: AtomicUsize::new(0),
            inner: Mutex::new(RecordInner::default()),
        }
    }

    /// Take ownership of `data`'s slices and reset the send position.
    /// The caller holds the record's first reference.
    pub fn prepare_for_sends(&self, data: &mut SliceBuffer) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.buf.is_empty());
        inner.buf.swap(data);
        inner.off = OutOffset::default();
        self.refs.store(1, Ordering::Release);
    }

    /// Plan the next sendmsg from the current position.
    ///
    /// The returned iovecs point into the record's payload; they stay valid
    /// until the record returns to the pool, which cannot happen while the
    /// caller holds its reference.
    pub fn populate_iovs(&self, iov: &mut [libc::iovec]) -> IovPlan {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        iovec::populate_iovs(&mut inner.buf, &mut inner.off, iov)
    }

    /// Restore the position recorded before a throttled send.
    pub fn unwind_if_throttled(&self, unwind: OutOffset) {
        self.inner.lock().off = unwind;
    }

    /// Walk the position back past the unsent suffix of a short write.
    pub fn update_offset_for_bytes_sent(&self, sending_length: usize, actually_sent: usize) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        iovec::update_offset_for_bytes_sent(&inner.buf, &mut inner.off, sending_length, actually_sent);
    }

    /// True once the position has passed every slice.
    pub fn all_slices_sent(&self) -> bool {
        let inner = self.inner.lock();
        inner.off.slice_idx == inner.buf.count()
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; true when it was the last.
    fn unref(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.buf.clear();
        inner.off = OutOffset::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptMemState {
    Open,
    /// The last send hit ENOBUFS; pinned memory is exhausted.
    Full,
}

struct CtxState {
    free: Vec<usize>,
    by_seq: AHashMap<u32, usize>,
    last_send: u32,
    shutdown: bool,
    mem_state: OptMemState,
}

/// Bounded pool of send records plus kernel-sequence reconciliation.
pub struct ZerocopySendCtx {
    records: Vec<Arc<ZerocopySendRecord>>,
    enabled: bool,
    threshold_bytes: usize,
    state: Mutex<CtxState>,
}

impl ZerocopySendCtx {
    pub fn new(enabled: bool, max_sends: usize, threshold_bytes: usize) -> Self {
        let max_sends = max_sends.max(1);
        let records = (0..max_sends)
            .map(|idx| Arc::new(ZerocopySendRecord::new(idx)))
            .collect::<Vec<_>>();
        Self {
            records,
            enabled,
            threshold_bytes,
            state: Mutex::new(CtxState {
                free: (0..max_sends).rev().collect(),
                by_seq: AHashMap::new(),
                last_send: 0,
                shutdown: false,
                mem_state: OptMemState::Open,
            }),
        }
    }

    /// Whether zero-copy was negotiated at construction.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Payloads at or below this size take the copy path.
    #[inline]
    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// A free record, or `None` at the concurrency ceiling or after shutdown.
    pub fn get_send_record(&self) -> Option<Arc<ZerocopySendRecord>> {
        let mut state = self.state.lock();
        if state.shutdown {
            return None;
        }
        state
            .free
            .pop()
            .map(|idx| Arc::clone(&self.records[idx]))
    }

    /// Register the next kernel sequence number against `record` and take a
    /// reference for the pending acknowledgement. Call before `sendmsg`.
    pub fn note_send(&self, record: &Arc<ZerocopySendRecord>) {
        record.add_ref();
        let mut state = self.state.lock();
        let seq = state.last_send;
        state.last_send = state.last_send.wrapping_add(1);
        state.by_seq.insert(seq, record.idx);
    }

    /// Roll back the most recent `note_send` after a failed syscall.
    pub fn undo_send(&self) {
        let released = {
            let mut state = self.state.lock();
            state.last_send = state.last_send.wrapping_sub(1);
            let seq = state.last_send;
            state.by_seq.remove(&seq)
        };
        if let Some(idx) = released {
            let record = Arc::clone(&self.records[idx]);
            self.unref_maybe_put(&record);
        }
    }

    /// Mark `seq` acknowledged and return the record that owns it. The caller
    /// must balance with [`unref_maybe_put`](Self::unref_maybe_put).
    pub fn release_send_record(&self, seq: u32) -> Option<Arc<ZerocopySendRecord>> {
        let mut state = self.state.lock();
        state
            .by_seq
            .remove(&seq)
            .map(|idx| Arc::clone(&self.records[idx]))
    }

    /// Drop one reference; the record returns to the pool on the last one.
    pub fn unref_maybe_put(&self, record: &Arc<ZerocopySendRecord>) {
        if record.unref() {
            record.reset();
            self.state.lock().free.push(record.idx);
        }
    }

    /// Freeze the pool. Acquires fail from here on; completions continue to
    /// drain until [`all_send_records_empty`](Self::all_send_records_empty).
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
    }

    /// True when every record is back in the pool.
    pub fn all_send_records_empty(&self) -> bool {
        let state = self.state.lock();
        state.free.len() == self.records.len()
    }

    /// Sends awaiting kernel acknowledgement.
    pub fn sends_in_flight(&self) -> usize {
        self.state.lock().by_seq.len()
    }

    /// Record the outcome of a send. Returns `true` (constrained) iff the
    /// send hit ENOBUFS while its own sequence was the only one in flight:
    /// the kernel's pinned-memory limit, not our ceiling, is the bottleneck.
    pub fn update_zero_copy_opt_mem_state_after_send(&self, seen_enobufs: bool) -> bool {
        let mut state = self.state.lock();
        let mut constrained = false;
        if seen_enobufs {
            constrained = state.by_seq.len() == 1;
            state.mem_state = OptMemState::Full;
        }
        constrained
    }

    /// Record a completion. Returns `true` when this transitions the context
    /// out of the ENOBUFS-constrained state; the caller then re-arms the
    /// writable edge.
    pub fn update_zero_copy_opt_mem_state_after_free(&self) -> bool {
        let mut state = self.state.lock();
        if state.mem_state == OptMemState::Full {
            state.mem_state = OptMemState::Open;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> SliceBuffer {
        SliceBuffer::from(vec![0xabu8; len])
    }

    #[test]
    fn test_acquire_up_to_ceiling() {
        let ctx = ZerocopySendCtx::new(true, 2, 1024);
        let a = ctx.get_send_record().unwrap();
        let _b = ctx.get_send_record().unwrap();
        assert!(ctx.get_send_record().is_none());
        // Returning one record frees a slot.
        a.prepare_for_sends(&mut payload(8));
        ctx.unref_maybe_put(&a);
        assert!(ctx.get_send_record().is_some());
    }

    #[test]
    fn test_send_ack_cycle_returns_record_once() {
        let ctx = ZerocopySendCtx::new(true, 1, 0);
        let record = ctx.get_send_record().unwrap();
        record.prepare_for_sends(&mut payload(16));

        ctx.note_send(&record);
        assert_eq!(ctx.sends_in_flight(), 1);

        // Kernel acknowledges seq 0.
        let acked = ctx.release_send_record(0).unwrap();
        ctx.unref_maybe_put(&acked);
        assert!(!ctx.all_send_records_empty());
        assert_eq!(ctx.release_send_record(0).map(|r| r.idx), None);

        // Caller's reference is the last one.
        ctx.unref_maybe_put(&record);
        assert!(ctx.all_send_records_empty());
    }

    #[test]
    fn test_undo_send_balances_note_send() {
        let ctx = ZerocopySendCtx::new(true, 1, 0);
        let record = ctx.get_send_record().unwrap();
        record.prepare_for_sends(&mut payload(16));

        ctx.note_send(&record);
        ctx.undo_send();
        assert_eq!(ctx.sends_in_flight(), 0);

        // The next send reuses the rolled-back sequence number.
        ctx.note_send(&record);
        assert!(ctx.release_send_record(0).is_some());
        ctx.unref_maybe_put(&record); // ack side
        ctx.unref_maybe_put(&record); // caller side
        assert!(ctx.all_send_records_empty());
    }

    #[test]
    fn test_shutdown_refuses_acquires_but_drains() {
        let ctx = ZerocopySendCtx::new(true, 2, 0);
        let record = ctx.get_send_record().unwrap();
        record.prepare_for_sends(&mut payload(16));
        ctx.note_send(&record);

        ctx.shutdown();
        assert!(ctx.get_send_record().is_none());
        assert!(!ctx.all_send_records_empty());

        let acked = ctx.release_send_record(0).unwrap();
        ctx.unref_maybe_put(&acked);
        ctx.unref_maybe_put(&record);
        assert!(ctx.all_send_records_empty());
    }

    #[test]
    fn test_constrained_only_when_sole_send_in_flight() {
        let ctx = ZerocopySendCtx::new(true, 2, 0);
        let first = ctx.get_send_record().unwrap();
        first.prepare_for_sends(&mut payload(16));
        let second = ctx.get_send_record().unwrap();
        second.prepare_for_sends(&mut payload(16));

        // Two sends in flight: ENOBUFS is our own backlog, not the kernel's.
        ctx.note_send(&first);
        ctx.note_send(&second);
        assert!(!ctx.update_zero_copy_opt_mem_state_after_send(true));

        // Drain and retry with one in flight.
        ctx.undo_send();
        assert!(ctx.update_zero_copy_opt_mem_state_after_send(true));
    }

    #[test]
    fn test_after_free_flips_out_of_constrained_once() {
        let ctx = ZerocopySendCtx::new(true, 1, 0);
        let record = ctx.get_send_record().unwrap();
        record.prepare_for_sends(&mut payload(16));
        ctx.note_send(&record);

        assert!(!ctx.update_zero_copy_opt_mem_state_after_free());
        ctx.update_zero_copy_opt_mem_state_after_send(true);
        assert!(ctx.update_zero_copy_opt_mem_state_after_free());
        assert!(!ctx.update_zero_copy_opt_mem_state_after_free());
    }

    #[test]
    fn test_record_send_progress() {
        let ctx = ZerocopySendCtx::new(true, 1, 0);
        let record = ctx.get_send_record().unwrap();
        let mut data = SliceBuffer::new();
        data.append_copy(b"abc");
        data.append_copy(b"defg");
        record.prepare_for_sends(&mut data);
        assert!(data.is_empty());

        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; 4];
        let plan = record.populate_iovs(&mut iov);
        assert_eq!(plan.iov_len, 2);
        assert_eq!(plan.sending_length, 7);

        // Short write of 5 bytes: position lands inside the second slice.
        record.update_offset_for_bytes_sent(7, 5);
        assert!(!record.all_slices_sent());
        let plan = record.populate_iovs(&mut iov);
        assert_eq!(plan.sending_length, 2);
        record.update_offset_for_bytes_sent(2, 2);
        assert!(record.all_slices_sent());
    }
}
