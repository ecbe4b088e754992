//! The stream endpoint core.
//!
//! Owns a connected stream socket for its lifetime and moves bytes between
//! an RPC framer above and an edge-triggered readiness poller below. One
//! read and one write may be in flight at a time; "pending" is encoded by
//! returning `false`, stashing the completion callback, and requesting the
//! next edge from the poller.
//!
//! The edge-triggered contract is the load-bearing invariant: a drain that
//! ends in EAGAIN consumed the edge and must re-arm; a drain that completed
//! without seeing EAGAIN did not, and the next read has to assume data is
//! still queued.

use std::net::SocketAddr;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::EndpointOptions;
use crate::error::EndpointError;
use crate::errqueue::{
    self, ControlBuffer, SockExtendedErr, collect_cmsgs, encode_u32_cmsg, extended_err,
    is_ip_recverr, is_zerocopy, parse_opt_stats, scm_timestamping, timestamping_recording_options,
    timestamping_socket_options,
};
use crate::estimator::{self, ReadSizer};
use crate::iovec::{self, MAX_READ_IOVEC, MAX_WRITE_IOVEC, OutOffset};
use crate::memory::{MemoryOwner, ReclamationPass};
use crate::poller::{EventHandle, Executor, PosixInterface, SysError, SysResult};
use crate::slice_buffer::SliceBuffer;
use crate::stats;
use crate::telemetry::{TelemetryInfo, WriteEventSink};
use crate::traced_buffer::TracedBufferList;
use crate::zerocopy::{ZerocopySendCtx, ZerocopySendRecord};

#[cfg(target_os = "linux")]
const SENDMSG_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SENDMSG_FLAGS: libc::c_int = 0;

const EMPTY_IOVEC: libc::iovec = libc::iovec {
    iov_base: std::ptr::null_mut(),
    iov_len: 0,
};

const BIG_READ_ALLOC: usize = 64 * 1024;
const SMALL_READ_ALLOC: usize = 8 * 1024;

/// Hints for a read operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadArgs {
    /// Bytes the caller needs before its callback is useful (a frame size).
    /// Only honored when frame-size tuning is enabled.
    pub read_hint_bytes: usize,
}

/// Arguments for a write operation.
#[derive(Debug, Default)]
pub struct WriteArgs {
    /// Sink for kernel write timings of this send. Requires an
    /// error-tracking poller; silently dropped otherwise.
    pub metrics_sink: Option<WriteEventSink>,
}

/// Completion callback for a read. Receives the filled buffer on success.
pub type ReadCallback = Box<dyn FnOnce(Result<SliceBuffer, EndpointError>) + Send>;

/// Completion callback for a write.
pub type WriteCallback = Box<dyn FnOnce(Result<(), EndpointError>) + Send>;

/// Callback receiving the raw descriptor released at destruction.
pub type ReleaseFdCallback = Box<dyn FnOnce(OwnedFd) + Send>;

enum DoRead {
    /// The edge was consumed without completing; re-arm and wait.
    Pending,
    /// The read finished, successfully or not.
    Complete(Result<(), EndpointError>),
}

enum Flush {
    /// The kernel throttled us; re-arm the writable edge.
    Pending,
    Done(Result<(), EndpointError>),
}

struct ReadState {
    read_cb: Option<ReadCallback>,
    /// Present exactly while a read is outstanding.
    incoming: Option<SliceBuffer>,
    /// Staging for bytes accumulated across edges and spare slices from
    /// previous reads.
    last_read: SliceBuffer,
    min_progress_size: usize,
    estimator: ReadSizer,
    /// Nonzero: the kernel reported (or we must assume) bytes still queued.
    inq: i32,
    set_rcvlowat: libc::c_int,
    is_first_read: bool,
    has_posted_reclaimer: bool,
    memory_owner: MemoryOwner,
}

struct WriteState {
    write_cb: Option<WriteCallback>,
    outgoing: SliceBuffer,
    outgoing_byte_idx: usize,
    current_zerocopy: Option<Arc<ZerocopySendRecord>>,
    /// Bytes accepted by the kernel across this endpoint's lifetime. Reset
    /// to -1 when SO_TIMESTAMPING is enabled so `bytes_counter + len` is the
    /// zero-based index of a send's last byte in the kernel's OPT_ID space.
    bytes_counter: i64,
    write_sink: Option<WriteEventSink>,
}

/// A POSIX stream-socket endpoint.
///
/// `read` and `write` return `true` iff they completed synchronously without
/// invoking the callback; otherwise the callback fires exactly once. At most
/// one operation per side may be outstanding.
pub struct PosixEndpoint {
    inner: Arc<EndpointImpl>,
}

impl PosixEndpoint {
    /// Wrap an already-connected descriptor.
    ///
    /// Capabilities (error tracking, `TCP_INQ`, `SO_ZEROCOPY`) are detected
    /// here once; absent subsystems collapse to no-ops. Registers for error
    /// notifications immediately when the poller supports them.
    pub fn new(
        handle: Arc<dyn EventHandle>,
        posix: Arc<dyn PosixInterface>,
        executor: Arc<dyn Executor>,
        options: EndpointOptions,
    ) -> Self {
        let fd = handle.raw_fd();
        let memory_owner = options.resource_quota.create_owner();
        let local_addr = posix.local_addr(fd).ok();
        let peer_addr = posix.peer_addr(fd).ok();

        let zerocopy_enabled = negotiate_zerocopy(
            posix.as_ref(),
            fd,
            options.tcp_tx_zero_copy_enabled && handle.can_track_errors(),
        );
        let inq_capable = negotiate_inq(posix.as_ref(), fd);
        let can_track_errors = handle.can_track_errors();

        let inner = Arc::new_cyclic(|weak: &Weak<EndpointImpl>| EndpointImpl {
            weak: weak.clone(),
            handle: Arc::clone(&handle),
            posix,
            executor,
            fd,
            frame_size_tuning: options.features.frame_size_tuning,
            rcvlowat_tuning: options.features.rcvlowat_tuning,
            inq_capable,
            ts_capable: AtomicBool::new(can_track_errors),
            socket_ts_enabled: AtomicBool::new(false),
            stop_error_notification: AtomicBool::new(false),
            zerocopy: ZerocopySendCtx::new(
                zerocopy_enabled,
                options.tcp_tx_zerocopy_max_simultaneous_sends,
                options.tcp_tx_zerocopy_send_bytes_threshold,
            ),
            traced: TracedBufferList::new(),
            read: Mutex::new(ReadState {
                read_cb: None,
                incoming: None,
                last_read: SliceBuffer::new(),
                min_progress_size: 1,
                estimator: ReadSizer::new(
                    options.tcp_read_chunk_size,
                    options.tcp_min_read_chunk_size,
                    options.tcp_max_read_chunk_size,
                ),
                inq: 0,
                set_rcvlowat: 0,
                is_first_read: true,
                has_posted_reclaimer: false,
                memory_owner,
            }),
            write: Mutex::new(WriteState {
                write_cb: None,
                outgoing: SliceBuffer::new(),
                outgoing_byte_idx: 0,
                current_zerocopy: None,
                bytes_counter: 0,
                write_sink: None,
            }),
            local_addr,
            peer_addr,
            on_release_fd: Mutex::new(None),
        });

        if can_track_errors {
            inner.request_error_edge();
        }

        Self { inner }
    }

    /// Read bytes into `buf`.
    ///
    /// Returns `true` when the read completed synchronously: the bytes are
    /// in `buf` and `on_read` never runs. Returns `false` when pending (or
    /// immediately failed); `on_read` then fires exactly once with the
    /// filled buffer or the error.
    pub fn read(&self, buf: &mut SliceBuffer, on_read: ReadCallback, args: ReadArgs) -> bool {
        self.inner.read(buf, on_read, args)
    }

    /// Write `data`, draining it.
    ///
    /// Same synchronous/pending contract as [`read`](Self::read).
    pub fn write(&self, data: &mut SliceBuffer, on_writable: WriteCallback, args: WriteArgs) -> bool {
        self.inner.write(data, on_writable, args)
    }

    /// Shut the endpoint down. Idempotent; only the first call takes effect.
    ///
    /// Pending operations fail their callbacks with a shutdown status. With
    /// `on_release_fd`, the raw descriptor is handed back (instead of being
    /// closed) once the last reference drops.
    pub fn maybe_shutdown(&self, reason: EndpointError, on_release_fd: Option<ReleaseFdCallback>) {
        self.inner.maybe_shutdown(reason, on_release_fd);
    }

    /// Local socket address, captured at construction.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Peer socket address, captured at construction.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// The write-metric catalog and sparse-set factory.
    pub fn telemetry_info(&self) -> TelemetryInfo {
        TelemetryInfo
    }
}

impl Drop for PosixEndpoint {
    fn drop(&mut self) {
        self.inner
            .maybe_shutdown(EndpointError::cancelled("endpoint destroyed"), None);
    }
}

struct EndpointImpl {
    weak: Weak<EndpointImpl>,
    handle: Arc<dyn EventHandle>,
    posix: Arc<dyn PosixInterface>,
    executor: Arc<dyn Executor>,
    fd: RawFd,
    frame_size_tuning: bool,
    rcvlowat_tuning: bool,
    inq_capable: bool,
    ts_capable: AtomicBool,
    socket_ts_enabled: AtomicBool,
    stop_error_notification: AtomicBool,
    zerocopy: ZerocopySendCtx,
    traced: TracedBufferList,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    on_release_fd: Mutex<Option<ReleaseFdCallback>>,
}

impl EndpointImpl {
    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("endpoint alive while in use")
    }

    fn request_read_edge(&self) {
        let this = self.arc();
        self.handle
            .notify_on_read(Box::new(move |status| this.handle_read(status)));
    }

    fn request_write_edge(&self) {
        let this = self.arc();
        self.handle
            .notify_on_write(Box::new(move |status| this.handle_write(status)));
    }

    fn request_error_edge(&self) {
        let this = self.arc();
        self.handle
            .notify_on_error(Box::new(move |status| this.handle_error(status)));
    }

    // ========================================================================
    // Read path
    // ========================================================================

    fn read(&self, buf: &mut SliceBuffer, on_read: ReadCallback, args: ReadArgs) -> bool {
        let mut rs = self.read.lock();
        assert!(rs.read_cb.is_none(), "read already in flight");
        debug_assert!(rs.incoming.is_none());

        // Reuse leftover capacity from the previous read.
        buf.clear();
        let mut incoming = SliceBuffer::new();
        incoming.swap(&mut rs.last_read);
        rs.incoming = Some(incoming);
        rs.min_progress_size = if self.frame_size_tuning {
            args.read_hint_bytes.max(1)
        } else {
            1
        };

        if rs.is_first_read {
            // Very first read: register with the poller before touching the
            // socket so the edge state starts clean.
            rs.is_first_read = false;
            rs.read_cb = Some(on_read);
            self.update_rcvlowat(&mut rs);
            drop(rs);
            self.request_read_edge();
        } else if rs.inq == 0 {
            // No pending data known from previous reads; wait for POLLIN.
            rs.read_cb = Some(on_read);
            self.update_rcvlowat(&mut rs);
            drop(rs);
            self.request_read_edge();
        } else {
            self.maybe_make_read_slices(&mut rs);
            match self.tcp_do_read(&mut rs) {
                DoRead::Pending => {
                    self.update_rcvlowat(&mut rs);
                    rs.read_cb = Some(on_read);
                    // We've consumed the edge, request a new one.
                    drop(rs);
                    self.request_read_edge();
                }
                DoRead::Complete(Err(error)) => {
                    drop(rs);
                    tracing::trace!(fd = self.fd, %error, "read failed immediately");
                    self.executor
                        .run(Box::new(move || on_read(Err(error))));
                }
                DoRead::Complete(Ok(())) => {
                    let out = rs.incoming.take().expect("incoming present on success");
                    rs.memory_owner.free(out.len());
                    *buf = out;
                    return true;
                }
            }
        }
        false
    }

    fn handle_read(&self, status: Result<(), EndpointError>) {
        let mut status = status;
        let mut rs = self.read.lock();
        let complete = self.handle_read_locked(&mut rs, &mut status);
        if !complete {
            drop(rs);
            self.request_read_edge();
            return;
        }
        let cb = rs.read_cb.take().expect("read callback registered");
        let result = match status {
            Ok(()) => {
                let out = rs.incoming.take().expect("incoming present on success");
                rs.memory_owner.free(out.len());
                Ok(out)
            }
            Err(error) => {
                if let Some(incoming) = rs.incoming.take() {
                    rs.memory_owner.free(incoming.len());
                }
                Err(error)
            }
        };
        drop(rs);
        tracing::trace!(fd = self.fd, "read complete");
        cb(result);
    }

    fn handle_read_locked(
        &self,
        rs: &mut ReadState,
        status: &mut Result<(), EndpointError>,
    ) -> bool {
        if status.is_ok() && rs.memory_owner.is_valid() {
            self.maybe_make_read_slices(rs);
            match self.tcp_do_read(rs) {
                DoRead::Pending => {
                    self.update_rcvlowat(rs);
                    // We've consumed the edge, request a new one.
                    false
                }
                DoRead::Complete(result) => {
                    *status = result;
                    true
                }
            }
        } else {
            if status.is_ok() {
                *status = Err(EndpointError::ShuttingDown);
            }
            if let Some(incoming) = rs.incoming.take() {
                rs.memory_owner.free(incoming.len());
            }
            let staged = std::mem::take(&mut rs.last_read);
            rs.memory_owner.free(staged.len());
            true
        }
    }

    /// Drain the socket until EAGAIN, the buffer is full, or the kernel says
    /// the queue is empty.
    fn tcp_do_read(&self, rs: &mut ReadState) -> DoRead {
        let mut incoming = rs.incoming.take().expect("read in flight");
        assert!(incoming.len() > 0);
        debug_assert!(rs.min_progress_size >= 1);

        let mut iov = [EMPTY_IOVEC; MAX_READ_IOVEC];
        let mut iov_len = incoming.count().min(MAX_READ_IOVEC);
        for i in 0..iov_len {
            let slice = incoming.slice_at_mut(i);
            iov[i] = libc::iovec {
                iov_base: slice.as_mut_ptr() as *mut libc::c_void,
                iov_len: slice.len(),
            };
        }

        let mut control = ControlBuffer::new();
        let mut total_read_bytes = 0usize;

        loop {
            // Assume there is something on the queue unless the kernel's
            // TCP_INQ hint says otherwise.
            rs.inq = 1;

            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = iov_len as _;
            if self.inq_capable {
                msg.msg_control = control.as_mut_ptr();
                msg.msg_controllen = control.len() as _;
            }

            let res = self.do_recvmsg(&mut msg, 0);
            let read_bytes = match res {
                Err(e) if e.is(libc::EAGAIN) => {
                    if total_read_bytes > 0 {
                        break;
                    }
                    rs.estimator.finish_estimate();
                    rs.inq = 0;
                    rs.incoming = Some(incoming);
                    return DoRead::Pending;
                }
                Err(e) => {
                    // Bytes from previous iterations still get delivered.
                    if total_read_bytes >= 1 {
                        break;
                    }
                    rs.memory_owner.free(incoming.len());
                    let error = match e {
                        SysError::WrongGeneration => EndpointError::cancelled("closed on fork"),
                        other => other.annotate("recvmsg"),
                    };
                    return DoRead::Complete(Err(error));
                }
                Ok(0) => {
                    if total_read_bytes >= 1 {
                        break;
                    }
                    // 0 read size ==> end of stream.
                    rs.memory_owner.free(incoming.len());
                    return DoRead::Complete(Err(EndpointError::ClosedByPeer));
                }
                Ok(n) => n as usize,
            };

            stats::READ_BYTES.add(read_bytes as u64);
            rs.estimator.add_to_estimate(read_bytes);
            debug_assert!(read_bytes <= incoming.len() - total_read_bytes);

            if self.inq_capable {
                for cmsg in unsafe { collect_cmsgs(&msg) } {
                    if cmsg.level == libc::IPPROTO_TCP as libc::c_int
                        && cmsg.ty == errqueue::TCP_CM_INQ
                        && cmsg.data.len() >= 4
                    {
                        rs.inq = i32::from_ne_bytes(cmsg.data[..4].try_into().unwrap());
                        break;
                    }
                }
            }

            total_read_bytes += read_bytes;
            if rs.inq == 0 || total_read_bytes == incoming.len() {
                break;
            }

            // Partial read with space remaining: drop the consumed prefix
            // from the iov array and read again.
            let mut remaining = read_bytes;
            let mut j = 0usize;
            for i in 0..iov_len {
                if remaining >= iov[i].iov_len {
                    remaining -= iov[i].iov_len;
                    continue;
                }
                if remaining > 0 {
                    iov[j] = libc::iovec {
                        iov_base: unsafe { (iov[i].iov_base as *mut u8).add(remaining) }
                            as *mut libc::c_void,
                        iov_len: iov[i].iov_len - remaining,
                    };
                    remaining = 0;
                } else {
                    iov[j] = iov[i];
                }
                j += 1;
            }
            iov_len = j;
        }

        if rs.inq == 0 {
            rs.estimator.finish_estimate();
            // Edge-triggered poller: this drain ended without EAGAIN, so the
            // edge was not consumed. The next read must assume bytes are
            // still queued or it could wait on an edge that never fires.
            rs.inq = 1;
        }

        debug_assert!(total_read_bytes > 0);
        if self.frame_size_tuning {
            if total_read_bytes < rs.min_progress_size {
                // Not enough for the caller's frame yet. Stage what we have
                // and wait for the next edge.
                rs.min_progress_size -= total_read_bytes;
                incoming.move_first_n_into(total_read_bytes, &mut rs.last_read);
                rs.incoming = Some(incoming);
                return DoRead::Pending;
            }
            // Frame complete. Move this round into the staging buffer, then
            // swap so the caller sees everything accumulated across edges
            // and the spare slices become the next read's staging.
            rs.min_progress_size = 1;
            incoming.move_first_n_into(total_read_bytes, &mut rs.last_read);
            incoming.swap(&mut rs.last_read);
            rs.incoming = Some(incoming);
            return DoRead::Complete(Ok(()));
        }

        if total_read_bytes < incoming.len() {
            let tail = incoming.len() - total_read_bytes;
            incoming.move_last_n_into(tail, &mut rs.last_read);
        }
        rs.incoming = Some(incoming);
        DoRead::Complete(Ok(()))
    }

    fn maybe_make_read_slices(&self, rs: &mut ReadState) {
        let incoming_len = rs.incoming.as_ref().map(|b| b.len()).unwrap_or(0);
        if incoming_len >= rs.min_progress_size.max(1) {
            return;
        }

        let mut allocate_length = rs.min_progress_size;
        let target_length = rs.estimator.target_length();
        // Under pressure, allocate only what completion strictly needs.
        let low_memory_pressure = rs.memory_owner.pressure() < 0.8;
        if low_memory_pressure && target_length > allocate_length {
            allocate_length = target_length;
        }

        let mut extra_wanted = (allocate_length as i64 - incoming_len as i64).max(1);
        let incoming = rs.incoming.as_mut().expect("read in flight");
        if extra_wanted
            >= if low_memory_pressure {
                (SMALL_READ_ALLOC * 3 / 2) as i64
            } else {
                BIG_READ_ALLOC as i64
            }
        {
            while extra_wanted > 0 {
                extra_wanted -= BIG_READ_ALLOC as i64;
                incoming.push(rs.memory_owner.make_slice(BIG_READ_ALLOC));
                stats::READ_ALLOC_64K.increment();
            }
        } else {
            while extra_wanted > 0 {
                extra_wanted -= SMALL_READ_ALLOC as i64;
                incoming.push(rs.memory_owner.make_slice(SMALL_READ_ALLOC));
                stats::READ_ALLOC_8K.increment();
            }
        }
        self.maybe_post_reclaimer(rs);
    }

    fn maybe_post_reclaimer(&self, rs: &mut ReadState) {
        if rs.has_posted_reclaimer {
            return;
        }
        rs.has_posted_reclaimer = true;
        let this = self.arc();
        rs.memory_owner.post_reclaimer(
            ReclamationPass::Benign,
            Box::new(move |sweep| {
                if sweep.is_some() {
                    this.perform_reclamation();
                }
            }),
        );
    }

    /// Benign reclamation: drop the idle read buffer.
    ///
    /// Runs only under the read lock, and completion delivery moves
    /// `incoming` out under that same lock first, so the reclaimer can never
    /// race callback delivery.
    fn perform_reclamation(&self) {
        let mut rs = self.read.lock();
        let len = rs.incoming.as_ref().map(|b| b.len()).unwrap_or(0);
        rs.memory_owner.free(len);
        if let Some(incoming) = rs.incoming.as_mut() {
            incoming.clear();
        }
        rs.has_posted_reclaimer = false;
    }

    fn update_rcvlowat(&self, rs: &mut ReadState) {
        if !self.rcvlowat_tuning {
            return;
        }
        let incoming_len = rs.incoming.as_ref().map(|b| b.len()).unwrap_or(0);
        let Some(value) = estimator::compute_rcvlowat(
            incoming_len,
            rs.min_progress_size,
            self.zerocopy.enabled(),
            rs.set_rcvlowat,
        ) else {
            return;
        };
        match self
            .posix
            .setsockopt_int(self.fd, libc::SOL_SOCKET, libc::SO_RCVLOWAT, value)
        {
            Ok(applied) => rs.set_rcvlowat = applied,
            Err(error) => {
                tracing::error!(fd = self.fd, error = %error.message(), "failed to set SO_RCVLOWAT");
            }
        }
    }

    fn do_recvmsg(&self, msg: &mut libc::msghdr, flags: libc::c_int) -> SysResult<isize> {
        loop {
            stats::SYSCALL_READ.increment();
            match self.posix.recvmsg(self.fd, msg, flags) {
                Err(e) if e.is(libc::EINTR) => continue,
                other => return other,
            }
        }
    }

    // ========================================================================
    // Write path
    // ========================================================================

    fn write(&self, data: &mut SliceBuffer, on_writable: WriteCallback, mut args: WriteArgs) -> bool {
        let mut ws = self.write.lock();
        assert!(ws.write_cb.is_none(), "write already in flight");
        debug_assert!(ws.current_zerocopy.is_none());

        tracing::trace!(fd = self.fd, bytes = data.len(), "write");
        if data.is_empty() {
            if self.handle.is_shutdown() {
                drop(ws);
                let error = EndpointError::Eof;
                self.executor
                    .run(Box::new(move || on_writable(Err(error))));
                return false;
            }
            return true;
        }

        let record = self.tcp_get_send_zerocopy_record(data);
        if record.is_none() {
            // Either not enough bytes or no free record; take the copy path.
            data.swap(&mut ws.outgoing);
            ws.outgoing_byte_idx = 0;
        }
        if args.metrics_sink.is_some() && self.handle.can_track_errors() {
            ws.write_sink = args.metrics_sink.take();
        }

        let flush = match &record {
            Some(record) => self.tcp_flush_zerocopy(&mut ws, record),
            None => self.tcp_flush(&mut ws),
        };
        match flush {
            Flush::Pending => {
                ws.write_cb = Some(on_writable);
                ws.current_zerocopy = record;
                drop(ws);
                self.request_write_edge();
                false
            }
            Flush::Done(Err(error)) => {
                drop(ws);
                tracing::trace!(fd = self.fd, %error, "write failed immediately");
                self.executor
                    .run(Box::new(move || on_writable(Err(error))));
                false
            }
            Flush::Done(Ok(())) => true,
        }
    }

    fn handle_write(&self, status: Result<(), EndpointError>) {
        let mut ws = self.write.lock();
        if let Err(error) = status {
            let cb = ws.write_cb.take().expect("write callback registered");
            if let Some(record) = ws.current_zerocopy.take() {
                self.zerocopy.unref_maybe_put(&record);
            }
            drop(ws);
            tracing::trace!(fd = self.fd, %error, "write failed");
            cb(Err(error));
            return;
        }
        let record = ws.current_zerocopy.clone();
        let flush = match &record {
            Some(record) => self.tcp_flush_zerocopy(&mut ws, record),
            None => self.tcp_flush(&mut ws),
        };
        match flush {
            Flush::Pending => {
                drop(ws);
                self.request_write_edge();
            }
            Flush::Done(result) => {
                let cb = ws.write_cb.take().expect("write callback registered");
                ws.current_zerocopy = None;
                drop(ws);
                tracing::trace!(fd = self.fd, "write complete");
                cb(result);
            }
        }
    }

    /// Acquire a zero-copy record for `data` when zero-copy is negotiated
    /// and the payload clears the threshold. Drains the error queue once if
    /// the pool is momentarily empty.
    fn tcp_get_send_zerocopy_record(
        &self,
        data: &mut SliceBuffer,
    ) -> Option<Arc<ZerocopySendRecord>> {
        if !self.zerocopy.enabled() || data.len() <= self.zerocopy.threshold_bytes() {
            return None;
        }
        let record = self.zerocopy.get_send_record().or_else(|| {
            self.process_errors();
            self.zerocopy.get_send_record()
        });
        match record {
            Some(record) => {
                record.prepare_for_sends(data);
                debug_assert!(data.is_empty());
                stats::ZEROCOPY_SENDS.increment();
                Some(record)
            }
            None => {
                stats::ZEROCOPY_FALLBACKS.increment();
                None
            }
        }
    }

    fn tcp_flush(&self, ws: &mut WriteState) -> Flush {
        let mut iov = [EMPTY_IOVEC; MAX_WRITE_IOVEC];
        // Slice index restarts at zero each flush because the buffer is
        // trimmed on exit; the byte index survives across flushes.
        let mut off = OutOffset {
            slice_idx: 0,
            byte_idx: ws.outgoing_byte_idx,
        };
        loop {
            let plan = iovec::populate_iovs(&mut ws.outgoing, &mut off, &mut iov);
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = plan.iov_len as _;

            let send_res = self.send_planned(ws, &mut msg, plan.sending_length, 0);
            match send_res {
                Err(e) if e.is(libc::EAGAIN) || e.is(libc::ENOBUFS) => {
                    ws.outgoing_byte_idx = plan.unwind.byte_idx;
                    // Forget the slices fully sent before this call.
                    for _ in 0..plan.unwind.slice_idx {
                        ws.outgoing.take_first();
                    }
                    return Flush::Pending;
                }
                Err(e) => {
                    ws.outgoing.clear();
                    ws.outgoing_byte_idx = 0;
                    return Flush::Done(Err(e.annotate("sendmsg")));
                }
                Ok(sent) => {
                    let sent = sent as usize;
                    ws.bytes_counter += sent as i64;
                    stats::WRITE_BYTES.add(sent as u64);
                    iovec::update_offset_for_bytes_sent(
                        &ws.outgoing,
                        &mut off,
                        plan.sending_length,
                        sent,
                    );
                    if off.slice_idx == ws.outgoing.count() {
                        ws.outgoing.clear();
                        ws.outgoing_byte_idx = 0;
                        return Flush::Done(Ok(()));
                    }
                }
            }
        }
    }

    fn tcp_flush_zerocopy(&self, ws: &mut WriteState, record: &Arc<ZerocopySendRecord>) -> Flush {
        let result = self.do_flush_zerocopy(ws, record);
        if !matches!(result, Flush::Pending) {
            // Error or all bytes sent; either way this flush's reference is
            // done with the record.
            self.zerocopy.unref_maybe_put(record);
        }
        result
    }

    fn do_flush_zerocopy(&self, ws: &mut WriteState, record: &Arc<ZerocopySendRecord>) -> Flush {
        let mut iov = [EMPTY_IOVEC; MAX_WRITE_IOVEC];
        loop {
            let plan = record.populate_iovs(&mut iov);
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = plan.iov_len as _;

            // One reference per sendmsg, balanced by the error-queue
            // completion (or undo on failure).
            self.zerocopy.note_send(record);
            let send_res =
                self.send_planned(ws, &mut msg, plan.sending_length, errqueue::MSG_ZEROCOPY);

            let seen_enobufs = matches!(send_res, Err(e) if e.is(libc::ENOBUFS));
            if self
                .zerocopy
                .update_zero_copy_opt_mem_state_after_send(seen_enobufs)
            {
                // ENOBUFS with nothing else in flight: the pinned-memory
                // limits are the bottleneck, not our concurrency ceiling.
                self.log_memlock_constrained();
            }

            match send_res {
                Err(e) => {
                    self.zerocopy.undo_send();
                    if e.is(libc::EAGAIN) || e.is(libc::ENOBUFS) {
                        record.unwind_if_throttled(plan.unwind);
                        return Flush::Pending;
                    }
                    return Flush::Done(Err(e.annotate("sendmsg")));
                }
                Ok(sent) => {
                    ws.bytes_counter += sent as i64;
                    stats::WRITE_BYTES.add(sent as u64);
                    record.update_offset_for_bytes_sent(plan.sending_length, sent as usize);
                    if record.all_slices_sent() {
                        return Flush::Done(Ok(()));
                    }
                }
            }
        }
    }

    /// Send the planned iovecs, attaching timestamp recording when a sink is
    /// installed and the socket supports it.
    fn send_planned(
        &self,
        ws: &mut WriteState,
        msg: &mut libc::msghdr,
        sending_length: usize,
        additional_flags: libc::c_int,
    ) -> SysResult<isize> {
        if ws.write_sink.is_some() && self.ts_capable.load(Ordering::Acquire) {
            match self.write_with_timestamps(ws, msg, sending_length, additional_flags) {
                Some(result) => return result,
                None => {
                    // Could not enable SO_TIMESTAMPING; timestamps are off
                    // for this endpoint from here on.
                    self.ts_capable.store(false, Ordering::Release);
                    self.shutdown_traced_buffer_list(ws);
                }
            }
        }
        msg.msg_control = std::ptr::null_mut();
        msg.msg_controllen = 0;
        self.tcp_send(msg, additional_flags)
    }

    /// Returns `None` when the socket option could not be enabled; the send
    /// was not attempted and the caller falls back to the plain path.
    fn write_with_timestamps(
        &self,
        ws: &mut WriteState,
        msg: &mut libc::msghdr,
        sending_length: usize,
        additional_flags: libc::c_int,
    ) -> Option<SysResult<isize>> {
        if !self.socket_ts_enabled.load(Ordering::Acquire) {
            if self
                .posix
                .setsockopt_int(
                    self.fd,
                    libc::SOL_SOCKET,
                    errqueue::SO_TIMESTAMPING,
                    timestamping_socket_options() as libc::c_int,
                )
                .is_err()
            {
                return None;
            }
            // OPT_ID byte counting starts at zero from here; keep
            // bytes_counter + sending_length equal to the last byte's index.
            ws.bytes_counter = -1;
            self.socket_ts_enabled.store(true, Ordering::Release);
        }

        let mut control = ControlBuffer::new();
        let controllen = encode_u32_cmsg(
            control.as_mut_slice(),
            libc::SOL_SOCKET,
            errqueue::SO_TIMESTAMPING,
            timestamping_recording_options(),
        );
        msg.msg_control = control.as_mut_ptr();
        msg.msg_controllen = controllen as _;

        // Register the traced entry before the send so the timestamp can
        // never arrive ahead of the registration.
        let sink = ws.write_sink.take().expect("sink checked by caller");
        self.traced
            .add_new_entry((ws.bytes_counter + sending_length as i64) as u32, sink);

        Some(self.tcp_send(msg, additional_flags))
    }

    fn shutdown_traced_buffer_list(&self, ws: &mut WriteState) {
        if ws.write_sink.is_some() {
            self.traced.shutdown(ws.write_sink.take());
        }
    }

    fn tcp_send(&self, msg: &libc::msghdr, additional_flags: libc::c_int) -> SysResult<isize> {
        loop {
            stats::SYSCALL_WRITE.increment();
            match self
                .posix
                .sendmsg(self.fd, msg, SENDMSG_FLAGS | additional_flags)
            {
                Err(e) if e.is(libc::EINTR) => continue,
                other => return other,
            }
        }
    }

    fn log_memlock_constrained(&self) {
        // At most one diagnostic per second across the process.
        static LAST_LOG_SECOND: AtomicU64 = AtomicU64::new(0);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let last = LAST_LOG_SECOND.load(Ordering::Relaxed);
        if now == last
            || LAST_LOG_SECOND
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
        {
            return;
        }
        #[cfg(target_os = "linux")]
        tracing::warn!(
            rlimit_memlock = crate::ulimit::rlimit_memlock_max(),
            hard_memlock_ulimit = crate::ulimit::ulimit_hard_memlock(),
            "zero-copy send hit ENOBUFS with no sends in flight; RLIMIT_MEMLOCK \
             or the hard memlock ulimit is likely too small for this workload"
        );
        #[cfg(not(target_os = "linux"))]
        tracing::warn!("zero-copy send hit ENOBUFS with no sends in flight");
    }

    // ========================================================================
    // Error-queue path
    // ========================================================================

    fn handle_error(&self, status: Result<(), EndpointError>) {
        if status.is_err() || self.stop_error_notification.load(Ordering::Relaxed) {
            // Not listening anymore; let this registration's reference go.
            return;
        }
        if !self.process_errors() {
            // Not an error-queue event. Wake both data paths so a real
            // socket error is observed by their syscalls.
            self.handle.set_readable();
            self.handle.set_writable();
        }
        self.request_error_edge();
    }

    /// Drain `MSG_ERRQUEUE`, dispatching zero-copy completions and
    /// timestamps. Returns whether any event was processed.
    fn process_errors(&self) -> bool {
        let mut processed_err = false;
        let mut control = ControlBuffer::new();
        loop {
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_control = control.as_mut_ptr();
            msg.msg_controllen = control.len() as _;

            let res = loop {
                match self
                    .posix
                    .recvmsg(self.fd, &mut msg, errqueue::MSG_ERRQUEUE)
                {
                    Err(e) if e.is(libc::EINTR) => continue,
                    other => break other,
                }
            };
            if res.is_err() {
                // EAGAIN: nothing more to process. Other errors: give up on
                // this drain.
                return processed_err;
            }
            if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
                tracing::error!(fd = self.fd, "error message was truncated");
            }
            if msg.msg_controllen == 0 {
                // No control message; probably spurious.
                return processed_err;
            }

            let cmsgs = unsafe { collect_cmsgs(&msg) };
            let mut seen = false;
            let mut i = 0usize;
            while i < cmsgs.len() {
                let cmsg = &cmsgs[i];
                if is_ip_recverr(cmsg.level, cmsg.ty) {
                    match extended_err(cmsg.data) {
                        Some(serr) if is_zerocopy(&serr) => {
                            self.process_zerocopy(&serr);
                            seen = true;
                            processed_err = true;
                            i += 1;
                        }
                        _ => return processed_err,
                    }
                } else if cmsg.level == libc::SOL_SOCKET && cmsg.ty == errqueue::SCM_TIMESTAMPING {
                    let Some(tss) = scm_timestamping(cmsg.data) else {
                        return processed_err;
                    };
                    seen = true;
                    processed_err = true;
                    let mut next = i + 1;
                    let opt_stats = if next < cmsgs.len()
                        && cmsgs[next].level == libc::SOL_SOCKET
                        && cmsgs[next].ty == errqueue::SCM_TIMESTAMPING_OPT_STATS
                    {
                        let parsed = parse_opt_stats(cmsgs[next].data);
                        next += 1;
                        Some(parsed)
                    } else {
                        None
                    };
                    if next >= cmsgs.len() {
                        break;
                    }
                    let follower = &cmsgs[next];
                    if !is_ip_recverr(follower.level, follower.ty) {
                        tracing::error!(fd = self.fd, "unexpected control message");
                        break;
                    }
                    let Some(serr) = extended_err(follower.data) else {
                        break;
                    };
                    if serr.ee_errno != libc::ENOMSG as u32
                        || serr.ee_origin != errqueue::SO_EE_ORIGIN_TIMESTAMPING
                    {
                        tracing::error!(fd = self.fd, "unexpected control message");
                        break;
                    }
                    self.traced
                        .process_timestamp(&serr, opt_stats.as_ref(), &tss);
                    i = next + 1;
                } else {
                    // Unknown control message terminates this drain.
                    return processed_err;
                }
            }
            if !seen {
                return processed_err;
            }
        }
    }

    fn process_zerocopy(&self, serr: &SockExtendedErr) {
        let lo = serr.ee_info;
        let hi = serr.ee_data;
        let mut seq = lo;
        loop {
            let released = self.zerocopy.release_send_record(seq);
            debug_assert!(released.is_some(), "completion for unknown sequence");
            if let Some(record) = released {
                self.zerocopy.unref_maybe_put(&record);
            }
            if seq == hi {
                break;
            }
            seq = seq.wrapping_add(1);
        }
        if self.zerocopy.update_zero_copy_opt_mem_state_after_free() {
            self.handle.set_writable();
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    fn zerocopy_disable_and_wait_for_remaining(&self) {
        self.zerocopy.shutdown();
        while !self.zerocopy.all_send_records_empty() {
            self.process_errors();
        }
    }

    fn maybe_shutdown(&self, reason: EndpointError, on_release_fd: Option<ReleaseFdCallback>) {
        if self.stop_error_notification.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::trace!(fd = self.fd, %reason, "shutdown");
        if self.handle.can_track_errors() {
            self.zerocopy_disable_and_wait_for_remaining();
            // Wake the pending error registration so it observes the stop
            // flag and releases its reference.
            self.handle.set_has_error();
            let sink = self.write.lock().write_sink.take();
            self.traced.shutdown(sink);
        }
        *self.on_release_fd.lock() = on_release_fd;
        self.handle.shutdown(reason);
        self.read.lock().memory_owner.reset();
    }
}

impl Drop for EndpointImpl {
    fn drop(&mut self) {
        let release = self.on_release_fd.get_mut().take();
        let fd = self.handle.orphan(release.is_some());
        if let (Some(cb), Some(fd)) = (release, fd) {
            self.executor.run(Box::new(move || cb(fd)));
        }
    }
}

fn negotiate_zerocopy(posix: &dyn PosixInterface, fd: RawFd, requested: bool) -> bool {
    if !requested {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        // Zero-copy pins payload pages; without a memlock budget the kernel
        // rejects the sends, so don't enable it at all.
        if crate::ulimit::rlimit_memlock_max() == 0 {
            tracing::error!(
                fd,
                "tx zero-copy will not be used since the RLIMIT_MEMLOCK value \
                 is not set; consider raising it with setrlimit"
            );
            return false;
        }
        if crate::ulimit::ulimit_hard_memlock() == 0 {
            tracing::error!(
                fd,
                "tx zero-copy will not be used since the hard memlock ulimit \
                 is not set; use ulimit -l <value> to set it"
            );
            return false;
        }
        match posix.setsockopt_int(fd, libc::SOL_SOCKET, errqueue::SO_ZEROCOPY, 1) {
            Ok(_) => {
                tracing::debug!(
                    fd,
                    rlimit_memlock = crate::ulimit::rlimit_memlock_max(),
                    hard_memlock_ulimit = crate::ulimit::ulimit_hard_memlock(),
                    "tx zero-copy enabled"
                );
                true
            }
            Err(error) => {
                tracing::error!(fd, error = %error.message(), "failed to set zero-copy socket option");
                false
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (posix, fd);
        false
    }
}

fn negotiate_inq(posix: &dyn PosixInterface, fd: RawFd) -> bool {
    #[cfg(target_os = "linux")]
    {
        match posix.setsockopt_int(fd, libc::SOL_TCP, errqueue::TCP_INQ, 1) {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(fd, error = %error.message(), "cannot set TCP_INQ");
                false
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (posix, fd);
        false
    }
}
