//! End-to-end tests over a real loopback TCP pair.
//!
//! A minimal mio-based poller drives the endpoint the way a production
//! event loop would: edge observations become sticky ready bits, and a
//! registered callback consumes a bit when dispatched.

use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;

use io_endpoint::{
    EndpointError, EndpointOptions, EventHandle, Executor, Features, MemoryQuota, OsInterface,
    PollerCallback, PosixEndpoint, ReadArgs, SliceBuffer, WriteArgs,
};

struct PollerInner {
    poll: Poll,
    events: Events,
    _stream: mio::net::TcpStream,
    read_cb: Option<PollerCallback>,
    write_cb: Option<PollerCallback>,
    error_cb: Option<PollerCallback>,
    ready_read: bool,
    ready_write: bool,
    shutdown: Option<EndpointError>,
}

struct TestPoller {
    fd: RawFd,
    inner: Mutex<PollerInner>,
}

impl TestPoller {
    fn new(stream: TcpStream) -> Arc<Self> {
        stream.set_nonblocking(true).unwrap();
        let fd = stream.as_raw_fd();
        let mut stream = mio::net::TcpStream::from_std(stream);
        let poll = Poll::new().unwrap();
        poll.registry()
            .register(&mut stream, Token(0), Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        Arc::new(Self {
            fd,
            inner: Mutex::new(PollerInner {
                poll,
                events: Events::with_capacity(16),
                _stream: stream,
                read_cb: None,
                write_cb: None,
                error_cb: None,
                ready_read: false,
                ready_write: false,
                shutdown: None,
            }),
        })
    }

    /// Dispatch ready callbacks, then poll once for new edges.
    fn pump(&self) {
        loop {
            let cb = {
                let mut inner = self.inner.lock();
                if inner.ready_read && inner.read_cb.is_some() {
                    inner.ready_read = false;
                    inner.read_cb.take()
                } else if inner.ready_write && inner.write_cb.is_some() {
                    inner.ready_write = false;
                    inner.write_cb.take()
                } else {
                    None
                }
            };
            match cb {
                Some(cb) => cb(Ok(())),
                None => break,
            }
        }
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let _ = inner
            .poll
            .poll(&mut inner.events, Some(Duration::from_millis(10)));
        for event in inner.events.iter() {
            if event.is_readable() || event.is_read_closed() {
                inner.ready_read = true;
            }
            if event.is_writable() {
                inner.ready_write = true;
            }
        }
    }

    fn pump_until(&self, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "pump_until timed out");
            self.pump();
        }
    }
}

impl EventHandle for TestPoller {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn notify_on_read(&self, cb: PollerCallback) {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.shutdown.clone() {
            drop(inner);
            cb(Err(reason));
            return;
        }
        inner.read_cb = Some(cb);
    }

    fn notify_on_write(&self, cb: PollerCallback) {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.shutdown.clone() {
            drop(inner);
            cb(Err(reason));
            return;
        }
        inner.write_cb = Some(cb);
    }

    fn notify_on_error(&self, cb: PollerCallback) {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.shutdown.clone() {
            drop(inner);
            cb(Err(reason));
            return;
        }
        inner.error_cb = Some(cb);
    }

    fn set_readable(&self) {
        self.inner.lock().ready_read = true;
    }

    fn set_writable(&self) {
        self.inner.lock().ready_write = true;
    }

    fn set_has_error(&self) {}

    fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown.is_some()
    }

    fn shutdown(&self, reason: EndpointError) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.shutdown = Some(reason.clone());
            [
                inner.read_cb.take(),
                inner.write_cb.take(),
                inner.error_cb.take(),
            ]
        };
        for cb in pending.into_iter().flatten() {
            cb(Err(reason.clone()));
        }
    }

    fn orphan(&self, _release_fd: bool) -> Option<OwnedFd> {
        None
    }

    fn can_track_errors(&self) -> bool {
        false
    }
}

struct InlineExecutor;

impl Executor for InlineExecutor {
    fn run(&self, f: Box<dyn FnOnce() + Send>) {
        f();
    }
}

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn make_endpoint(features: Features) -> (PosixEndpoint, Arc<TestPoller>, TcpStream) {
    let (client, server) = tcp_pair();
    let poller = TestPoller::new(client);
    let mut options = EndpointOptions::new(Arc::new(MemoryQuota::new(64 * 1024 * 1024)));
    options.features = features;
    let endpoint = PosixEndpoint::new(
        poller.clone(),
        Arc::new(OsInterface),
        Arc::new(InlineExecutor),
        options,
    );
    (endpoint, poller, server)
}

type ReadResults = Arc<Mutex<Vec<Result<Vec<u8>, EndpointError>>>>;

fn read_callback(results: &ReadResults) -> io_endpoint::ReadCallback {
    let results = Arc::clone(results);
    Box::new(move |res| results.lock().push(res.map(|buf| buf.to_vec())))
}

/// Write all of `data`, pumping the poller until the kernel accepted it.
fn write_all(endpoint: &PosixEndpoint, poller: &TestPoller, data: Vec<u8>) {
    let done = Arc::new(Mutex::new(None::<Result<(), EndpointError>>));
    let done2 = Arc::clone(&done);
    let mut buf = SliceBuffer::from(data);
    let wrote = endpoint.write(
        &mut buf,
        Box::new(move |res| *done2.lock() = Some(res)),
        WriteArgs::default(),
    );
    if wrote {
        return;
    }
    poller.pump_until(|| done.lock().is_some());
    done.lock().take().unwrap().expect("write completed");
}

#[test]
fn test_echo_one_kilobyte() {
    let (endpoint, poller, mut peer) = make_endpoint(Features::default());
    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();

    write_all(&endpoint, &poller, payload.clone());

    // Peer echoes the kilobyte back.
    let echo = {
        use std::io::{Read, Write};
        let mut received = vec![0u8; 1024];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(received, payload);
        peer.write_all(&received).unwrap();
        received
    };

    let results: ReadResults = Arc::default();
    let mut buf = SliceBuffer::new();
    let done = endpoint.read(&mut buf, read_callback(&results), ReadArgs::default());
    if done {
        assert_eq!(buf.to_vec(), echo);
        assert!(results.lock().is_empty());
    } else {
        poller.pump_until(|| !results.lock().is_empty());
        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &echo);
    }
}

#[test]
fn test_read_hint_collects_split_frame() {
    let features = Features {
        frame_size_tuning: true,
        rcvlowat_tuning: false,
    };
    let (endpoint, poller, mut peer) = make_endpoint(features);

    let results: ReadResults = Arc::default();
    let mut buf = SliceBuffer::new();
    assert!(!endpoint.read(
        &mut buf,
        read_callback(&results),
        ReadArgs {
            read_hint_bytes: 1000,
        },
    ));

    let writer = std::thread::spawn(move || {
        use std::io::Write;
        peer.write_all(&[0xaa; 100]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        peer.write_all(&[0xbb; 900]).unwrap();
        peer
    });

    poller.pump_until(|| !results.lock().is_empty());
    let _peer = writer.join().unwrap();

    // One completion carrying the whole frame, in arrival order.
    let results = results.lock();
    assert_eq!(results.len(), 1);
    let bytes = results[0].as_ref().unwrap();
    assert_eq!(bytes.len(), 1000);
    assert!(bytes[..100].iter().all(|&b| b == 0xaa));
    assert!(bytes[100..].iter().all(|&b| b == 0xbb));
}

#[test]
fn test_shutdown_fails_pending_read_exactly_once() {
    let (endpoint, poller, _peer) = make_endpoint(Features::default());

    let results: ReadResults = Arc::default();
    let mut buf = SliceBuffer::new();
    assert!(!endpoint.read(&mut buf, read_callback(&results), ReadArgs::default()));
    poller.pump();

    endpoint.maybe_shutdown(EndpointError::cancelled("test teardown"), None);
    let snapshot = results.lock().clone();
    assert_eq!(snapshot.len(), 1);
    let err = snapshot[0].as_ref().unwrap_err();
    assert_eq!(
        err.transport_status(),
        io_endpoint::TransportStatus::Cancelled
    );

    // A few more pump cycles must not produce further callbacks.
    for _ in 0..5 {
        poller.pump();
    }
    assert_eq!(results.lock().len(), 1);
}

#[test]
fn test_peer_close_fails_read() {
    let (endpoint, poller, peer) = make_endpoint(Features::default());

    let results: ReadResults = Arc::default();
    let mut buf = SliceBuffer::new();
    assert!(!endpoint.read(&mut buf, read_callback(&results), ReadArgs::default()));

    drop(peer);
    poller.pump_until(|| !results.lock().is_empty());
    let results = results.lock();
    assert_eq!(
        results[0].as_ref().unwrap_err(),
        &EndpointError::ClosedByPeer
    );
}

#[test]
fn test_zero_length_write_is_a_noop() {
    let (endpoint, _poller, _peer) = make_endpoint(Features::default());
    let mut empty = SliceBuffer::new();
    assert!(endpoint.write(
        &mut empty,
        Box::new(|_| panic!("no callback for a no-op write")),
        WriteArgs::default(),
    ));
}

#[test]
fn test_large_write_under_backpressure() {
    let (endpoint, poller, mut peer) = make_endpoint(Features::default());
    const TOTAL: usize = 8 * 1024 * 1024;

    let reader = std::thread::spawn(move || {
        use std::io::Read;
        let mut remaining = TOTAL;
        let mut chunk = vec![0u8; 64 * 1024];
        let mut checksum: u64 = 0;
        while remaining > 0 {
            let n = peer.read(&mut chunk).unwrap();
            assert!(n > 0, "peer saw EOF early");
            checksum += chunk[..n].iter().map(|&b| b as u64).sum::<u64>();
            remaining -= n;
        }
        checksum
    });

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 199) as u8).collect();
    let expected: u64 = payload.iter().map(|&b| b as u64).sum();
    write_all(&endpoint, &poller, payload);

    let checksum = reader.join().unwrap();
    assert_eq!(checksum, expected);
}

#[test]
fn test_addresses_match_socket() {
    let (client, server) = tcp_pair();
    let client_local = client.local_addr().unwrap();
    let client_peer = client.peer_addr().unwrap();
    let poller = TestPoller::new(client);
    let endpoint = PosixEndpoint::new(
        poller,
        Arc::new(OsInterface),
        Arc::new(InlineExecutor),
        EndpointOptions::new(Arc::new(MemoryQuota::new(usize::MAX))),
    );
    assert_eq!(endpoint.local_addr(), Some(client_local));
    assert_eq!(endpoint.peer_addr(), Some(client_peer));
    drop(server);
}
