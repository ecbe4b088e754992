//! Memory quota collaborator.
//!
//! Read-buffer allocations are charged against a process-wide
//! [`MemoryQuota`]. Each endpoint holds a [`MemoryOwner`]: a resettable
//! handle that tracks the bytes the endpoint currently holds, reports
//! pressure, and registers reclamation callbacks that the quota may invoke
//! under memory pressure.
//!
//! Accounting covers endpoint-held buffers. Bytes delivered to the caller
//! leave the quota at delivery time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

/// Reclamation urgency, from cheapest to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclamationPass {
    /// Drop caches and idle buffers; no observable effect on callers.
    Benign,
    /// Reclaim from idle connections.
    Idle,
    /// Reclaim at the cost of active work.
    Destructive,
}

/// Proof that a reclamation sweep is live. A reclaimer invoked with `None`
/// was cancelled (its owner reset) and must not reclaim.
#[derive(Debug)]
pub struct ReclamationSweep(());

/// A posted reclamation callback.
pub type Reclaimer = Box<dyn FnOnce(Option<ReclamationSweep>) + Send>;

struct ReclaimerEntry {
    owner_id: u64,
    pass: ReclamationPass,
    f: Reclaimer,
}

struct QuotaShared {
    limit: usize,
    allocated: AtomicUsize,
    reclaimers: Mutex<Vec<ReclaimerEntry>>,
    next_owner_id: AtomicU64,
}

/// A byte budget shared by all endpoints constructed against it.
pub struct MemoryQuota {
    shared: Arc<QuotaShared>,
}

impl MemoryQuota {
    /// Create a quota with the given byte limit.
    pub fn new(limit: usize) -> Self {
        Self {
            shared: Arc::new(QuotaShared {
                limit,
                allocated: AtomicUsize::new(0),
                reclaimers: Mutex::new(Vec::new()),
                next_owner_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create an owner handle charging against this quota.
    pub fn create_owner(&self) -> MemoryOwner {
        MemoryOwner {
            shared: Some(Arc::clone(&self.shared)),
            id: self.shared.next_owner_id.fetch_add(1, Ordering::Relaxed),
            owned: 0,
        }
    }

    /// Bytes currently charged.
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Run all posted reclaimers of the given pass with a live sweep.
    pub fn reclaim(&self, pass: ReclamationPass) {
        let drained: Vec<ReclaimerEntry> = {
            let mut reclaimers = self.shared.reclaimers.lock();
            let (matching, rest) = reclaimers.drain(..).partition(|e| e.pass == pass);
            *reclaimers = rest;
            matching
        };
        for entry in drained {
            (entry.f)(Some(ReclamationSweep(())));
        }
    }
}

impl QuotaShared {
    fn pressure(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        let allocated = self.allocated.load(Ordering::Relaxed) as f64;
        (allocated / self.limit as f64).clamp(0.0, 1.0)
    }
}

/// A resettable per-endpoint handle on a [`MemoryQuota`].
pub struct MemoryOwner {
    shared: Option<Arc<QuotaShared>>,
    id: u64,
    owned: usize,
}

impl MemoryOwner {
    /// Allocate a zeroed slice of `len` bytes, charging the quota.
    pub fn make_slice(&mut self, len: usize) -> BytesMut {
        if let Some(shared) = &self.shared {
            shared.allocated.fetch_add(len, Ordering::Relaxed);
            self.owned += len;
        }
        BytesMut::zeroed(len)
    }

    /// Release `n` bytes back to the quota. Clamped to what this owner holds.
    pub fn free(&mut self, n: usize) {
        let n = n.min(self.owned);
        if n == 0 {
            return;
        }
        if let Some(shared) = &self.shared {
            shared.allocated.fetch_sub(n, Ordering::Relaxed);
        }
        self.owned -= n;
    }

    /// Quota pressure in `[0, 1]`.
    pub fn pressure(&self) -> f64 {
        self.shared.as_ref().map(|s| s.pressure()).unwrap_or(0.0)
    }

    /// Post a reclamation callback for the given pass.
    pub fn post_reclaimer(&self, pass: ReclamationPass, f: Reclaimer) {
        if let Some(shared) = &self.shared {
            shared.reclaimers.lock().push(ReclaimerEntry {
                owner_id: self.id,
                pass,
                f,
            });
        }
    }

    /// True until [`reset`](Self::reset) is called.
    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    /// Detach from the quota: release held bytes and cancel posted
    /// reclaimers (they are invoked with `None`).
    pub fn reset(&mut self) {
        let owned = self.owned;
        self.free(owned);
        let cancelled: Vec<ReclaimerEntry> = match &self.shared {
            Some(shared) => {
                let mut reclaimers = shared.reclaimers.lock();
                let (mine, rest) = reclaimers.drain(..).partition(|e| e.owner_id == self.id);
                *reclaimers = rest;
                mine
            }
            None => Vec::new(),
        };
        for entry in cancelled {
            (entry.f)(None);
        }
        self.shared = None;
    }
}

impl Drop for MemoryOwner {
    fn drop(&mut self) {
        self.reset();
    }
}
