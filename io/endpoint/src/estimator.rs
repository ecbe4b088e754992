//! Adaptive receive sizing.
//!
//! Tracks how many bytes each read burst produced and moves a target buffer
//! length toward observed throughput: fast growth when a burst fills more
//! than 80% of the target, slow exponential decay otherwise. Also computes
//! the `SO_RCVLOWAT` value that lets the kernel hold back readable wakeups
//! until a useful amount of data is buffered.

/// Adaptive target read size.
#[derive(Debug)]
pub struct ReadSizer {
    target_length: f64,
    bytes_read_this_round: f64,
    min_chunk: f64,
    max_chunk: f64,
}

impl ReadSizer {
    pub fn new(initial: usize, min_chunk: usize, max_chunk: usize) -> Self {
        let min_chunk = min_chunk.max(1) as f64;
        let max_chunk = (max_chunk as f64).max(min_chunk);
        Self {
            target_length: (initial as f64).clamp(min_chunk, max_chunk),
            bytes_read_this_round: 0.0,
            min_chunk,
            max_chunk,
        }
    }

    /// Account bytes produced by one recvmsg.
    pub fn add_to_estimate(&mut self, bytes: usize) {
        self.bytes_read_this_round += bytes as f64;
    }

    /// Close out a read burst and update the target.
    ///
    /// Reading more than 80% of the target in one burst doubles the target
    /// (or jumps straight to the burst size if larger); otherwise the target
    /// decays 1% toward the burst size.
    pub fn finish_estimate(&mut self) {
        if self.bytes_read_this_round > self.target_length * 0.8 {
            self.target_length = (2.0 * self.target_length).max(self.bytes_read_this_round);
        } else {
            self.target_length = 0.99 * self.target_length + 0.01 * self.bytes_read_this_round;
        }
        self.target_length = self.target_length.clamp(self.min_chunk, self.max_chunk);
        self.bytes_read_this_round = 0.0;
    }

    /// Current target, clamped to the configured chunk bounds.
    pub fn target_length(&self) -> usize {
        self.target_length as usize
    }
}

/// Ceiling for `SO_RCVLOWAT`.
pub const RCVLOWAT_MAX: usize = 16 * 1024 * 1024;

/// Below this, setting `SO_RCVLOWAT` does not save CPU.
pub const RCVLOWAT_THRESHOLD: usize = 16 * 1024;

/// Compute the next `SO_RCVLOWAT` value, or `None` when the kernel value
/// should be left alone.
///
/// `current` is the last value the kernel reported back.
pub fn compute_rcvlowat(
    incoming_length: usize,
    min_progress_size: usize,
    zerocopy_enabled: bool,
    current: libc::c_int,
) -> Option<libc::c_int> {
    let mut remaining = incoming_length.min(RCVLOWAT_MAX).min(min_progress_size);

    // Setting SO_RCVLOWAT for small quantities does not save on CPU.
    if remaining < RCVLOWAT_THRESHOLD {
        remaining = 0;
    }

    // If zerocopy is off, wake shortly before the full frame is here. More
    // can show up partway through recvmsg() since it takes a while to copy
    // data, so an early wakeup aids latency.
    if !zerocopy_enabled && remaining > 0 {
        remaining -= RCVLOWAT_THRESHOLD;
    }

    // We still do not know the frame size. Do not set SO_RCVLOWAT.
    if current <= 1 && remaining <= 1 {
        return None;
    }

    // Previous value is still valid.
    if current == remaining as libc::c_int {
        return None;
    }

    Some(remaining as libc::c_int)
}
