//! Scatter/gather planning for vectored sends.
//!
//! Converts a [`SliceBuffer`] position into an iovec array and walks the
//! position back to the first unsent byte after a short write.

use crate::slice_buffer::SliceBuffer;

#[cfg(target_os = "linux")]
const OS_IOV_MAX: usize = libc::UIO_MAXIOV as usize;
#[cfg(not(target_os = "linux"))]
const OS_IOV_MAX: usize = libc::IOV_MAX as usize;

/// Iovec cap per sendmsg call: 260 covers a full frame's worth of slices,
/// clamped to the OS `IOV_MAX` where that is smaller.
pub const MAX_WRITE_IOVEC: usize = if OS_IOV_MAX < 260 { OS_IOV_MAX } else { 260 };

/// Iovec cap per recvmsg call.
pub const MAX_READ_IOVEC: usize = 64;

/// A position in a slice buffer: slice index plus byte offset within it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutOffset {
    pub slice_idx: usize,
    pub byte_idx: usize,
}

/// Result of planning one sendmsg call.
#[derive(Debug, Clone, Copy)]
pub struct IovPlan {
    /// Number of iovec entries filled.
    pub iov_len: usize,
    /// Total bytes covered by the filled entries.
    pub sending_length: usize,
    /// The position before planning; restore to here on EAGAIN/ENOBUFS.
    pub unwind: OutOffset,
}

/// Fill `iov` from `buf` starting at `off`, advancing `off` past the planned
/// bytes. Plans at most `iov.len()` entries.
pub fn populate_iovs(buf: &mut SliceBuffer, off: &mut OutOffset, iov: &mut [libc::iovec]) -> IovPlan {
    let unwind = *off;
    let mut sending_length = 0usize;
    let mut iov_len = 0usize;
    while off.slice_idx != buf.count() && iov_len != iov.len() {
        let slice = buf.slice_at_mut(off.slice_idx);
        let rest = &mut slice[off.byte_idx..];
        iov[iov_len] = libc::iovec {
            iov_base: rest.as_mut_ptr() as *mut libc::c_void,
            iov_len: rest.len(),
        };
        sending_length += rest.len();
        iov_len += 1;
        off.slice_idx += 1;
        off.byte_idx = 0;
    }
    debug_assert!(iov_len > 0);
    IovPlan {
        iov_len,
        sending_length,
        unwind,
    }
}

/// After a short write, walk `off` backward over the planned slices until the
/// unsent suffix is accounted for, leaving it at the first unsent byte.
pub fn update_offset_for_bytes_sent(
    buf: &SliceBuffer,
    off: &mut OutOffset,
    sending_length: usize,
    actually_sent: usize,
) {
    let mut trailing = sending_length - actually_sent;
    while trailing > 0 {
        off.slice_idx -= 1;
        let slice_len = buf.slice_at(off.slice_idx).len();
        if slice_len > trailing {
            off.byte_idx = slice_len - trailing;
            break;
        }
        trailing -= slice_len;
    }
}
