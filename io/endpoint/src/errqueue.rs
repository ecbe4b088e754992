//! Socket error-queue surface.
//!
//! Constants, control-message walking, and `SCM_TIMESTAMPING_OPT_STATS`
//! parsing for `MSG_ERRQUEUE` drainage. Constants that older libc builds may
//! not export are defined here with their kernel ABI values; the kernel
//! guarantees they never change.

use libc::c_int;

use crate::telemetry::ConnMetrics;

pub const TCP_INQ: c_int = 36;
pub const TCP_CM_INQ: c_int = TCP_INQ;
pub const SO_ZEROCOPY: c_int = 60;
pub const MSG_ZEROCOPY: c_int = 0x400_0000;
pub const MSG_ERRQUEUE: c_int = 0x2000;

pub const SOL_IP: c_int = 0;
pub const SOL_IPV6: c_int = 41;
pub const IP_RECVERR: c_int = 11;
pub const IPV6_RECVERR: c_int = 25;

pub const SO_EE_ORIGIN_TIMESTAMPING: u8 = 4;
pub const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

pub const SCM_TSTAMP_SND: u32 = 0;
pub const SCM_TSTAMP_SCHED: u32 = 1;
pub const SCM_TSTAMP_ACK: u32 = 2;

pub const SO_TIMESTAMPING: c_int = 37;
pub const SCM_TIMESTAMPING: c_int = SO_TIMESTAMPING;
pub const SCM_TIMESTAMPING_OPT_STATS: c_int = 54;

bitflags::bitflags! {
    /// `SOF_TIMESTAMPING_*` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimestampFlags: u32 {
        const TX_SOFTWARE = 1 << 1;
        const SOFTWARE = 1 << 4;
        const OPT_ID = 1 << 7;
        const TX_SCHED = 1 << 8;
        const TX_ACK = 1 << 9;
        const OPT_TSONLY = 1 << 11;
        const OPT_STATS = 1 << 12;
    }
}

/// Socket-level `SO_TIMESTAMPING` options enabled once per endpoint.
pub fn timestamping_socket_options() -> u32 {
    (TimestampFlags::SOFTWARE
        | TimestampFlags::OPT_ID
        | TimestampFlags::OPT_TSONLY
        | TimestampFlags::OPT_STATS)
        .bits()
}

/// Per-send record mask attached as a cmsg to timestamped writes.
pub fn timestamping_recording_options() -> u32 {
    (TimestampFlags::TX_SCHED | TimestampFlags::TX_SOFTWARE | TimestampFlags::TX_ACK).bits()
}

/// `struct scm_timestamping`: software, legacy, and hardware timestamps.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ScmTimestamping {
    pub ts: [libc::timespec; 3],
}

/// `struct sock_extended_err`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockExtendedErr {
    pub ee_errno: u32,
    pub ee_origin: u8,
    pub ee_type: u8,
    pub ee_code: u8,
    pub ee_pad: u8,
    pub ee_info: u32,
    pub ee_data: u32,
}

/// True for the IPv4/IPv6 extended-error cmsg levels.
pub fn is_ip_recverr(level: c_int, ty: c_int) -> bool {
    (level == SOL_IP && ty == IP_RECVERR) || (level == SOL_IPV6 && ty == IPV6_RECVERR)
}

/// True for a zero-copy completion: extended error with errno 0 and
/// zero-copy origin.
pub fn is_zerocopy(serr: &SockExtendedErr) -> bool {
    serr.ee_errno == 0 && serr.ee_origin == SO_EE_ORIGIN_ZEROCOPY
}

/// Read a `sock_extended_err` out of cmsg payload bytes.
pub fn extended_err(data: &[u8]) -> Option<SockExtendedErr> {
    if data.len() < std::mem::size_of::<SockExtendedErr>() {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const SockExtendedErr) })
}

/// Read an `scm_timestamping` out of cmsg payload bytes.
pub fn scm_timestamping(data: &[u8]) -> Option<ScmTimestamping> {
    if data.len() < std::mem::size_of::<ScmTimestamping>() {
        return None;
    }
    Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const ScmTimestamping) })
}

/// Control buffer sized for an `scm_timestamping`, an extended error with
/// address, and a full set of OPT_STATS netlink attributes.
pub const CONTROL_BUFFER_LEN: usize = 768;

/// An aligned control-message buffer for `recvmsg`/`sendmsg`.
#[repr(C, align(8))]
pub struct ControlBuffer {
    data: [u8; CONTROL_BUFFER_LEN],
}

impl ControlBuffer {
    pub fn new() -> Self {
        Self {
            data: [0; CONTROL_BUFFER_LEN],
        }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.data.as_mut_ptr() as *mut libc::c_void
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        CONTROL_BUFFER_LEN
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for ControlBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// One control message: level, type, and payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct Cmsg<'a> {
    pub level: c_int,
    pub ty: c_int,
    pub data: &'a [u8],
}

/// Align a cmsg length up to the platform boundary (size_t, per the kernel's
/// CMSG_ALIGN).
#[inline]
fn cmsg_align(len: usize) -> usize {
    let align = std::mem::size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

/// Bytes of a control-message header, aligned (CMSG_LEN(0)).
#[inline]
fn cmsg_hdr_len() -> usize {
    cmsg_align(std::mem::size_of::<libc::cmsghdr>())
}

fn make_cmsghdr(len: usize, level: c_int, ty: c_int) -> libc::cmsghdr {
    let mut hdr: libc::cmsghdr = unsafe { std::mem::zeroed() };
    hdr.cmsg_len = len as _;
    hdr.cmsg_level = level;
    hdr.cmsg_type = ty;
    hdr
}

/// Collect the control messages attached to `msg`. Reads headers unaligned,
/// so the control buffer needs no particular alignment.
///
/// # Safety
///
/// `msg.msg_control`/`msg_controllen` must describe a valid, initialized
/// buffer that outlives the returned slices.
pub unsafe fn collect_cmsgs(msg: &libc::msghdr) -> Vec<Cmsg<'_>> {
    let mut out = Vec::new();
    if msg.msg_control.is_null() {
        return out;
    }
    let base = msg.msg_control as *const u8;
    let total = msg.msg_controllen as usize;
    let hdr_len = cmsg_hdr_len();
    let mut offset = 0usize;
    while offset + hdr_len <= total {
        let hdr = std::ptr::read_unaligned(base.add(offset) as *const libc::cmsghdr);
        let cmsg_len = hdr.cmsg_len as usize;
        if cmsg_len < hdr_len || offset + cmsg_len > total {
            break;
        }
        let data = std::slice::from_raw_parts(base.add(offset + hdr_len), cmsg_len - hdr_len);
        out.push(Cmsg {
            level: hdr.cmsg_level,
            ty: hdr.cmsg_type,
            data,
        });
        offset += cmsg_align(cmsg_len);
    }
    out
}

/// Append one control message (header + padded payload) to `buf`.
pub fn encode_cmsg(buf: &mut Vec<u8>, level: c_int, ty: c_int, data: &[u8]) {
    let hdr_len = cmsg_hdr_len();
    let len = hdr_len + data.len();
    let space = cmsg_align(len);
    let start = buf.len();
    buf.resize(start + space, 0);
    let hdr = make_cmsghdr(len, level, ty);
    unsafe {
        std::ptr::write_unaligned(buf.as_mut_ptr().add(start) as *mut libc::cmsghdr, hdr);
        std::ptr::copy_nonoverlapping(
            data.as_ptr(),
            buf.as_mut_ptr().add(start + hdr_len),
            data.len(),
        );
    }
}

/// Write a single cmsg with a `u32` payload into the front of `buf`;
/// returns the control length to put in `msg_controllen`.
pub fn encode_u32_cmsg(buf: &mut [u8], level: c_int, ty: c_int, value: u32) -> usize {
    let hdr_len = cmsg_hdr_len();
    let len = hdr_len + 4;
    let space = cmsg_align(len);
    assert!(buf.len() >= space);
    buf[..space].fill(0);
    let hdr = make_cmsghdr(len, level, ty);
    unsafe {
        std::ptr::write_unaligned(buf.as_mut_ptr() as *mut libc::cmsghdr, hdr);
        std::ptr::copy_nonoverlapping(
            value.to_ne_bytes().as_ptr(),
            buf.as_mut_ptr().add(hdr_len),
            4,
        );
    }
    space
}

// TCP_NLA_* attribute types carried in SCM_TIMESTAMPING_OPT_STATS.
const TCP_NLA_BUSY: u16 = 1;
const TCP_NLA_RWND_LIMITED: u16 = 2;
const TCP_NLA_SNDBUF_LIMITED: u16 = 3;
const TCP_NLA_DATA_SEGS_OUT: u16 = 4;
const TCP_NLA_TOTAL_RETRANS: u16 = 5;
const TCP_NLA_PACING_RATE: u16 = 6;
const TCP_NLA_DELIVERY_RATE: u16 = 7;
const TCP_NLA_SND_CWND: u16 = 8;
const TCP_NLA_REORDERING: u16 = 9;
const TCP_NLA_MIN_RTT: u16 = 10;
const TCP_NLA_RECUR_RETRANS: u16 = 11;
const TCP_NLA_DELIVERY_RATE_APP_LMT: u16 = 12;
const TCP_NLA_SNDQ_SIZE: u16 = 13;
const TCP_NLA_CA_STATE: u16 = 14;
const TCP_NLA_SND_SSTHRESH: u16 = 15;
const TCP_NLA_DELIVERED: u16 = 16;
const TCP_NLA_DELIVERED_CE: u16 = 17;
const TCP_NLA_BYTES_SENT: u16 = 18;
const TCP_NLA_BYTES_RETRANS: u16 = 19;
const TCP_NLA_DSACK_DUPS: u16 = 20;
const TCP_NLA_REORD_SEEN: u16 = 21;
const TCP_NLA_SRTT: u16 = 22;

const NLA_HDRLEN: usize = 4;
const NLA_ALIGNTO: usize = 4;

fn read_nla_value(payload: &[u8]) -> Option<u64> {
    match payload.len() {
        1 => Some(payload[0] as u64),
        2 => Some(u16::from_ne_bytes(payload.try_into().ok()?) as u64),
        4 => Some(u32::from_ne_bytes(payload.try_into().ok()?) as u64),
        8 => Some(u64::from_ne_bytes(payload.try_into().ok()?)),
        _ => None,
    }
}

/// Parse the netlink attributes of an OPT_STATS message into metrics.
/// Unknown attributes are skipped.
pub fn parse_opt_stats(data: &[u8]) -> ConnMetrics {
    let mut metrics = ConnMetrics::default();
    let mut offset = 0usize;
    while offset + NLA_HDRLEN <= data.len() {
        let nla_len =
            u16::from_ne_bytes([data[offset], data[offset + 1]]) as usize;
        let nla_type = u16::from_ne_bytes([data[offset + 2], data[offset + 3]]);
        if nla_len < NLA_HDRLEN || offset + nla_len > data.len() {
            break;
        }
        let value = read_nla_value(&data[offset + NLA_HDRLEN..offset + nla_len]);
        match nla_type {
            TCP_NLA_BUSY => metrics.busy_usec = value,
            TCP_NLA_RWND_LIMITED => metrics.rwnd_limited_usec = value,
            TCP_NLA_SNDBUF_LIMITED => metrics.sndbuf_limited_usec = value,
            TCP_NLA_DATA_SEGS_OUT => metrics.packet_sent = value,
            TCP_NLA_TOTAL_RETRANS => metrics.packet_retx = value,
            TCP_NLA_PACING_RATE => metrics.pacing_rate = value,
            TCP_NLA_DELIVERY_RATE => metrics.delivery_rate = value,
            TCP_NLA_SND_CWND => metrics.congestion_window = value,
            TCP_NLA_REORDERING => metrics.reordering = value,
            TCP_NLA_MIN_RTT => metrics.min_rtt = value,
            TCP_NLA_RECUR_RETRANS => metrics.recurring_retrans = value,
            TCP_NLA_DELIVERY_RATE_APP_LMT => metrics.delivery_rate_app_limited = value,
            TCP_NLA_SNDQ_SIZE => metrics.sndq_size = value,
            TCP_NLA_CA_STATE => metrics.ca_state = value,
            TCP_NLA_SND_SSTHRESH => metrics.snd_ssthresh = value,
            TCP_NLA_DELIVERED => metrics.packet_delivered = value,
            TCP_NLA_DELIVERED_CE => metrics.packet_delivered_ce = value,
            TCP_NLA_BYTES_SENT => metrics.bytes_sent = value,
            TCP_NLA_BYTES_RETRANS => metrics.bytes_retrans = value,
            TCP_NLA_DSACK_DUPS => metrics.dsack_dups = value,
            TCP_NLA_REORD_SEEN => metrics.reord_seen = value,
            TCP_NLA_SRTT => metrics.srtt = value,
            _ => {}
        }
        offset += (nla_len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1);
    }
    metrics
}
