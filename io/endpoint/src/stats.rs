//! Process-global endpoint counters, exposed through metriken.

use metriken::metric;
use metrics::{Counter, CounterGroup};

mod slots {
    pub const READ: usize = 0;
    pub const WRITE: usize = 1;
    pub const ALLOC_8K: usize = 0;
    pub const ALLOC_64K: usize = 1;
    pub const SENDS: usize = 0;
    pub const FALLBACKS: usize = 1;
}

static SYSCALL: CounterGroup = CounterGroup::new();
static TRAFFIC: CounterGroup = CounterGroup::new();
static ALLOC: CounterGroup = CounterGroup::new();
static ZEROCOPY: CounterGroup = CounterGroup::new();

#[metric(
    name = "endpoint_syscall_read",
    description = "recvmsg calls issued on the data path"
)]
pub static SYSCALL_READ: Counter = Counter::new(&SYSCALL, slots::READ);

#[metric(
    name = "endpoint_syscall_write",
    description = "sendmsg calls issued on the data path"
)]
pub static SYSCALL_WRITE: Counter = Counter::new(&SYSCALL, slots::WRITE);

#[metric(
    name = "endpoint_read_bytes",
    description = "bytes received from the kernel"
)]
pub static READ_BYTES: Counter = Counter::new(&TRAFFIC, slots::READ);

#[metric(
    name = "endpoint_write_bytes",
    description = "bytes the kernel accepted for transmission"
)]
pub static WRITE_BYTES: Counter = Counter::new(&TRAFFIC, slots::WRITE);

#[metric(
    name = "endpoint_read_alloc_8k",
    description = "8 KiB read-buffer slices allocated"
)]
pub static READ_ALLOC_8K: Counter = Counter::new(&ALLOC, slots::ALLOC_8K);

#[metric(
    name = "endpoint_read_alloc_64k",
    description = "64 KiB read-buffer slices allocated"
)]
pub static READ_ALLOC_64K: Counter = Counter::new(&ALLOC, slots::ALLOC_64K);

#[metric(
    name = "endpoint_zerocopy_sends",
    description = "writes dispatched through MSG_ZEROCOPY"
)]
pub static ZEROCOPY_SENDS: Counter = Counter::new(&ZEROCOPY, slots::SENDS);

#[metric(
    name = "endpoint_zerocopy_fallbacks",
    description = "writes above the zero-copy threshold that fell back to the copy path"
)]
pub static ZEROCOPY_FALLBACKS: Counter = Counter::new(&ZEROCOPY, slots::FALLBACKS);
