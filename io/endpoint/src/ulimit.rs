//! Memlock limit probes.
//!
//! Zero-copy sends pin pages, bounded per-process by `RLIMIT_MEMLOCK` and
//! per-socket by the hard memlock ulimit. Both probes are computed once and
//! cached for the process lifetime. A probe reporting 0 disables zero-copy
//! at endpoint construction; nonzero values feed the diagnostics printed
//! when a zero-copy send hits `ENOBUFS`.

use std::path::Path;
use std::sync::OnceLock;

const CAP_SYS_RESOURCE: libc::c_int = 24;

fn cap_is_supported(cap: libc::c_int) -> bool {
    unsafe { libc::prctl(libc::PR_CAPBSET_READ, cap, 0, 0, 0) > 0 }
}

/// `RLIMIT_MEMLOCK` hard limit, or `u64::MAX` for privileged processes.
/// Returns 0 when the limit cannot be read.
pub fn rlimit_memlock_max() -> u64 {
    static CACHE: OnceLock<u64> = OnceLock::new();
    *CACHE.get_or_init(|| {
        if cap_is_supported(CAP_SYS_RESOURCE) {
            // The limit is ignored for privileged users.
            return u64::MAX;
        }
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut limit) } != 0 {
            return 0;
        }
        limit.rlim_max as u64
    })
}

/// First `* hard memlock <value>` found under `/etc/security/limits.d/`,
/// falling back to `/etc/security/limits.conf`. `unlimited`/`infinity` map
/// to `u64::MAX`; absent maps to 0.
pub fn ulimit_hard_memlock() -> u64 {
    static CACHE: OnceLock<u64> = OnceLock::new();
    *CACHE.get_or_init(compute_ulimit_hard_memlock)
}

fn compute_ulimit_hard_memlock() -> u64 {
    if cap_is_supported(CAP_SYS_RESOURCE) {
        return u64::MAX;
    }
    if let Ok(dir) = std::fs::read_dir("/etc/security/limits.d") {
        for entry in dir.flatten() {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let value = parse_memlock_file(&entry.path());
            if value != 0 {
                return value;
            }
        }
    }
    parse_memlock_file(Path::new("/etc/security/limits.conf"))
}

fn parse_memlock_file(path: &Path) -> u64 {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_hard_memlock(&contents),
        Err(_) => 0,
    }
}

/// Extract the value of the first `* hard memlock <value>` line.
fn parse_hard_memlock(contents: &str) -> u64 {
    const PREFIX: &str = "* hard memlock";
    let Some(start) = contents.find(PREFIX) else {
        return 0;
    };
    let rest = &contents[start + PREFIX.len()..];
    let line = match rest.find('\n') {
        Some(end) => &rest[..end],
        None => rest,
    };
    let Some(value) = line.split_whitespace().next() else {
        return 0;
    };
    match value {
        "unlimited" | "infinity" => u64::MAX,
        _ => value.parse::<u64>().unwrap_or(0),
    }
}
