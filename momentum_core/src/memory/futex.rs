//! Process-shared wait/wake on a 32-bit word in shared memory.
//!
//! On Linux this is a plain `futex(2)` without `FUTEX_PRIVATE_FLAG`, so waiters
//! and wakers may live in different processes mapping the same segment.
//! Elsewhere waits degrade to short sleeps and wakes are no-ops.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Fallback sleep granularity when no futex is available
#[cfg(not(target_os = "linux"))]
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Block while `*word == expected`, for at most `timeout`.
///
/// Returns on wake, timeout, signal or value change; callers must re-check
/// their condition.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

    // SAFETY: `word` is a valid, aligned u32 for the duration of the call.
    // EAGAIN / ETIMEDOUT / EINTR are all "go re-check", so the result is ignored.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake up to `count` waiters blocked on `word`
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: i32) {
    // SAFETY: see futex_wait
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;
    if word.load(Ordering::Acquire) != expected {
        return;
    }
    let nap = timeout.map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL));
    std::thread::sleep(nap);
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: i32) {}

/// Wake every waiter on `word`
pub fn futex_wake_all(word: &AtomicU32) {
    futex_wake(word, i32::MAX);
}
