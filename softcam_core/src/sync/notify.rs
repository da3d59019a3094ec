// Wait/notify channel over a 32-bit sequence word in shared memory
//
// Linux: shared futex (no FUTEX_PRIVATE_FLAG, so waiters in other processes
// mapping the same file are woken).
// Elsewhere: bounded sleep-polling of the same word.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[cfg(not(target_os = "linux"))]
const POLL_SLICE: Duration = Duration::from_millis(2);

/// Bump the sequence and wake every waiter blocked on `word`
///
/// Any state change the waiters should observe must be stored before this call.
pub fn wake_all(word: &AtomicU32) {
    word.fetch_add(1, Ordering::Release);

    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
        );
    }
}

/// Block while `word` still holds `expected`, for at most `timeout`
///
/// May return early (signal, spurious wakeup); callers re-check their predicate.
/// Snapshot `expected` before evaluating the predicate so no wakeup is lost.
pub fn wait_for_change(word: &AtomicU32, expected: u32, timeout: Duration) {
    if timeout.is_zero() || word.load(Ordering::Acquire) != expected {
        return;
    }

    #[cfg(target_os = "linux")]
    {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        // EAGAIN, ETIMEDOUT and EINTR all mean "go look again"
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                &ts as *const libc::timespec,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let deadline = Instant::now() + timeout;
        while word.load(Ordering::Acquire) == expected {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}

/// Wait until `ready` returns true or `timeout` elapses, waking at least every
/// `recheck` to re-evaluate. Returns the final value of `ready`.
pub fn wait_until(
    word: &AtomicU32,
    timeout: Duration,
    recheck: Duration,
    mut ready: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let seq = word.load(Ordering::Acquire);
        if ready() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        wait_for_change(word, seq, recheck.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_wait_returns_when_word_already_changed() {
        let word = AtomicU32::new(5);
        let start = Instant::now();
        wait_for_change(&word, 4, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        wait_for_change(&word, 0, Duration::from_millis(50));
        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn test_wake_all_releases_every_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let flag = Arc::new(AtomicBool::new(false));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let word = word.clone();
                let flag = flag.clone();
                std::thread::spawn(move || {
                    let start = Instant::now();
                    let seen = wait_until(
                        &word,
                        Duration::from_secs(5),
                        Duration::from_secs(5),
                        || flag.load(Ordering::Acquire),
                    );
                    (seen, start.elapsed())
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::Release);
        wake_all(&word);

        for waiter in waiters {
            let (seen, elapsed) = waiter.join().unwrap();
            assert!(seen);
            assert!(elapsed < Duration::from_secs(2));
        }
    }

    #[test]
    fn test_wait_until_honours_deadline() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let seen = wait_until(
            &word,
            Duration::from_millis(150),
            Duration::from_millis(20),
            || false,
        );
        let elapsed = start.elapsed();
        assert!(!seen);
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(600));
    }
}
