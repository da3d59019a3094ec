// Producer liveness: heartbeat thread and the clock it beats with

use crate::error::SoftcamResult;
use crate::memory::FrameRegion;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Nanoseconds on a clock shared by every process on the host
///
/// Unix uses CLOCK_MONOTONIC, which is system-wide and never jumps. Other
/// platforms fall back to wall-clock time.
pub fn monotonic_now_ns() -> u64 {
    #[cfg(unix)]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    }

    #[cfg(not(unix))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Background thread refreshing the header heartbeat of a producer's region
///
/// Stops when [`Heartbeat::stop`] is called or the value is dropped.
pub struct Heartbeat {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn spawn(region: Arc<FrameRegion>, interval: Duration) -> SoftcamResult<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let name = region.shm().name().to_string();

        let thread = std::thread::Builder::new()
            .name(format!("softcam-heartbeat-{}", name))
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        region.header().beat(monotonic_now_ns());
                    }
                    // Explicit stop or the owning handle went away
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        log::debug!(
            "Heartbeat started for '{}' every {:?}",
            name,
            interval
        );

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stop beating and wait for the thread to exit
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FrameFormat, DEFAULT_MAX_FRAME_BYTES};

    #[test]
    fn test_clock_is_monotonic() {
        let a = monotonic_now_ns();
        std::thread::sleep(Duration::from_millis(5));
        let b = monotonic_now_ns();
        assert!(b > a);
        assert!(b - a >= 5_000_000);
    }

    #[test]
    fn test_heartbeat_refreshes_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let format = FrameFormat {
            width: 2,
            height: 2,
            framerate: 0.0,
        };
        let region = Arc::new(
            FrameRegion::create(
                dir.path(),
                "beat",
                format,
                Duration::from_secs(1),
                0,
                DEFAULT_MAX_FRAME_BYTES,
            )
            .unwrap(),
        );

        let mut heartbeat = Heartbeat::spawn(region.clone(), Duration::from_millis(10)).unwrap();
        assert!(heartbeat.is_running());

        std::thread::sleep(Duration::from_millis(100));
        let beat = region.header().last_heartbeat_ns();
        assert!(beat > 0);
        assert!(!region.header().heartbeat_expired(monotonic_now_ns()));

        heartbeat.stop();
        assert!(!heartbeat.is_running());

        let frozen = region.header().last_heartbeat_ns();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(region.header().last_heartbeat_ns(), frozen);
    }
}
