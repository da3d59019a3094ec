//! Frame buffer handle shared between one producer and many consumers
//!
//! A producer [`create`](FrameBuffer::create)s the named region, writes frames
//! and eventually deactivates or releases it. Consumers [`open`](FrameBuffer::open)
//! the same region from any process and block in
//! [`wait_for_new_frame`](FrameBuffer::wait_for_new_frame) until the frame
//! counter moves, the producer deactivates, or the producer's heartbeat stops.
//!
//! Construction never fails loudly: a failed `create` or `open` yields an
//! invalid handle whose accessors all return neutral defaults. Use the
//! `try_*` constructors to get the reason.
//!
//! ```rust,no_run
//! use softcam_core::FrameBuffer;
//! use std::time::Duration;
//!
//! let producer = FrameBuffer::create(320, 240, 60.0);
//! let consumer = FrameBuffer::open();
//! assert!(producer.is_valid() && consumer.is_valid());
//!
//! let frame = vec![0u8; producer.frame_size()];
//! let seen = consumer.frame_counter();
//! producer.write(&frame).unwrap();
//! assert!(consumer.wait_for_new_frame(seen, Duration::from_secs(1)));
//! ```

use crate::config::FrameBufferConfig;
use crate::error::{SoftcamError, SoftcamResult};
use crate::memory::{
    frame_bytes, FrameFormat, FrameHeader, FrameRegion, RegionLock, RegionState, ShmRegion,
};
use crate::sync::{monotonic_now_ns, wait_until, wake_all, Heartbeat};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a valid handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(NonZeroU64);

impl HandleId {
    fn next() -> Self {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        HandleId(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fb#{}", self.0)
    }
}

/// Which side of the region a handle is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

struct Inner {
    id: HandleId,
    role: Role,
    region: Arc<FrameRegion>,
    heartbeat: Option<Heartbeat>,
    recheck: Duration,
}

impl Inner {
    fn header(&self) -> &FrameHeader {
        self.region.header()
    }

    /// Apply the watchdog, then report the active flag
    fn poll_active(&self) -> bool {
        let header = self.header();
        if header.expire_if_stale(monotonic_now_ns()) {
            log::warn!(
                "Producer of frame buffer '{}' (pid {}) silent for over {:?}, deactivating",
                self.region.shm().name(),
                header.producer_pid(),
                header.watchdog_timeout()
            );
            wake_all(header.notify_word());
        }
        header.is_active()
    }

    fn connected(&self) -> bool {
        let header = self.header();
        match self.role {
            Role::Producer => header.connected_count() > 0,
            Role::Consumer => {
                header.producer_attached() && !header.heartbeat_expired(monotonic_now_ns())
            }
        }
    }

    fn recheck_interval(&self) -> Duration {
        self.recheck
            .min(self.header().watchdog_timeout())
            .max(Duration::from_millis(1))
    }
}

/// Handle to a shared frame buffer region
#[derive(Default)]
pub struct FrameBuffer {
    inner: Option<Inner>,
}

impl FrameBuffer {
    /// Create the region under the default name. Returns an invalid handle on failure.
    pub fn create(width: i32, height: i32, framerate: f32) -> Self {
        Self::create_with(&FrameBufferConfig::default(), width, height, framerate)
    }

    /// Create the region described by `config`. Returns an invalid handle on failure.
    pub fn create_with(config: &FrameBufferConfig, width: i32, height: i32, framerate: f32) -> Self {
        Self::try_create(config, width, height, framerate).unwrap_or_else(|e| {
            log::warn!("Failed to create frame buffer '{}': {}", config.name, e);
            Self::default()
        })
    }

    /// Attach to the region under the default name. Returns an invalid handle on failure.
    pub fn open() -> Self {
        Self::open_with(&FrameBufferConfig::default())
    }

    /// Attach to the region described by `config`. Returns an invalid handle on failure.
    pub fn open_with(config: &FrameBufferConfig) -> Self {
        Self::try_open(config).unwrap_or_else(|e| {
            match e {
                SoftcamError::NotFound(_) => {
                    log::debug!("Frame buffer '{}' is not available", config.name)
                }
                e => log::warn!("Failed to open frame buffer '{}': {}", config.name, e),
            }
            Self::default()
        })
    }

    pub fn try_create(
        config: &FrameBufferConfig,
        width: i32,
        height: i32,
        framerate: f32,
    ) -> SoftcamResult<Self> {
        config.validate()?;

        if width <= 0 || height <= 0 {
            return Err(SoftcamError::invalid_argument(format!(
                "dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        if !framerate.is_finite() || framerate < 0.0 {
            return Err(SoftcamError::invalid_argument(format!(
                "framerate must be a non-negative number, got {}",
                framerate
            )));
        }

        let format = FrameFormat {
            width: width as u32,
            height: height as u32,
            framerate,
        };
        // Reject oversized frames before touching the filesystem
        let frame_size = frame_bytes(format.width, format.height, config.max_frame_bytes)?;

        let dir = config.shm_dir();
        let create = || {
            FrameRegion::create(
                &dir,
                &config.name,
                format,
                config.watchdog_timeout(),
                monotonic_now_ns(),
                config.max_frame_bytes,
            )
        };

        let region = match create() {
            Ok(region) => region,
            Err(SoftcamError::AlreadyExists(_)) => {
                // Probe, removal and re-creation must not interleave with
                // another producer doing the same
                let _lock = RegionLock::acquire(&dir, &config.name)?;
                match FrameRegion::probe(&dir, &config.name, monotonic_now_ns())? {
                    RegionState::Live => {
                        return Err(SoftcamError::AlreadyExists(config.name.clone()));
                    }
                    RegionState::Stale => {
                        log::warn!(
                            "Replacing inactive frame buffer region '{}'",
                            config.name
                        );
                        ShmRegion::remove(&dir, &config.name)?;
                        create()?
                    }
                    RegionState::Missing => create()?,
                }
            }
            Err(e) => return Err(e),
        };

        let region = Arc::new(region);
        let heartbeat = Heartbeat::spawn(region.clone(), config.heartbeat_interval())?;

        log::info!(
            "Created frame buffer '{}' ({}x{} @ {} fps, {} bytes per frame)",
            config.name,
            format.width,
            format.height,
            format.framerate,
            frame_size
        );

        Ok(Self {
            inner: Some(Inner {
                id: HandleId::next(),
                role: Role::Producer,
                region,
                heartbeat: Some(heartbeat),
                recheck: config.recheck_interval(),
            }),
        })
    }

    pub fn try_open(config: &FrameBufferConfig) -> SoftcamResult<Self> {
        config.validate()?;

        let region = FrameRegion::open(&config.shm_dir(), &config.name)?;
        let header = region.header();
        let connected = header.attach_consumer();
        wake_all(header.notify_word());

        log::info!(
            "Opened frame buffer '{}' ({}x{}, {} consumer(s) connected)",
            config.name,
            header.width(),
            header.height(),
            connected
        );

        Ok(Self {
            inner: Some(Inner {
                id: HandleId::next(),
                role: Role::Consumer,
                region: Arc::new(region),
                heartbeat: None,
                recheck: config.recheck_interval(),
            }),
        })
    }

    /// Invalidate this handle
    ///
    /// A producer stops its heartbeat and unlinks the region name, so later
    /// `open` calls fail and attached consumers see the watchdog fire. A
    /// consumer only detaches itself.
    pub fn release(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        let name = inner.region.shm().name().to_string();

        match inner.role {
            Role::Producer => {
                if let Some(mut heartbeat) = inner.heartbeat.take() {
                    heartbeat.stop();
                }
                let header = inner.region.header();
                header.set_producer_attached(false);
                wake_all(header.notify_word());
                inner.region.shm().unlink();
                log::info!("Released frame buffer '{}' ({})", name, inner.id);
            }
            Role::Consumer => {
                let remaining = inner.region.header().detach_consumer();
                log::debug!(
                    "Detached from frame buffer '{}' ({}, {} consumer(s) left)",
                    name,
                    inner.id,
                    remaining
                );
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// Opaque identity while valid
    pub fn handle(&self) -> Option<HandleId> {
        self.inner.as_ref().map(|inner| inner.id)
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.as_ref().map(|inner| inner.role)
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.as_ref().map(|inner| inner.region.shm().name())
    }

    fn header(&self) -> Option<&FrameHeader> {
        self.inner.as_ref().map(Inner::header)
    }

    pub fn width(&self) -> u32 {
        self.header().map_or(0, FrameHeader::width)
    }

    pub fn height(&self) -> u32 {
        self.header().map_or(0, FrameHeader::height)
    }

    pub fn framerate(&self) -> f32 {
        self.header().map_or(0.0, FrameHeader::framerate)
    }

    pub fn format(&self) -> Option<FrameFormat> {
        self.header().map(|header| FrameFormat {
            width: header.width(),
            height: header.height(),
            framerate: header.framerate(),
        })
    }

    /// Bytes expected by [`write`](Self::write) and [`read_frame`](Self::read_frame)
    pub fn frame_size(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.region.frame_size())
    }

    pub fn frame_counter(&self) -> u64 {
        self.header().map_or(0, FrameHeader::frame_counter)
    }

    pub fn active(&self) -> bool {
        self.inner.as_ref().is_some_and(Inner::poll_active)
    }

    /// Producer: at least one consumer attached. Consumer: the producer is
    /// still attached and beating.
    pub fn connected(&self) -> bool {
        self.inner.as_ref().is_some_and(Inner::connected)
    }

    pub fn connected_count(&self) -> u32 {
        self.header().map_or(0, FrameHeader::connected_count)
    }

    pub fn producer_pid(&self) -> Option<u32> {
        self.header().map(FrameHeader::producer_pid)
    }

    fn producer(&self) -> SoftcamResult<&Inner> {
        let inner = self.inner.as_ref().ok_or(SoftcamError::InvalidHandle)?;
        if inner.role != Role::Producer {
            return Err(SoftcamError::NotProducer);
        }
        Ok(inner)
    }

    /// Publish one frame of exactly [`frame_size`](Self::frame_size) bytes
    ///
    /// Returns the new frame counter.
    pub fn write(&self, pixels: &[u8]) -> SoftcamResult<u64> {
        let inner = self.producer()?;
        let header = inner.header();
        if !header.is_active() {
            return Err(SoftcamError::Inactive);
        }

        inner.region.copy_in(pixels)?;
        let counter = header.advance_frame();
        wake_all(header.notify_word());
        Ok(counter)
    }

    /// Permanently mark the region inactive and wake every waiter
    pub fn deactivate(&self) -> SoftcamResult<()> {
        let inner = self.producer()?;
        let header = inner.header();
        if header.deactivate() {
            log::info!(
                "Deactivated frame buffer '{}' at frame {}",
                inner.region.shm().name(),
                header.frame_counter()
            );
        }
        wake_all(header.notify_word());
        Ok(())
    }

    /// Block until the frame counter passes `observed`, the region goes
    /// inactive, or `timeout` elapses.
    ///
    /// Returns `false` only when the region is (or becomes) inactive; a new
    /// frame or a plain timeout both return `true`.
    pub fn wait_for_new_frame(&self, observed: u64, timeout: Duration) -> bool {
        let Some(inner) = self.inner.as_ref() else {
            return false;
        };
        let header = inner.header();

        let mut inactive = false;
        wait_until(header.notify_word(), timeout, inner.recheck_interval(), || {
            if header.frame_counter() > observed {
                return true;
            }
            inactive = !inner.poll_active();
            inactive
        });
        !inactive
    }

    /// Block until [`connected`](Self::connected) holds or `timeout` elapses
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        let Some(inner) = self.inner.as_ref() else {
            return false;
        };
        wait_until(
            inner.header().notify_word(),
            timeout,
            inner.recheck_interval(),
            || inner.connected(),
        )
    }

    /// Copy the current frame into `dst` and return the counter it belongs to
    pub fn read_frame(&self, dst: &mut [u8]) -> SoftcamResult<u64> {
        let inner = self.inner.as_ref().ok_or(SoftcamError::InvalidHandle)?;
        let counter = inner.header().frame_counter();
        inner.region.copy_out(dst)?;
        Ok(counter)
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("FrameBuffer")
                .field("id", &inner.id)
                .field("role", &inner.role)
                .field("name", &inner.region.shm().name())
                .field("width", &self.width())
                .field("height", &self.height())
                .field("frame_counter", &self.frame_counter())
                .finish_non_exhaustive(),
            None => f.write_str("FrameBuffer(invalid)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ids_are_unique() {
        let a = HandleId::next();
        let b = HandleId::next();
        assert_ne!(a, b);
        assert!(a.get() > 0);
        assert!(a.to_string().starts_with("fb#"));
    }

    #[test]
    fn test_default_handle_is_invalid() {
        let fb = FrameBuffer::default();
        assert!(!fb.is_valid());
        assert_eq!(fb.handle(), None);
        assert_eq!(fb.role(), None);
        assert_eq!(fb.frame_size(), 0);
        assert!(!fb.wait_for_new_frame(0, Duration::from_millis(10)));
        assert!(!fb.wait_for_connection(Duration::from_millis(10)));
        assert!(matches!(fb.write(&[]), Err(SoftcamError::InvalidHandle)));
        assert!(matches!(fb.deactivate(), Err(SoftcamError::InvalidHandle)));
        assert_eq!(format!("{:?}", fb), "FrameBuffer(invalid)");
    }
}
