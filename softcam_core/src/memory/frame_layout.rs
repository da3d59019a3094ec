//! Frame buffer layout inside a shared memory region
//!
//! ```text
//! [FrameHeader (64-byte aligned)][pixels: width * height * BYTES_PER_PIXEL]
//! ```
//!
//! Every header field is atomic: the producer, any number of consumers and the
//! watchdog touch it concurrently from different processes.

use super::platform::region_path;
use super::shm_region::ShmRegion;
use crate::error::{SoftcamError, SoftcamResult};
use std::mem;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Pixels are 24-bit RGB
pub const BYTES_PER_PIXEL: usize = 3;

/// Largest accepted width or height
pub const MAX_DIMENSION: u32 = 16384;

/// Default allocation cap for the pixel buffer (one 4K RGB frame)
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 3840 * 2160 * BYTES_PER_PIXEL as u64;

const HEADER_MAGIC: u32 = 0x5343_4642; // "SCFB"
const LAYOUT_VERSION: u32 = 1;

/// Bytes reserved for the header; pixel data starts here
pub const HEADER_SIZE: usize = mem::size_of::<FrameHeader>();

/// Control block at the start of every frame buffer region
#[repr(C, align(64))]
pub struct FrameHeader {
    magic: AtomicU32,
    version: AtomicU32,
    width: AtomicU32,
    height: AtomicU32,
    framerate_bits: AtomicU32,
    active: AtomicU32,
    producer_attached: AtomicU32,
    producer_pid: AtomicU32,
    frame_counter: AtomicU64,
    last_heartbeat_ns: AtomicU64,
    watchdog_timeout_ms: AtomicU64,
    connected_count: AtomicU32,
    // Futex word of the wait/notify channel
    notify_seq: AtomicU32,
}

impl FrameHeader {
    /// Fill a zeroed header and publish it. The magic is stored last.
    fn init(&self, format: FrameFormat, watchdog: Duration, now_ns: u64) {
        self.width.store(format.width, Ordering::Relaxed);
        self.height.store(format.height, Ordering::Relaxed);
        self.framerate_bits
            .store(format.framerate.to_bits(), Ordering::Relaxed);
        self.frame_counter.store(0, Ordering::Relaxed);
        self.connected_count.store(0, Ordering::Relaxed);
        self.watchdog_timeout_ms
            .store(watchdog.as_millis() as u64, Ordering::Relaxed);
        self.last_heartbeat_ns.store(now_ns, Ordering::Relaxed);
        self.producer_pid.store(std::process::id(), Ordering::Relaxed);
        self.producer_attached.store(1, Ordering::Relaxed);
        self.active.store(1, Ordering::Relaxed);
        self.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        self.magic.store(HEADER_MAGIC, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) == HEADER_MAGIC
            && self.version.load(Ordering::Relaxed) == LAYOUT_VERSION
    }

    pub fn width(&self) -> u32 {
        self.width.load(Ordering::Relaxed)
    }

    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn framerate(&self) -> f32 {
        f32::from_bits(self.framerate_bits.load(Ordering::Relaxed))
    }

    /// Bytes in one frame as described by this header
    pub fn frame_size(&self) -> usize {
        self.width() as usize * self.height() as usize * BYTES_PER_PIXEL
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter.load(Ordering::Acquire)
    }

    /// Publish a new frame. Pixel stores made before this call are visible
    /// to anyone who observes the returned counter.
    pub fn advance_frame(&self) -> u64 {
        self.frame_counter.fetch_add(1, Ordering::Release) + 1
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    /// Clear the active flag. Returns true if this call performed the transition.
    pub fn deactivate(&self) -> bool {
        self.active.swap(0, Ordering::AcqRel) != 0
    }

    pub fn producer_attached(&self) -> bool {
        self.producer_attached.load(Ordering::Acquire) != 0
    }

    pub fn set_producer_attached(&self, attached: bool) {
        self.producer_attached
            .store(attached as u32, Ordering::Release);
    }

    pub fn producer_pid(&self) -> u32 {
        self.producer_pid.load(Ordering::Relaxed)
    }

    pub fn connected_count(&self) -> u32 {
        self.connected_count.load(Ordering::Acquire)
    }

    pub fn attach_consumer(&self) -> u32 {
        self.connected_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn detach_consumer(&self) -> u32 {
        match self
            .connected_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    pub fn last_heartbeat_ns(&self) -> u64 {
        self.last_heartbeat_ns.load(Ordering::Acquire)
    }

    pub fn beat(&self, now_ns: u64) {
        self.last_heartbeat_ns.store(now_ns, Ordering::Release);
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms.load(Ordering::Relaxed))
    }

    /// Whether the producer has been silent longer than the watchdog timeout
    pub fn heartbeat_expired(&self, now_ns: u64) -> bool {
        let silent_ns = now_ns.saturating_sub(self.last_heartbeat_ns());
        silent_ns > self.watchdog_timeout().as_nanos() as u64
    }

    /// Declare the region inactive if the heartbeat is stale.
    /// Returns true only for the caller that performed the transition.
    pub fn expire_if_stale(&self, now_ns: u64) -> bool {
        if !self.is_active() || !self.heartbeat_expired(now_ns) {
            return false;
        }
        self.active
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn notify_word(&self) -> &AtomicU32 {
        &self.notify_seq
    }
}

/// What an existing name refers to, as seen by a would-be producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Missing,
    /// Active with a fresh heartbeat, or still being initialised
    Live,
    /// Deactivated, or its producer stopped beating
    Stale,
}

/// Negotiated frame format, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: f32,
}

/// A mapped region with a validated header
#[derive(Debug)]
pub struct FrameRegion {
    region: ShmRegion,
    header: NonNull<FrameHeader>,
    frame_size: usize,
}

unsafe impl Send for FrameRegion {}
unsafe impl Sync for FrameRegion {}

/// Validate dimensions and compute the pixel buffer size
pub fn frame_bytes(width: u32, height: u32, max_frame_bytes: u64) -> SoftcamResult<usize> {
    if width == 0 || height == 0 {
        return Err(SoftcamError::invalid_argument(format!(
            "dimensions must be positive, got {}x{}",
            width, height
        )));
    }

    let requested = width as u64 * height as u64 * BYTES_PER_PIXEL as u64;
    if width > MAX_DIMENSION || height > MAX_DIMENSION || requested > max_frame_bytes {
        return Err(SoftcamError::Oversized {
            requested,
            limit: max_frame_bytes,
        });
    }

    usize::try_from(requested).map_err(|_| SoftcamError::Oversized {
        requested,
        limit: max_frame_bytes,
    })
}

impl FrameRegion {
    /// Allocate a fresh region and publish its header
    pub fn create(
        dir: &Path,
        name: &str,
        format: FrameFormat,
        watchdog: Duration,
        now_ns: u64,
        max_frame_bytes: u64,
    ) -> SoftcamResult<Self> {
        let frame_size = frame_bytes(format.width, format.height, max_frame_bytes)?;
        let region = ShmRegion::create_exclusive(dir, name, HEADER_SIZE + frame_size)?;
        let header = match Self::header_ptr(&region) {
            Ok(header) => header,
            Err(e) => {
                region.discard();
                return Err(e);
            }
        };

        unsafe { header.as_ref() }.init(format, watchdog, now_ns);

        Ok(Self {
            region,
            header,
            frame_size,
        })
    }

    /// Attach to an existing region, validating its header against its size
    pub fn open(dir: &Path, name: &str) -> SoftcamResult<Self> {
        let region = ShmRegion::open(dir, name)?;
        if region.size() < HEADER_SIZE {
            return Err(SoftcamError::NotFound(name.to_string()));
        }

        let header = Self::header_ptr(&region)?;
        let hdr = unsafe { header.as_ref() };
        if !hdr.is_initialized() {
            return Err(SoftcamError::NotFound(name.to_string()));
        }

        let frame_size = hdr.frame_size();
        if frame_size == 0 || region.size() < HEADER_SIZE + frame_size {
            return Err(SoftcamError::corrupt(format!(
                "region '{}' is {} bytes, header describes {} pixel bytes",
                name,
                region.size(),
                frame_size
            )));
        }

        Ok(Self {
            region,
            header,
            frame_size,
        })
    }

    /// Inspect whatever currently lives under `name`
    pub fn probe(dir: &Path, name: &str, now_ns: u64) -> SoftcamResult<RegionState> {
        let region = match ShmRegion::open(dir, name) {
            Ok(region) => region,
            Err(SoftcamError::NotFound(_)) => {
                // A creator may not have sized the file yet
                return Ok(match std::fs::metadata(region_path(dir, name)) {
                    Ok(meta) => Self::initializing_state(
                        meta.modified().ok().and_then(|m| m.elapsed().ok()),
                    ),
                    Err(_) => RegionState::Missing,
                });
            }
            Err(e) => return Err(e),
        };

        if region.size() < HEADER_SIZE {
            return Ok(Self::initializing_state(region.age()));
        }

        let header = Self::header_ptr(&region)?;
        let hdr = unsafe { header.as_ref() };
        if !hdr.is_initialized() {
            return Ok(Self::initializing_state(region.age()));
        }

        if hdr.is_active() && !hdr.heartbeat_expired(now_ns) {
            Ok(RegionState::Live)
        } else {
            Ok(RegionState::Stale)
        }
    }

    // A half-created region blocks creation for one default watchdog period
    fn initializing_state(age: Option<Duration>) -> RegionState {
        match age {
            Some(age) if age > crate::config::DEFAULT_WATCHDOG_TIMEOUT => RegionState::Stale,
            _ => RegionState::Live,
        }
    }

    fn header_ptr(region: &ShmRegion) -> SoftcamResult<NonNull<FrameHeader>> {
        let ptr = region.as_ptr() as *mut FrameHeader;
        if !(ptr as usize).is_multiple_of(mem::align_of::<FrameHeader>()) {
            return Err(SoftcamError::corrupt("header pointer not properly aligned"));
        }
        NonNull::new(ptr).ok_or_else(|| SoftcamError::corrupt("null header pointer"))
    }

    pub fn header(&self) -> &FrameHeader {
        // Validated for size and alignment at construction; lives as long as `region`
        unsafe { self.header.as_ref() }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn shm(&self) -> &ShmRegion {
        &self.region
    }

    /// Copy one frame into the pixel buffer
    pub fn copy_in(&self, src: &[u8]) -> SoftcamResult<()> {
        if src.len() != self.frame_size {
            return Err(SoftcamError::FrameSizeMismatch {
                expected: self.frame_size,
                actual: src.len(),
            });
        }
        unsafe {
            let dst = self.region.as_ptr().add(HEADER_SIZE);
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, self.frame_size);
        }
        Ok(())
    }

    /// Copy the pixel buffer out
    pub fn copy_out(&self, dst: &mut [u8]) -> SoftcamResult<()> {
        if dst.len() != self.frame_size {
            return Err(SoftcamError::FrameSizeMismatch {
                expected: self.frame_size,
                actual: dst.len(),
            });
        }
        unsafe {
            let src = self.region.as_ptr().add(HEADER_SIZE) as *const u8;
            std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), self.frame_size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND_NS: u64 = 1_000_000_000;

    fn create(dir: &Path, name: &str, now_ns: u64) -> FrameRegion {
        let format = FrameFormat {
            width: 4,
            height: 2,
            framerate: 30.0,
        };
        FrameRegion::create(
            dir,
            name,
            format,
            Duration::from_secs(1),
            now_ns,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .unwrap()
    }

    #[test]
    fn test_header_is_cache_aligned() {
        assert_eq!(HEADER_SIZE % 64, 0);
        assert_eq!(mem::align_of::<FrameHeader>(), 64);
    }

    #[test]
    fn test_frame_bytes_limits() {
        assert_eq!(frame_bytes(320, 240, DEFAULT_MAX_FRAME_BYTES).unwrap(), 320 * 240 * 3);
        assert!(matches!(
            frame_bytes(0, 240, DEFAULT_MAX_FRAME_BYTES),
            Err(SoftcamError::InvalidArgument(_))
        ));
        assert!(matches!(
            frame_bytes(32000, 240, DEFAULT_MAX_FRAME_BYTES),
            Err(SoftcamError::Oversized { .. })
        ));
        assert!(matches!(
            frame_bytes(320, 24000, DEFAULT_MAX_FRAME_BYTES),
            Err(SoftcamError::Oversized { .. })
        ));
        assert!(frame_bytes(3840, 2160, DEFAULT_MAX_FRAME_BYTES).is_ok());
        assert!(frame_bytes(640, 480, 1000).is_err());
    }

    #[test]
    fn test_create_publishes_header() {
        let dir = tempfile::tempdir().unwrap();
        let region = create(dir.path(), "cam", 5 * SECOND_NS);
        let hdr = region.header();

        assert!(hdr.is_initialized());
        assert_eq!(hdr.width(), 4);
        assert_eq!(hdr.height(), 2);
        assert_eq!(hdr.framerate(), 30.0);
        assert_eq!(hdr.frame_counter(), 0);
        assert_eq!(hdr.connected_count(), 0);
        assert!(hdr.is_active());
        assert!(hdr.producer_attached());
        assert_eq!(hdr.producer_pid(), std::process::id());
        assert_eq!(region.frame_size(), 4 * 2 * 3);

        let opened = FrameRegion::open(dir.path(), "cam").unwrap();
        assert_eq!(opened.header().width(), 4);
        assert_eq!(opened.frame_size(), region.frame_size());
    }

    #[test]
    fn test_pixels_are_shared() {
        let dir = tempfile::tempdir().unwrap();
        let producer = create(dir.path(), "cam", 0);
        let consumer = FrameRegion::open(dir.path(), "cam").unwrap();

        let frame: Vec<u8> = (0..24).collect();
        producer.copy_in(&frame).unwrap();
        producer.header().advance_frame();

        let mut out = vec![0u8; 24];
        consumer.copy_out(&mut out).unwrap();
        assert_eq!(out, frame);
        assert_eq!(consumer.header().frame_counter(), 1);

        assert!(matches!(
            producer.copy_in(&[0u8; 5]),
            Err(SoftcamError::FrameSizeMismatch { expected: 24, actual: 5 })
        ));
    }

    #[test]
    fn test_connected_count_never_underflows() {
        let dir = tempfile::tempdir().unwrap();
        let region = create(dir.path(), "cam", 0);
        let hdr = region.header();

        assert_eq!(hdr.attach_consumer(), 1);
        assert_eq!(hdr.attach_consumer(), 2);
        assert_eq!(hdr.detach_consumer(), 1);
        assert_eq!(hdr.detach_consumer(), 0);
        assert_eq!(hdr.detach_consumer(), 0);
        assert_eq!(hdr.connected_count(), 0);
    }

    #[test]
    fn test_watchdog_expiry_is_one_directional() {
        let dir = tempfile::tempdir().unwrap();
        let region = create(dir.path(), "cam", 10 * SECOND_NS);
        let hdr = region.header();

        assert!(!hdr.expire_if_stale(10 * SECOND_NS + SECOND_NS / 2));
        assert!(hdr.is_active());

        assert!(hdr.expire_if_stale(12 * SECOND_NS));
        assert!(!hdr.is_active());
        // Only the first observer performs the transition
        assert!(!hdr.expire_if_stale(13 * SECOND_NS));

        // A late heartbeat does not resurrect the region
        hdr.beat(14 * SECOND_NS);
        assert!(!hdr.is_active());
        assert!(!hdr.deactivate());
    }

    #[test]
    fn test_probe_states() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            FrameRegion::probe(dir.path(), "cam", 0).unwrap(),
            RegionState::Missing
        );

        let region = create(dir.path(), "cam", 10 * SECOND_NS);
        assert_eq!(
            FrameRegion::probe(dir.path(), "cam", 10 * SECOND_NS).unwrap(),
            RegionState::Live
        );
        assert_eq!(
            FrameRegion::probe(dir.path(), "cam", 20 * SECOND_NS).unwrap(),
            RegionState::Stale
        );

        region.header().deactivate();
        assert_eq!(
            FrameRegion::probe(dir.path(), "cam", 10 * SECOND_NS).unwrap(),
            RegionState::Stale
        );
    }

    #[test]
    fn test_open_rejects_uninitialized_region() {
        let dir = tempfile::tempdir().unwrap();
        let _raw = ShmRegion::create_exclusive(dir.path(), "raw", HEADER_SIZE + 64).unwrap();
        assert!(matches!(
            FrameRegion::open(dir.path(), "raw"),
            Err(SoftcamError::NotFound(_))
        ));
        assert_eq!(
            FrameRegion::probe(dir.path(), "raw", 0).unwrap(),
            RegionState::Live
        );
    }
}
