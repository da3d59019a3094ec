//! # Shared memory for softcam
//!
//! - **ShmRegion**: a named, memory-mapped file under the shm base directory
//! - **FrameRegion**: a region carrying a [`FrameHeader`] followed by pixel data
//!
//! On Linux the base directory lives on tmpfs (`/dev/shm`), so frames never
//! touch a disk.

pub mod frame_layout;
pub mod platform;
pub mod shm_region;

pub use frame_layout::{
    frame_bytes, FrameFormat, FrameHeader, FrameRegion, RegionState, BYTES_PER_PIXEL,
    DEFAULT_MAX_FRAME_BYTES, HEADER_SIZE, MAX_DIMENSION,
};
pub use platform::*;
pub use shm_region::{RegionLock, ShmRegion};
