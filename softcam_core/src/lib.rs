//! # Softcam Core
//!
//! Live video frames from one producer process to any number of consumer
//! processes through a single named shared memory region.
//!
//! - **Memory**: the shared region allocator and the atomic frame header
//! - **Sync**: the cross-process wait/notify channel and the producer watchdog
//! - **FrameBuffer**: the handle each process holds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use softcam_core::FrameBuffer;
//! use std::time::Duration;
//!
//! // Producer process
//! let camera = FrameBuffer::create(640, 480, 30.0);
//! let frame = vec![128u8; camera.frame_size()];
//! camera.write(&frame).unwrap();
//!
//! // Consumer process
//! let viewer = FrameBuffer::open();
//! let mut pixels = vec![0u8; viewer.frame_size()];
//! let mut seen = viewer.frame_counter();
//! while viewer.wait_for_new_frame(seen, Duration::from_secs(1)) {
//!     if viewer.frame_counter() > seen {
//!         seen = viewer.read_frame(&mut pixels).unwrap();
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod frame_buffer;
pub mod memory;
pub mod sync;

pub use config::FrameBufferConfig;
pub use error::{SoftcamError, SoftcamResult};
pub use frame_buffer::{FrameBuffer, HandleId, Role};
pub use memory::{FrameFormat, BYTES_PER_PIXEL};
