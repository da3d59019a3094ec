//! Cross-process synchronisation for frame buffers
//!
//! - **notify**: the wait/notify channel (a futex word inside the shared header)
//! - **watchdog**: producer heartbeat and liveness clock

pub mod notify;
pub mod watchdog;

pub use notify::{wait_for_change, wait_until, wake_all};
pub use watchdog::{monotonic_now_ns, Heartbeat};
