//! Host-side GPU event synchronization runtime.
//!
//! Events mark points in an asynchronously executing command stream. Host
//! code records an event on a stream, later queries or blocks on it, and
//! derives elapsed time between two recorded events from a monotonic,
//! frequency-scaled tick clock.
//!
//! The runtime reconciles three concurrency domains: host threads, the
//! per-stream worker that drains enqueued commands in FIFO order, and the
//! tick clock that timestamps completion. Recording on the default stream
//! (`None`) synchronizes against *all* outstanding work before capturing a
//! timestamp; recording on a concrete stream is asynchronous and attaches
//! a completion marker instead.
//!
//! # Example
//!
//! ```
//! use gpu_sync::prelude::*;
//!
//! let rt = Runtime::new();
//! let stream = rt.create_stream();
//!
//! let start = rt.create_event()?;
//! let stop = rt.create_event()?;
//!
//! rt.record_event(start, Some(&stream))?;
//! stream.enqueue(|| {
//!     // device work
//! });
//! rt.record_event(stop, Some(&stream))?;
//!
//! rt.synchronize_event(stop)?;
//! let ms = rt.elapsed_time_ms(start, stop)?;
//! assert!(ms >= 0.0);
//! # Ok::<(), GpuSyncError>(())
//! ```

pub mod error;
pub mod runtime;

pub use error::{GpuSyncError, Result};

/// Convenience re-exports for the common public surface.
pub mod prelude {
    pub use crate::error::{GpuSyncError, Result};
    pub use crate::runtime::{
        ClockSource, Event, EventFlags, HostClock, Marker, Runtime, RuntimeStats, Stream,
        StreamId, StreamStats, VirtualClock, WaitMode,
    };
}
