//! Synchronization runtime: streams, events, markers, and the tick clock.

pub mod clock;
pub mod event;
pub mod marker;
pub mod stream;

use crate::error::Result;
use parking_lot::Once;
use std::sync::Arc;

pub use clock::{ClockSource, HostClock, VirtualClock};
pub use event::{Event, EventFlags};
pub use marker::{Marker, WaitMode};
pub use stream::{Stream, StreamId, StreamStats};

use event::EventRegistry;
use stream::StreamRegistry;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Snapshot of the runtime's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RuntimeStats {
    pub live_events: usize,
    pub live_streams: usize,
    pub clock_frequency_hz: u64,
}

/// The synchronization runtime context.
///
/// Owns the clock, the stream registry, and the event registry, and
/// exposes the event boundary operations. There is no global state: each
/// `Runtime` carries its own one-time initialization guard, which every
/// entry point runs first (exactly once, thread-safe).
pub struct Runtime {
    clock: Arc<dyn ClockSource>,
    streams: StreamRegistry,
    events: EventRegistry,
    init: Once,
}

impl Runtime {
    /// Runtime backed by the host monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(HostClock::new()))
    }

    /// Runtime backed by a caller-supplied clock source.
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            clock,
            streams: StreamRegistry::new(),
            events: EventRegistry::new(),
            init: Once::new(),
        }
    }

    /// Idempotent, thread-safe readiness guard.
    ///
    /// The body runs exactly once even under concurrent first calls.
    fn ensure_ready(&self) {
        self.init.call_once(|| {
            log::info!(
                "gpu-sync runtime ready (clock frequency {} Hz)",
                self.clock.frequency_hz()
            );
        });
    }

    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    /// Create a new command stream.
    pub fn create_stream(&self) -> Stream {
        self.ensure_ready();
        self.streams.register(self.clock.clone())
    }

    /// Block until every live stream has drained.
    pub fn synchronize_device(&self) {
        self.ensure_ready();
        self.streams.synchronize_all();
    }

    /// Create an event with the default configuration.
    pub fn create_event(&self) -> Result<Event> {
        self.create_event_with_flags(EventFlags::DEFAULT)
    }

    /// Create an event with explicit flags.
    ///
    /// Only `EventFlags::DEFAULT` is accepted; any other value fails with
    /// `InvalidValue` and allocates nothing.
    pub fn create_event_with_flags(&self, flags: EventFlags) -> Result<Event> {
        self.ensure_ready();
        self.events.create(flags)
    }

    /// Record `event` at the current enqueue point of `stream`.
    ///
    /// `None` selects the default stream: the call blocks until all
    /// outstanding work on every live stream completes, then captures the
    /// timestamp directly. With a concrete stream the call attaches a
    /// completion marker and returns without blocking.
    pub fn record_event(&self, event: Event, stream: Option<&Stream>) -> Result<()> {
        self.ensure_ready();
        self.events
            .record(event, stream, &self.streams, self.clock.as_ref())
    }

    /// Block until the work `event` marks has completed.
    ///
    /// Succeeds immediately for a never-recorded event. Never returns
    /// `NotReady`. After the wait, copy resources covered by the event's
    /// sequence id are reclaimed on the owning stream.
    pub fn synchronize_event(&self, event: Event) -> Result<()> {
        self.ensure_ready();
        self.events.synchronize(event, &self.streams)
    }

    /// Non-blocking completion poll.
    ///
    /// Fails with `NotReady` while a recording is outstanding.
    pub fn query_event(&self, event: Event) -> Result<()> {
        self.ensure_ready();
        self.events.query(event)
    }

    /// `query_event` as a boolean: `Ok(false)` instead of `NotReady`.
    pub fn event_ready(&self, event: Event) -> Result<bool> {
        match self.query_event(event) {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_ready() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Milliseconds between two recorded events.
    ///
    /// Fails with `NotReady` while either recording is outstanding and
    /// with `InvalidValue` when the clock frequency is unknown.
    pub fn elapsed_time_ms(&self, start: Event, stop: Event) -> Result<f32> {
        self.ensure_ready();
        self.events
            .elapsed_time_ms(start, stop, self.clock.as_ref())
    }

    /// Destroy `event`, invalidating the handle.
    pub fn destroy_event(&self, event: Event) -> Result<()> {
        self.ensure_ready();
        self.events.destroy(event)
    }

    pub fn live_events(&self) -> usize {
        self.events.live_count()
    }

    pub fn live_streams(&self) -> usize {
        self.streams.live_count()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            live_events: self.live_events(),
            live_streams: self.live_streams(),
            clock_frequency_hz: self.clock.frequency_hz(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
