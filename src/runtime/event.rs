//! Event lifecycle: creation, recording, synchronization, polling,
//! elapsed-time measurement, and destruction.
//!
//! An `Event` is a copyable handle naming a slot in the runtime's event
//! registry. Destroying the event removes the slot; any later use of the
//! handle fails with `InvalidResourceHandle` instead of touching freed
//! state.

use crate::error::{GpuSyncError, Result};
use crate::runtime::clock::ClockSource;
use crate::runtime::marker::{Marker, WaitMode};
use crate::runtime::stream::{Stream, StreamId, StreamRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Host-visible handle for a synchronization point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    id: u64,
}

impl Event {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Event creation flags.
///
/// Only `DEFAULT` is currently accepted; the named bits document the
/// configuration surface but are rejected with `InvalidValue` at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventFlags(u32);

impl EventFlags {
    /// Default configuration; the only value creation accepts.
    pub const DEFAULT: EventFlags = EventFlags(0);
    /// Synchronizing threads yield instead of spinning.
    pub const BLOCKING_SYNC: EventFlags = EventFlags(1 << 0);
    /// The event records no timestamp.
    pub const DISABLE_TIMING: EventFlags = EventFlags(1 << 1);

    pub const fn from_bits(bits: u32) -> EventFlags {
        EventFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: EventFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Wait strategy selected by the flags.
    pub(crate) fn wait_mode(self) -> WaitMode {
        if self.contains(EventFlags::BLOCKING_SYNC) {
            WaitMode::Blocked
        } else {
            WaitMode::Active
        }
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

/// How a recorded event obtained its timestamp.
///
/// Exactly one representation exists per recorded event, fixed by the
/// stream it was recorded on.
enum RecordOrigin {
    /// Default-stream recording: the tick was read from the clock after a
    /// full device synchronization.
    DefaultStream,
    /// Concrete-stream recording: the tick came from the marker's
    /// completion timestamp. Marker and sequence id are retained so a
    /// later synchronize can still wait and reclaim.
    Stream {
        id: StreamId,
        marker: Marker,
        copy_seq_id: u64,
    },
}

enum RecordState {
    /// Created, never recorded. Nothing to wait for.
    Created,
    /// Recorded on a concrete stream; the marker has not been observed
    /// complete yet.
    Recording {
        stream: StreamId,
        marker: Marker,
        copy_seq_id: u64,
    },
    /// Measurement point established.
    Recorded { ticks: u64, origin: RecordOrigin },
}

struct EventSlot {
    flags: EventFlags,
    state: RecordState,
}

/// What a synchronize call must do once the registry lock is released.
enum WaitPlan {
    Nothing,
    DeviceSync,
    MarkerWait {
        marker: Marker,
        mode: WaitMode,
        stream: StreamId,
        copy_seq_id: u64,
        /// The slot was still `Recording`; publish the completion tick
        /// after the wait.
        publish: bool,
    },
}

/// Storage and state machine for all live events.
pub(crate) struct EventRegistry {
    slots: Mutex<HashMap<u64, EventSlot>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocate a new event in the `Created` state.
    ///
    /// Rejects every flags value except `DEFAULT` without allocating.
    pub(crate) fn create(&self, flags: EventFlags) -> Result<Event> {
        if flags != EventFlags::DEFAULT {
            return Err(GpuSyncError::InvalidValue(format!(
                "unsupported event flags {:#x}",
                flags.bits()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.slots.lock().insert(
            id,
            EventSlot {
                flags,
                state: RecordState::Created,
            },
        );
        log::debug!("event {} created", id);
        Ok(Event { id })
    }

    /// Record `event` at the current enqueue point of `stream`.
    ///
    /// `None` selects the default stream: every live stream is synchronized
    /// (blocking) and the timestamp is read from the clock on the host.
    /// With a concrete stream the call is asynchronous: it attaches a
    /// completion marker and captures the copy-sequence id.
    pub(crate) fn record(
        &self,
        event: Event,
        stream: Option<&Stream>,
        streams: &StreamRegistry,
        clock: &dyn ClockSource,
    ) -> Result<()> {
        match stream {
            None => {
                // Validate before blocking; the wait must not run on a
                // destroyed handle.
                if !self.slots.lock().contains_key(&event.id) {
                    return Err(GpuSyncError::InvalidResourceHandle);
                }

                streams.synchronize_all();
                let ticks = clock.now_ticks();

                let mut slots = self.slots.lock();
                let slot = slots
                    .get_mut(&event.id)
                    .ok_or(GpuSyncError::InvalidResourceHandle)?;
                slot.state = RecordState::Recorded {
                    ticks,
                    origin: RecordOrigin::DefaultStream,
                };
                log::trace!("event {} recorded on default stream at tick {}", event.id, ticks);
                Ok(())
            }
            Some(s) => {
                let mut slots = self.slots.lock();
                let slot = slots
                    .get_mut(&event.id)
                    .ok_or(GpuSyncError::InvalidResourceHandle)?;
                let marker = s.create_marker();
                let copy_seq_id = s.last_copy_seq_id();
                slot.state = RecordState::Recording {
                    stream: s.id(),
                    marker,
                    copy_seq_id,
                };
                log::trace!("event {} recording on stream {}", event.id, s.id());
                Ok(())
            }
        }
    }

    /// Block until the work the event marks has completed.
    ///
    /// Never returns `NotReady`. The registry lock is released before any
    /// blocking wait, so concurrent calls on different events do not
    /// interfere.
    pub(crate) fn synchronize(&self, event: Event, streams: &StreamRegistry) -> Result<()> {
        let plan = {
            let slots = self.slots.lock();
            let slot = slots
                .get(&event.id)
                .ok_or(GpuSyncError::InvalidResourceHandle)?;
            match &slot.state {
                RecordState::Created => WaitPlan::Nothing,
                RecordState::Recorded {
                    origin: RecordOrigin::DefaultStream,
                    ..
                } => WaitPlan::DeviceSync,
                RecordState::Recording {
                    stream,
                    marker,
                    copy_seq_id,
                } => WaitPlan::MarkerWait {
                    marker: marker.clone(),
                    mode: slot.flags.wait_mode(),
                    stream: *stream,
                    copy_seq_id: *copy_seq_id,
                    publish: true,
                },
                RecordState::Recorded {
                    origin:
                        RecordOrigin::Stream {
                            id,
                            marker,
                            copy_seq_id,
                        },
                    ..
                } => WaitPlan::MarkerWait {
                    marker: marker.clone(),
                    mode: slot.flags.wait_mode(),
                    stream: *id,
                    copy_seq_id: *copy_seq_id,
                    publish: false,
                },
            }
        };

        match plan {
            WaitPlan::Nothing => Ok(()),
            WaitPlan::DeviceSync => {
                // Idempotent: the device already synchronized at record
                // time; doing it again is safe.
                streams.synchronize_all();
                Ok(())
            }
            WaitPlan::MarkerWait {
                marker,
                mode,
                stream,
                copy_seq_id,
                publish,
            } => {
                let ticks = marker.wait(mode);

                // The covered copies are complete now; let the owning
                // stream release their staging. A torn-down stream no
                // longer resolves and has nothing left to reclaim.
                if let Some(owner) = streams.get(stream) {
                    owner.reclaim_resources(copy_seq_id);
                }

                if publish {
                    let mut slots = self.slots.lock();
                    if let Some(slot) = slots.get_mut(&event.id) {
                        // A concurrent re-record swaps the marker; a stale
                        // wait must not publish over it.
                        let still_current = matches!(
                            &slot.state,
                            RecordState::Recording { marker: current, .. }
                                if current.same_cell(&marker)
                        );
                        if still_current {
                            slot.state = RecordState::Recorded {
                                ticks,
                                origin: RecordOrigin::Stream {
                                    id: stream,
                                    marker,
                                    copy_seq_id,
                                },
                            };
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Non-blocking completion poll.
    ///
    /// `Recording` signals `NotReady`; every other live state signals
    /// success. The marker is not consulted and state does not advance;
    /// the transition is observed via `synchronize` or `elapsed_time_ms`.
    pub(crate) fn query(&self, event: Event) -> Result<()> {
        let slots = self.slots.lock();
        let slot = slots
            .get(&event.id)
            .ok_or(GpuSyncError::InvalidResourceHandle)?;
        match slot.state {
            RecordState::Recording { .. } => Err(GpuSyncError::NotReady),
            _ => Ok(()),
        }
    }

    /// Milliseconds between two recorded events.
    ///
    /// Both operands first pass a resolution step: a `Recording` event
    /// whose marker has completed transitions to `Recorded` using the
    /// marker's completion tick. The operands need not be recorded in
    /// chronological order; a negative result is valid data. A pair
    /// involving a never-recorded event contributes no measurement and
    /// yields 0.
    pub(crate) fn elapsed_time_ms(
        &self,
        start: Event,
        stop: Event,
        clock: &dyn ClockSource,
    ) -> Result<f32> {
        let mut slots = self.slots.lock();
        if !slots.contains_key(&start.id) || !slots.contains_key(&stop.id) {
            return Err(GpuSyncError::InvalidResourceHandle);
        }

        for id in [start.id, stop.id] {
            if let Some(slot) = slots.get_mut(&id) {
                resolve_pending_timestamp(slot);
            }
        }

        let start_ticks = recorded_ticks(&slots[&start.id].state);
        let stop_ticks = recorded_ticks(&slots[&stop.id].state);

        match (start_ticks, stop_ticks) {
            (Some(t0), Some(t1)) => {
                let freq = clock.frequency_hz();
                if freq == 0 {
                    return Err(GpuSyncError::InvalidValue(
                        "clock frequency unavailable".into(),
                    ));
                }
                let tick_diff = t1 as i64 - t0 as i64;
                Ok(((tick_diff as f64 * 1000.0) / freq as f64) as f32)
            }
            _ => {
                let recording = |state: &RecordState| matches!(state, RecordState::Recording { .. });
                if recording(&slots[&start.id].state) || recording(&slots[&stop.id].state) {
                    Err(GpuSyncError::NotReady)
                } else {
                    // Neither recording nor both recorded: at least one
                    // operand was never recorded. No measurement exists.
                    Ok(0.0)
                }
            }
        }
    }

    /// Remove the slot, invalidating the handle.
    pub(crate) fn destroy(&self, event: Event) -> Result<()> {
        self.slots
            .lock()
            .remove(&event.id)
            .map(|_| log::debug!("event {} destroyed", event.id))
            .ok_or(GpuSyncError::InvalidResourceHandle)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Transition a `Recording` slot whose marker has completed.
fn resolve_pending_timestamp(slot: &mut EventSlot) {
    let resolved = match &slot.state {
        RecordState::Recording {
            stream,
            marker,
            copy_seq_id,
        } => marker.completion_ticks().map(|ticks| RecordState::Recorded {
            ticks,
            origin: RecordOrigin::Stream {
                id: *stream,
                marker: marker.clone(),
                copy_seq_id: *copy_seq_id,
            },
        }),
        _ => None,
    };
    if let Some(state) = resolved {
        slot.state = state;
    }
}

fn recorded_ticks(state: &RecordState) -> Option<u64> {
    match state {
        RecordState::Recorded { ticks, .. } => Some(*ticks),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_bits_roundtrip() {
        let combined = EventFlags::BLOCKING_SYNC | EventFlags::DISABLE_TIMING;
        assert_eq!(combined.bits(), 0x3);
        assert_eq!(EventFlags::from_bits(0x3), combined);
        assert!(combined.contains(EventFlags::BLOCKING_SYNC));
        assert!(combined.contains(EventFlags::DISABLE_TIMING));
        assert!(!EventFlags::DEFAULT.contains(EventFlags::BLOCKING_SYNC));
    }

    #[test]
    fn test_wait_mode_from_flags() {
        assert_eq!(EventFlags::DEFAULT.wait_mode(), WaitMode::Active);
        assert_eq!(EventFlags::BLOCKING_SYNC.wait_mode(), WaitMode::Blocked);
    }

    #[test]
    fn test_create_rejects_nonzero_flags() {
        let registry = EventRegistry::new();
        for bits in [0x1u32, 0x2, 0x3, 0x80] {
            let err = registry.create(EventFlags::from_bits(bits)).unwrap_err();
            assert!(matches!(err, GpuSyncError::InvalidValue(_)));
        }
        assert_eq!(registry.live_count(), 0, "rejected create must not allocate");
    }

    #[test]
    fn test_destroy_invalidates_handle() {
        let registry = EventRegistry::new();
        let event = registry.create(EventFlags::DEFAULT).unwrap();
        assert_eq!(registry.live_count(), 1);

        registry.destroy(event).unwrap();
        assert_eq!(registry.live_count(), 0);
        assert_eq!(
            registry.destroy(event).unwrap_err(),
            GpuSyncError::InvalidResourceHandle
        );
        assert_eq!(
            registry.query(event).unwrap_err(),
            GpuSyncError::InvalidResourceHandle
        );
    }

    #[test]
    fn test_query_created_event_is_ready() {
        let registry = EventRegistry::new();
        let event = registry.create(EventFlags::DEFAULT).unwrap();
        assert!(registry.query(event).is_ok());
    }

    #[test]
    fn test_handles_are_distinct() {
        let registry = EventRegistry::new();
        let a = registry.create(EventFlags::DEFAULT).unwrap();
        let b = registry.create(EventFlags::DEFAULT).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }
}
