//! Tick clock sources used to timestamp event completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic tick counter with a known rate.
///
/// `now_ticks` must never decrease. A frequency of zero signals that the
/// rate is unknown or unsupported; elapsed-time computation rejects such a
/// clock with `InvalidValue`.
pub trait ClockSource: Send + Sync {
    /// Current tick value.
    fn now_ticks(&self) -> u64;

    /// Ticks per second, or 0 if unknown.
    fn frequency_hz(&self) -> u64;
}

/// Host monotonic clock.
///
/// Ticks are nanoseconds elapsed since the clock was created, so the
/// reported frequency is 1 GHz.
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    /// Tick rate of the host clock (nanosecond resolution).
    pub const FREQUENCY_HZ: u64 = 1_000_000_000;

    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for HostClock {
    fn now_ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn frequency_hz(&self) -> u64 {
        Self::FREQUENCY_HZ
    }
}

/// Manually advanced clock for deterministic tests and simulation.
///
/// The caller is responsible for keeping the tick value monotonic. A
/// frequency of 0 models timing hardware whose rate cannot be queried.
pub struct VirtualClock {
    ticks: AtomicU64,
    frequency: AtomicU64,
}

impl VirtualClock {
    pub fn new(frequency_hz: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            frequency: AtomicU64::new(frequency_hz),
        }
    }

    /// Set the current tick value.
    pub fn set_ticks(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    /// Advance the tick value by `delta`.
    pub fn advance(&self, delta: u64) {
        self.ticks.fetch_add(delta, Ordering::SeqCst);
    }

    /// Change the reported frequency.
    pub fn set_frequency(&self, hz: u64) {
        self.frequency.store(hz, Ordering::SeqCst);
    }
}

impl ClockSource for VirtualClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn frequency_hz(&self) -> u64 {
        self.frequency.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_clock_monotonic() {
        let clock = HostClock::new();
        let a = clock.now_ticks();
        let b = clock.now_ticks();
        assert!(b >= a, "host ticks must not decrease");
        assert_eq!(clock.frequency_hz(), HostClock::FREQUENCY_HZ);
    }

    #[test]
    fn test_virtual_clock_control() {
        let clock = VirtualClock::new(1000);
        assert_eq!(clock.now_ticks(), 0);

        clock.set_ticks(500);
        assert_eq!(clock.now_ticks(), 500);

        clock.advance(250);
        assert_eq!(clock.now_ticks(), 750);
        assert_eq!(clock.frequency_hz(), 1000);
    }

    #[test]
    fn test_virtual_clock_zero_frequency() {
        let clock = VirtualClock::new(0);
        assert_eq!(clock.frequency_hz(), 0);

        clock.set_frequency(1_000_000);
        assert_eq!(clock.frequency_hz(), 1_000_000);
    }
}
