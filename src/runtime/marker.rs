//! Completion markers handed out by streams.
//!
//! A marker covers all work enqueued on its stream before the marker was
//! created. The stream worker signals it after that work drains, stamping
//! it with the clock tick at completion time.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Wait strategy for blocking on a marker.
///
/// Callers trade wake latency against host CPU consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WaitMode {
    /// Spin on the completion flag. Lowest wake latency.
    Active,
    /// Park on a condition variable until signaled.
    Blocked,
}

/// Opaque completion token for work enqueued on a stream up to a point.
///
/// Clones share the same completion cell, so an event can hold a marker
/// beyond the lifetime of the stream that issued it.
#[derive(Clone)]
pub struct Marker {
    cell: Arc<MarkerCell>,
}

struct MarkerCell {
    done: AtomicBool,
    ticks: AtomicU64,
    lock: Mutex<bool>,
    cond: Condvar,
}

impl Marker {
    pub(crate) fn new() -> Self {
        Self {
            cell: Arc::new(MarkerCell {
                done: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                lock: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Mark the covered work complete at `completion_ticks`.
    ///
    /// The tick store precedes the flag store, so any observer that sees
    /// the marker complete also sees its timestamp.
    pub(crate) fn signal(&self, completion_ticks: u64) {
        self.cell.ticks.store(completion_ticks, Ordering::Relaxed);
        self.cell.done.store(true, Ordering::Release);

        let mut done = self.cell.lock.lock();
        *done = true;
        self.cell.cond.notify_all();
    }

    /// Non-blocking poll of the completion flag.
    pub fn is_complete(&self) -> bool {
        self.cell.done.load(Ordering::Acquire)
    }

    /// Tick at which the covered work completed, if it has.
    pub fn completion_ticks(&self) -> Option<u64> {
        if self.is_complete() {
            Some(self.cell.ticks.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// Block until the marker is signaled and return the completion tick.
    ///
    /// No timeout and no cancellation: the wait runs to completion.
    pub fn wait(&self, mode: WaitMode) -> u64 {
        match mode {
            WaitMode::Active => {
                let mut spins = 0u32;
                while !self.is_complete() {
                    spins = spins.wrapping_add(1);
                    if spins % 64 == 0 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
            }
            WaitMode::Blocked => {
                let mut done = self.cell.lock.lock();
                while !*done {
                    self.cell.cond.wait(&mut done);
                }
            }
        }
        self.cell.ticks.load(Ordering::Relaxed)
    }

    /// True when `other` refers to the same completion cell.
    ///
    /// Used to revalidate an event slot after a wait: a re-record swaps in
    /// a new marker, and a stale wait must not publish over it.
    pub(crate) fn same_cell(&self, other: &Marker) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marker")
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_marker_starts_incomplete() {
        let m = Marker::new();
        assert!(!m.is_complete());
        assert_eq!(m.completion_ticks(), None);
    }

    #[test]
    fn test_signal_publishes_ticks() {
        let m = Marker::new();
        m.signal(4242);
        assert!(m.is_complete());
        assert_eq!(m.completion_ticks(), Some(4242));
        assert_eq!(m.wait(WaitMode::Active), 4242);
    }

    #[test]
    fn test_clones_share_cell() {
        let m = Marker::new();
        let c = m.clone();
        assert!(m.same_cell(&c));
        m.signal(7);
        assert_eq!(c.completion_ticks(), Some(7));

        let other = Marker::new();
        assert!(!m.same_cell(&other));
    }

    #[test]
    fn test_blocked_wait_across_threads() {
        let m = Marker::new();
        let signaler = m.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler.signal(99);
        });

        assert_eq!(m.wait(WaitMode::Blocked), 99);
        handle.join().expect("signaler thread should not panic");
    }

    #[test]
    fn test_active_wait_across_threads() {
        let m = Marker::new();
        let signaler = m.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaler.signal(11);
        });

        assert_eq!(m.wait(WaitMode::Active), 11);
        handle.join().expect("signaler thread should not panic");
    }
}
