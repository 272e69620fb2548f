//! Command streams: FIFO work queues drained by a worker thread.
//!
//! A stream executes enqueued commands strictly in order, which is what
//! makes its completion markers meaningful: a marker observes completion
//! no earlier than every command enqueued before it, and says nothing
//! about commands enqueued afterward.
//!
//! Simulated data transfers carry a monotonically increasing copy-sequence
//! id. Their staging buffers are parked after the transfer completes and
//! released only when an event synchronize reclaims them, mirroring the
//! lazy reclamation contract of the event subsystem.

use crate::runtime::clock::ClockSource;
use crate::runtime::marker::Marker;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifier an event stores to reference its owning stream.
///
/// Resolved through the runtime's stream registry; holding an id never
/// keeps the stream alive and never dangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a stream's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamStats {
    /// Commands enqueued but not yet executed.
    pub pending_ops: u64,
    /// Commands submitted over the stream's lifetime.
    pub total_ops: u64,
    /// Sequence id of the most recently enqueued copy, 0 if none.
    pub last_copy_seq_id: u64,
    /// Completed copies whose staging is still awaiting reclamation.
    pub pending_reclaim: usize,
}

enum Op {
    Task(Box<dyn FnOnce() + Send>),
    Copy { seq_id: u64, staging: Vec<u8> },
    Signal(Marker),
}

struct QueueState {
    ops: VecDeque<Op>,
    /// The worker is inside `run_op`.
    busy: bool,
    shutdown: bool,
}

struct RetiredCopy {
    seq_id: u64,
    staging: Vec<u8>,
}

pub(crate) struct StreamShared {
    id: StreamId,
    clock: Arc<dyn ClockSource>,
    queue: Mutex<QueueState>,
    /// Wakes the worker when work arrives or shutdown is requested.
    work_cond: Condvar,
    /// Wakes synchronizers when the queue drains.
    idle_cond: Condvar,
    pending: AtomicU64,
    total_ops: AtomicU64,
    copy_seq: AtomicU64,
    retired: Mutex<Vec<RetiredCopy>>,
}

impl StreamShared {
    fn push(&self, op: Op) {
        let mut q = self.queue.lock();
        q.ops.push_back(op);
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.total_ops.fetch_add(1, Ordering::SeqCst);
        self.work_cond.notify_one();
    }

    /// Capture the current enqueue point as a completion marker.
    pub(crate) fn create_marker(&self) -> Marker {
        let marker = Marker::new();
        self.push(Op::Signal(marker.clone()));
        marker
    }

    pub(crate) fn last_copy_seq_id(&self) -> u64 {
        self.copy_seq.load(Ordering::SeqCst)
    }

    /// Release retired staging resources with sequence id <= `up_to`.
    ///
    /// Only completed copies sit in the retired pool, so reclamation can
    /// never free an in-flight transfer; a copy that completes later with
    /// a covered id is picked up by the next reclaim pass.
    pub(crate) fn reclaim_resources(&self, up_to: u64) -> usize {
        let mut retired = self.retired.lock();
        let before = retired.len();
        let mut freed_bytes = 0usize;
        retired.retain(|r| {
            if r.seq_id > up_to {
                true
            } else {
                freed_bytes += r.staging.len();
                false
            }
        });
        let freed = before - retired.len();
        if freed > 0 {
            log::trace!(
                "stream {}: reclaimed {} copy resources, {} staging bytes (seq <= {})",
                self.id,
                freed,
                freed_bytes,
                up_to
            );
        }
        freed
    }

    /// Block until every enqueued command has executed.
    pub(crate) fn synchronize(&self) {
        let mut q = self.queue.lock();
        while !q.ops.is_empty() || q.busy {
            self.idle_cond.wait(&mut q);
        }
    }

    fn run_op(&self, op: Op) {
        match op {
            Op::Task(task) => task(),
            Op::Copy { seq_id, staging } => {
                log::trace!(
                    "stream {}: copy seq {} transferred {} bytes",
                    self.id,
                    seq_id,
                    staging.len()
                );
                self.retired.lock().push(RetiredCopy { seq_id, staging });
            }
            Op::Signal(marker) => {
                marker.signal(self.clock.now_ticks());
            }
        }
    }
}

fn worker_loop(shared: Arc<StreamShared>) {
    loop {
        let op = {
            let mut q = shared.queue.lock();
            loop {
                if let Some(op) = q.ops.pop_front() {
                    q.busy = true;
                    break Some(op);
                }
                if q.shutdown {
                    break None;
                }
                shared.work_cond.wait(&mut q);
            }
        };

        let Some(op) = op else {
            break;
        };

        shared.run_op(op);
        shared.pending.fetch_sub(1, Ordering::SeqCst);

        let mut q = shared.queue.lock();
        q.busy = false;
        if q.ops.is_empty() {
            shared.idle_cond.notify_all();
        }
    }

    // Queue is drained at this point; wake any late synchronizers.
    shared.idle_cond.notify_all();
}

/// An ordered command queue on the device.
///
/// Work enqueued on a stream executes in FIFO order on a dedicated worker.
/// Dropping the stream drains the remaining queue (all outstanding markers
/// signal) before the worker exits.
pub struct Stream {
    shared: Arc<StreamShared>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    pub(crate) fn new(id: StreamId, clock: Arc<dyn ClockSource>) -> Self {
        let shared = Arc::new(StreamShared {
            id,
            clock,
            queue: Mutex::new(QueueState {
                ops: VecDeque::new(),
                busy: false,
                shutdown: false,
            }),
            work_cond: Condvar::new(),
            idle_cond: Condvar::new(),
            pending: AtomicU64::new(0),
            total_ops: AtomicU64::new(0),
            copy_seq: AtomicU64::new(0),
            retired: Mutex::new(Vec::new()),
        });

        let worker_shared = shared.clone();
        let worker = thread::spawn(move || worker_loop(worker_shared));

        log::debug!("stream {} created", id);
        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Enqueue an arbitrary command.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push(Op::Task(Box::new(task)));
    }

    /// Enqueue a simulated asynchronous transfer of `staging`.
    ///
    /// Returns the copy-sequence id assigned to the transfer. The staging
    /// buffer is held until the transfer completes, then parked until an
    /// event synchronize reclaims it.
    pub fn enqueue_copy(&self, staging: Vec<u8>) -> u64 {
        let seq_id = self.shared.copy_seq.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!(
            "stream {}: copy seq {} enqueued ({} bytes)",
            self.shared.id,
            seq_id,
            staging.len()
        );
        self.shared.push(Op::Copy { seq_id, staging });
        seq_id
    }

    /// Capture the current enqueue point as a completion marker.
    pub fn create_marker(&self) -> Marker {
        self.shared.create_marker()
    }

    /// Block until every enqueued command has executed.
    pub fn synchronize(&self) {
        self.shared.synchronize();
    }

    /// Sequence id of the most recently enqueued copy, 0 if none.
    pub fn last_copy_seq_id(&self) -> u64 {
        self.shared.last_copy_seq_id()
    }

    /// Release retired staging resources with sequence id <= `up_to`.
    pub fn reclaim_resources(&self, up_to: u64) -> usize {
        self.shared.reclaim_resources(up_to)
    }

    /// Commands enqueued but not yet executed.
    pub fn pending_ops(&self) -> u64 {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Commands submitted over the stream's lifetime.
    pub fn total_ops(&self) -> u64 {
        self.shared.total_ops.load(Ordering::SeqCst)
    }

    /// True when no command is queued or executing.
    pub fn is_idle(&self) -> bool {
        self.pending_ops() == 0
    }

    /// Completed copies whose staging is still awaiting reclamation.
    pub fn pending_reclaim(&self) -> usize {
        self.shared.retired.lock().len()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            pending_ops: self.pending_ops(),
            total_ops: self.total_ops(),
            last_copy_seq_id: self.last_copy_seq_id(),
            pending_reclaim: self.pending_reclaim(),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        {
            let mut q = self.shared.queue.lock();
            q.shutdown = true;
            self.shared.work_cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        log::debug!("stream {} destroyed", self.shared.id);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("pending_ops", &self.pending_ops())
            .finish()
    }
}

/// Registry resolving `StreamId`s to live streams.
///
/// Entries are weak: a destroyed stream simply stops resolving, so an
/// event that still references it can never follow a dangling pointer.
pub(crate) struct StreamRegistry {
    entries: Mutex<HashMap<StreamId, Weak<StreamShared>>>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn register(&self, clock: Arc<dyn ClockSource>) -> Stream {
        let id = StreamId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let stream = Stream::new(id, clock);
        self.entries
            .lock()
            .insert(id, Arc::downgrade(stream.shared()));
        stream
    }

    pub(crate) fn get(&self, id: StreamId) -> Option<Arc<StreamShared>> {
        let mut entries = self.entries.lock();
        match entries.get(&id).and_then(Weak::upgrade) {
            Some(shared) => Some(shared),
            None => {
                entries.remove(&id);
                None
            }
        }
    }

    /// Snapshot all live streams and synchronize each in turn.
    ///
    /// The registry lock is not held across the blocking waits.
    pub(crate) fn synchronize_all(&self) {
        let live: Vec<Arc<StreamShared>> = {
            let mut entries = self.entries.lock();
            entries.retain(|_, weak| weak.strong_count() > 0);
            entries.values().filter_map(Weak::upgrade).collect()
        };
        for shared in live {
            shared.synchronize();
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::{HostClock, VirtualClock};
    use crate::runtime::marker::WaitMode;
    use std::sync::atomic::AtomicBool;

    fn test_stream() -> Stream {
        Stream::new(StreamId(1), Arc::new(HostClock::new()))
    }

    #[test]
    fn test_stream_starts_idle() {
        let stream = test_stream();
        assert!(stream.is_idle());
        assert_eq!(stream.pending_ops(), 0);
        assert_eq!(stream.total_ops(), 0);
        assert_eq!(stream.last_copy_seq_id(), 0);
    }

    #[test]
    fn test_fifo_execution_order() {
        let stream = test_stream();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let order = order.clone();
            stream.enqueue(move || order.lock().push(i));
        }
        stream.synchronize();

        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
        assert_eq!(stream.total_ops(), 16);
        assert!(stream.is_idle());
    }

    #[test]
    fn test_copy_sequence_ids_increase() {
        let stream = test_stream();
        let a = stream.enqueue_copy(vec![0u8; 64]);
        let b = stream.enqueue_copy(vec![0u8; 64]);
        let c = stream.enqueue_copy(vec![0u8; 64]);
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(stream.last_copy_seq_id(), 3);
    }

    #[test]
    fn test_copies_retire_then_reclaim() {
        let stream = test_stream();
        stream.enqueue_copy(vec![1u8; 128]);
        stream.enqueue_copy(vec![2u8; 128]);
        stream.enqueue_copy(vec![3u8; 128]);
        stream.synchronize();

        assert_eq!(stream.pending_reclaim(), 3);

        // Reclamation is bounded by the sequence id.
        assert_eq!(stream.reclaim_resources(2), 2);
        assert_eq!(stream.pending_reclaim(), 1);
        assert_eq!(stream.reclaim_resources(3), 1);
        assert_eq!(stream.pending_reclaim(), 0);
    }

    #[test]
    fn test_marker_covers_prior_work() {
        let stream = test_stream();
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        stream.enqueue(move || flag.store(true, Ordering::SeqCst));
        let marker = stream.create_marker();

        marker.wait(WaitMode::Blocked);
        assert!(
            done.load(Ordering::SeqCst),
            "marker must not signal before prior work completes"
        );
    }

    #[test]
    fn test_marker_completion_ticks_from_clock() {
        let clock = Arc::new(VirtualClock::new(1000));
        let stream = Stream::new(StreamId(7), clock.clone());

        clock.set_ticks(1234);
        let marker = stream.create_marker();
        assert_eq!(marker.wait(WaitMode::Blocked), 1234);
    }

    #[test]
    fn test_synchronize_waits_for_slow_task() {
        let stream = test_stream();
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        stream.enqueue(move || {
            thread::sleep(std::time::Duration::from_millis(30));
            flag.store(true, Ordering::SeqCst);
        });

        stream.synchronize();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_drains_outstanding_markers() {
        let stream = test_stream();
        stream.enqueue(|| thread::sleep(std::time::Duration::from_millis(10)));
        let marker = stream.create_marker();

        drop(stream);
        assert!(
            marker.is_complete(),
            "teardown must drain the queue so markers signal"
        );
    }

    #[test]
    fn test_registry_resolves_only_live_streams() {
        let registry = StreamRegistry::new();
        let clock: Arc<dyn ClockSource> = Arc::new(HostClock::new());

        let stream = registry.register(clock.clone());
        let id = stream.id();
        assert!(registry.get(id).is_some());
        assert_eq!(registry.live_count(), 1);

        drop(stream);
        assert!(registry.get(id).is_none());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_registry_synchronize_all() {
        let registry = StreamRegistry::new();
        let clock: Arc<dyn ClockSource> = Arc::new(HostClock::new());

        let a = registry.register(clock.clone());
        let b = registry.register(clock.clone());
        let counter = Arc::new(AtomicU64::new(0));

        for stream in [&a, &b] {
            let counter = counter.clone();
            stream.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        registry.synchronize_all();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
