//! Hand-off of finished payloads to the consumer's execution context.
//!
//! The producer thread never waits on the consumer. Each pipeline owns a
//! one-slot channel; submitting while the slot is still occupied replaces
//! the stale payload with the fresh one. Every submission posts one drain
//! task to the [`DeliveryContext`], which takes whatever is newest, checks
//! that the pipeline is still running, reads the current sink and calls it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use parking_lot::{Mutex, RwLock};

use crate::error::SinkError;
use crate::payload::Payload;
use crate::throttle::Clock;

/// A unit of work run on a delivery context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The execution context consumers must be called on, typically a UI or
/// main-thread event loop.
///
/// Implementations run posted tasks one at a time in the order they were
/// posted. Delayed tasks run no earlier than their delay and are ordered
/// with respect to each other by deadline.
pub trait DeliveryContext: Send + Sync {
    fn post(&self, task: Task);
    fn post_after(&self, delay: Duration, task: Task);
}

/// Something that consumes finished frames.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, payload: Payload) -> Result<(), SinkError>;
}

impl<F> FrameSink for F
where
    F: Fn(Payload) -> Result<(), SinkError> + Send + Sync,
{
    fn deliver(&self, payload: Payload) -> Result<(), SinkError> {
        self(payload)
    }
}

/// Shared, replaceable reference to the active consumer.
///
/// The host sets it when a consumer subscribes and clears it when the
/// consumer goes away. Pipelines read it at delivery time, so a change is
/// seen by the very next frame.
#[derive(Clone, Default)]
pub struct SinkHandle {
    current: Arc<RwLock<Option<Arc<dyn FrameSink>>>>,
}

impl SinkHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sink: Arc<dyn FrameSink>) {
        *self.current.write() = Some(sink);
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }

    pub fn current(&self) -> Option<Arc<dyn FrameSink>> {
        self.current.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.current.read().is_some()
    }
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkHandle")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Delivery counters for one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryStats {
    pub submitted: u64,
    pub delivered: u64,
    /// Replaced by a fresher payload before the consumer context got to it.
    pub superseded: u64,
    /// Dropped because the bridge was closed or no sink was set.
    pub discarded: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    superseded: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
}

struct BridgeShared {
    slot_tx: Sender<Payload>,
    slot_rx: Receiver<Payload>,
    sink: SinkHandle,
    running: AtomicBool,
    counters: Counters,
}

impl BridgeShared {
    fn drain(&self) {
        let Ok(payload) = self.slot_rx.try_recv() else {
            return;
        };
        if !self.running.load(Ordering::SeqCst) {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(sink) = self.sink.current() else {
            log::trace!("no sink listening, dropping frame");
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| sink.deliver(payload))) {
            Ok(Ok(())) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                log::warn!("frame sink failed: {e}");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                log::warn!("frame sink panicked, frame dropped");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Producer-side end of the hand-off for one pipeline.
pub struct DeliveryBridge {
    shared: Arc<BridgeShared>,
    context: Arc<dyn DeliveryContext>,
}

impl DeliveryBridge {
    pub fn new(sink: SinkHandle, context: Arc<dyn DeliveryContext>) -> Self {
        let (slot_tx, slot_rx) = bounded(1);
        DeliveryBridge {
            shared: Arc::new(BridgeShared {
                slot_tx,
                slot_rx,
                sink,
                running: AtomicBool::new(true),
                counters: Counters::default(),
            }),
            context,
        }
    }

    /// Queue `payload` for delivery and return immediately.
    pub fn submit(&self, payload: Payload) {
        let shared = &self.shared;
        if !shared.running.load(Ordering::SeqCst) {
            shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut pending = payload;
        loop {
            match shared.slot_tx.try_send(pending) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    if shared.slot_rx.try_recv().is_ok() {
                        log::trace!("consumer behind, replacing undelivered frame");
                        shared.counters.superseded.fetch_add(1, Ordering::Relaxed);
                    }
                    pending = rejected;
                }
                // both ends live in `shared`
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::clone(shared);
        self.context.post(Box::new(move || shared.drain()));
    }

    /// Stop delivering. Payloads still queued, and drain tasks already
    /// posted, are discarded without touching the sink.
    pub fn close(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let counters = &self.shared.counters;
        while self.shared.slot_rx.try_recv().is_ok() {
            counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DeliveryStats {
        let c = &self.shared.counters;
        DeliveryStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        log::warn!("delivery task panicked");
    }
}

enum LoopMessage {
    Run(Task),
    RunAt(Instant, Task),
    Shutdown,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // reversed: BinaryHeap is a max-heap, the earliest deadline must pop first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// A dedicated single-threaded delivery context.
///
/// For hosts without an event loop of their own. Tasks run on one named
/// thread in posting order; delayed tasks run when due.
pub struct EventLoop {
    tx: Sender<LoopMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_event_loop(rx))?;
        log::debug!("delivery event loop {name:?} started");
        Ok(EventLoop {
            tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stop the loop after the tasks already queued have run. Pending
    /// delayed tasks are dropped. Blocks until the thread exits unless
    /// called from the loop itself.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopMessage::Shutdown);
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

fn run_event_loop(rx: Receiver<LoopMessage>) {
    let mut timers = BinaryHeap::<Timer>::new();
    let mut seq = 0u64;
    loop {
        let message = match timers.peek() {
            Some(timer) => {
                let now = Instant::now();
                if timer.deadline <= now {
                    if let Some(timer) = timers.pop() {
                        run_task(timer.task);
                    }
                    continue;
                }
                match rx.recv_timeout(timer.deadline - now) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };
        match message {
            LoopMessage::Run(task) => run_task(task),
            LoopMessage::RunAt(deadline, task) => {
                seq += 1;
                timers.push(Timer {
                    deadline,
                    seq,
                    task,
                });
            }
            LoopMessage::Shutdown => break,
        }
    }
    log::debug!(
        "delivery event loop exiting, {} timer(s) dropped",
        timers.len()
    );
}

impl DeliveryContext for EventLoop {
    fn post(&self, task: Task) {
        if self.tx.send(LoopMessage::Run(task)).is_err() {
            log::debug!("event loop is shut down, task dropped");
        }
    }

    fn post_after(&self, delay: Duration, task: Task) {
        let deadline = Instant::now() + delay;
        if self.tx.send(LoopMessage::RunAt(deadline, task)).is_err() {
            log::debug!("event loop is shut down, timer dropped");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A delivery context driven by the host's own loop.
///
/// Nothing runs until the host calls [`pump`](Self::pump), on whichever
/// thread it treats as the consumer context. Delays are measured on the
/// supplied [`Clock`].
pub struct PumpedContext {
    clock: Arc<dyn Clock>,
    queue: Mutex<VecDeque<Task>>,
    timers: Mutex<Vec<(Duration, u64, Task)>>,
    seq: AtomicU64,
}

impl PumpedContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        PumpedContext {
            clock,
            queue: Mutex::new(VecDeque::new()),
            timers: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Run every task that is due now. Tasks posted while pumping wait for
    /// the next call. Returns how many tasks ran.
    pub fn pump(&self) -> usize {
        let now = self.clock.now();
        let mut due = {
            let mut timers = self.timers.lock();
            let mut due = Vec::new();
            let mut i = 0;
            while i < timers.len() {
                if timers[i].0 <= now {
                    due.push(timers.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            due
        };
        due.sort_by_key(|&(deadline, seq, _)| (deadline, seq));

        let batch: Vec<Task> = {
            let mut queue = self.queue.lock();
            queue.extend(due.into_iter().map(|(_, _, task)| task));
            queue.drain(..).collect()
        };
        let ran = batch.len();
        for task in batch {
            run_task(task);
        }
        ran
    }

    /// Tasks ready to run on the next [`pump`](Self::pump), not counting
    /// timers.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }
}

impl DeliveryContext for PumpedContext {
    fn post(&self, task: Task) {
        self.queue.lock().push_back(task);
    }

    fn post_after(&self, delay: Duration, task: Task) {
        let deadline = self.clock.now() + delay;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.timers.lock().push((deadline, seq, task));
    }
}
