//! Frame fan-out with per-sink backpressure.
//!
//! The dispatcher is the single ingress point for decoded frames. Every
//! registered sink gets its own bounded queue and its own worker task, so
//! a slow or stalled sink degrades only itself: the ingest loop never
//! waits on a sink longer than that sink's own block timeout, and other
//! sinks' queues are untouched by it.
//!
//! Overflow behavior is the sink's choice, declared at registration:
//!
//! - [`DropPolicy::Block`]: the dispatch call waits for queue room up to
//!   a timeout; on timeout the sink is demoted to degraded and only its
//!   own frame is dropped.
//! - [`DropPolicy::DropOldest`] / [`DropPolicy::DropNewest`]: silent
//!   eviction, visible through the per-sink eviction counter.
//!
//! A sink whose `accept` returns a fatal error is unregistered; the
//! pipeline keeps running for the remaining sinks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::pipeline::PipelineEvent;
use crate::sink::FrameSink;
use crate::types::Frame;

/// Base delay before re-offering a frame to a degraded sink.
const RETRY_BASE: Duration = Duration::from_millis(50);
/// Ceiling for the degraded-sink retry delay.
const RETRY_CEILING: Duration = Duration::from_secs(5);

/// Overflow behavior for one sink's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Wait for room up to the timeout; then degrade and drop for this
    /// sink only.
    Block { timeout: Duration },
    /// Evict the oldest queued frame to make room.
    DropOldest,
    /// Discard the incoming frame when full.
    DropNewest,
}

/// Registration-time description of a sink.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub name: String,
    /// Maximum frames queued ahead of the sink.
    pub queue_depth: usize,
    pub policy: DropPolicy,
}

impl SinkOptions {
    pub fn new(name: impl Into<String>, queue_depth: usize, policy: DropPolicy) -> Self {
        Self { name: name.into(), queue_depth, policy }
    }
}

/// Opaque token identifying a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

/// Observable per-sink counters.
///
/// A sink is degraded when its queue is stalled (Block policy timeouts)
/// or its `accept` is failing; the two conditions clear independently.
#[derive(Debug, Default)]
pub struct SinkStats {
    delivered: AtomicU64,
    evicted: AtomicU64,
    stalled: AtomicBool,
    failing: AtomicBool,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            degraded: self.stalled.load(Ordering::Relaxed)
                || self.failing.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SinkStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkStatsSnapshot {
    /// Frames the sink's `accept` completed successfully.
    pub delivered: u64,
    /// Frames dropped for this sink (policy eviction or block timeout).
    pub evicted: u64,
    /// Whether the sink is currently demoted.
    pub degraded: bool,
}

struct QueueState {
    frames: VecDeque<Arc<Frame>>,
    open: bool,
}

struct SinkQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Signalled when the worker pops (room for producers).
    space: Notify,
    /// Signalled when a producer pushes (work for the worker).
    items: Notify,
}

impl SinkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState { frames: VecDeque::new(), open: true }),
            capacity: capacity.max(1),
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    fn close(&self, discard: bool) {
        let mut state = self.state.lock().expect("sink queue lock");
        state.open = false;
        if discard {
            state.frames.clear();
        }
        drop(state);
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    fn is_open(&self) -> bool {
        self.state.lock().expect("sink queue lock").open
    }
}

struct Entry {
    id: RegistrationId,
    name: String,
    policy: DropPolicy,
    queue: Arc<SinkQueue>,
    stats: Arc<SinkStats>,
    worker: JoinHandle<()>,
}

struct Inner {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    events: broadcast::Sender<PipelineEvent>,
}

/// Fan-out hub. Cheap to clone; clones share the sink set.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(events: broadcast::Sender<PipelineEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Register a sink and spawn its worker task.
    pub fn register(&self, sink: Arc<dyn FrameSink>, opts: SinkOptions) -> RegistrationId {
        let id = RegistrationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(SinkQueue::new(opts.queue_depth));
        let stats = Arc::new(SinkStats::default());

        let worker = tokio::spawn(sink_worker(
            sink,
            opts.name.clone(),
            Arc::clone(&queue),
            Arc::clone(&stats),
            self.inner.events.clone(),
        ));

        info!(sink = %opts.name, depth = opts.queue_depth, policy = ?opts.policy, "sink registered");
        self.inner.entries.lock().expect("dispatcher lock").push(Entry {
            id,
            name: opts.name,
            policy: opts.policy,
            queue,
            stats,
            worker,
        });
        id
    }

    /// Stop offering frames to a sink. Queued-but-undelivered frames are
    /// discarded; an in-flight `accept` finishes on the worker task.
    pub fn unregister(&self, id: RegistrationId) {
        let mut entries = self.inner.entries.lock().expect("dispatcher lock");
        if let Some(index) = entries.iter().position(|e| e.id == id) {
            let entry = entries.remove(index);
            info!(sink = %entry.name, "sink unregistered");
            entry.queue.close(true);
        }
    }

    /// Offer a frame to every registered sink.
    ///
    /// The frame value is shared, never copied or mutated. Time spent here
    /// is bounded by the sum of the Block timeouts of currently-full Block
    /// sinks; eviction policies never wait.
    pub async fn dispatch(&self, frame: &Arc<Frame>) {
        // Snapshot under the lock, offer outside it
        let targets: Vec<(String, DropPolicy, Arc<SinkQueue>, Arc<SinkStats>)> = {
            let mut entries = self.inner.entries.lock().expect("dispatcher lock");
            // Drop entries whose workers died (fatal sink errors)
            entries.retain(|e| e.queue.is_open());
            entries
                .iter()
                .map(|e| (e.name.clone(), e.policy, Arc::clone(&e.queue), Arc::clone(&e.stats)))
                .collect()
        };

        for (name, policy, queue, stats) in targets {
            offer(frame, &name, policy, &queue, &stats, &self.inner.events).await;
        }
    }

    /// Stats for a registered sink, if still registered.
    pub fn stats(&self, id: RegistrationId) -> Option<SinkStatsSnapshot> {
        let entries = self.inner.entries.lock().expect("dispatcher lock");
        entries.iter().find(|e| e.id == id).map(|e| e.stats.snapshot())
    }

    /// Number of currently registered sinks.
    pub fn sink_count(&self) -> usize {
        self.inner.entries.lock().expect("dispatcher lock").len()
    }

    /// Stop accepting new frames and let workers drain their queues, up to
    /// the grace period; whatever is still queued afterwards is dropped.
    pub async fn shutdown(&self, grace: Duration) {
        let entries: Vec<Entry> = {
            let mut guard = self.inner.entries.lock().expect("dispatcher lock");
            std::mem::take(&mut *guard)
        };

        for entry in &entries {
            entry.queue.close(false);
        }

        let deadline = Instant::now() + grace;
        for entry in entries {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abort = entry.worker.abort_handle();
            match tokio::time::timeout(remaining, entry.worker).await {
                Ok(_) => debug!(sink = %entry.name, "sink drained"),
                Err(_) => {
                    warn!(sink = %entry.name, "drain grace period expired, stopping sink");
                    entry.queue.close(true);
                    abort.abort();
                }
            }
        }
    }
}

async fn offer(
    frame: &Arc<Frame>,
    name: &str,
    policy: DropPolicy,
    queue: &SinkQueue,
    stats: &SinkStats,
    events: &broadcast::Sender<PipelineEvent>,
) {
    match policy {
        DropPolicy::DropOldest => {
            let mut state = queue.state.lock().expect("sink queue lock");
            if !state.open {
                return;
            }
            if state.frames.len() >= queue.capacity {
                state.frames.pop_front();
                stats.evicted.fetch_add(1, Ordering::Relaxed);
            }
            state.frames.push_back(Arc::clone(frame));
            drop(state);
            queue.items.notify_one();
        }
        DropPolicy::DropNewest => {
            let mut state = queue.state.lock().expect("sink queue lock");
            if !state.open {
                return;
            }
            if state.frames.len() >= queue.capacity {
                stats.evicted.fetch_add(1, Ordering::Relaxed);
            } else {
                state.frames.push_back(Arc::clone(frame));
                drop(state);
                queue.items.notify_one();
            }
        }
        DropPolicy::Block { timeout } => {
            let deadline = Instant::now() + timeout;
            loop {
                let space = queue.space.notified();
                {
                    let mut state = queue.state.lock().expect("sink queue lock");
                    if !state.open {
                        return;
                    }
                    if state.frames.len() < queue.capacity {
                        state.frames.push_back(Arc::clone(frame));
                        drop(state);
                        queue.items.notify_one();
                        if stats.stalled.swap(false, Ordering::Relaxed) {
                            info!(sink = %name, "sink queue caught up");
                            let _ = events
                                .send(PipelineEvent::SinkRecovered { sink: name.to_string() });
                        }
                        return;
                    }
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero()
                    || tokio::time::timeout(remaining, space).await.is_err()
                {
                    stats.evicted.fetch_add(1, Ordering::Relaxed);
                    if !stats.stalled.swap(true, Ordering::Relaxed) {
                        warn!(sink = %name, ?timeout, "sink queue full past timeout, demoting");
                        let _ =
                            events.send(PipelineEvent::SinkDegraded { sink: name.to_string() });
                    }
                    return;
                }
            }
        }
    }
}

async fn sink_worker(
    sink: Arc<dyn FrameSink>,
    name: String,
    queue: Arc<SinkQueue>,
    stats: Arc<SinkStats>,
    events: broadcast::Sender<PipelineEvent>,
) {
    let mut retries = 0u32;

    'outer: loop {
        // Register interest before checking so a push between the check
        // and the await still wakes us
        let items = queue.items.notified();

        let frame = {
            let mut state = queue.state.lock().expect("sink queue lock");
            match state.frames.pop_front() {
                Some(frame) => {
                    drop(state);
                    queue.space.notify_one();
                    Some(frame)
                }
                None if !state.open => break,
                None => None,
            }
        };

        let Some(frame) = frame else {
            items.await;
            continue;
        };

        // Deliver, re-offering on degraded errors
        loop {
            match sink.accept(&frame).await {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    if retries > 0 {
                        retries = 0;
                        if stats.failing.swap(false, Ordering::Relaxed) {
                            info!(sink = %name, "sink recovered");
                            let _ =
                                events.send(PipelineEvent::SinkRecovered { sink: name.clone() });
                        }
                    }
                    break;
                }
                Err(err) if err.is_fatal() => {
                    error!(sink = %name, error = %err, "fatal sink error, unregistering");
                    let _ = events.send(PipelineEvent::SinkFailed {
                        sink: name.clone(),
                        reason: err.to_string(),
                    });
                    queue.close(true);
                    break 'outer;
                }
                Err(err) => {
                    if !stats.failing.swap(true, Ordering::Relaxed) {
                        warn!(sink = %name, error = %err, "sink degraded");
                        let _ = events.send(PipelineEvent::SinkDegraded { sink: name.clone() });
                    }
                    let delay = retry_delay(retries);
                    retries = retries.saturating_add(1);
                    debug!(sink = %name, ?delay, "retrying frame after sink error");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    if let Err(err) = sink.flush().await {
        warn!(sink = %name, error = %err, "flush on shutdown failed");
    }
    debug!(sink = %name, "sink worker stopped");
}

fn retry_delay(retries: u32) -> Duration {
    let factor = 1u32 << retries.min(7);
    RETRY_CEILING.min(RETRY_BASE * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::SinkError;
    use crate::types::{CanId, ChannelId, Direction, FrameFlags};

    fn frame(sequence: u64) -> Arc<Frame> {
        Arc::new(Frame {
            channel: ChannelId(0),
            id: CanId::Standard(0x100),
            payload: vec![1, 2],
            direction: Direction::Rx,
            flags: FrameFlags::default(),
            wall_clock: Utc::now(),
            monotonic_ns: sequence,
            sequence,
            dropped: 0,
        })
    }

    /// Sink that records sequences, optionally sleeping per frame.
    struct RecordingSink {
        seen: Mutex<Vec<u64>>,
        delay: Duration,
    }

    impl RecordingSink {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self { seen: Mutex::new(Vec::new()), delay })
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn accept(&self, frame: &Arc<Frame>) -> Result<(), SinkError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().unwrap().push(frame.sequence);
            Ok(())
        }
    }

    /// Sink whose accept never returns.
    struct StuckSink;

    #[async_trait]
    impl FrameSink for StuckSink {
        async fn accept(&self, _frame: &Arc<Frame>) -> Result<(), SinkError> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    /// Sink that fails fatally on the first frame.
    struct PoisonSink;

    #[async_trait]
    impl FrameSink for PoisonSink {
        async fn accept(&self, _frame: &Arc<Frame>) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    fn dispatcher() -> Dispatcher {
        let (events, _) = broadcast::channel(64);
        Dispatcher::new(events)
    }

    #[tokio::test]
    async fn delivers_in_dispatch_order() {
        let dispatcher = dispatcher();
        let sink = RecordingSink::new(Duration::ZERO);
        dispatcher.register(
            sink.clone(),
            SinkOptions::new("rec", 16, DropPolicy::DropOldest),
        );

        for seq in 1..=5 {
            dispatcher.dispatch(&frame(seq)).await;
        }
        dispatcher.shutdown(Duration::from_secs(1)).await;

        assert_eq!(sink.seen(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn stuck_sink_does_not_delay_fast_sink() {
        let dispatcher = dispatcher();
        let stuck_id = dispatcher.register(
            Arc::new(StuckSink),
            SinkOptions::new(
                "stuck",
                1,
                DropPolicy::Block { timeout: Duration::from_millis(50) },
            ),
        );
        let fast = RecordingSink::new(Duration::ZERO);
        dispatcher.register(fast.clone(), SinkOptions::new("fast", 16, DropPolicy::DropOldest));

        let started = Instant::now();
        for seq in 1..=10 {
            dispatcher.dispatch(&frame(seq)).await;
        }
        let elapsed = started.elapsed();

        // The stuck sink costs at most one block timeout per dispatch;
        // nothing is lost for the fast sink.
        assert!(elapsed < Duration::from_secs(2), "dispatch stalled: {elapsed:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fast.seen().len(), 10);

        let stats = dispatcher.stats(stuck_id).unwrap();
        assert!(stats.degraded);
        assert!(stats.evicted > 0);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_from_the_front() {
        let dispatcher = dispatcher();
        // Worker is held busy by the first frame; the rest pile up in a
        // depth-2 queue
        let sink = RecordingSink::new(Duration::from_millis(100));
        let id = dispatcher.register(sink.clone(), SinkOptions::new("slow", 2, DropPolicy::DropOldest));

        dispatcher.dispatch(&frame(1)).await;
        // Let the worker pick up frame 1 before the queue starts filling
        tokio::time::sleep(Duration::from_millis(10)).await;
        for seq in 2..=6 {
            dispatcher.dispatch(&frame(seq)).await;
        }
        dispatcher.shutdown(Duration::from_secs(2)).await;

        let seen = sink.seen();
        // Frame 1 went straight to the worker; of 2..=6 only the newest
        // two survive the depth-2 queue
        assert!(seen.contains(&1));
        assert!(seen.contains(&6));
        assert!(seen.len() <= 4, "expected evictions, saw {seen:?}");
        assert!(dispatcher.stats(id).is_none(), "shutdown clears registrations");
    }

    #[tokio::test]
    async fn drop_newest_keeps_earliest_frames() {
        let dispatcher = dispatcher();
        let sink = RecordingSink::new(Duration::from_millis(100));
        dispatcher.register(sink.clone(), SinkOptions::new("slow", 2, DropPolicy::DropNewest));

        dispatcher.dispatch(&frame(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        for seq in 2..=6 {
            dispatcher.dispatch(&frame(seq)).await;
        }
        dispatcher.shutdown(Duration::from_secs(2)).await;

        let seen = sink.seen();
        assert!(seen.starts_with(&[1, 2, 3]), "expected head retained, saw {seen:?}");
    }

    #[tokio::test]
    async fn fatal_sink_is_unregistered_and_reported() {
        let (events, mut events_rx) = broadcast::channel(16);
        let dispatcher = Dispatcher::new(events);
        dispatcher.register(
            Arc::new(PoisonSink),
            SinkOptions::new("poison", 4, DropPolicy::DropOldest),
        );
        let healthy = RecordingSink::new(Duration::ZERO);
        dispatcher.register(healthy.clone(), SinkOptions::new("ok", 4, DropPolicy::DropOldest));

        dispatcher.dispatch(&frame(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.dispatch(&frame(2)).await;
        dispatcher.shutdown(Duration::from_secs(1)).await;

        assert_eq!(healthy.seen(), vec![1, 2]);

        let mut saw_failure = false;
        while let Ok(event) = events_rx.try_recv() {
            if matches!(&event, PipelineEvent::SinkFailed { sink, .. } if sink == "poison") {
                saw_failure = true;
            }
        }
        assert!(saw_failure, "expected a SinkFailed event");
    }

    #[tokio::test]
    async fn unregister_stops_offers_immediately() {
        let dispatcher = dispatcher();
        let sink = RecordingSink::new(Duration::ZERO);
        let id = dispatcher.register(sink.clone(), SinkOptions::new("rec", 16, DropPolicy::DropOldest));

        dispatcher.dispatch(&frame(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.unregister(id);
        dispatcher.dispatch(&frame(2)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sink.seen(), vec![1]);
        assert_eq!(dispatcher.sink_count(), 0);
    }
}
