//! Priority task queue and dispatch pump
//!
//! Enqueue never blocks and never sheds; the queue is unbounded. The pump on
//! the other side is bounded by a semaphore, so at most `max_in_flight` tasks
//! run concurrently. Ordering is strict: lower priority value first, FIFO
//! within a priority via a monotonic sequence number.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, warn};

use crate::task::Task;

/// Executes one dequeued task. Implementations absorb their own errors; a
/// handler failure must never take the pump down.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: Task);
}

/// Heap entry. `BinaryHeap` is a max-heap, so comparisons are reversed to pop
/// the lowest priority value first and the lowest sequence within a priority.
struct QueuedTask {
    task: Task,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Unbounded priority queue with a bounded dispatch pump
pub struct QueueProcessor {
    heap: Arc<Mutex<BinaryHeap<QueuedTask>>>,
    seq: AtomicU64,
    notify: Arc<Notify>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    shutdown: Arc<AtomicBool>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QueueProcessor {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            heap: Arc::new(Mutex::new(BinaryHeap::new())),
            seq: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            shutdown: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        }
    }

    /// Enqueue a task. Non-blocking, no shedding.
    pub async fn enqueue(&self, task: Task) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(task = %task.id, priority = task.priority, seq, "task enqueued");
        self.heap.lock().await.push(QueuedTask { task, seq });
        self.notify.notify_one();
    }

    /// Tasks queued but not yet dispatched
    pub async fn depth(&self) -> usize {
        self.heap.lock().await.len()
    }

    /// Tasks currently being handled
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.permits.available_permits())
    }

    /// Start the dispatch pump. The pump parks permit-free while the queue
    /// is empty, then takes a concurrency permit and pops the best task, so
    /// ordering is decided at dispatch time against everything enqueued so
    /// far and an idle pump counts nothing toward `in_flight`.
    pub async fn start(&self, handler: Arc<dyn TaskHandler>) {
        let heap = self.heap.clone();
        let notify = self.notify.clone();
        let permits = self.permits.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                loop {
                    if shutdown.load(AtomicOrdering::SeqCst) {
                        return;
                    }
                    if !heap.lock().await.is_empty() {
                        break;
                    }
                    notify.notified().await;
                }
                let permit = match permits.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                if shutdown.load(AtomicOrdering::SeqCst) {
                    return;
                }
                let Some(entry) = heap.lock().await.pop() else {
                    continue;
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler.handle(entry.task).await;
                    drop(permit);
                });
            }
        });
        *self.pump.lock().await = Some(handle);
    }

    /// Stop the pump. Queued tasks stay queued; in-flight tasks finish.
    pub async fn stop(&self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
        if let Some(handle) = self.pump.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "queue pump terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Phase;
    use std::time::Duration;
    use uuid::Uuid;

    fn task(priority: u8, tag: &str) -> Task {
        Task::new(
            Uuid::new_v4(),
            Phase::Discovery,
            serde_json::json!({ "tag": tag }),
            priority,
        )
    }

    /// Records the order tasks were handled in.
    struct Recorder {
        seen: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, task: Task) {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let tag = task.payload["tag"].as_str().unwrap_or("").to_string();
            self.seen.lock().await.push(tag);
        }
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        // One permit so dispatch order equals handling order.
        let queue = QueueProcessor::new(1);
        queue.enqueue(task(10, "b1")).await;
        queue.enqueue(task(5, "a1")).await;
        queue.enqueue(task(10, "b2")).await;
        queue.enqueue(task(5, "a2")).await;

        let recorder = Recorder::new(Duration::ZERO);
        queue.start(recorder.clone()).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.stop().await;

        let seen = recorder.seen.lock().await.clone();
        assert_eq!(seen, vec!["a1", "a2", "b1", "b2"]);
    }

    #[tokio::test]
    async fn test_in_flight_bounded_by_permits() {
        let queue = QueueProcessor::new(2);
        for i in 0..6 {
            queue.enqueue(task(10, &format!("t{i}"))).await;
        }
        let recorder = Recorder::new(Duration::from_millis(50));
        queue.start(recorder.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.in_flight() <= 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(recorder.seen.lock().await.len(), 6);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_enqueue_while_running() {
        let queue = QueueProcessor::new(1);
        let recorder = Recorder::new(Duration::ZERO);
        queue.start(recorder.clone()).await;

        queue.enqueue(task(10, "late")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.seen.lock().await.clone(), vec!["late"]);
        assert_eq!(queue.depth().await, 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_idle_pump_holds_no_permit() {
        let queue = QueueProcessor::new(2);
        let recorder = Recorder::new(Duration::ZERO);
        queue.start(recorder).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.in_flight(), 0);

        queue.enqueue(task(10, "one")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Drained again: the permit went back when the handler finished.
        assert_eq!(queue.in_flight(), 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_leaves_queued_tasks() {
        let queue = QueueProcessor::new(1);
        let recorder = Recorder::new(Duration::ZERO);
        queue.stop().await;
        queue.enqueue(task(10, "parked")).await;
        drop(recorder);
        assert_eq!(queue.depth().await, 1);
    }
}
