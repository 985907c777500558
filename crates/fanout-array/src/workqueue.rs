//! Indexed background work queue.
//!
//! [`IndexedWorkQueue`] runs items through a [`Processor`] on a bounded pool of
//! tokio tasks and keeps an index of every item it has seen, so callers can
//! enqueue by id and poll the outcome later without waiting on it.
//!
//! ## Semantics
//!
//! - Queuing an id that is already indexed is a no-op; at most one job per id
//!   is ever in flight.
//! - A processor error is retried up to `max_retries` times, then the item is
//!   marked [`WorkStatus::Failed`] with the last error.
//! - A processor that panics marks its item [`WorkStatus::Failed`].
//! - When the index is full, the oldest finished item is evicted. If every
//!   indexed item is still running, queuing fails.
//!
//! ## Limitations
//!
//! - **Single-process only**: the index lives in memory; a restarted host
//!   re-queues work on its next poll.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Instant;

use async_trait::async_trait;
use fanout_core::observability::assembly_span;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};
use ulid::Ulid;

use crate::config::WorkQueueConfig;
use crate::error::{Error, Result};
use crate::metrics::ArrayMetrics;

/// Work performed for each queued item.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Item type.
    type Item: Send + Sync + 'static;

    /// Processes one item. Errors are retried by the queue.
    async fn process(&self, item: &Self::Item) -> Result<()>;
}

/// Status of an indexed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkStatus {
    /// Waiting for or being processed.
    NotDone,
    /// Processed successfully.
    Succeeded,
    /// Retries exhausted.
    Failed,
}

impl WorkStatus {
    /// Returns true once the item will not be processed again.
    #[must_use]
    pub const fn is_done(self) -> bool {
        !matches!(self, Self::NotDone)
    }
}

/// Snapshot of an indexed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItemInfo {
    /// Caller-supplied id.
    pub id: String,
    /// Unique id of this queue entry.
    pub entry_id: String,
    /// Current status.
    pub status: WorkStatus,
    /// Last processing error, if the item failed.
    pub error: Option<String>,
    /// Retries performed so far.
    pub retries: u32,
}

struct Entry<I> {
    item: Arc<I>,
    entry_id: Ulid,
    status: WorkStatus,
    error: Option<String>,
    retries: u32,
}

struct Index<I> {
    entries: HashMap<String, Entry<I>>,
    order: VecDeque<String>,
    pending: usize,
}

impl<I> Index<I> {
    fn evict_oldest_done(&mut self) -> bool {
        let Some(position) = self.order.iter().position(|id| {
            self.entries
                .get(id)
                .is_some_and(|entry| entry.status.is_done())
        }) else {
            return false;
        };
        if let Some(id) = self.order.remove(position) {
            self.entries.remove(&id);
        }
        true
    }
}

struct Shared<P: Processor> {
    name: String,
    config: WorkQueueConfig,
    processor: P,
    index: RwLock<Index<P::Item>>,
    metrics: ArrayMetrics,
}

/// Converts a lock poison error to a work queue error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::work_queue("work queue lock poisoned")
}

impl<P: Processor> Shared<P> {
    // Index updates never panic mid-write, so a poisoned index is still consistent.
    fn index_mut(&self) -> RwLockWriteGuard<'_, Index<P::Item>> {
        self.index.write().unwrap_or_else(|poisoned| {
            warn!(queue = %self.name, "recovering poisoned work queue index");
            poisoned.into_inner()
        })
    }

    fn item(&self, id: &str) -> Option<Arc<P::Item>> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.entries.get(id).map(|entry| Arc::clone(&entry.item))
    }

    fn update(&self, id: &str, status: WorkStatus, error: Option<String>, retries: u32) {
        let mut index = self.index_mut();
        let mut finished = false;
        if let Some(entry) = index.entries.get_mut(id) {
            finished = status.is_done() && !entry.status.is_done();
            entry.status = status;
            entry.error = error;
            entry.retries = retries;
        }
        if finished {
            index.pending = index.pending.saturating_sub(1);
        }
        let pending = index.pending;
        drop(index);
        if finished {
            self.metrics.set_queue_depth(&self.name, pending);
        }
    }

    fn fail(&self, id: &str, message: String) {
        let retries = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .map_or(0, |entry| entry.retries);
        self.metrics.record_assembly(&self.name, "failed");
        self.update(id, WorkStatus::Failed, Some(message), retries);
    }

    async fn work(&self, id: &str) {
        let Some(item) = self.item(id) else {
            return;
        };

        let mut retries = 0;
        loop {
            let started = Instant::now();
            let result = self.processor.process(&item).await;
            self.metrics
                .observe_assembly_duration(&self.name, started.elapsed());

            match result {
                Ok(()) => {
                    debug!(queue = %self.name, work_item = %id, retries, "work item succeeded");
                    self.metrics.record_assembly(&self.name, "succeeded");
                    self.update(id, WorkStatus::Succeeded, None, retries);
                    return;
                }
                Err(err) if retries < self.config.max_retries => {
                    retries += 1;
                    warn!(queue = %self.name, work_item = %id, retries, error = %err, "retrying work item");
                    self.metrics.record_assembly(&self.name, "retried");
                    self.update(id, WorkStatus::NotDone, Some(err.to_string()), retries);
                }
                Err(err) => {
                    error!(queue = %self.name, work_item = %id, retries, error = %err, "work item failed");
                    self.metrics.record_assembly(&self.name, "failed");
                    self.update(id, WorkStatus::Failed, Some(err.to_string()), retries);
                    return;
                }
            }
        }
    }
}

/// Work queue with an id-addressable index of items and their outcomes.
///
/// ## Example
///
/// ```rust,ignore
/// let queue = IndexedWorkQueue::new("outputs", WorkQueueConfig::default(), processor, metrics);
/// queue.start()?;
/// queue.queue("exec-1", item)?;
/// let info = queue.get("exec-1")?;
/// ```
pub struct IndexedWorkQueue<P: Processor> {
    shared: Arc<Shared<P>>,
    sender: mpsc::UnboundedSender<String>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl<P: Processor> std::fmt::Debug for IndexedWorkQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedWorkQueue")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<P: Processor> IndexedWorkQueue<P> {
    /// Creates a stopped queue. Items can be queued before [`start`](Self::start).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        config: WorkQueueConfig,
        processor: P,
        metrics: ArrayMetrics,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                processor,
                index: RwLock::new(Index {
                    entries: HashMap::new(),
                    order: VecDeque::new(),
                    pending: 0,
                }),
                metrics,
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The processor items run through.
    #[must_use]
    pub fn processor(&self) -> &P {
        &self.shared.processor
    }

    /// Starts the dispatcher on the current tokio runtime.
    ///
    /// The dispatcher stops once the queue is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkQueue`] if the queue was already started.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let mut receiver = self
            .receiver
            .lock()
            .map_err(poison_err)?
            .take()
            .ok_or_else(|| {
                Error::work_queue(format!("work queue {} already started", self.name()))
            })?;

        let shared = Arc::clone(&self.shared);
        let permits = Arc::new(Semaphore::new(shared.config.workers));
        debug!(queue = %shared.name, workers = shared.config.workers, "starting work queue");

        Ok(tokio::spawn(async move {
            while let Some(id) = receiver.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let worker = Arc::clone(&shared);
                    let job_id = id.clone();
                    let span = assembly_span(&shared.name, &id);
                    let job = async move { worker.work(&job_id).await }.instrument(span);
                    let outcome = tokio::spawn(job).await;
                    if let Err(err) = outcome {
                        error!(queue = %shared.name, work_item = %id, error = %err, "worker panicked");
                        shared.fail(&id, format!("worker panicked: {err}"));
                    }
                    drop(permit);
                });
            }
        }))
    }

    /// Queues `item` under `id`.
    ///
    /// Returns false without queuing if `id` is already indexed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkQueue`] if the index is full of unfinished items or
    /// the dispatcher has stopped.
    pub fn queue(&self, id: impl Into<String>, item: P::Item) -> Result<bool> {
        let id = id.into();
        let mut index = self.shared.index.write().map_err(poison_err)?;
        if index.entries.contains_key(&id) {
            return Ok(false);
        }
        if index.entries.len() >= self.shared.config.index_cache_max_items
            && !index.evict_oldest_done()
        {
            return Err(Error::work_queue(format!(
                "work queue {} index is full of unfinished items",
                self.name()
            )));
        }

        index.entries.insert(
            id.clone(),
            Entry {
                item: Arc::new(item),
                entry_id: Ulid::new(),
                status: WorkStatus::NotDone,
                error: None,
                retries: 0,
            },
        );
        index.order.push_back(id.clone());
        index.pending += 1;
        let pending = index.pending;
        drop(index);

        self.shared.metrics.set_queue_depth(self.name(), pending);
        self.sender.send(id).map_err(|_| {
            Error::work_queue(format!("work queue {} dispatcher stopped", self.name()))
        })?;
        Ok(true)
    }

    /// Returns the indexed state of `id`, or `None` if it is not indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, id: &str) -> Result<Option<WorkItemInfo>> {
        let index = self.shared.index.read().map_err(poison_err)?;
        Ok(index.entries.get(id).map(|entry| WorkItemInfo {
            id: id.to_string(),
            entry_id: entry.entry_id.to_string(),
            status: entry.status,
            error: entry.error.clone(),
            retries: entry.retries,
        }))
    }

    /// Number of indexed items.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let index = self.shared.index.read().map_err(poison_err)?;
        Ok(index.entries.len())
    }

    /// Returns true if nothing is indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    /// Fails the first `failures` attempts of every item.
    struct Flaky {
        failures: u32,
        attempts: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Processor for Flaky {
        type Item = u32;

        async fn process(&self, item: &u32) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(Error::work_queue(format!("item {item} attempt {attempt} failed")));
            }
            Ok(())
        }
    }

    /// Blocks until released.
    struct Gate {
        open: tokio::sync::Notify,
    }

    #[async_trait]
    impl Processor for Gate {
        type Item = ();

        async fn process(&self, _item: &()) -> Result<()> {
            self.open.notified().await;
            Ok(())
        }
    }

    struct Panicky;

    #[async_trait]
    impl Processor for Panicky {
        type Item = u32;

        async fn process(&self, item: &u32) -> Result<()> {
            panic!("processor blew up on {item}");
        }
    }

    fn config(max_retries: u32, capacity: usize) -> WorkQueueConfig {
        WorkQueueConfig {
            workers: 2,
            max_retries,
            index_cache_max_items: capacity,
        }
    }

    async fn wait_done<P: Processor>(queue: &IndexedWorkQueue<P>, id: &str) -> WorkItemInfo {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Some(info)) = queue.get(id) {
                    if info.status.is_done() {
                        return info;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("work item finished in time")
    }

    #[tokio::test]
    async fn processes_and_indexes() -> Result<()> {
        let queue = IndexedWorkQueue::new("test", config(0, 10), Flaky::new(0), ArrayMetrics::new());
        assert!(queue.get("a")?.is_none());

        queue.start()?;
        assert!(queue.queue("a", 1)?);
        let info = wait_done(&queue, "a").await;
        assert_eq!(info.status, WorkStatus::Succeeded);
        assert_eq!(info.retries, 0);
        assert!(Ulid::from_string(&info.entry_id).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_ids_are_not_requeued() -> Result<()> {
        let queue = IndexedWorkQueue::new("test", config(0, 10), Flaky::new(0), ArrayMetrics::new());
        queue.start()?;

        assert!(queue.queue("a", 1)?);
        assert!(!queue.queue("a", 2)?);
        wait_done(&queue, "a").await;
        assert!(!queue.queue("a", 3)?);

        assert_eq!(queue.processor().attempts.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn retries_then_succeeds() -> Result<()> {
        let queue = IndexedWorkQueue::new("test", config(3, 10), Flaky::new(2), ArrayMetrics::new());
        queue.start()?;
        queue.queue("a", 1)?;

        let info = wait_done(&queue, "a").await;
        assert_eq!(info.status, WorkStatus::Succeeded);
        assert_eq!(info.retries, 2);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_fail() -> Result<()> {
        let queue = IndexedWorkQueue::new("test", config(1, 10), Flaky::new(5), ArrayMetrics::new());
        queue.start()?;
        queue.queue("a", 7)?;

        let info = wait_done(&queue, "a").await;
        assert_eq!(info.status, WorkStatus::Failed);
        assert_eq!(info.retries, 1);
        assert!(info.error.is_some_and(|e| e.contains("item 7")));
        assert_eq!(queue.processor().attempts.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn full_index_evicts_finished_items_only() -> Result<()> {
        let queue = IndexedWorkQueue::new("test", config(0, 2), Flaky::new(0), ArrayMetrics::new());
        queue.start()?;
        queue.queue("a", 1)?;
        wait_done(&queue, "a").await;
        queue.queue("b", 2)?;
        wait_done(&queue, "b").await;

        queue.queue("c", 3)?;
        assert!(queue.get("a")?.is_none());
        assert!(queue.get("b")?.is_some());
        assert_eq!(queue.len()?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn full_index_of_running_items_rejects() -> Result<()> {
        let gate = Gate {
            open: tokio::sync::Notify::new(),
        };
        let queue = IndexedWorkQueue::new("test", config(0, 1), gate, ArrayMetrics::new());
        queue.start()?;
        queue.queue("a", ())?;

        assert!(matches!(queue.queue("b", ()), Err(Error::WorkQueue { .. })));

        queue.processor().open.notify_one();
        wait_done(&queue, "a").await;
        assert!(queue.queue("b", ())?);
        Ok(())
    }

    #[tokio::test]
    async fn starting_twice_fails() -> Result<()> {
        let queue = IndexedWorkQueue::new("test", config(0, 1), Flaky::new(0), ArrayMetrics::new());
        queue.start()?;
        assert!(matches!(queue.start(), Err(Error::WorkQueue { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn panicking_processor_fails_the_item() -> Result<()> {
        let queue = IndexedWorkQueue::new("test", config(3, 10), Panicky, ArrayMetrics::new());
        queue.start()?;
        queue.queue("a", 1)?;

        let info = wait_done(&queue, "a").await;
        assert_eq!(info.status, WorkStatus::Failed);
        assert!(info.error.is_some_and(|e| e.contains("panicked")));

        // The pool keeps serving after a panic.
        queue.queue("b", 2)?;
        assert_eq!(wait_done(&queue, "b").await.status, WorkStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn poisoned_index_still_records_outcomes() -> Result<()> {
        let gate = Gate {
            open: tokio::sync::Notify::new(),
        };
        let queue = IndexedWorkQueue::new("test", config(0, 10), gate, ArrayMetrics::new());
        queue.start()?;
        queue.queue("a", ())?;

        let shared = Arc::clone(&queue.shared);
        let _ = std::thread::spawn(move || {
            let _guard = shared.index.write().unwrap();
            panic!("poison the index");
        })
        .join();
        assert!(matches!(queue.get("a"), Err(Error::WorkQueue { .. })));

        queue.processor().open.notify_one();
        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = queue
                    .shared
                    .index
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entries
                    .get("a")
                    .map(|entry| entry.status);
                if status.is_some_and(WorkStatus::is_done) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("work item finished in time");
        assert_eq!(status, Some(WorkStatus::Succeeded));
        Ok(())
    }
}
