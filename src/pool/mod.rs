//! Fixed-size worker thread pool.
//!
//! Each worker loops on [`TaskQueue::pop_blocking`], runs the task to
//! completion and goes back for more until the queue reports shutdown.
//! Submission only enqueues: a task never runs on the submitting thread.

pub mod queue;

pub use queue::{PushError, ShutdownPolicy, Task, TaskQueue};

use crate::error::{KvError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

/// Execution state of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
}

/// A worker's state plus the id of the task it is running, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub current_task: Option<u64>,
}

/// Aggregate view of the pool.
///
/// `idle + busy == total_threads` in every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total_threads: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
    pub executed: u64,
}

struct WorkerSlot {
    status: Mutex<WorkerStatus>,
}

impl WorkerSlot {
    fn set(&self, state: WorkerState, current_task: Option<u64>) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.state = state;
        status.current_task = current_task;
    }

    fn get(&self) -> WorkerStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct PoolShared {
    queue: TaskQueue,
    busy: AtomicUsize,
    executed: AtomicU64,
    panicked: AtomicU64,
}

/// Bounded set of OS threads executing queued tasks.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    slots: Vec<Arc<WorkerSlot>>,
    worker_ids: Vec<ThreadId>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts exactly `num_threads` workers.
    ///
    /// # Errors
    ///
    /// - `InvalidParam` if `num_threads` is 0
    /// - `NoMemory` if a thread cannot be spawned; workers already started
    ///   are stopped and joined before returning
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(KvError::InvalidParam(
                "worker pool needs at least one thread".to_string(),
            ));
        }

        let shared = Arc::new(PoolShared {
            queue: TaskQueue::new(),
            busy: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        let mut slots = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);

        for id in 0..num_threads {
            let slot = Arc::new(WorkerSlot {
                status: Mutex::new(WorkerStatus {
                    state: WorkerState::Idle,
                    current_task: None,
                }),
            });

            let worker_shared = Arc::clone(&shared);
            let worker_slot = Arc::clone(&slot);
            let spawned = thread::Builder::new()
                .name(format!("nvmekv-worker-{}", id))
                .spawn(move || worker_loop(worker_shared, worker_slot));

            match spawned {
                Ok(handle) => {
                    slots.push(slot);
                    handles.push(handle);
                }
                Err(e) => {
                    tracing::error!("Failed to spawn worker {}: {}", id, e);
                    shared.queue.shutdown(ShutdownPolicy::Drain);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(KvError::NoMemory(format!(
                        "cannot spawn worker thread: {}",
                        e
                    )));
                }
            }
        }

        tracing::info!("Worker pool started with {} threads", num_threads);

        let worker_ids = handles.iter().map(|h| h.thread().id()).collect();

        Ok(Self {
            shared,
            slots,
            worker_ids,
            handles: Mutex::new(handles),
        })
    }

    /// Enqueues a task for a worker and returns immediately.
    ///
    /// After shutdown the task is handed back inside the error.
    pub fn submit(&self, task: Task) -> std::result::Result<(), PushError> {
        tracing::debug!("Submitting task {} ({})", task.id(), task.label());
        self.shared.queue.push(task)
    }

    /// Blocks until no task is queued or running.
    ///
    /// Must not be called from inside a task.
    pub fn wait_idle(&self) {
        self.shared.queue.wait_idle();
    }

    /// Closes the queue and joins every worker.
    ///
    /// Returns how many queued tasks were discarded (always 0 for
    /// [`ShutdownPolicy::Drain`]). Calling it again is a no-op.
    pub fn shutdown(&self, policy: ShutdownPolicy) -> usize {
        let discarded = self.shared.queue.shutdown(policy);
        let discarded_count = discarded.len();
        if discarded_count > 0 {
            tracing::warn!("Discarded {} queued tasks on shutdown", discarded_count);
        }
        drop(discarded);

        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()),
        );
        if handles.is_empty() {
            return discarded_count;
        }

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                // Shutdown triggered from a task; this worker exits on its own.
                tracing::warn!("Worker pool shut down from its own worker thread");
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Worker thread terminated abnormally");
            }
        }

        tracing::info!(
            "Worker pool stopped: {} tasks executed, {} panicked",
            self.shared.executed.load(Ordering::Relaxed),
            self.shared.panicked.load(Ordering::Relaxed)
        );
        discarded_count
    }

    pub fn total_threads(&self) -> usize {
        self.slots.len()
    }

    /// True when called from inside a task running on this pool.
    pub fn is_worker_thread(&self) -> bool {
        self.worker_ids.contains(&thread::current().id())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.queue.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        let total_threads = self.slots.len();
        let busy = self.shared.busy.load(Ordering::SeqCst).min(total_threads);
        PoolStatus {
            total_threads,
            idle: total_threads - busy,
            busy,
            queued: self.shared.queue.len(),
            executed: self.shared.executed.load(Ordering::SeqCst),
        }
    }

    /// Per-worker state, indexed by worker number.
    pub fn worker_states(&self) -> Vec<WorkerStatus> {
        self.slots.iter().map(|slot| slot.get()).collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownPolicy::Drain);
    }
}

fn worker_loop(shared: Arc<PoolShared>, slot: Arc<WorkerSlot>) {
    while let Some(task) = shared.queue.pop_blocking() {
        let id = task.id();
        let label = task.label();

        slot.set(WorkerState::Busy, Some(id));
        shared.busy.fetch_add(1, Ordering::SeqCst);

        if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Task {} ({}) panicked", id, label);
        }

        shared.busy.fetch_sub(1, Ordering::SeqCst);
        slot.set(WorkerState::Idle, None);
        shared.executed.fetch_add(1, Ordering::SeqCst);
        shared.queue.task_done();
    }
}
