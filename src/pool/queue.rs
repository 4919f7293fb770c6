use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of deferred work.
///
/// The closure carries its own context (buffers, completion callback,
/// backend handle). It runs at most once, on exactly one worker.
pub struct Task {
    id: u64,
    label: &'static str,
    job: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new<F>(label: &'static str, job: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            label,
            job: Box::new(job),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Consumes the task and runs its action.
    pub fn run(self) {
        (self.job)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

/// What happens to queued tasks when the queue shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Workers keep popping until the queue is empty.
    #[default]
    Drain,
    /// Queued tasks are removed and handed back to the caller unrun.
    Discard,
}

/// Returned by [`TaskQueue::push`] after shutdown; the caller keeps the task.
#[derive(Debug)]
pub struct PushError(pub Task);

impl PushError {
    pub fn into_inner(self) -> Task {
        self.0
    }
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task queue closed, task {} rejected", self.0.id)
    }
}

impl std::error::Error for PushError {}

struct QueueState {
    tasks: VecDeque<Task>,
    closed: bool,
    /// Queued plus currently executing.
    pending: usize,
}

/// Unbounded multi-producer/multi-consumer FIFO of tasks.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                closed: false,
                pending: 0,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    /// Appends a task and wakes one waiting worker.
    pub fn push(&self, task: Task) -> Result<(), PushError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PushError(task));
        }
        state.tasks.push_back(task);
        state.pending += 1;
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until a task is available.
    ///
    /// Returns `None` once the queue is closed and empty. A caller that gets
    /// a task must report back through [`TaskQueue::task_done`].
    pub fn pop_blocking(&self) -> Option<Task> {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Marks one popped task as finished.
    pub fn task_done(&self) {
        let mut state = self.lock();
        state.pending -= 1;
        if state.pending == 0 {
            self.idle.notify_all();
        }
    }

    /// Closes the queue and wakes every blocked worker.
    ///
    /// With [`ShutdownPolicy::Discard`] the still-queued tasks are removed
    /// and returned; with `Drain` they stay for the workers to finish.
    pub fn shutdown(&self, policy: ShutdownPolicy) -> Vec<Task> {
        let mut state = self.lock();
        state.closed = true;

        let discarded: Vec<Task> = match policy {
            ShutdownPolicy::Drain => Vec::new(),
            ShutdownPolicy::Discard => state.tasks.drain(..).collect(),
        };
        state.pending -= discarded.len();
        if state.pending == 0 {
            self.idle.notify_all();
        }
        drop(state);

        self.available.notify_all();
        discarded
    }

    /// Blocks until nothing is queued or executing.
    pub fn wait_idle(&self) {
        let mut state = self.lock();
        while state.pending > 0 {
            state = self.idle.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
