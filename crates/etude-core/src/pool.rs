// src/pool.rs
//! Fixed-size worker pool fed through a bounded FIFO queue.
//!
//! The reactor submits without ever blocking; a full queue hands the task
//! straight back so the caller decides what to drop. Workers sleep on a
//! condition variable while the queue is empty.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::error::{EtudeError, EtudeResult};

struct QueueState<T> {
    tasks: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer multi-consumer FIFO.
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    // A panicking task never holds the lock, so a poisoned guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking. Returns the task when the queue is full or closed.
    pub fn push(&self, task: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.closed || state.tasks.len() >= self.capacity {
            return Err(task);
        }
        state.tasks.push_back(task);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until a task is available. `None` once the queue is closed and
    /// fully drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            if state.closed {
                return None;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Refuse new tasks and wake every waiter. Queued tasks are still handed out.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct WorkerPool<T> {
    queue: Arc<TaskQueue<T>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` threads running `handler` on each submitted task.
    ///
    /// With `pin` set, worker `i` is pinned to core `i % cores`.
    pub fn new<F>(workers: usize, queue_depth: usize, pin: bool, handler: F) -> EtudeResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let queue = Arc::new(TaskQueue::new(queue_depth));
        let handler = Arc::new(handler);
        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = WorkerPool {
            queue: Arc::clone(&queue),
            handles: Vec::with_capacity(workers),
        };

        for i in 0..workers.max(1) {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);

            let spawned = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }

                    while let Some(task) = queue.pop() {
                        handler(task);
                    }
                    debug!(worker = i, "worker exiting");
                });

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(EtudeError::Spawn(e));
                }
            }
        }

        Ok(pool)
    }

    /// Hand a task to the workers without blocking.
    #[inline(always)]
    pub fn submit(&self, task: T) -> Result<(), T> {
        self.queue.push(task)
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl<T> WorkerPool<T> {
    /// Stop accepting tasks, let the workers drain what is queued, then join them.
    pub fn shutdown(&mut self) {
        self.queue.close();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
