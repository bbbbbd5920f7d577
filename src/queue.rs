//! Single-writer task queue and one-shot readiness barrier.
//!
//! Every result set multiplexer and the channel router own a [`SerialQueue`].
//! Tasks on one queue run strictly in FIFO order, one at a time, while
//! different queues proceed independently. There is no dedicated worker
//! thread: whichever thread enqueues onto an idle queue drains it.

use crate::error::{Result, SyncError};
use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use std::time::Duration;

type Task = Box<dyn FnOnce() + Send>;

struct QueueState {
    tasks: VecDeque<Task>,
    /// Thread currently draining, if any.
    drainer: Option<ThreadId>,
}

/// Strict FIFO task queue drained by its callers.
pub struct SerialQueue {
    name: String,
    state: Mutex<QueueState>,
}

impl SerialQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                drainer: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task without waiting for it.
    ///
    /// If the queue is idle the calling thread drains it before returning,
    /// so on an uncontended queue the task has run when this returns.
    pub fn queue_task(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state.lock();
            state.tasks.push_back(Box::new(task));
            if state.drainer.is_some() {
                return;
            }
            state.drainer = Some(thread::current().id());
        }
        self.drain();
    }

    /// Run a task on the queue and wait for its result.
    ///
    /// Called from the thread already draining this queue (a task scheduling
    /// more work on its own queue), the task runs inline ahead of anything
    /// still queued.
    pub fn run_task<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_draining_on_current_thread() {
            return catch_unwind(AssertUnwindSafe(task)).map_err(|_| {
                tracing::error!(queue = %self.name, "inline task panicked");
                SyncError::TaskAborted(self.name.clone())
            });
        }

        let (tx, rx) = bounded(1);
        self.queue_task(move || {
            let _ = tx.send(task());
        });
        rx.recv()
            .map_err(|_| SyncError::TaskAborted(self.name.clone()))
    }

    /// Whether the current thread is inside one of this queue's tasks.
    pub fn is_draining_on_current_thread(&self) -> bool {
        self.state.lock().drainer == Some(thread::current().id())
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.state.lock().tasks.len()
    }

    fn drain(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                match state.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        state.drainer = None;
                        return;
                    }
                }
            };
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!(queue = %self.name, "queued task panicked");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LatchState {
    Pending,
    Ready,
    Failed(String),
}

/// One-shot barrier that settles once, either ready or failed.
pub struct ReadyLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl ReadyLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Pending),
            cond: Condvar::new(),
        }
    }

    /// Settle as ready. Returns false if the latch had already settled.
    pub fn set_ready(&self) -> bool {
        self.settle(LatchState::Ready)
    }

    /// Settle as failed. Returns false if the latch had already settled.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.settle(LatchState::Failed(reason.into()))
    }

    fn settle(&self, to: LatchState) -> bool {
        let mut state = self.state.lock();
        if *state != LatchState::Pending {
            return false;
        }
        *state = to;
        self.cond.notify_all();
        true
    }

    pub fn is_ready(&self) -> bool {
        *self.state.lock() == LatchState::Ready
    }

    pub fn is_settled(&self) -> bool {
        *self.state.lock() != LatchState::Pending
    }

    /// Block until the latch settles.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while *state == LatchState::Pending {
            self.cond.wait(&mut state);
        }
        Self::outcome(&state)
    }

    /// Block until the latch settles or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut state = self.state.lock();
        if *state == LatchState::Pending {
            self.cond.wait_for(&mut state, timeout);
        }
        match *state {
            LatchState::Pending => None,
            ref settled => Some(Self::outcome(settled)),
        }
    }

    fn outcome(state: &LatchState) -> Result<()> {
        match state {
            LatchState::Failed(reason) => Err(SyncError::QueryFailed(reason.clone())),
            _ => Ok(()),
        }
    }
}

impl Default for ReadyLatch {
    fn default() -> Self {
        Self::new()
    }
}
