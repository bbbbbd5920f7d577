//! Cancellable one-shot timers and fixed-interval background tasks.

use crossbeam_channel::{select, tick, unbounded, Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identifier of a scheduled one-shot timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

type Callback = Box<dyn FnOnce() + Send>;

enum Command {
    Schedule(TimerId, Instant, Callback),
    Cancel(TimerId),
    Shutdown,
}

/// Runs one-shot callbacks on a dedicated thread after a delay.
pub struct TimerService {
    commands: Sender<Command>,
    next_id: AtomicU64,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("livesync-timers".to_string())
            .spawn(move || run_timers(rx))
            .ok();
        if worker.is_none() {
            tracing::error!("failed to spawn timer thread; timers will not fire");
        }
        Self {
            commands: tx,
            next_id: AtomicU64::new(1),
            worker: parking_lot::Mutex::new(worker),
        }
    }

    /// Schedule `callback` to run once after `delay`.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let deadline = Instant::now() + delay;
        if self
            .commands
            .send(Command::Schedule(id, deadline, Box::new(callback)))
            .is_err()
        {
            tracing::warn!(timer = id.0, "timer service stopped; dropping timer");
        }
        id
    }

    /// Cancel a pending timer. Cancelling a fired timer is a no-op.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.commands.send(Command::Cancel(id));
    }

    /// Stop the timer thread, discarding pending timers.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timers(commands: Receiver<Command>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, TimerId)>> = BinaryHeap::new();
    let mut callbacks: HashMap<TimerId, Callback> = HashMap::new();

    loop {
        // Fire everything due.
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some(callback) = callbacks.remove(&id) {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)).is_err() {
                    tracing::error!(timer = id.0, "timer callback panicked");
                }
            }
        }

        let command = match deadlines.peek() {
            Some(Reverse((deadline, _))) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match commands.recv_timeout(wait) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match commands.recv() {
                Ok(cmd) => cmd,
                Err(_) => return,
            },
        };

        match command {
            Command::Schedule(id, deadline, callback) => {
                callbacks.insert(id, callback);
                deadlines.push(Reverse((deadline, id)));
            }
            Command::Cancel(id) => {
                // The heap entry is skipped when it comes due.
                callbacks.remove(&id);
            }
            Command::Shutdown => return,
        }
    }
}

/// A background thread running a task on a fixed interval until stopped.
pub struct PeriodicTask {
    name: String,
    stop: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn(
        name: impl Into<String>,
        interval: Duration,
        mut task: impl FnMut() + Send + 'static,
    ) -> Self {
        let name = name.into();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let ticker = tick(interval);
        let thread_name = name.clone();
        let worker = thread::Builder::new()
            .name(format!("livesync-{}", name))
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => task(),
                    recv(stop_rx) -> _ => {
                        tracing::debug!(task = %thread_name, "periodic task stopped");
                        return;
                    }
                }
            })
            .ok();
        if worker.is_none() {
            tracing::error!(task = %name, "failed to spawn periodic task");
        }
        Self {
            name,
            stop: stop_tx,
            worker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
