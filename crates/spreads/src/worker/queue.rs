use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};
use parking_lot::Mutex;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// FIFO background queue with a single worker thread.
///
/// Process, output and asynchronous crop jobs run here one at a time, so
/// work submitted by different callers never interleaves.
pub struct TaskQueue {
    sender: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Receives the result of one submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    result: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finished. `None` if it panicked or the queue
    /// was shut down before it ran.
    pub fn wait(self) -> Option<T> {
        self.result.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        match self.result.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_result(&self) -> Option<T> {
        self.result.try_recv().ok()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded::<Task>();
        let worker = thread::Builder::new()
            .name("spreads-tasks".to_string())
            .spawn(move || run_worker(receiver));

        let worker = match worker {
            Ok(handle) => {
                info!("Started task queue worker");
                Some(handle)
            }
            Err(e) => {
                error!("Failed to start task queue worker: {}", e);
                None
            }
        };

        Self {
            sender: Mutex::new(worker.as_ref().map(|_| sender)),
            worker: Mutex::new(worker),
        }
    }

    /// Queues `task`; returns `None` once the queue is shut down.
    pub fn submit<T, F>(&self, task: F) -> Option<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = bounded::<T>(1);
        let job: Task = Box::new(move || {
            // Nobody may be waiting for the result
            let _ = result_tx.send(task());
        });

        let sender = self.sender.lock();
        let sender = sender.as_ref()?;
        sender.send(job).ok()?;
        Some(TaskHandle { result: result_rx })
    }

    pub fn pending(&self) -> usize {
        self.sender.lock().as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stops accepting work, drains what is queued and joins the worker.
    pub fn shutdown(&self) {
        // Drop sender to signal the worker to exit
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if let Err(e) = worker.join() {
                error!("Task queue worker panicked: {:?}", e);
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: Receiver<Task>) {
    debug!("Task queue worker started");
    for task in receiver.iter() {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("Background task panicked");
        }
    }
    debug!("Task queue worker stopped");
}
