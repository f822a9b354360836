//! The transfer scheduler.
//!
//! [`run_batch`] runs a batch of [`TransferTask`]s serially or on scoped OS threads.
//! Concurrency is bounded by a [`SchedulerContext`] that may be shared by many concurrent reads:
//! every running task holds a [`WorkerPermit`], so the number of transfer threads in the process never exceeds the context's maximum.
//!
//! The calling thread drives a poll loop. It launches tasks while permits are available,
//! retires one finished task per pass, and otherwise waits until a task finishes or the poll timeout elapses.
//! The first failure stops further launches. Every task already launched is waited for before the failure is returned,
//! so no transfer outlives the call.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::mpsc::{self, Receiver, TryRecvError},
    thread::{Scope, ScopedJoinHandle},
    time::Duration,
};

use chunkweave_storage::StorageError;
use parking_lot::{Condvar, Mutex};

use crate::{ReconstructError, config::Config};

/// The shared owner of the transfer worker count.
///
/// Create one per process (or per group of reads that should share a concurrency bound) and pass it to every read by [`Arc`](std::sync::Arc).
#[derive(Debug)]
pub struct SchedulerContext {
    active: Mutex<usize>,
    released: Condvar,
    max_workers: usize,
    poll_timeout: Duration,
}

impl Default for SchedulerContext {
    /// Create a context from the global [`Config`].
    fn default() -> Self {
        Self::from_config(&crate::config::global_config())
    }
}

impl SchedulerContext {
    /// Create a context allowing `max_workers` concurrent transfers.
    ///
    /// A `max_workers` of zero is raised to one.
    #[must_use]
    pub fn new(max_workers: usize, poll_timeout: Duration) -> Self {
        Self {
            active: Mutex::new(0),
            released: Condvar::new(),
            max_workers: max_workers.max(1),
            poll_timeout,
        }
    }

    /// Create a context from the transfer options of `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_transfer_threads(),
            Duration::from_millis(config.poll_timeout_ms()),
        )
    }

    /// The maximum number of concurrent transfers.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// The poll timeout.
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// The number of permits currently held.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        *self.active.lock()
    }

    /// Take a permit if fewer than [`max_workers`](Self::max_workers) are held.
    #[must_use]
    pub fn try_acquire(&self) -> Option<WorkerPermit<'_>> {
        let mut active = self.active.lock();
        if *active < self.max_workers {
            *active += 1;
            Some(WorkerPermit { context: self })
        } else {
            None
        }
    }

    /// Wait up to `timeout` for a permit to be released if none are available.
    fn wait_for_release(&self, timeout: Duration) {
        let mut active = self.active.lock();
        if *active >= self.max_workers {
            let _ = self.released.wait_for(&mut active, timeout);
        }
    }
}

/// One unit of transfer capacity, released on drop.
#[derive(Debug)]
pub struct WorkerPermit<'a> {
    context: &'a SchedulerContext,
}

impl Drop for WorkerPermit<'_> {
    fn drop(&mut self) {
        let mut active = self.context.active.lock();
        *active -= 1;
        self.context.released.notify_all();
    }
}

type TaskFn<'env> = Box<dyn FnOnce() -> Result<(), ReconstructError> + Send + 'env>;

/// A unit of transfer work.
pub struct TransferTask<'env> {
    label: String,
    work: TaskFn<'env>,
}

impl std::fmt::Debug for TransferTask<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTask")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl<'env> TransferTask<'env> {
    /// Create a task named `label` that runs `work`.
    pub fn new(
        label: impl Into<String>,
        work: impl FnOnce() -> Result<(), ReconstructError> + Send + 'env,
    ) -> Self {
        Self {
            label: label.into(),
            work: Box::new(work),
        }
    }

    /// The task label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the task on the current thread, converting a panic into [`ReconstructError::TaskPanicked`].
    fn run(self) -> Result<(), ReconstructError> {
        let Self { label, work } = self;
        catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            log::warn!("transfer task {label} panicked: {message}");
            Err(ReconstructError::TaskPanicked(label))
        })
    }
}

/// How a batch of tasks runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferMode {
    /// In submission order on the calling thread.
    Serial,
    /// On scoped threads bounded by the [`SchedulerContext`].
    Concurrent,
}

impl TransferMode {
    /// Concurrent if transfer threads are enabled and there are at least two tasks, serial otherwise.
    #[must_use]
    pub fn select(use_transfer_threads: bool, num_tasks: usize) -> Self {
        if use_transfer_threads && num_tasks >= 2 {
            Self::Concurrent
        } else {
            Self::Serial
        }
    }
}

/// The state of a launched task.
#[derive(Debug)]
pub enum TaskStatus {
    /// The task is running.
    Pending,
    /// The task finished.
    Ready(Result<(), ReconstructError>),
    /// The task was abandoned without reporting a result.
    Invalid,
}

/// Counts task completions so the poll loop can sleep until one happens.
#[derive(Debug, Default)]
struct Completion {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Completion {
    fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    fn notify(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    fn wait_changed(&self, seen: u64, timeout: Duration) {
        let mut generation = self.generation.lock();
        if *generation == seen {
            let _ = self.changed.wait_for(&mut generation, timeout);
        }
    }
}

/// A handle to a launched task.
#[derive(Debug)]
pub struct TaskHandle<'scope> {
    label: String,
    receiver: Receiver<Result<(), ReconstructError>>,
    thread: Option<ScopedJoinHandle<'scope, ()>>,
    _permit: WorkerPermit<'scope>,
}

impl<'scope> TaskHandle<'scope> {
    fn spawn<'env>(
        scope: &'scope Scope<'scope, 'env>,
        task: TransferTask<'env>,
        permit: WorkerPermit<'scope>,
        completion: &'scope Completion,
    ) -> Result<Self, ReconstructError> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let label = task.label.clone();
        let thread = std::thread::Builder::new()
            .name(format!("chunkweave-{label}"))
            .spawn_scoped(scope, move || {
                let result = task.run();
                let _ = sender.send(result);
                completion.notify();
            })
            .map_err(StorageError::from)?;
        log::trace!("launched transfer task {label}");
        Ok(Self {
            label,
            receiver,
            thread: Some(thread),
            _permit: permit,
        })
    }

    /// The task label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Check the task without blocking.
    pub fn poll_status(&mut self) -> TaskStatus {
        match self.receiver.try_recv() {
            Ok(result) => TaskStatus::Ready(result),
            Err(TryRecvError::Empty) => TaskStatus::Pending,
            Err(TryRecvError::Disconnected) => TaskStatus::Invalid,
        }
    }

    /// Wait for the task to finish.
    ///
    /// Returns [`None`] if the task was abandoned without reporting a result.
    pub fn join(mut self) -> Option<Result<(), ReconstructError>> {
        let result = self.receiver.recv().ok();
        self.join_thread();
        result
    }

    /// Wait for the thread of a task that has already reported, then release its permit.
    fn retire(mut self) {
        self.join_thread();
        log::trace!("retired transfer task {}", self.label);
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Retire the first finished task in `in_flight`.
///
/// Returns [`None`] if every task is still running.
fn retire_one(in_flight: &mut Vec<TaskHandle<'_>>) -> Option<TaskStatus> {
    let (index, status) = in_flight
        .iter_mut()
        .enumerate()
        .find_map(|(index, handle)| match handle.poll_status() {
            TaskStatus::Pending => None,
            status => Some((index, status)),
        })?;
    in_flight.swap_remove(index).retire();
    Some(status)
}

/// Run `tasks` to completion.
///
/// In [`TransferMode::Serial`] tasks run in submission order on the calling thread and the first failure is returned immediately.
/// In [`TransferMode::Concurrent`] tasks are launched in submission order as permits of `context` become available.
///
/// # Errors
/// Returns the first task failure. A panicking task fails with [`ReconstructError::TaskPanicked`].
pub fn run_batch(
    context: &SchedulerContext,
    tasks: Vec<TransferTask<'_>>,
    mode: TransferMode,
) -> Result<(), ReconstructError> {
    log::debug!("running {} transfer tasks ({mode:?})", tasks.len());
    match mode {
        TransferMode::Serial => tasks.into_iter().try_for_each(TransferTask::run),
        TransferMode::Concurrent => run_concurrent(context, tasks),
    }
}

fn run_concurrent(
    context: &SchedulerContext,
    tasks: Vec<TransferTask<'_>>,
) -> Result<(), ReconstructError> {
    let completion = Completion::default();
    std::thread::scope(|scope| {
        let mut queue: VecDeque<_> = tasks.into();
        let mut in_flight: Vec<TaskHandle<'_>> = Vec::new();
        let mut failure: Option<ReconstructError> = None;
        loop {
            while failure.is_none() && !queue.is_empty() {
                let Some(permit) = context.try_acquire() else {
                    break;
                };
                let Some(task) = queue.pop_front() else {
                    break;
                };
                match TaskHandle::spawn(scope, task, permit, &completion) {
                    Ok(handle) => in_flight.push(handle),
                    Err(err) => failure = Some(err),
                }
            }
            if failure.is_some() {
                queue.clear();
            }

            if in_flight.is_empty() {
                if queue.is_empty() {
                    break;
                }
                // every permit is held by other batches
                context.wait_for_release(context.poll_timeout());
                continue;
            }

            let seen = completion.generation();
            match retire_one(&mut in_flight) {
                Some(TaskStatus::Ready(Ok(())) | TaskStatus::Pending) => {}
                Some(TaskStatus::Ready(Err(err))) => {
                    if failure.is_none() {
                        log::debug!(
                            "transfer task failed, draining {} in flight: {err}",
                            in_flight.len()
                        );
                        failure = Some(err);
                    }
                }
                Some(TaskStatus::Invalid) => {
                    log::warn!("discarded an abandoned transfer task handle");
                }
                None => completion.wait_changed(seen, context.poll_timeout()),
            }
        }
        failure.map_or(Ok(()), Err)
    })
}
