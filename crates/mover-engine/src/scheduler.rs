//! Repeating and one-shot task scheduling.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::EngineError;

pub type TaskBody = Box<dyn FnMut() + Send + 'static>;

/// Cancellation handle of a scheduled task. `cancel()` is safe to call at
/// any time, including before the task first ran.
#[derive(Clone, Debug, Default)]
pub struct TaskHandle {
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub trait Scheduler: Send + Sync {
    /// Run `body` every `period` after `initial_delay`. An invocation always
    /// completes before the next one starts.
    fn schedule_repeating(&self, initial_delay: Duration, period: Duration, body: TaskBody)
        -> TaskHandle;

    fn spawn(&self, task: BoxFuture<'static, ()>);

    fn spawn_delayed(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle;
}

/// Run a fallible continuation, logging its error instead of dropping it.
pub fn spawn_logged<F>(scheduler: &dyn Scheduler, what: &'static str, task: F)
where
    F: Future<Output = Result<(), EngineError>> + Send + 'static,
{
    scheduler.spawn(Box::pin(async move {
        if let Err(e) = task.await {
            warn!(task = what, error = %e, "continuation failed");
        }
    }));
}

/// Scheduler backed by a tokio runtime.
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context.
    ///
    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        mut body: TaskBody,
    ) -> TaskHandle {
        let task = TaskHandle::new();
        let cancel = task.cancel.clone();
        let period = period.max(Duration::from_millis(1));
        let _ = self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => body(),
                }
            }
        });
        task
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        let _ = self.handle.spawn(task);
    }

    fn spawn_delayed(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle {
        let handle = TaskHandle::new();
        let cancel = handle.cancel.clone();
        let _ = self.handle.spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => task.await,
            }
        });
        handle
    }
}

struct Repeating {
    handle: TaskHandle,
    body: Option<TaskBody>,
}

/// Deterministic scheduler driven by explicit [`ManualScheduler::advance`]
/// calls. Delays and periods are ignored: every advance fires each live
/// repeating task once, then every delayed task queued before the advance.
/// Spawned futures run to completion inline.
#[derive(Default)]
pub struct ManualScheduler {
    repeating: Mutex<Vec<Repeating>>,
    delayed: Mutex<Vec<(TaskHandle, BoxFuture<'static, ()>)>>,
    advances: AtomicU64,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self) {
        let _ = self.advances.fetch_add(1, Ordering::Relaxed);
        let due = std::mem::take(&mut *self.delayed.lock());

        let count = self.repeating.lock().len();
        for i in 0..count {
            let body = {
                let mut tasks = self.repeating.lock();
                let task = &mut tasks[i];
                if task.handle.is_cancelled() {
                    None
                } else {
                    task.body.take()
                }
            };
            if let Some(mut body) = body {
                body();
                self.repeating.lock()[i].body = Some(body);
            }
        }
        self.repeating.lock().retain(|t| !t.handle.is_cancelled());

        for (handle, task) in due {
            if !handle.is_cancelled() {
                futures::executor::block_on(task);
            }
        }
    }

    pub fn advance_by(&self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    /// Repeating tasks that have not been cancelled.
    pub fn live_tasks(&self) -> usize {
        self.repeating
            .lock()
            .iter()
            .filter(|t| !t.handle.is_cancelled())
            .count()
    }

    pub fn pending_delayed(&self) -> usize {
        self.delayed.lock().len()
    }

    pub fn advances(&self) -> u64 {
        self.advances.load(Ordering::Relaxed)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_repeating(
        &self,
        _initial_delay: Duration,
        _period: Duration,
        body: TaskBody,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        self.repeating.lock().push(Repeating {
            handle: handle.clone(),
            body: Some(body),
        });
        handle
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        futures::executor::block_on(task);
    }

    fn spawn_delayed(&self, _delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle {
        let handle = TaskHandle::new();
        self.delayed.lock().push((handle.clone(), task));
        handle
    }
}
