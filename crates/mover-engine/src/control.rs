//! The single control context that owns world-mutating operations.
//!
//! Block spawning, removal, restoration and commits all execute on one named
//! thread. Work is handed to it with [`ControlContext::submit`], which yields a
//! [`Completion`] that can be awaited or waited on synchronously.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{JoinHandle, ThreadId};

use futures::channel::oneshot;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{panic_message, EngineError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The result of work submitted to the control context.
///
/// Resolves to [`EngineError::JobAbandoned`] when the job panicked or the
/// context shut down before running it.
#[must_use = "a completion does nothing unless awaited or waited on"]
pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Completion<T> {
    /// An already-resolved completion.
    pub fn ready(value: T) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }

    /// Block the current thread until the job has run.
    pub fn wait(self) -> Result<T, EngineError> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| EngineError::JobAbandoned))
    }
}

pub struct ControlContext {
    name: String,
    thread_id: ThreadId,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ControlContext {
    /// Start the control thread.
    pub fn spawn(name: impl Into<String>) -> Result<Arc<Self>, EngineError> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let thread_name = name.clone();
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(context = %thread_name, "control context started");
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
                debug!(context = %thread_name, "control context stopped");
            })?;
        Ok(Arc::new(Self {
            name,
            thread_id: join.thread().id(),
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is the control thread.
    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Fail with [`EngineError::WrongContext`] unless called on the control thread.
    pub fn assert_current(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(EngineError::WrongContext { operation })
        }
    }

    /// Run `f` on the control thread. Runs inline when already on it.
    pub fn submit<T, F>(&self, f: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let context = self.name.clone();
        let job = move || match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => {
                let _ = tx.send(value);
            }
            Err(payload) => {
                error!(context = %context, panic = %panic_message(&*payload), "control job panicked");
            }
        };

        if self.is_current() {
            job();
        } else {
            let sent = self
                .tx
                .lock()
                .as_ref()
                .is_some_and(|sender| sender.send(Box::new(job)).is_ok());
            if !sent {
                debug!(context = %self.name, "control context closed, dropping job");
            }
        }
        Completion { rx }
    }

    /// Stop accepting work and wait for queued jobs to drain.
    ///
    /// Jobs submitted afterwards resolve to [`EngineError::JobAbandoned`].
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        if self.is_current() {
            return;
        }
        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                error!(context = %self.name, "control thread terminated abnormally");
            }
        }
    }
}

impl Drop for ControlContext {
    fn drop(&mut self) {
        drop(self.tx.lock().take());
    }
}

impl std::fmt::Debug for ControlContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlContext")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_runs_on_control_thread() {
        let control = ControlContext::spawn("mover-control-test").unwrap();
        let name = control
            .submit(|| std::thread::current().name().map(str::to_string))
            .wait()
            .unwrap();
        assert_eq!(name.as_deref(), Some("mover-control-test"));
    }

    #[test]
    fn assert_current_off_thread_fails() {
        let control = ControlContext::spawn("mover-control-test").unwrap();
        assert!(matches!(
            control.assert_current("spawn blocks"),
            Err(EngineError::WrongContext { operation: "spawn blocks" })
        ));
        let inner = Arc::clone(&control);
        let on_thread = control
            .submit(move || inner.assert_current("spawn blocks").is_ok())
            .wait()
            .unwrap();
        assert!(on_thread);
    }

    #[test]
    fn nested_submit_runs_inline() {
        let control = ControlContext::spawn("mover-control-test").unwrap();
        let inner = Arc::clone(&control);
        let value = control
            .submit(move || inner.submit(|| 7).wait())
            .wait()
            .unwrap()
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn panicking_job_is_abandoned_and_thread_survives() {
        let control = ControlContext::spawn("mover-control-test").unwrap();
        let result = control.submit(|| -> u32 { panic!("bad job") }).wait();
        assert!(matches!(result, Err(EngineError::JobAbandoned)));
        assert_eq!(control.submit(|| 3).wait().unwrap(), 3);
    }

    #[test]
    fn submit_after_shutdown_is_abandoned() {
        let control = ControlContext::spawn("mover-control-test").unwrap();
        control.shutdown();
        assert!(matches!(
            control.submit(|| 1).wait(),
            Err(EngineError::JobAbandoned)
        ));
    }

    #[tokio::test]
    async fn completion_is_awaitable() {
        let control = ControlContext::spawn("mover-control-test").unwrap();
        assert_eq!(control.submit(|| 5).await.unwrap(), 5);
        assert_eq!(Completion::ready("done").await.unwrap(), "done");
    }
}
