//! Frame tasks
//!
//! Background work started during a frame and joined later in the same
//! frame. There is no implicit synchronization: whoever needs the result
//! calls [`FrameTask::wait`] first.
//!
//! # Usage
//!
//! ```ignore
//! let task = FrameTask::spawn("light-mobility", move || state.advanced());
//! // ... other frame work ...
//! let state = task.wait()?;
//! ```

use crate::error::{CacheError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Handle to work running on a named background thread
pub struct FrameTask<T> {
    name: &'static str,
    state: TaskState<T>,
}

enum TaskState<T> {
    Done(T),
    Running {
        result: Receiver<T>,
        handle: JoinHandle<()>,
    },
    Lost,
}

impl<T: Send + 'static> FrameTask<T> {
    /// Run `work` on a new thread named `name`.
    ///
    /// If the thread cannot be started the work runs inline and the
    /// returned handle is already complete.
    pub fn spawn<F>(name: &'static str, work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (job_tx, job_rx) = bounded::<F>(1);
        let (result_tx, result_rx) = bounded::<T>(1);

        // Queue the job before spawning so a failed spawn can take it back.
        if let Err(err) = job_tx.send(work) {
            return Self::completed(name, (err.into_inner())());
        }

        match spawn_worker(name, job_rx.clone(), result_tx) {
            Ok(handle) => Self {
                name,
                state: TaskState::Running {
                    result: result_rx,
                    handle,
                },
            },
            Err(err) => {
                log::warn!("{}; running inline", err);
                match job_rx.try_recv() {
                    Ok(work) => Self::completed(name, work()),
                    Err(_) => Self {
                        name,
                        state: TaskState::Lost,
                    },
                }
            }
        }
    }

    /// A task whose result is already known
    pub fn completed(name: &'static str, value: T) -> Self {
        Self {
            name,
            state: TaskState::Done(value),
        }
    }

    /// Task name (also the thread name)
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether `wait` would return without blocking
    pub fn is_finished(&self) -> bool {
        match &self.state {
            TaskState::Done(_) | TaskState::Lost => true,
            TaskState::Running { handle, .. } => handle.is_finished(),
        }
    }

    /// Block until the work has finished and take its result
    pub fn wait(self) -> Result<T> {
        let FrameTask { name, state } = self;
        match state {
            TaskState::Done(value) => Ok(value),
            TaskState::Lost => Err(CacheError::TaskPanicked(name)),
            TaskState::Running { result, handle } => {
                let received = result.recv();
                // A panicked worker drops its sender without sending
                let _ = handle.join();
                received.map_err(|_| CacheError::TaskPanicked(name))
            }
        }
    }
}

impl<T> core::fmt::Debug for FrameTask<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match &self.state {
            TaskState::Done(_) => "done",
            TaskState::Running { .. } => "running",
            TaskState::Lost => "lost",
        };
        write!(f, "FrameTask({}, {})", self.name, state)
    }
}

fn spawn_worker<F, T>(name: &'static str, jobs: Receiver<F>, results: Sender<T>) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Ok(work) = jobs.recv() {
                // The handle may have been dropped; nobody wants the result then
                let _ = results.send(work());
            }
        })
        .map_err(|source| CacheError::TaskSpawn { name, source })
}
