//! Task descriptors and the cooperative terminate signal

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::schedule::Schedule;

/// Stop request, polled by task bodies alongside their timed waits.
///
/// Stays raised until [`TerminateSignal::reset`].
#[derive(Debug)]
pub struct TerminateSignal {
    raised: watch::Sender<bool>,
}

impl Default for TerminateSignal {
    fn default() -> Self {
        TerminateSignal {
            raised: watch::channel(false).0,
        }
    }
}

impl TerminateSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.send_replace(true);
    }

    pub fn reset(&self) {
        self.raised.send_replace(false);
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.borrow()
    }

    /// Resolves once the signal is raised.
    pub async fn raised(&self) {
        let mut rx = self.raised.subscribe();
        // The sender lives in `self`, so the channel stays open
        let _ = rx.wait_for(|raised| *raised).await;
    }

    /// Block for up to `timeout`. Returns `true` as soon as the signal is
    /// raised, `false` once the timeout elapses.
    ///
    /// Meant for task threads. Called from async code it does not wait and
    /// only reports the current state.
    pub fn poll(&self, timeout: Duration) -> bool {
        if self.is_raised() || timeout.is_zero() {
            return self.is_raised();
        }
        if Handle::try_current().is_ok() {
            debug!("terminate poll inside a runtime, not waiting");
            return self.is_raised();
        }
        match Builder::new_current_thread().enable_time().build() {
            Ok(rt) => rt.block_on(async {
                tokio::time::timeout(timeout, self.raised()).await.is_ok()
            }),
            Err(e) => {
                warn!(error = %e, "no runtime for terminate poll");
                std::thread::sleep(timeout);
                self.is_raised()
            }
        }
    }
}

/// Everything a running task can see.
#[derive(Clone)]
pub struct TaskContext {
    pub name: Arc<str>,
    pub schedule_idx: usize,
    pub schedule: Arc<Schedule>,
    pub terminate: Arc<TerminateSignal>,
    arg: Option<Arc<dyn Any + Send + Sync>>,
    /// Number of times a workqueue task has been rescheduled
    pub reschedule_count: u32,
}

impl TaskContext {
    pub(crate) fn new(
        name: Arc<str>,
        schedule_idx: usize,
        schedule: Arc<Schedule>,
        terminate: Arc<TerminateSignal>,
        arg: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        TaskContext {
            name,
            schedule_idx,
            schedule,
            terminate,
            arg,
            reschedule_count: 0,
        }
    }

    /// Static argument given to the task definition.
    pub fn arg<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.arg.as_deref().and_then(|a| a.downcast_ref())
    }

    pub fn should_terminate(&self) -> bool {
        self.terminate.is_raised()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("name", &self.name)
            .field("schedule_idx", &self.schedule_idx)
            .field("terminating", &self.should_terminate())
            .finish()
    }
}

/// Result of one workqueue task step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Run again after the delay (immediately if termination was requested)
    Reschedule(Duration),
    Done,
}

pub type ThreadFn = Arc<dyn Fn(TaskContext) + Send + Sync>;
pub type WorkFn = Arc<dyn Fn(&TaskContext) -> WorkStatus + Send + Sync>;

#[derive(Clone)]
pub enum Executor {
    /// Dedicated thread, joined without blocking
    Thread(ThreadFn),
    /// Cooperative step on the shared workqueue
    Workqueue(WorkFn),
}

/// Static task definition.
#[derive(Clone)]
pub struct TaskConfig {
    pub name: Arc<str>,
    pub task_id: u8,
    pub executor: Executor,
    arg: Option<Arc<dyn Any + Send + Sync>>,
    /// Backing device failed to initialise, never start
    pub skip: bool,
}

impl TaskConfig {
    pub fn thread<F>(name: &str, task_id: u8, f: F) -> Self
    where
        F: Fn(TaskContext) + Send + Sync + 'static,
    {
        TaskConfig {
            name: name.into(),
            task_id,
            executor: Executor::Thread(Arc::new(f)),
            arg: None,
            skip: false,
        }
    }

    pub fn workqueue<F>(name: &str, task_id: u8, f: F) -> Self
    where
        F: Fn(&TaskContext) -> WorkStatus + Send + Sync + 'static,
    {
        TaskConfig {
            name: name.into(),
            task_id,
            executor: Executor::Workqueue(Arc::new(f)),
            arg: None,
            skip: false,
        }
    }

    pub fn with_arg<T: Any + Send + Sync>(mut self, arg: T) -> Self {
        self.arg = Some(Arc::new(arg));
        self
    }

    /// Mark the task as unusable, e.g. its device is not ready.
    pub fn unavailable(mut self) -> Self {
        self.skip = true;
        self
    }

    pub(crate) fn context(&self, schedule_idx: usize, schedule: Arc<Schedule>, terminate: Arc<TerminateSignal>) -> TaskContext {
        TaskContext::new(self.name.clone(), schedule_idx, schedule, terminate, self.arg.clone())
    }
}

impl fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let executor = match self.executor {
            Executor::Thread(_) => "thread",
            Executor::Workqueue(_) => "workqueue",
        };
        f.debug_struct("TaskConfig")
            .field("name", &self.name)
            .field("task_id", &self.task_id)
            .field("executor", &executor)
            .field("skip", &self.skip)
            .finish()
    }
}
