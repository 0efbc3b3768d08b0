//! infuse-task-runner: declarative task scheduling
//!
//! A static set of [`Schedule`]s refers to a static set of tasks by task
//! id. Once per second [`TaskRunner::iterate`] decides which tasks start
//! and which are asked to stop, based on application states, uptime,
//! epoch time and battery charge.
//!
//! - `schedule`: schedule representation and the start/terminate rules
//! - `task`: task definitions, executors and the terminate signal
//! - `workqueue`: cooperative executor shared by workqueue tasks
//! - `runner`: the evaluation loop
//! - `watchdog`: software watchdog channels
//! - `overrides`: schedules persisted over the built-in defaults

pub mod overrides;
pub mod runner;
pub mod schedule;
pub mod task;
pub mod watchdog;
pub mod workqueue;

pub use overrides::ScheduleOverrides;
pub use runner::{EventCallback, ScheduleEvent, TaskRunner};
pub use schedule::{
    should_start, should_terminate, EvalContext, Periodicity, Schedule, ScheduleState,
    StatePredicate, Validity,
};
pub use task::{Executor, TaskConfig, TaskContext, TerminateSignal, WorkStatus};
pub use watchdog::{Watchdog, WatchdogChannel};
pub use workqueue::{WorkItem, Workqueue};
