//! Schedule evaluation loop
//!
//! [`TaskRunner::iterate`] is called once per second. It reaps finished
//! tasks, then walks the schedules in order, starting idle tasks whose
//! schedule permits it and asking running tasks to stop once their
//! schedule says so. It never blocks on a task.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use infuse_core::{InfuseResult, StatesSnapshot};
use tracing::{debug, info, warn};

use crate::schedule::{
    should_start, should_terminate, EvalContext, Periodicity, Schedule, ScheduleState, Validity,
};
use crate::task::{Executor, TaskConfig, TerminateSignal, WorkStatus};
use crate::watchdog::{Watchdog, WatchdogChannel};
use crate::workqueue::{WorkItem, Workqueue};

/// Lifecycle notifications for a single schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
    Started,
    TerminateRequest,
    Stopped,
}

pub type EventCallback = Arc<dyn Fn(usize, &Schedule, ScheduleEvent) + Send + Sync>;

enum Exec {
    Idle,
    Thread(JoinHandle<()>),
    Work(Arc<WorkItem>),
}

struct TaskData {
    running: bool,
    schedule_idx: usize,
    terminate: Arc<TerminateSignal>,
    exec: Exec,
}

struct ScheduleSlot {
    schedule: Arc<Schedule>,
    /// `None` for invalid schedules, which are never evaluated
    task_idx: Option<usize>,
    linked: Option<usize>,
    state: ScheduleState,
    event_cb: Option<EventCallback>,
}

pub struct TaskRunner {
    tasks: Vec<TaskConfig>,
    data: Vec<TaskData>,
    schedules: Vec<ScheduleSlot>,
    workqueue: Workqueue,
    watchdog: Option<(Arc<Watchdog>, WatchdogChannel)>,
    pending_reload: Option<Vec<Schedule>>,
    reload_terminating: bool,
}

impl TaskRunner {
    pub fn new(schedules: Vec<Schedule>, tasks: Vec<TaskConfig>) -> InfuseResult<Self> {
        let workqueue = Workqueue::new("task_wq")?;

        for (i, task) in tasks.iter().enumerate() {
            if task.skip {
                warn!(task = %task.name, "task unavailable, schedules skipped");
            }
            if let Some(j) = tasks[..i].iter().position(|t| t.task_id == task.task_id) {
                warn!(first = j, second = i, task_id = task.task_id, "tasks share a task ID");
            }
        }
        let data = tasks
            .iter()
            .map(|_| TaskData {
                running: false,
                schedule_idx: usize::MAX,
                terminate: Arc::new(TerminateSignal::new()),
                exec: Exec::Idle,
            })
            .collect();

        let mut runner = TaskRunner {
            tasks,
            data,
            schedules: Vec::new(),
            workqueue,
            watchdog: None,
            pending_reload: None,
            reload_terminating: false,
        };
        runner.init_schedules(schedules);
        Ok(runner)
    }

    /// Feed a watchdog channel once per iteration.
    pub fn with_watchdog(mut self, watchdog: Arc<Watchdog>, timeout: Duration) -> Self {
        let channel = watchdog.register("task_runner", timeout, Instant::now());
        self.watchdog = Some((watchdog, channel));
        self
    }

    pub fn watchdog_channel(&self) -> Option<WatchdogChannel> {
        self.watchdog.as_ref().map(|(_, c)| *c)
    }

    fn init_schedules(&mut self, schedules: Vec<Schedule>) {
        let count = schedules.len();
        let callbacks: Vec<Option<EventCallback>> =
            self.schedules.iter().map(|s| s.event_cb.clone()).collect();

        self.schedules = schedules
            .into_iter()
            .enumerate()
            .map(|(i, schedule)| {
                let mut slot = ScheduleSlot {
                    task_idx: None,
                    linked: None,
                    state: ScheduleState::default(),
                    event_cb: callbacks.get(i).cloned().flatten(),
                    schedule: Arc::new(schedule),
                };
                if let Err(e) = slot.schedule.validate() {
                    warn!(schedule = i, task_id = slot.schedule.task_id, error = %e, "schedule is invalid");
                    return slot;
                }
                slot.task_idx = self
                    .tasks
                    .iter()
                    .position(|t| t.task_id == slot.schedule.task_id);
                if slot.task_idx.is_none() {
                    warn!(schedule = i, task_id = slot.schedule.task_id, "schedule refers to unknown task");
                    return slot;
                }
                if let Periodicity::After { schedule_idx, .. } = slot.schedule.periodicity {
                    if (schedule_idx as usize) < count {
                        slot.linked = Some(schedule_idx as usize);
                    } else {
                        warn!(schedule = i, linked = schedule_idx, "schedule links to unknown schedule");
                    }
                }
                slot
            })
            .collect();
    }

    /// Register the lifecycle callback of one schedule. Survives reloads.
    pub fn set_event_callback<F>(&mut self, schedule_idx: usize, cb: F) -> bool
    where
        F: Fn(usize, &Schedule, ScheduleEvent) + Send + Sync + 'static,
    {
        match self.schedules.get_mut(schedule_idx) {
            Some(slot) => {
                slot.event_cb = Some(Arc::new(cb));
                true
            }
            None => false,
        }
    }

    /// Replace the schedule set. Running tasks are asked to terminate
    /// and the new schedules take effect once all of them have stopped.
    pub fn reload_schedules(&mut self, schedules: Vec<Schedule>) {
        warn!(count = schedules.len(), "schedules updated, terminating tasks");
        self.pending_reload = Some(schedules);
        self.reload_terminating = false;
    }

    pub fn schedules(&self) -> impl Iterator<Item = &Schedule> + '_ {
        self.schedules.iter().map(|s| s.schedule.as_ref())
    }

    pub fn schedule_count(&self) -> usize {
        self.schedules.len()
    }

    /// Whether the schedule passed validation and refers to a known task.
    pub fn schedule_valid(&self, schedule_idx: usize) -> bool {
        self.schedules
            .get(schedule_idx)
            .is_some_and(|s| s.task_idx.is_some())
    }

    pub fn schedule_state(&self, schedule_idx: usize) -> Option<ScheduleState> {
        self.schedules.get(schedule_idx).map(|s| s.state)
    }

    /// Schedule index the task with `task_id` is running under.
    pub fn running_schedule(&self, task_id: u8) -> Option<usize> {
        let idx = self.tasks.iter().position(|t| t.task_id == task_id)?;
        let d = &self.data[idx];
        d.running.then_some(d.schedule_idx)
    }

    pub fn task_running(&self, task_id: u8) -> bool {
        self.running_schedule(task_id).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.data.iter().filter(|d| d.running).count()
    }

    /// Names of the tasks currently running on their own thread.
    pub fn running_threads(&self) -> Vec<String> {
        self.tasks
            .iter()
            .zip(&self.data)
            .filter(|(_, d)| d.running && matches!(d.exec, Exec::Thread(_)))
            .map(|(t, _)| t.name.to_string())
            .collect()
    }

    /// Collect tasks that have exited, without starting anything.
    pub fn reap(&mut self, uptime: u32) {
        for task_idx in 0..self.tasks.len() {
            if self.data[task_idx].running && self.has_terminated(task_idx) {
                let d = &mut self.data[task_idx];
                debug!(task = %self.tasks[task_idx].name, uptime, "task terminated");
                d.running = false;
                d.exec = Exec::Idle;
                if let Some(slot) = self.schedules.get_mut(d.schedule_idx) {
                    slot.state.last_terminate = uptime;
                }
            }
        }
    }

    /// One evaluation step.
    pub fn iterate(&mut self, states: &StatesSnapshot, uptime: u32, epoch_s: u32, battery: u8) {
        self.reap(uptime);

        if !self.handle_reload() {
            let ctx = EvalContext {
                states,
                uptime,
                epoch_s,
                battery,
            };
            for i in 0..self.schedules.len() {
                self.evaluate(i, &ctx);
            }
        }

        if let Some((watchdog, channel)) = &self.watchdog {
            watchdog.set_threads(*channel, self.running_threads());
            watchdog.feed(*channel, Instant::now());
        }
    }

    /// Returns `true` while a reload is still waiting on running tasks.
    fn handle_reload(&mut self) -> bool {
        if self.pending_reload.is_none() {
            return false;
        }
        if !self.reload_terminating {
            self.terminate_all();
            self.reload_terminating = true;
        }
        if let Some(d) = self.data.iter().position(|d| d.running) {
            debug!(task = %self.tasks[d].name, "reload waiting on task");
            return true;
        }
        if let Some(schedules) = self.pending_reload.take() {
            info!(count = schedules.len(), "all tasks terminated, reloading");
            self.init_schedules(schedules);
        }
        self.reload_terminating = false;
        false
    }

    fn evaluate(&mut self, i: usize, ctx: &EvalContext<'_>) {
        let Some(task_idx) = self.schedules[i].task_idx else {
            return;
        };
        if self.tasks[task_idx].skip {
            return;
        }
        let d = &self.data[task_idx];
        if d.running && d.schedule_idx != i {
            debug!(schedule = i, running_from = d.schedule_idx, "task started by another schedule");
            return;
        }
        let running = d.running;

        if self.schedules[i].schedule.validity == Validity::PermanentlyRuns {
            if !running {
                self.start(i, ctx.uptime);
            }
            self.schedules[i].state.runtime += 1;
            return;
        }

        if running {
            self.schedules[i].state.runtime += 1;
            let slot = &self.schedules[i];
            // Requested once per run; the task owns the exit
            if should_terminate(&slot.schedule, &slot.state, ctx)
                && !self.data[task_idx].terminate.is_raised()
            {
                self.terminate(i);
            }
        } else {
            let slot = &self.schedules[i];
            let linked = slot.linked.map(|l| &self.schedules[l].state);
            if should_start(&slot.schedule, &slot.state, linked, ctx) {
                self.start(i, ctx.uptime);
            }
        }
    }

    fn start(&mut self, i: usize, uptime: u32) {
        let Some(task_idx) = self.schedules[i].task_idx else {
            return;
        };
        let task = &self.tasks[task_idx];
        let slot = &mut self.schedules[i];
        let d = &mut self.data[task_idx];
        debug!(task = %task.name, schedule = i, "booting task");

        slot.state.last_run = uptime;
        slot.state.runtime = 0;
        d.terminate.reset();
        let ctx = task.context(i, slot.schedule.clone(), d.terminate.clone());

        d.exec = match &task.executor {
            Executor::Thread(f) => {
                let f = f.clone();
                match thread::Builder::new()
                    .name(task.name.to_string())
                    .spawn(move || f(ctx))
                {
                    Ok(handle) => Exec::Thread(handle),
                    Err(e) => {
                        warn!(task = %task.name, error = %e, "failed to spawn task thread");
                        return;
                    }
                }
            }
            Executor::Workqueue(f) => {
                let f = f.clone();
                let mut ctx = ctx;
                let item = WorkItem::new(task.name.to_string(), move || match f(&ctx) {
                    WorkStatus::Done => None,
                    WorkStatus::Reschedule(delay) => {
                        ctx.reschedule_count += 1;
                        Some(if ctx.should_terminate() {
                            Duration::ZERO
                        } else {
                            delay
                        })
                    }
                });
                self.workqueue.schedule(&item, Duration::ZERO);
                Exec::Work(item)
            }
        };
        d.running = true;
        d.schedule_idx = i;

        if let Some(cb) = &slot.event_cb {
            cb(i, &slot.schedule, ScheduleEvent::Started);
        }
    }

    fn terminate(&mut self, i: usize) {
        let Some(task_idx) = self.schedules[i].task_idx else {
            return;
        };
        let d = &self.data[task_idx];
        debug!(task = %self.tasks[task_idx].name, schedule = i, "requesting task terminate");

        d.terminate.raise();
        if let Exec::Work(item) = &d.exec {
            self.workqueue.kick(item);
        }
        let slot = &self.schedules[i];
        if let Some(cb) = &slot.event_cb {
            cb(i, &slot.schedule, ScheduleEvent::TerminateRequest);
        }
    }

    fn has_terminated(&mut self, task_idx: usize) -> bool {
        let d = &mut self.data[task_idx];
        let done = match &d.exec {
            Exec::Idle => true,
            Exec::Thread(handle) => handle.is_finished(),
            Exec::Work(item) => !item.is_busy(),
        };
        if !done {
            return false;
        }
        if let Exec::Thread(handle) = std::mem::replace(&mut d.exec, Exec::Idle) {
            if handle.join().is_err() {
                warn!(task = %self.tasks[task_idx].name, "task thread panicked");
            }
        }
        if let Some(slot) = self.schedules.get(d.schedule_idx) {
            if let Some(cb) = &slot.event_cb {
                cb(d.schedule_idx, &slot.schedule, ScheduleEvent::Stopped);
            }
        }
        true
    }

    /// Ask every running task to stop, as on a pending reboot.
    pub fn terminate_all(&mut self) {
        for i in 0..self.schedules.len() {
            let running_here = self.schedules[i]
                .task_idx
                .is_some_and(|t| self.data[t].running && self.data[t].schedule_idx == i);
            if running_here {
                self.terminate(i);
            }
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        for d in &self.data {
            d.terminate.raise();
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("tasks", &self.tasks.len())
            .field("schedules", &self.schedules.len())
            .field("running", &self.data.iter().filter(|d| d.running).count())
            .finish()
    }
}
