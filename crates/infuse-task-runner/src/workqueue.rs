//! Single-threaded cooperative workqueue
//!
//! Work items are closures returning the delay until their next run, or
//! `None` when finished. Every scheduled item is driven by a task on a
//! current-thread tokio runtime owned by the queue, so items run one at a
//! time on its dedicated thread in deadline order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, trace};

type WorkFn = Box<dyn FnMut() -> Option<Duration> + Send>;

/// Schedulable unit of work.
pub struct WorkItem {
    name: String,
    func: Mutex<WorkFn>,
    state: Mutex<WorkState>,
    /// Deadline changed or cancelled
    wake: Notify,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkState {
    due: Option<Instant>,
    running: bool,
    /// A driver task for this item exists on the runtime
    driven: bool,
}

impl WorkItem {
    pub fn new<F>(name: impl Into<String>, f: F) -> Arc<Self>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        Arc::new(WorkItem {
            name: name.into(),
            func: Mutex::new(Box::new(f)),
            state: Mutex::new(WorkState::default()),
            wake: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, WorkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queued or currently running.
    pub fn is_busy(&self) -> bool {
        let st = self.state();
        st.due.is_some() || st.running
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("name", &self.name)
            .field("state", &*self.state())
            .finish()
    }
}

pub struct Workqueue {
    handle: Handle,
    shutdown: broadcast::Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl Workqueue {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_time().build()?;
        let handle = runtime.handle().clone();
        let (shutdown, mut shutdown_rx) = broadcast::channel::<()>(1);
        let worker = thread::Builder::new().name(name.to_string()).spawn(move || {
            runtime.block_on(async {
                let _ = shutdown_rx.recv().await;
            });
            debug!("workqueue stopping");
        })?;
        Ok(Workqueue {
            handle,
            shutdown,
            worker: Some(worker),
        })
    }

    /// Queue `item` to run after `delay`, replacing any pending deadline.
    pub fn schedule(&self, item: &Arc<WorkItem>, delay: Duration) {
        let spawn = {
            let mut st = item.state();
            st.due = Some(Instant::now() + delay);
            !std::mem::replace(&mut st.driven, true)
        };
        trace!(work = %item.name, ?delay, "work scheduled");
        if spawn {
            self.handle.spawn(drive(item.clone()));
        } else {
            item.wake.notify_one();
        }
    }

    /// Bring a queued item forward to run now. Idle or running items are
    /// left alone; a running item sees the change on its next reschedule.
    pub fn kick(&self, item: &Arc<WorkItem>) {
        let mut st = item.state();
        if st.due.is_some() {
            st.due = Some(Instant::now());
            drop(st);
            item.wake.notify_one();
        }
    }

    /// Remove a queued item. Returns `false` if it was not queued.
    pub fn cancel(&self, item: &Arc<WorkItem>) -> bool {
        let was_queued = item.state().due.take().is_some();
        item.wake.notify_one();
        was_queued
    }
}

impl Drop for Workqueue {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Run `item` each time its deadline passes, until it is neither queued
/// nor rescheduled.
async fn drive(item: Arc<WorkItem>) {
    loop {
        let due = {
            let mut st = item.state();
            match st.due {
                Some(due) => due,
                None => {
                    st.driven = false;
                    return;
                }
            }
        };
        tokio::select! {
            _ = tokio::time::sleep_until(due.into()) => {}
            _ = item.wake.notified() => continue,
        }
        {
            let mut st = item.state();
            match st.due {
                Some(due) if due <= Instant::now() => {
                    st.due = None;
                    st.running = true;
                }
                // Moved or cancelled while sleeping
                _ => continue,
            }
        }

        let next = {
            let mut func = item.func.lock().unwrap_or_else(PoisonError::into_inner);
            (func)()
        };

        let mut st = item.state();
        st.running = false;
        match (next, st.due) {
            // Rescheduled while running: keep whichever deadline is sooner
            (Some(delay), Some(due)) => st.due = Some(due.min(Instant::now() + delay)),
            (Some(delay), None) => st.due = Some(Instant::now() + delay),
            (None, _) => {}
        }
        drop(st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_runs_until_done() {
        let wq = Workqueue::new("test_wq").unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let item = WorkItem::new("counter", move || {
            let n = r.fetch_add(1, Ordering::SeqCst) + 1;
            (n < 3).then_some(Duration::from_millis(1))
        });

        wq.schedule(&item, Duration::ZERO);
        assert!(wait_until(|| !item.is_busy() && runs.load(Ordering::SeqCst) == 3));
    }

    #[test]
    fn test_kick_and_cancel() {
        let wq = Workqueue::new("test_wq").unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let item = WorkItem::new("slow", move || {
            r.fetch_add(1, Ordering::SeqCst);
            None
        });

        wq.schedule(&item, Duration::from_secs(60));
        assert!(item.is_busy());
        wq.kick(&item);
        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 1 && !item.is_busy()));

        // Kicking an idle item does not run it
        wq.kick(&item);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        wq.schedule(&item, Duration::from_secs(60));
        assert!(wq.cancel(&item));
        assert!(!item.is_busy());
        assert!(!wq.cancel(&item));

        // A cancelled item can be queued again
        wq.schedule(&item, Duration::ZERO);
        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 2 && !item.is_busy()));
    }

    #[test]
    fn test_deadline_order() {
        let wq = Workqueue::new("test_wq").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let items: Vec<_> = ["late", "early"]
            .into_iter()
            .map(|name| {
                let o = order.clone();
                WorkItem::new(name, move || {
                    o.lock().unwrap().push(name);
                    None
                })
            })
            .collect();

        wq.schedule(&items[0], Duration::from_millis(40));
        wq.schedule(&items[1], Duration::from_millis(5));
        assert!(wait_until(|| order.lock().unwrap().len() == 2));
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn test_drop_with_pending_items() {
        let item = WorkItem::new("never", || None);
        {
            let wq = Workqueue::new("test_wq").unwrap();
            wq.schedule(&item, Duration::from_secs(60));
        }
        // The queue shut down without running it
        assert!(item.is_busy());
    }
}
