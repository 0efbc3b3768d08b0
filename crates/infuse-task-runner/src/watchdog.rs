//! Software watchdog
//!
//! Each channel must be fed within its timeout. [`Watchdog::check`] reports
//! starved channels once and invokes the expiry hooks, which normally
//! record a `SwWatchdog` reboot.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{error, warn};

/// Handle of a registered watchdog channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchdogChannel(usize);

impl WatchdogChannel {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Channel {
    name: String,
    timeout: Duration,
    last_feed: Instant,
    expired: bool,
    /// Threads considered part of this channel, for diagnostics
    threads: Vec<String>,
}

type ExpiryHook = Arc<dyn Fn(WatchdogChannel, &str) + Send + Sync>;

#[derive(Default)]
pub struct Watchdog {
    channels: Mutex<Vec<Channel>>,
    hooks: RwLock<Vec<ExpiryHook>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a channel, considered fed at `now`.
    pub fn register(&self, name: &str, timeout: Duration, now: Instant) -> WatchdogChannel {
        let mut channels = self.lock();
        channels.push(Channel {
            name: name.to_string(),
            timeout,
            last_feed: now,
            expired: false,
            threads: Vec::new(),
        });
        WatchdogChannel(channels.len() - 1)
    }

    pub fn on_expiry<F>(&self, hook: F)
    where
        F: Fn(WatchdogChannel, &str) + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    pub fn feed(&self, channel: WatchdogChannel, now: Instant) {
        if let Some(c) = self.lock().get_mut(channel.0) {
            c.last_feed = now;
            c.expired = false;
        }
    }

    /// Record the threads a channel is responsible for.
    pub fn set_threads(&self, channel: WatchdogChannel, threads: Vec<String>) {
        if let Some(c) = self.lock().get_mut(channel.0) {
            c.threads = threads;
        }
    }

    /// Channels whose feed deadline has passed at `now`.
    pub fn expired(&self, now: Instant) -> Vec<WatchdogChannel> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, c)| now.saturating_duration_since(c.last_feed) >= c.timeout)
            .map(|(i, _)| WatchdogChannel(i))
            .collect()
    }

    /// Fire hooks for channels that newly expired. Returns those channels.
    pub fn check(&self, now: Instant) -> Vec<WatchdogChannel> {
        let fired: Vec<(WatchdogChannel, String)> = {
            let mut channels = self.lock();
            channels
                .iter_mut()
                .enumerate()
                .filter(|(_, c)| !c.expired && now.saturating_duration_since(c.last_feed) >= c.timeout)
                .map(|(i, c)| {
                    c.expired = true;
                    warn!(channel = %c.name, threads = ?c.threads, "watchdog channel starved");
                    (WatchdogChannel(i), c.name.clone())
                })
                .collect()
        };
        if !fired.is_empty() {
            let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone();
            for (channel, name) in &fired {
                error!(channel = %name, "watchdog expired");
                for hook in &hooks {
                    hook(*channel, name);
                }
            }
        }
        fired.into_iter().map(|(c, _)| c).collect()
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("channels", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_feed_and_expiry() {
        let wdog = Watchdog::new();
        let t0 = Instant::now();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        wdog.on_expiry(move |_, name| {
            assert_eq!(name, "runner");
            f.fetch_add(1, Ordering::SeqCst);
        });

        let ch = wdog.register("runner", Duration::from_secs(10), t0);
        let other = wdog.register("other", Duration::from_secs(60), t0);
        assert_ne!(ch, other);

        assert!(wdog.expired(t0 + Duration::from_secs(9)).is_empty());
        wdog.feed(ch, t0 + Duration::from_secs(9));
        assert!(wdog.check(t0 + Duration::from_secs(18)).is_empty());

        assert_eq!(wdog.check(t0 + Duration::from_secs(19)), vec![ch]);
        // Reported once until fed again
        assert!(wdog.check(t0 + Duration::from_secs(20)).is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(wdog.expired(t0 + Duration::from_secs(20)), vec![ch]);

        wdog.feed(ch, t0 + Duration::from_secs(21));
        assert!(wdog.expired(t0 + Duration::from_secs(22)).is_empty());
    }
}
