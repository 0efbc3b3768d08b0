//! Application state bitmap
//!
//! 256 named boolean states shared by the whole device. Bits are stored in
//! atomics so `set`/`clear`/`get` never block; only timeout bookkeeping and
//! the observer list sit behind locks.
//!
//! ```text
//!   1 - 127 : platform defined states
//! 128 - 255 : application specific states
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use tracing::{debug, warn};

/// Well-known state indices.
pub struct AppState;

impl AppState {
    /// Device is about to reboot
    pub const REBOOTING: u8 = 1;
    /// Application is active according to persisted configuration
    pub const APPLICATION_ACTIVE: u8 = 2;
    /// A trusted time source has been observed
    pub const TIME_KNOWN: u8 = 3;
    /// First application specific state
    pub const APP_START: u8 = 128;
}

const WORDS: usize = 4;

/// Maximum number of concurrently running state timeouts.
pub const MAX_TIMEOUTS: usize = 8;

/// Point-in-time copy of the state bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatesSnapshot([u64; WORDS]);

impl StatesSnapshot {
    pub fn get(&self, state: u8) -> bool {
        let (word, bit) = split(state);
        self.0[word] & (1 << bit) != 0
    }

    pub fn set(&mut self, state: u8) {
        let (word, bit) = split(state);
        self.0[word] |= 1 << bit;
    }

    pub fn clear(&mut self, state: u8) {
        let (word, bit) = split(state);
        self.0[word] &= !(1 << bit);
    }

    /// Snapshot with the given states set.
    pub fn with(states: &[u8]) -> Self {
        let mut s = Self::default();
        for st in states {
            s.set(*st);
        }
        s
    }
}

fn split(state: u8) -> (usize, u32) {
    ((state / 64) as usize, (state % 64) as u32)
}

#[derive(Debug, Clone, Copy)]
struct TimeoutContext {
    state: u8,
    remaining: u16,
}

type StateObserver = Box<dyn Fn(u8, bool, u16) + Send + Sync>;

pub struct ApplicationStates {
    bits: [AtomicU64; WORDS],
    timeouts: Mutex<Vec<TimeoutContext>>,
    observers: RwLock<Vec<StateObserver>>,
}

impl ApplicationStates {
    pub fn new() -> Self {
        ApplicationStates {
            bits: Default::default(),
            timeouts: Mutex::new(Vec::with_capacity(MAX_TIMEOUTS)),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer invoked with `(state, value_after, timeout_remaining)`.
    pub fn register_observer<F>(&self, cb: F)
    where
        F: Fn(u8, bool, u16) + Send + Sync + 'static,
    {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(cb));
    }

    fn notify(&self, state: u8, value: bool, timeout: u16) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        for cb in observers.iter() {
            cb(state, value, timeout);
        }
    }

    /// Set `state`, returning whether it was already set.
    pub fn set(&self, state: u8) -> bool {
        let (word, bit) = split(state);
        let prev = self.bits[word].fetch_or(1 << bit, Ordering::SeqCst);
        let already = prev & (1 << bit) != 0;
        debug!(state, "state set");
        if !already {
            self.notify(state, true, 0);
        }
        already
    }

    /// Set `state` for `timeout` seconds. A zero timeout is ignored.
    pub fn set_timeout(&self, state: u8, timeout: u16) {
        if timeout == 0 {
            return;
        }
        {
            let mut contexts = self.timeouts.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(ctx) = contexts.iter_mut().find(|c| c.state == state) {
                ctx.remaining = timeout;
            } else if contexts.len() == MAX_TIMEOUTS {
                warn!(state, "insufficient timeout contexts");
                return;
            } else {
                contexts.push(TimeoutContext {
                    state,
                    remaining: timeout,
                });
            }
            let (word, bit) = split(state);
            self.bits[word].fetch_or(1 << bit, Ordering::SeqCst);
        }
        debug!(state, timeout, "state set with timeout");
        self.notify(state, true, timeout);
    }

    /// Clear `state`, returning whether it was previously set.
    pub fn clear(&self, state: u8) -> bool {
        let (word, bit) = split(state);
        let prev = self.bits[word].fetch_and(!(1 << bit), Ordering::SeqCst);
        let was_set = prev & (1 << bit) != 0;
        debug!(state, "state cleared");
        if was_set {
            self.notify(state, false, 0);
        }
        was_set
    }

    pub fn get(&self, state: u8) -> bool {
        let (word, bit) = split(state);
        self.bits[word].load(Ordering::SeqCst) & (1 << bit) != 0
    }

    pub fn snapshot(&self) -> StatesSnapshot {
        let mut out = [0u64; WORDS];
        for (o, b) in out.iter_mut().zip(self.bits.iter()) {
            *o = b.load(Ordering::SeqCst);
        }
        StatesSnapshot(out)
    }

    /// Advance state timeouts by one second.
    ///
    /// Must be called exactly once per second with a snapshot taken before
    /// the caller acted on the current states.
    pub fn tick(&self, snapshot: &StatesSnapshot) {
        let mut expired = Vec::new();
        {
            let mut contexts = self.timeouts.lock().unwrap_or_else(PoisonError::into_inner);
            contexts.retain_mut(|ctx| {
                if !snapshot.get(ctx.state) {
                    // Cleared externally, timeout no longer relevant
                    return false;
                }
                ctx.remaining -= 1;
                if ctx.remaining == 0 {
                    let (word, bit) = split(ctx.state);
                    self.bits[word].fetch_and(!(1 << bit), Ordering::SeqCst);
                    expired.push(ctx.state);
                    return false;
                }
                true
            });
        }
        for state in expired {
            debug!(state, "state timed out");
            self.notify(state, false, 0);
        }
    }

    /// Seconds remaining on the timeout for `state`, if one is running.
    pub fn timeout_remaining(&self, state: u8) -> Option<u16> {
        let contexts = self.timeouts.lock().unwrap_or_else(PoisonError::into_inner);
        contexts.iter().find(|c| c.state == state).map(|c| c.remaining)
    }
}

impl Default for ApplicationStates {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_get_clear() {
        let states = ApplicationStates::new();
        assert!(!states.get(AppState::APPLICATION_ACTIVE));
        assert!(!states.set(AppState::APPLICATION_ACTIVE));
        assert!(states.set(AppState::APPLICATION_ACTIVE));
        assert!(states.get(AppState::APPLICATION_ACTIVE));
        assert!(states.clear(AppState::APPLICATION_ACTIVE));
        assert!(!states.get(AppState::APPLICATION_ACTIVE));
        assert!(!states.clear(AppState::APPLICATION_ACTIVE));
    }

    #[test]
    fn test_high_states() {
        let states = ApplicationStates::new();
        states.set(255);
        states.set(AppState::APP_START);
        let snap = states.snapshot();
        assert!(snap.get(255));
        assert!(snap.get(128));
        assert!(!snap.get(127));
    }

    #[test]
    fn test_timeout_expires_after_ticks() {
        let states = ApplicationStates::new();
        states.set_timeout(200, 3);
        for _ in 0..2 {
            let snap = states.snapshot();
            states.tick(&snap);
            assert!(states.get(200));
        }
        let snap = states.snapshot();
        states.tick(&snap);
        assert!(!states.get(200));
        assert_eq!(states.timeout_remaining(200), None);
    }

    #[test]
    fn test_zero_timeout_ignored() {
        let states = ApplicationStates::new();
        states.set_timeout(10, 0);
        assert!(!states.get(10));
    }

    #[test]
    fn test_timeout_refresh_reuses_context() {
        let states = ApplicationStates::new();
        states.set_timeout(10, 2);
        states.tick(&states.snapshot());
        states.set_timeout(10, 5);
        assert_eq!(states.timeout_remaining(10), Some(5));

        for i in 0..MAX_TIMEOUTS as u8 - 1 {
            states.set_timeout(20 + i, 5);
        }
        // Contexts exhausted
        states.set_timeout(100, 5);
        assert!(!states.get(100));
    }

    #[test]
    fn test_cleared_state_releases_timeout() {
        let states = ApplicationStates::new();
        states.set_timeout(10, 10);
        states.clear(10);
        states.tick(&states.snapshot());
        assert_eq!(states.timeout_remaining(10), None);
    }

    #[test]
    fn test_observers_see_changes() {
        let states = ApplicationStates::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        states.register_observer(move |state, value, timeout| {
            s.lock().unwrap().push((state, value, timeout));
        });

        states.set(5);
        states.set(5);
        states.set_timeout(6, 1);
        states.tick(&states.snapshot());
        states.clear(5);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![(5, true, 0), (6, true, 1), (6, false, 0), (5, false, 0)]
        );
    }

    #[test]
    fn test_snapshot_helpers() {
        let mut snap = StatesSnapshot::with(&[1, 70, 200]);
        assert!(snap.get(70));
        snap.clear(70);
        assert!(!snap.get(70));
        assert!(snap.get(200));
    }
}
