//! Epoch time base
//!
//! Two clocks exist on a device:
//! ```text
//! local ticks  : monotonic since boot, LOCAL_TICKS_PER_SEC
//! epoch ticks  : GPS seconds << 16 | subseconds, EPOCH_TICKS_PER_SEC
//! ```
//! A `SyncInstant` pairs one local tick with the epoch time observed at that
//! tick, which lets any other local tick be converted to epoch time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{InfuseError, InfuseResult};
use crate::states::{AppState, ApplicationStates};

pub const SECONDS_PER_MINUTE: u64 = 60;
pub const SECONDS_PER_HOUR: u64 = 60 * SECONDS_PER_MINUTE;
pub const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;
pub const SECONDS_PER_WEEK: u64 = 7 * SECONDS_PER_DAY;

/// Epoch ticks per second (subsecond resolution is 1/65536 s).
pub const EPOCH_TICKS_PER_SEC: u64 = 65536;

/// Local tick rate of the monotonic uptime counter.
pub const LOCAL_TICKS_PER_SEC: u64 = 32768;

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06).
pub const GPS_UNIX_OFFSET_SECONDS_BASE: u64 = 315_964_800;
/// Leap seconds between GPS time and UTC.
pub const GPS_UNIX_OFFSET_SECONDS_LEAP: u64 = 18;

/// 2020-01-01T00:00:00Z expressed as epoch time, assumed before any sync.
pub const JAN_01_01_2020: u64 = 1_261_872_018 << 16;

pub fn epoch_time_seconds(epoch_time: u64) -> u64 {
    epoch_time >> 16
}

pub fn epoch_time_subseconds(epoch_time: u64) -> u16 {
    (epoch_time & 0xFFFF) as u16
}

pub fn epoch_time_milliseconds(epoch_time: u64) -> u16 {
    ((epoch_time_subseconds(epoch_time) as u32 * 1000) / 0x10000) as u16
}

pub fn epoch_time_from(seconds: u64, subseconds: u16) -> u64 {
    (seconds << 16) | subseconds as u64
}

pub fn epoch_time_from_gps(week: u16, week_seconds: u32, subseconds: u16) -> u64 {
    let seconds = SECONDS_PER_WEEK * week as u64 + week_seconds as u64;
    epoch_time_from(seconds, subseconds)
}

pub fn unix_time_from_epoch(epoch_time: u64) -> u64 {
    epoch_time_seconds(epoch_time) + GPS_UNIX_OFFSET_SECONDS_BASE - GPS_UNIX_OFFSET_SECONDS_LEAP
}

pub fn epoch_time_from_unix(unix_time: u64, subseconds: u16) -> u64 {
    let seconds = unix_time - GPS_UNIX_OFFSET_SECONDS_BASE + GPS_UNIX_OFFSET_SECONDS_LEAP;
    epoch_time_from(seconds, subseconds)
}

/// Authority that provided the current time reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeSource(u8);

impl TimeSource {
    pub const NONE: TimeSource = TimeSource(0);
    pub const GNSS: TimeSource = TimeSource(1);
    pub const NTP: TimeSource = TimeSource(2);
    pub const RPC: TimeSource = TimeSource(3);
    pub const NETWORK: TimeSource = TimeSource(4);
    pub const INVALID: TimeSource = TimeSource(5);
    /// Flag marking a reference that was restored across a reboot.
    pub const RECOVERED_FLAG: u8 = 0x80;

    pub fn from_raw(raw: u8) -> Self {
        TimeSource(raw)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn recovered(self) -> Self {
        TimeSource(self.0 | Self::RECOVERED_FLAG)
    }

    pub fn is_recovered(self) -> bool {
        self.0 & Self::RECOVERED_FLAG != 0
    }

    pub fn base(self) -> Self {
        TimeSource(self.0 & !Self::RECOVERED_FLAG)
    }

    /// Whether the source can be trusted, optionally accepting recovered values.
    pub fn trusted(self, recovered_ok: bool) -> bool {
        let base = self.base().0;
        let base_good = base > Self::NONE.0 && base < Self::INVALID.0;
        base_good && (!self.is_recovered() || recovered_ok)
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        TimeSource::NONE
    }
}

/// A `(local, reference)` pair describing the same instant on both clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncInstant {
    /// Local uptime ticks
    pub local: u64,
    /// Epoch time at `local`
    pub reference: u64,
}

impl SyncInstant {
    fn epoch_from_local(&self, ticks: u64) -> u64 {
        let delta = ticks as i128 - self.local as i128;
        let epoch = self.reference as i128 + delta * EPOCH_TICKS_PER_SEC as i128 / LOCAL_TICKS_PER_SEC as i128;
        epoch.max(0) as u64
    }

    fn local_from_epoch(&self, epoch_time: u64) -> u64 {
        let delta = epoch_time as i128 - self.reference as i128;
        let local = self.local as i128 + delta * LOCAL_TICKS_PER_SEC as i128 / EPOCH_TICKS_PER_SEC as i128;
        local.max(0) as u64
    }
}

type ReferenceCallback = Box<dyn Fn(TimeSource, SyncInstant, SyncInstant) + Send + Sync>;

struct ClockInner {
    source: TimeSource,
    base: SyncInstant,
    callbacks: Vec<ReferenceCallback>,
}

/// Converts local uptime ticks to epoch time.
pub struct EpochClock {
    boot: Instant,
    inner: Mutex<ClockInner>,
    states: Option<Arc<ApplicationStates>>,
}

impl EpochClock {
    pub fn new() -> Self {
        EpochClock {
            boot: Instant::now(),
            inner: Mutex::new(ClockInner {
                source: TimeSource::NONE,
                base: SyncInstant {
                    local: 0,
                    reference: JAN_01_01_2020,
                },
                callbacks: Vec::new(),
            }),
            states: None,
        }
    }

    /// Clock that raises `TIME_KNOWN` once a trusted reference is set.
    pub fn with_states(states: Arc<ApplicationStates>) -> Self {
        EpochClock {
            states: Some(states),
            ..Self::new()
        }
    }

    /// Local ticks elapsed since this clock was created.
    pub fn uptime_ticks(&self) -> u64 {
        let elapsed = self.boot.elapsed();
        elapsed.as_secs() * LOCAL_TICKS_PER_SEC
            + (elapsed.subsec_nanos() as u64 * LOCAL_TICKS_PER_SEC) / 1_000_000_000
    }

    pub fn uptime_seconds(&self) -> u32 {
        (self.uptime_ticks() / LOCAL_TICKS_PER_SEC) as u32
    }

    pub fn source(&self) -> TimeSource {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).source
    }

    pub fn register_callback<F>(&self, cb: F)
    where
        F: Fn(TimeSource, SyncInstant, SyncInstant) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.callbacks.push(Box::new(cb));
    }

    /// Install a new reference instant.
    pub fn set_reference(&self, source: TimeSource, reference: SyncInstant) -> InfuseResult<()> {
        if reference.reference == 0 {
            return Err(InfuseError::invalid("reference time of 0"));
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = inner.base;
        inner.base = reference;
        inner.source = source;

        if source.trusted(true) {
            if let Some(states) = &self.states {
                states.set(AppState::TIME_KNOWN);
            }
        }
        for cb in &inner.callbacks {
            cb(source, previous, reference);
        }
        info!(
            source = source.raw(),
            gps_seconds = epoch_time_seconds(reference.reference),
            "epoch reference updated"
        );
        Ok(())
    }

    pub fn epoch_time_from_ticks(&self, ticks: u64) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.base.epoch_from_local(ticks)
    }

    pub fn ticks_from_epoch_time(&self, epoch_time: u64) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.base.local_from_epoch(epoch_time)
    }

    pub fn now(&self) -> u64 {
        self.epoch_time_from_ticks(self.uptime_ticks())
    }

    /// Seconds since the reference was set, `u32::MAX` without a trusted source.
    pub fn reference_age(&self) -> u32 {
        self.reference_age_at(self.uptime_ticks())
    }

    pub fn reference_age_at(&self, now_ticks: u64) -> u32 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.source.trusted(true) {
            return u32::MAX;
        }
        let age = now_ticks.saturating_sub(inner.base.local) / LOCAL_TICKS_PER_SEC;
        age.min(u32::MAX as u64) as u32
    }

    /// Epoch shift at `now_ticks` when moving from reference `a` to `b`.
    pub fn reference_shift(a: &SyncInstant, b: &SyncInstant, now_ticks: u64) -> i64 {
        let out_a = a.epoch_from_local(now_ticks) as i64;
        let out_b = b.epoch_from_local(now_ticks) as i64;
        debug!(shift = out_b - out_a, "reference shift");
        out_b - out_a
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_epoch_field_helpers() {
        let t = epoch_time_from(1000, 0x8000);
        assert_eq!(epoch_time_seconds(t), 1000);
        assert_eq!(epoch_time_subseconds(t), 0x8000);
        assert_eq!(epoch_time_milliseconds(t), 500);
    }

    #[test]
    fn test_unix_conversion_roundtrip() {
        let unix = 1_700_000_000;
        let epoch = epoch_time_from_unix(unix, 0);
        assert_eq!(unix_time_from_epoch(epoch), unix);
        assert_eq!(unix_time_from_epoch(JAN_01_01_2020), 1_577_836_800);
    }

    #[test]
    fn test_gps_week_conversion() {
        let t = epoch_time_from_gps(2, 10, 0);
        assert_eq!(epoch_time_seconds(t), 2 * SECONDS_PER_WEEK + 10);
    }

    #[test]
    fn test_time_source_trust() {
        assert!(!TimeSource::NONE.trusted(true));
        assert!(TimeSource::GNSS.trusted(false));
        assert!(TimeSource::GNSS.recovered().trusted(true));
        assert!(!TimeSource::GNSS.recovered().trusted(false));
        assert!(!TimeSource::INVALID.trusted(true));
    }

    #[test]
    fn test_default_reference_is_2020() {
        let clock = EpochClock::new();
        assert_eq!(clock.epoch_time_from_ticks(0), JAN_01_01_2020);
        assert_eq!(clock.source(), TimeSource::NONE);
        assert_eq!(clock.reference_age_at(1000), u32::MAX);
    }

    #[test]
    fn test_set_reference_conversions() {
        let clock = EpochClock::new();
        let reference = SyncInstant {
            local: LOCAL_TICKS_PER_SEC * 10,
            reference: epoch_time_from(5000, 0),
        };
        clock.set_reference(TimeSource::GNSS, reference).unwrap();

        let later = clock.epoch_time_from_ticks(LOCAL_TICKS_PER_SEC * 12);
        assert_eq!(epoch_time_seconds(later), 5002);
        assert_eq!(
            clock.ticks_from_epoch_time(epoch_time_from(5003, 0)),
            LOCAL_TICKS_PER_SEC * 13
        );
        assert_eq!(clock.reference_age_at(LOCAL_TICKS_PER_SEC * 15), 5);
    }

    #[test]
    fn test_zero_reference_rejected() {
        let clock = EpochClock::new();
        let err = clock
            .set_reference(TimeSource::NTP, SyncInstant::default())
            .unwrap_err();
        assert_eq!(err.errno(), -22);
    }

    #[test]
    fn test_reference_callbacks_and_time_known() {
        let states = Arc::new(ApplicationStates::new());
        let clock = EpochClock::with_states(states.clone());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        clock.register_callback(move |source, old, new| {
            assert_eq!(source, TimeSource::NTP);
            assert_eq!(old.reference, JAN_01_01_2020);
            assert_eq!(new.reference, 42 << 16);
            c.fetch_add(1, Ordering::SeqCst);
        });

        clock
            .set_reference(
                TimeSource::NTP,
                SyncInstant {
                    local: 0,
                    reference: 42 << 16,
                },
            )
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(states.get(AppState::TIME_KNOWN));
    }

    #[test]
    fn test_reference_shift() {
        let a = SyncInstant {
            local: 0,
            reference: epoch_time_from(100, 0),
        };
        let b = SyncInstant {
            local: 0,
            reference: epoch_time_from(101, 0),
        };
        assert_eq!(EpochClock::reference_shift(&a, &b, 500), 65536);
    }
}
