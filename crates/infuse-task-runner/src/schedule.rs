//! Schedule definitions and start/terminate evaluation
//!
//! A schedule is pure data; all mutable bookkeeping lives in
//! [`ScheduleState`] so evaluation can be exercised without a runner.

use infuse_core::config::{
    BatteryRange, PeriodicityConfig, ScheduleConfig, ScheduleValidity, StateTerm, TaskLoggingConfig,
};
use infuse_core::{AppState, InfuseError, InfuseResult, StatesSnapshot};

/// Upper bit of a lockout period: the first evaluation after boot passes.
pub const LOCKOUT_IGNORE_FIRST: u32 = 1 << 31;
/// Number of slots in a state predicate
pub const STATE_PREDICATE_SLOTS: usize = 4;
/// Size of the task argument blob
pub const TASK_ARGS_SIZE: usize = 16;
/// Number of task logging channels
pub const TASK_LOGGING_CHANNELS: usize = 2;

const BATTERY_MAX: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Validity {
    Always = 0,
    Active = 1,
    Inactive = 2,
    PermanentlyRuns = 3,
}

impl Validity {
    /// Flag that prevents persisted overrides replacing the schedule
    pub const LOCKED: u8 = 0x80;

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw & !Self::LOCKED {
            0 => Some(Validity::Always),
            1 => Some(Validity::Active),
            2 => Some(Validity::Inactive),
            3 => Some(Validity::PermanentlyRuns),
            _ => None,
        }
    }
}

impl From<ScheduleValidity> for Validity {
    fn from(v: ScheduleValidity) -> Self {
        match v {
            ScheduleValidity::Always => Validity::Always,
            ScheduleValidity::Active => Validity::Active,
            ScheduleValidity::Inactive => Validity::Inactive,
            ScheduleValidity::PermanentlyRuns => Validity::PermanentlyRuns,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Periodicity {
    /// No constraint
    None,
    /// Start when `epoch_s % period_s == 0`
    Fixed { period_s: u32 },
    /// Start once `lockout_s` has passed since the last start. May carry
    /// [`LOCKOUT_IGNORE_FIRST`].
    Lockout { lockout_s: u32 },
    /// Start `duration_s` after schedule `schedule_idx` terminates
    After { schedule_idx: u8, duration_s: u32 },
    /// Lockout that stretches as the battery drains from `battery_max`
    /// down to `battery_min` percent
    LockoutDynamicBattery {
        lockout_min_s: u32,
        lockout_max_s: u32,
        battery_min: u8,
        battery_max: u8,
    },
}

impl Periodicity {
    pub fn type_id(&self) -> u8 {
        match self {
            Periodicity::None => 0,
            Periodicity::Fixed { .. } => 1,
            Periodicity::Lockout { .. } => 2,
            Periodicity::After { .. } => 3,
            Periodicity::LockoutDynamicBattery { .. } => 4,
        }
    }
}

impl From<PeriodicityConfig> for Periodicity {
    fn from(p: PeriodicityConfig) -> Self {
        match p {
            PeriodicityConfig::None => Periodicity::None,
            PeriodicityConfig::Fixed { period_s } => Periodicity::Fixed { period_s },
            PeriodicityConfig::Lockout {
                lockout_s,
                ignore_first,
            } => Periodicity::Lockout {
                lockout_s: if ignore_first {
                    lockout_s | LOCKOUT_IGNORE_FIRST
                } else {
                    lockout_s
                },
            },
            PeriodicityConfig::After { linked, duration_s } => Periodicity::After {
                schedule_idx: linked,
                duration_s,
            },
            PeriodicityConfig::LockoutDynamicBattery {
                lockout_min_s,
                lockout_max_s,
                battery_min,
                battery_max,
            } => Periodicity::LockoutDynamicBattery {
                lockout_min_s,
                lockout_max_s,
                battery_min,
                battery_max,
            },
        }
    }
}

/// Up to four application states combined left to right:
/// `(((S0 op1 S1) op2 S2) op3 S3)`.
///
/// Metadata bit `i` inverts slot `i`; bit `i + 4` joins slot `i` with OR
/// instead of AND. A zero state index ends the predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatePredicate {
    pub states: [u8; STATE_PREDICATE_SLOTS],
    pub metadata: u8,
}

impl StatePredicate {
    pub const fn not_bit(slot: usize) -> u8 {
        1 << slot
    }

    pub const fn or_bit(slot: usize) -> u8 {
        1 << (slot + STATE_PREDICATE_SLOTS)
    }

    pub fn from_terms(terms: &[StateTerm]) -> InfuseResult<Self> {
        if terms.len() > STATE_PREDICATE_SLOTS {
            return Err(InfuseError::invalid(format!(
                "{} state terms, at most {STATE_PREDICATE_SLOTS} supported",
                terms.len()
            )));
        }
        let mut p = StatePredicate::default();
        for (i, term) in terms.iter().enumerate() {
            if term.state == 0 {
                return Err(InfuseError::invalid("state 0 cannot be used in a predicate"));
            }
            p.states[i] = term.state;
            if term.not {
                p.metadata |= Self::not_bit(i);
            }
            if term.or {
                p.metadata |= Self::or_bit(i);
            }
        }
        Ok(p)
    }

    pub fn is_empty(&self) -> bool {
        self.states[0] == 0
    }

    /// Evaluate against `states`, returning `empty` when no slot is used.
    pub fn evaluate(&self, states: &StatesSnapshot, empty: bool) -> bool {
        if self.is_empty() {
            return empty;
        }
        let mut result = true;
        for (i, &state) in self.states.iter().enumerate() {
            if state == 0 {
                break;
            }
            let mut value = states.get(state);
            if self.metadata & Self::not_bit(i) != 0 {
                value = !value;
            }
            result = if i == 0 {
                value
            } else if self.metadata & Self::or_bit(i) != 0 {
                result || value
            } else {
                result && value
            };
        }
        result
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskLogging {
    pub loggers: u8,
    pub tdf_mask: u32,
}

impl From<TaskLoggingConfig> for TaskLogging {
    fn from(c: TaskLoggingConfig) -> Self {
        TaskLogging {
            loggers: c.loggers,
            tdf_mask: c.tdf_mask,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub task_id: u8,
    pub validity: Validity,
    pub locked: bool,
    pub boot_lockout_minutes: u8,
    pub timeout_s: u32,
    pub battery_start: BatteryRange,
    pub battery_terminate: BatteryRange,
    pub periodicity: Periodicity,
    /// Start predicate is bypassed `2 * N` seconds after the last start
    pub states_start_timeout_2x_s: u16,
    pub states_start: StatePredicate,
    pub states_terminate: StatePredicate,
    pub task_logging: [TaskLogging; TASK_LOGGING_CHANNELS],
    pub task_args: [u8; TASK_ARGS_SIZE],
}

impl Schedule {
    /// Schedule that starts `task_id` whenever it is idle.
    pub fn always(task_id: u8) -> Self {
        Schedule {
            task_id,
            validity: Validity::Always,
            locked: false,
            boot_lockout_minutes: 0,
            timeout_s: 0,
            battery_start: BatteryRange::default(),
            battery_terminate: BatteryRange::default(),
            periodicity: Periodicity::None,
            states_start_timeout_2x_s: 0,
            states_start: StatePredicate::default(),
            states_terminate: StatePredicate::default(),
            task_logging: [TaskLogging::default(); TASK_LOGGING_CHANNELS],
            task_args: [0; TASK_ARGS_SIZE],
        }
    }

    /// Convert a configuration entry. Fails only on shapes the runtime
    /// representation cannot hold; value ranges are checked by
    /// [`Schedule::validate`].
    pub fn from_config(config: &ScheduleConfig) -> InfuseResult<Self> {
        if config.task_args.len() > TASK_ARGS_SIZE {
            return Err(InfuseError::invalid(format!(
                "task_args of {} bytes, at most {TASK_ARGS_SIZE}",
                config.task_args.len()
            )));
        }
        if config.task_logging.len() > TASK_LOGGING_CHANNELS {
            return Err(InfuseError::invalid("at most two task logging channels"));
        }
        let mut task_args = [0u8; TASK_ARGS_SIZE];
        task_args[..config.task_args.len()].copy_from_slice(&config.task_args);
        let mut task_logging = [TaskLogging::default(); TASK_LOGGING_CHANNELS];
        for (slot, c) in task_logging.iter_mut().zip(&config.task_logging) {
            *slot = (*c).into();
        }
        Ok(Schedule {
            task_id: config.task_id,
            validity: config.validity.into(),
            locked: config.locked,
            boot_lockout_minutes: config.boot_lockout_minutes,
            timeout_s: config.timeout_s,
            battery_start: config.battery_start,
            battery_terminate: config.battery_terminate,
            periodicity: config.periodicity.into(),
            states_start_timeout_2x_s: config.states_start_timeout_2x_s,
            states_start: StatePredicate::from_terms(&config.states_start)?,
            states_terminate: StatePredicate::from_terms(&config.states_terminate)?,
            task_logging,
            task_args,
        })
    }

    /// Check value ranges. Invalid schedules never run.
    pub fn validate(&self) -> InfuseResult<()> {
        match self.periodicity {
            Periodicity::Fixed { period_s: 0 } => {
                return Err(InfuseError::invalid("fixed period of 0 seconds"));
            }
            Periodicity::Lockout { lockout_s } if lockout_s & !LOCKOUT_IGNORE_FIRST == 0 => {
                return Err(InfuseError::invalid("lockout of 0 seconds"));
            }
            Periodicity::LockoutDynamicBattery {
                lockout_min_s,
                lockout_max_s,
                ..
            } if lockout_min_s == 0 || lockout_max_s < lockout_min_s => {
                return Err(InfuseError::invalid(format!(
                    "dynamic lockout range {lockout_min_s}..{lockout_max_s}"
                )));
            }
            Periodicity::LockoutDynamicBattery {
                battery_min,
                battery_max,
                ..
            } if battery_max > BATTERY_MAX || battery_max <= battery_min => {
                return Err(InfuseError::invalid(format!(
                    "dynamic lockout battery range {battery_min}..{battery_max}"
                )));
            }
            _ => {}
        }
        for (name, range) in [
            ("battery_start", self.battery_start),
            ("battery_terminate", self.battery_terminate),
        ] {
            if range.lower > BATTERY_MAX || range.upper > BATTERY_MAX {
                return Err(InfuseError::invalid(format!("{name} above {BATTERY_MAX}%")));
            }
            if range.lower != 0 && range.upper != 0 && range.upper <= range.lower {
                return Err(InfuseError::invalid(format!(
                    "{name} upper {} not above lower {}",
                    range.upper, range.lower
                )));
            }
        }
        Ok(())
    }
}

/// Inputs to one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub states: &'a StatesSnapshot,
    pub uptime: u32,
    /// Epoch time in whole seconds
    pub epoch_s: u32,
    /// Battery charge in percent
    pub battery: u8,
}

/// Runtime bookkeeping of one schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleState {
    /// Uptime of the last start
    pub last_run: u32,
    /// Seconds the current run has lasted
    pub runtime: u32,
    /// Uptime of the last termination, 0 if never terminated
    pub last_terminate: u32,
}

/// Lockout applied at `battery` percent: `lockout_max_s` at or below
/// `battery_min`, `lockout_min_s` at or above `battery_max`, linear in
/// between.
pub fn dynamic_lockout(
    lockout_min_s: u32,
    lockout_max_s: u32,
    battery_min: u8,
    battery_max: u8,
    battery: u8,
) -> u32 {
    if battery_max <= battery_min {
        return if battery >= battery_max { lockout_min_s } else { lockout_max_s };
    }
    let range = (battery_max - battery_min) as u64;
    let above = (battery.clamp(battery_min, battery_max) - battery_min) as u64;
    let span = lockout_max_s.saturating_sub(lockout_min_s) as u64;
    lockout_max_s - (span * above / range) as u32
}

fn validity_allows(schedule: &Schedule, states: &StatesSnapshot) -> bool {
    let active = states.get(AppState::APPLICATION_ACTIVE);
    match schedule.validity {
        Validity::Active => active,
        Validity::Inactive => !active,
        Validity::Always | Validity::PermanentlyRuns => true,
    }
}

/// Whether an idle schedule should start its task now.
///
/// `linked` is the state of the schedule an AFTER periodicity refers to.
pub fn should_start(
    schedule: &Schedule,
    state: &ScheduleState,
    linked: Option<&ScheduleState>,
    ctx: &EvalContext<'_>,
) -> bool {
    // Nothing new starts while the device goes down
    if ctx.states.get(AppState::REBOOTING) {
        return false;
    }
    if !validity_allows(schedule, ctx.states) {
        return false;
    }
    if (ctx.uptime as u64) < schedule.boot_lockout_minutes as u64 * 60 {
        return false;
    }

    let since_last_run = ctx.uptime.wrapping_sub(state.last_run);
    let periodicity = match schedule.periodicity {
        Periodicity::None => true,
        Periodicity::Fixed { period_s } => period_s != 0 && ctx.epoch_s % period_s == 0,
        Periodicity::Lockout { lockout_s } => {
            let ignore_first =
                lockout_s & LOCKOUT_IGNORE_FIRST != 0 && state.last_run == 0 && ctx.uptime != 0;
            ignore_first || since_last_run >= lockout_s & !LOCKOUT_IGNORE_FIRST
        }
        Periodicity::After { duration_s, .. } => linked.is_some_and(|l| {
            l.last_terminate != 0
                && l.last_terminate as u64 + duration_s as u64 == ctx.uptime as u64
        }),
        Periodicity::LockoutDynamicBattery {
            lockout_min_s,
            lockout_max_s,
            battery_min,
            battery_max,
        } => {
            since_last_run
                >= dynamic_lockout(lockout_min_s, lockout_max_s, battery_min, battery_max, ctx.battery)
        }
    };

    let battery_lower =
        schedule.battery_start.lower == 0 || ctx.battery >= schedule.battery_start.lower;
    let battery_upper =
        schedule.battery_start.upper == 0 || ctx.battery <= schedule.battery_start.upper;

    let start_timeout = schedule.states_start_timeout_2x_s as u32;
    let states = (start_timeout != 0 && since_last_run >= 2 * start_timeout)
        || schedule.states_start.evaluate(ctx.states, true);

    periodicity && battery_lower && battery_upper && states
}

/// Whether the running task of this schedule should be asked to stop.
pub fn should_terminate(schedule: &Schedule, state: &ScheduleState, ctx: &EvalContext<'_>) -> bool {
    if schedule.validity == Validity::PermanentlyRuns {
        return false;
    }
    if ctx.states.get(AppState::REBOOTING) {
        return true;
    }
    if !validity_allows(schedule, ctx.states) {
        return true;
    }

    let timeout = schedule.timeout_s != 0 && state.runtime >= schedule.timeout_s;
    let battery_lower =
        schedule.battery_terminate.lower != 0 && ctx.battery <= schedule.battery_terminate.lower;
    let battery_upper =
        schedule.battery_terminate.upper != 0 && ctx.battery >= schedule.battery_terminate.upper;
    let states = schedule.states_terminate.evaluate(ctx.states, false);

    timeout || battery_lower || battery_upper || states
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(states: &StatesSnapshot, uptime: u32, epoch_s: u32, battery: u8) -> EvalContext<'_> {
        EvalContext {
            states,
            uptime,
            epoch_s,
            battery,
        }
    }

    fn fixed(period_s: u32) -> Schedule {
        Schedule {
            periodicity: Periodicity::Fixed { period_s },
            ..Schedule::always(1)
        }
    }

    #[test]
    fn test_validate() {
        assert!(Schedule::always(1).validate().is_ok());
        assert!(fixed(0).validate().is_err());
        assert!(fixed(10).validate().is_ok());

        let lockout0 = Schedule {
            periodicity: Periodicity::Lockout {
                lockout_s: LOCKOUT_IGNORE_FIRST,
            },
            ..Schedule::always(1)
        };
        assert!(lockout0.validate().is_err());

        for (start, terminate) in [
            ((101, 0), (0, 0)),
            ((0, 101), (0, 0)),
            ((0, 0), (101, 0)),
            ((0, 0), (0, 101)),
            ((70, 60), (0, 0)),
            ((0, 0), (70, 60)),
        ] {
            let s = Schedule {
                battery_start: BatteryRange {
                    lower: start.0,
                    upper: start.1,
                },
                battery_terminate: BatteryRange {
                    lower: terminate.0,
                    upper: terminate.1,
                },
                ..Schedule::always(1)
            };
            assert!(s.validate().is_err(), "{start:?} {terminate:?}");
        }

        let dynamic = Schedule {
            periodicity: Periodicity::LockoutDynamicBattery {
                lockout_min_s: 100,
                lockout_max_s: 50,
                battery_min: 0,
                battery_max: 100,
            },
            ..Schedule::always(1)
        };
        assert!(dynamic.validate().is_err());

        for (battery_min, battery_max) in [(50, 50), (60, 40), (0, 101)] {
            let dynamic = Schedule {
                periodicity: Periodicity::LockoutDynamicBattery {
                    lockout_min_s: 60,
                    lockout_max_s: 600,
                    battery_min,
                    battery_max,
                },
                ..Schedule::always(1)
            };
            assert!(dynamic.validate().is_err(), "{battery_min}..{battery_max}");
        }
    }

    #[test]
    fn test_from_config() {
        let config = ScheduleConfig {
            task_id: 7,
            validity: ScheduleValidity::Active,
            locked: true,
            periodicity: PeriodicityConfig::Lockout {
                lockout_s: 30,
                ignore_first: true,
            },
            states_start: vec![
                StateTerm {
                    state: 10,
                    ..Default::default()
                },
                StateTerm {
                    state: 11,
                    not: true,
                    or: false,
                },
                StateTerm {
                    state: 12,
                    not: false,
                    or: true,
                },
            ],
            task_args: vec![1, 2, 3],
            ..Default::default()
        };
        let s = Schedule::from_config(&config).unwrap();
        assert_eq!(s.validity, Validity::Active);
        assert!(s.locked);
        assert_eq!(
            s.periodicity,
            Periodicity::Lockout {
                lockout_s: 30 | LOCKOUT_IGNORE_FIRST
            }
        );
        assert_eq!(s.states_start.states, [10, 11, 12, 0]);
        assert_eq!(
            s.states_start.metadata,
            StatePredicate::not_bit(1) | StatePredicate::or_bit(2)
        );
        assert_eq!(&s.task_args[..4], &[1, 2, 3, 0]);

        let too_many = ScheduleConfig {
            task_args: vec![0; 17],
            ..Default::default()
        };
        assert!(Schedule::from_config(&too_many).is_err());
    }

    #[test]
    fn test_validity_raw() {
        assert_eq!(Validity::from_raw(Validity::LOCKED | 1), Some(Validity::Active));
        assert_eq!(Validity::from_raw(4), None);
    }

    #[test]
    fn test_empty_schedule() {
        let states = StatesSnapshot::default();
        let s = Schedule::always(1);
        let state = ScheduleState::default();
        for i in 0..100 {
            assert!(should_start(&s, &state, None, &ctx(&states, 50 + i, 100 + i, 100)));
            assert!(!should_terminate(&s, &state, &ctx(&states, 30 + i, 100 + i, 100)));
        }
    }

    #[test]
    fn test_active_and_inactive() {
        let active = StatesSnapshot::with(&[AppState::APPLICATION_ACTIVE]);
        let inactive = StatesSnapshot::default();
        let state = ScheduleState::default();

        let s = Schedule {
            validity: Validity::Active,
            ..Schedule::always(1)
        };
        assert!(should_start(&s, &state, None, &ctx(&active, 50, 100, 100)));
        assert!(!should_terminate(&s, &state, &ctx(&active, 50, 100, 100)));
        assert!(!should_start(&s, &state, None, &ctx(&inactive, 50, 100, 100)));
        assert!(should_terminate(&s, &state, &ctx(&inactive, 50, 100, 100)));

        let s = Schedule {
            validity: Validity::Inactive,
            ..Schedule::always(1)
        };
        assert!(!should_start(&s, &state, None, &ctx(&active, 50, 100, 100)));
        assert!(should_terminate(&s, &state, &ctx(&active, 50, 100, 100)));
        assert!(should_start(&s, &state, None, &ctx(&inactive, 50, 100, 100)));
    }

    #[test]
    fn test_rebooting_blocks_everything() {
        let states = StatesSnapshot::with(&[AppState::REBOOTING]);
        let s = Schedule::always(1);
        let state = ScheduleState::default();
        assert!(!should_start(&s, &state, None, &ctx(&states, 50, 100, 100)));
        assert!(should_terminate(&s, &state, &ctx(&states, 50, 100, 100)));

        // Permanent schedules are never evaluated for termination
        let permanent = Schedule {
            validity: Validity::PermanentlyRuns,
            ..Schedule::always(1)
        };
        assert!(!should_terminate(&permanent, &state, &ctx(&states, 50, 100, 100)));
    }

    #[test]
    fn test_boot_lockout() {
        let states = StatesSnapshot::default();
        let s = Schedule {
            boot_lockout_minutes: 2,
            ..Schedule::always(1)
        };
        let state = ScheduleState::default();
        for (uptime, expected) in [
            (0, false),
            (100, false),
            (119, false),
            (120, true),
            (121, true),
            (1_000_000, true),
            (u32::MAX, true),
        ] {
            assert_eq!(
                should_start(&s, &state, None, &ctx(&states, uptime, 100, 100)),
                expected,
                "uptime {uptime}"
            );
        }
    }

    #[test]
    fn test_periodicity_fixed() {
        let states = StatesSnapshot::default();
        let s = fixed(10);
        let state = ScheduleState::default();
        assert!(should_start(&s, &state, None, &ctx(&states, 29, 100, 100)));
        for epoch in 101..110 {
            assert!(!should_start(&s, &state, None, &ctx(&states, 29, epoch, 100)));
        }
        assert!(should_start(&s, &state, None, &ctx(&states, 39, 110, 100)));
    }

    #[test]
    fn test_periodicity_lockout() {
        let states = StatesSnapshot::default();
        let s = Schedule {
            periodicity: Periodicity::Lockout { lockout_s: 12 },
            ..Schedule::always(1)
        };
        let state = ScheduleState {
            last_run: 20,
            ..Default::default()
        };
        for i in 0..12 {
            assert!(!should_start(&s, &state, None, &ctx(&states, 20 + i, 10_000 + i, 100)));
        }
        assert!(should_start(&s, &state, None, &ctx(&states, 32, 10_012, 100)));
    }

    #[test]
    fn test_periodicity_lockout_ignore_first() {
        let states = StatesSnapshot::default();
        let s = Schedule {
            periodicity: Periodicity::Lockout {
                lockout_s: LOCKOUT_IGNORE_FIRST | 100,
            },
            ..Schedule::always(1)
        };
        let mut state = ScheduleState::default();
        // Not at uptime 0, so last_run ends up non-zero
        assert!(!should_start(&s, &state, None, &ctx(&states, 0, 10_000, 100)));
        for i in 1..150 {
            assert!(should_start(&s, &state, None, &ctx(&states, i, 10_000 + i, 100)));
        }

        state.last_run = 10;
        for i in 0..100 {
            assert!(!should_start(&s, &state, None, &ctx(&states, 10 + i, 10_000 + i, 100)));
        }
        assert!(should_start(&s, &state, None, &ctx(&states, 110, 200, 100)));
    }

    #[test]
    fn test_periodicity_after() {
        let states = StatesSnapshot::default();
        let mut s = Schedule {
            periodicity: Periodicity::After {
                schedule_idx: 0,
                duration_s: 10,
            },
            ..Schedule::always(1)
        };
        let state = ScheduleState::default();
        let mut linked = ScheduleState {
            last_terminate: 20,
            ..Default::default()
        };
        for i in 0..60 {
            let expected = i == 30;
            assert_eq!(
                should_start(&s, &state, Some(&linked), &ctx(&states, i, 10_000 + i, 100)),
                expected,
                "uptime {i}"
            );
        }

        s.periodicity = Periodicity::After {
            schedule_idx: 0,
            duration_s: 0,
        };
        linked.last_terminate = 100;
        assert!(!should_start(&s, &state, Some(&linked), &ctx(&states, 99, 0, 100)));
        assert!(should_start(&s, &state, Some(&linked), &ctx(&states, 100, 0, 100)));
        assert!(!should_start(&s, &state, Some(&linked), &ctx(&states, 101, 0, 100)));

        // Linked schedule has never terminated, or does not exist
        linked.last_terminate = 0;
        for i in 0..20 {
            assert!(!should_start(&s, &state, Some(&linked), &ctx(&states, i, 0, 100)));
            assert!(!should_start(&s, &state, None, &ctx(&states, i, 0, 100)));
        }
    }

    #[test]
    fn test_dynamic_battery_lockout() {
        assert_eq!(dynamic_lockout(60, 600, 0, 100, 100), 60);
        assert_eq!(dynamic_lockout(60, 600, 0, 100, 0), 600);
        assert_eq!(dynamic_lockout(60, 600, 0, 100, 50), 330);
        // Out of range clamps to the full endpoint
        assert_eq!(dynamic_lockout(60, 600, 0, 100, 250), 60);

        let states = StatesSnapshot::default();
        let s = Schedule {
            periodicity: Periodicity::LockoutDynamicBattery {
                lockout_min_s: 60,
                lockout_max_s: 600,
                battery_min: 0,
                battery_max: 100,
            },
            ..Schedule::always(1)
        };
        let state = ScheduleState {
            last_run: 1000,
            ..Default::default()
        };
        assert!(should_start(&s, &state, None, &ctx(&states, 1060, 0, 100)));
        assert!(!should_start(&s, &state, None, &ctx(&states, 1060, 0, 50)));
        assert!(should_start(&s, &state, None, &ctx(&states, 1330, 0, 50)));
        assert!(!should_start(&s, &state, None, &ctx(&states, 1599, 0, 0)));
        assert!(should_start(&s, &state, None, &ctx(&states, 1600, 0, 0)));
    }

    #[test]
    fn test_dynamic_battery_lockout_bounds() {
        // Scales over 20..80%, clamped outside
        assert_eq!(dynamic_lockout(100, 700, 20, 80, 10), 700);
        assert_eq!(dynamic_lockout(100, 700, 20, 80, 20), 700);
        assert_eq!(dynamic_lockout(100, 700, 20, 80, 50), 400);
        assert_eq!(dynamic_lockout(100, 700, 20, 80, 80), 100);
        assert_eq!(dynamic_lockout(100, 700, 20, 80, 95), 100);

        let states = StatesSnapshot::default();
        let s = Schedule {
            periodicity: Periodicity::LockoutDynamicBattery {
                lockout_min_s: 100,
                lockout_max_s: 700,
                battery_min: 20,
                battery_max: 80,
            },
            ..Schedule::always(1)
        };
        s.validate().unwrap();
        let state = ScheduleState {
            last_run: 1000,
            ..Default::default()
        };
        assert!(!should_start(&s, &state, None, &ctx(&states, 1399, 0, 50)));
        assert!(should_start(&s, &state, None, &ctx(&states, 1400, 0, 50)));
        assert!(should_start(&s, &state, None, &ctx(&states, 1100, 0, 90)));
    }

    #[test]
    fn test_battery_static() {
        let states = StatesSnapshot::default();
        let mut s = Schedule {
            battery_start: BatteryRange { lower: 50, upper: 0 },
            battery_terminate: BatteryRange { lower: 20, upper: 0 },
            ..Schedule::always(1)
        };
        let state = ScheduleState::default();
        for b in 0..=100u8 {
            assert_eq!(should_start(&s, &state, None, &ctx(&states, 10, 100, b)), b >= 50);
            assert_eq!(should_terminate(&s, &state, &ctx(&states, 10, 100, b)), b <= 20);
        }

        s.battery_start.upper = 60;
        s.battery_terminate.upper = 90;
        assert!(s.validate().is_ok());
        for b in 0..=100u8 {
            assert_eq!(
                should_start(&s, &state, None, &ctx(&states, 10, 100, b)),
                (50..=60).contains(&b)
            );
            assert_eq!(
                should_terminate(&s, &state, &ctx(&states, 10, 100, b)),
                b <= 20 || b >= 90
            );
        }
    }

    #[test]
    fn test_timeout() {
        let states = StatesSnapshot::default();
        let s = Schedule {
            timeout_s: 5,
            ..Schedule::always(1)
        };
        let mut state = ScheduleState::default();
        for runtime in 0..5 {
            state.runtime = runtime;
            assert!(!should_terminate(&s, &state, &ctx(&states, 10, 100, 100)));
        }
        state.runtime = 5;
        assert!(should_terminate(&s, &state, &ctx(&states, 10, 100, 100)));
    }

    #[test]
    fn test_state_predicate() {
        let p = StatePredicate::from_terms(&[
            StateTerm {
                state: 10,
                not: false,
                or: false,
            },
            StateTerm {
                state: 11,
                not: true,
                or: false,
            },
            StateTerm {
                state: 12,
                not: false,
                or: true,
            },
        ])
        .unwrap();

        assert!(p.evaluate(&StatesSnapshot::with(&[10]), false));
        assert!(p.evaluate(&StatesSnapshot::with(&[12]), false));
        assert!(!p.evaluate(&StatesSnapshot::with(&[11]), false));
        assert!(!p.evaluate(&StatesSnapshot::with(&[10, 11]), false));
        assert!(p.evaluate(&StatesSnapshot::with(&[10, 11, 12]), false));

        let empty = StatePredicate::default();
        assert!(empty.evaluate(&StatesSnapshot::default(), true));
        assert!(!empty.evaluate(&StatesSnapshot::default(), false));

        // OR on the first slot has no effect
        let first_or = StatePredicate {
            states: [10, 0, 0, 0],
            metadata: StatePredicate::or_bit(0),
        };
        assert!(!first_or.evaluate(&StatesSnapshot::default(), true));

        assert!(StatePredicate::from_terms(&[StateTerm::default()]).is_err());
    }

    #[test]
    fn test_states_start_timeout_short_circuits() {
        let s = Schedule {
            states_start_timeout_2x_s: 30,
            states_start: StatePredicate {
                states: [200, 0, 0, 0],
                metadata: 0,
            },
            ..Schedule::always(1)
        };
        let states = StatesSnapshot::default();
        let state = ScheduleState {
            last_run: 100,
            ..Default::default()
        };
        assert!(!should_start(&s, &state, None, &ctx(&states, 159, 0, 100)));
        assert!(should_start(&s, &state, None, &ctx(&states, 160, 0, 100)));
        assert!(should_start(&s, &state, None, &ctx(&StatesSnapshot::with(&[200]), 101, 0, 100)));
    }

    #[test]
    fn test_terminate_states() {
        let s = Schedule {
            states_terminate: StatePredicate {
                states: [150, 0, 0, 0],
                metadata: 0,
            },
            ..Schedule::always(1)
        };
        let state = ScheduleState::default();
        assert!(!should_terminate(&s, &state, &ctx(&StatesSnapshot::default(), 1, 0, 100)));
        assert!(should_terminate(&s, &state, &ctx(&StatesSnapshot::with(&[150]), 1, 0, 100)));
    }

    mod proptest_suite {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_fixed_only_on_period(period in 1u32..3600, epoch in any::<u32>(), uptime in any::<u32>()) {
                let states = StatesSnapshot::default();
                let s = fixed(period);
                let started = should_start(&s, &ScheduleState::default(), None, &ctx(&states, uptime, epoch, 100));
                prop_assert_eq!(started, epoch % period == 0);
            }
        }
    }
}
