//! `infuse run`: the 1 Hz supervisor loop
//!
//! Each iteration snapshots the application states, lets the task runner
//! start and stop tasks, ticks state timeouts and checks the software
//! watchdog. A watchdog expiry records a `SwWatchdog` reboot and ends the
//! loop with an error so the service manager restarts the process.

use anyhow::{bail, Context, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use infuse_core::config::InfuseConfig;
use infuse_core::reboot::{FileRetention, MemRetention, RebootManager, RebootReason, Retention};
use infuse_core::time::epoch_time_seconds;
use infuse_core::{AppState, ApplicationStates, EpochClock, InfuseError};
use infuse_logger::{
    DataLogger, DiskAccessBackend, FileDisk, FileFlash, FlashMapBackend, LoggerBackend,
    LoggerMask, MemDisk, MemFlash, TdfLogger,
};
use infuse_task_runner::schedule::LOCKOUT_IGNORE_FIRST;
use infuse_task_runner::{
    Periodicity, Schedule, ScheduleOverrides, TaskConfig, TaskContext, TaskRunner, Validity,
    Watchdog, WorkStatus,
};
use infuse_tdf::definitions::{Announce, BatteryState, TDF_ANNOUNCE, TDF_BATTERY_STATE};

pub const TASK_ID_ANNOUNCE: u8 = 1;
pub const TASK_ID_BATTERY: u8 = 2;

/// Time allowed for tasks to stop on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_BATTERY_PERIOD_S: u32 = 10;

// ── Built-in tasks ────────────────────────────────────────────────────────────

/// Loggers selected by the first task logging channel (flash if unset).
fn task_loggers(ctx: &TaskContext) -> LoggerMask {
    match ctx.schedule.task_logging[0].loggers {
        0 => LoggerMask::FLASH,
        bits => LoggerMask::from_bits(bits),
    }
}

fn announce_task(tdf: Arc<TdfLogger>, clock: Arc<EpochClock>) -> TaskConfig {
    TaskConfig::workqueue("announce", TASK_ID_ANNOUNCE, move |ctx| {
        let announce = Announce {
            application: 0x1F5E_0000,
            version_major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            version_minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            version_revision: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            version_build: 0,
            kv_crc: 0,
            uptime: clock.uptime_seconds(),
            reboots: 0,
            flags: 0,
        };
        let mask = task_loggers(ctx);
        let result = tdf
            .log(mask, TDF_ANNOUNCE, Announce::SIZE as u8, 1, clock.now(), 0, &announce.to_bytes())
            .and_then(|_| tdf.flush(mask));
        if let Err(e) = result {
            warn!(error = %e, "announce not logged");
        }
        WorkStatus::Done
    })
}

/// Samples the reported battery charge every `task_args[0..4]` seconds.
fn battery_task(tdf: Arc<TdfLogger>, clock: Arc<EpochClock>, battery: u8) -> TaskConfig {
    TaskConfig::thread("battery", TASK_ID_BATTERY, move |ctx| {
        let args = &ctx.schedule.task_args;
        let period = match u32::from_le_bytes([args[0], args[1], args[2], args[3]]) {
            0 => DEFAULT_BATTERY_PERIOD_S,
            p => p,
        };
        let mask = task_loggers(&ctx);
        loop {
            let state = BatteryState {
                voltage_mv: 3300 + 9 * battery as u32,
                current_ua: 0,
                soc: battery,
            };
            if let Err(e) = tdf.log(
                mask,
                TDF_BATTERY_STATE,
                BatteryState::SIZE as u8,
                1,
                clock.now(),
                0,
                &state.to_bytes(),
            ) {
                warn!(error = %e, "battery state not logged");
            }
            if ctx.terminate.poll(Duration::from_secs(period as u64)) {
                break;
            }
        }
        debug!("battery task exiting");
    })
}

/// Schedules used when the configuration declares none.
pub fn default_schedules() -> Vec<Schedule> {
    vec![
        Schedule {
            periodicity: Periodicity::Lockout {
                lockout_s: 3600 | LOCKOUT_IGNORE_FIRST,
            },
            ..Schedule::always(TASK_ID_ANNOUNCE)
        },
        Schedule {
            validity: Validity::PermanentlyRuns,
            ..Schedule::always(TASK_ID_BATTERY)
        },
    ]
}

/// Configured schedules with persisted overrides applied.
pub fn load_schedules(config: &InfuseConfig) -> Result<Vec<Schedule>> {
    let defaults = if config.schedules.is_empty() {
        default_schedules()
    } else {
        config
            .schedules
            .iter()
            .enumerate()
            .map(|(i, c)| Schedule::from_config(c).with_context(|| format!("schedule {i}")))
            .collect::<Result<Vec<_>>>()?
    };
    match &config.task_runner.schedule_overrides {
        Some(path) => {
            let overrides = ScheduleOverrides::load(path)
                .with_context(|| format!("loading schedule overrides {}", path.display()))?;
            Ok(overrides.apply(&defaults))
        }
        None => Ok(defaults),
    }
}

// ── Loggers ───────────────────────────────────────────────────────────────────

fn open_loggers(config: &InfuseConfig) -> Result<(TdfLogger, Vec<Arc<DataLogger>>)> {
    let mut tdf = TdfLogger::new(config.tdf.clone());
    let mut loggers = Vec::new();

    let flash = &config.logger.flash;
    if flash.enabled {
        let block_size = flash.block_size as usize;
        let backend: Box<dyn LoggerBackend> = match &flash.image {
            Some(path) => {
                let area = FileFlash::open(path, flash.area_size, flash.erase_size)
                    .with_context(|| format!("opening flash image {}", path.display()))?;
                Box::new(FlashMapBackend::new("flash", area, block_size)?)
            }
            None => {
                let area = MemFlash::new(flash.area_size as usize, flash.erase_size);
                Box::new(FlashMapBackend::new("flash", area, block_size)?)
            }
        };
        let logger = Arc::new(DataLogger::new(backend)?);
        tdf.add_backend(LoggerMask::FLASH, logger.clone())?;
        loggers.push(logger);
    }

    let removable = &config.logger.removable;
    if removable.enabled {
        let sector_size = removable.sector_size as usize;
        let backend: Box<dyn LoggerBackend> = match &removable.image {
            Some(path) => {
                let disk = FileDisk::open(path, sector_size, removable.sector_count)
                    .with_context(|| format!("opening disk image {}", path.display()))?;
                Box::new(DiskAccessBackend::new("removable", disk, removable.erase_sectors)?)
            }
            None => {
                let disk = MemDisk::new(sector_size, removable.sector_count)
                    .with_erase_sectors(removable.erase_sectors);
                Box::new(DiskAccessBackend::new("removable", disk, removable.erase_sectors)?)
            }
        };
        let logger = Arc::new(DataLogger::new(backend)?);
        tdf.add_backend(LoggerMask::REMOVABLE, logger.clone())?;
        loggers.push(logger);
    }
    Ok((tdf, loggers))
}

// ── Loop ──────────────────────────────────────────────────────────────────────

pub async fn run(config: InfuseConfig, battery: u8, iterations: Option<u64>) -> Result<()> {
    let states = Arc::new(ApplicationStates::new());
    let clock = Arc::new(EpochClock::with_states(states.clone()));

    let retention: Box<dyn Retention> = match &config.device.retention_file {
        Some(path) => Box::new(FileRetention::new(path)),
        None => Box::new(MemRetention::new()),
    };
    let reboot_requested = Arc::new(Mutex::new(None::<RebootReason>));
    let requested = reboot_requested.clone();
    let reboot = Arc::new(RebootManager::new(retention, clock.clone(), move |reason| {
        *requested.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }));
    match reboot.query() {
        Ok(previous) => info!(
            reason = ?previous.reason,
            uptime = previous.uptime,
            thread = %previous.thread_name,
            "previous reboot"
        ),
        Err(InfuseError::NotFound) => debug!("no reboot record"),
        Err(e) => warn!(error = %e, "reading reboot record"),
    }

    let (tdf, loggers) = open_loggers(&config)?;
    let tdf = Arc::new(tdf);
    let tasks = vec![
        announce_task(tdf.clone(), clock.clone()),
        battery_task(tdf.clone(), clock.clone(), battery),
    ];
    let schedules = load_schedules(&config)?;
    let mut runner = TaskRunner::new(schedules, tasks).context("starting task runner")?;

    let watchdog = (config.task_runner.watchdog_timeout_s > 0).then(|| Arc::new(Watchdog::new()));
    if let Some(wd) = &watchdog {
        let reboot = reboot.clone();
        wd.on_expiry(move |channel, name| {
            error!(channel = %name, "software watchdog expired");
            if let Err(e) = reboot.reboot(RebootReason::SwWatchdog, channel.index() as u32, 0) {
                error!(error = %e, "failed to record watchdog reboot");
            }
        });
        runner = runner.with_watchdog(
            wd.clone(),
            Duration::from_secs(config.task_runner.watchdog_timeout_s as u64),
        );
    }

    info!(
        schedules = runner.schedule_count(),
        period_ms = config.task_runner.iteration_period_ms,
        battery,
        "supervisor starting"
    );
    let mut interval =
        tokio::time::interval(Duration::from_millis(config.task_runner.iteration_period_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut count = 0u64;
    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("received SIGINT");
                break Ok(());
            }
            _ = interval.tick() => {}
        }

        let snapshot = states.snapshot();
        let epoch_s = epoch_time_seconds(clock.now()) as u32;
        runner.iterate(&snapshot, clock.uptime_seconds(), epoch_s, battery);
        states.tick(&snapshot);
        if let Some(wd) = &watchdog {
            wd.check(Instant::now());
        }

        if let Some(reason) = *reboot_requested.lock().unwrap_or_else(PoisonError::into_inner) {
            break Err(reason);
        }
        count += 1;
        if iterations.is_some_and(|n| count >= n) {
            break Ok(());
        }
    };

    shutdown(&mut runner, &states, &clock).await;
    if let Err(e) = tdf.flush(LoggerMask::from_bits(0xFF)) {
        warn!(error = %e, "final TDF flush");
    }
    for logger in &loggers {
        if let Err(e) = logger.flush() {
            warn!(logger = logger.name(), error = %e, "final logger flush");
        }
    }

    match outcome {
        Ok(()) => {
            info!(iterations = count, "supervisor stopped");
            Ok(())
        }
        Err(reason) => bail!("reboot requested: {reason:?}"),
    }
}

/// Raise REBOOTING, ask every task (permanent ones included) to stop and
/// wait for them to exit. Nothing is started again.
async fn shutdown(runner: &mut TaskRunner, states: &ApplicationStates, clock: &EpochClock) {
    states.set(AppState::REBOOTING);
    runner.terminate_all();
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    loop {
        runner.reap(clock.uptime_seconds());
        if runner.running_count() == 0 {
            return;
        }
        if Instant::now() >= deadline {
            warn!(running = runner.running_count(), "tasks still running at shutdown");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
