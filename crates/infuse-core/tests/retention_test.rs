//! Reboot records persisted through a file-backed retention region.

use std::sync::Arc;

use infuse_core::reboot::{FileRetention, RebootInfo, RebootManager, RebootReason};
use infuse_core::time::{epoch_time_from, EpochClock, SyncInstant, TimeSource};
use infuse_core::InfuseError;

#[test]
fn test_file_retention_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reboot.bin");

    let clock = Arc::new(EpochClock::new());
    clock
        .set_reference(
            TimeSource::GNSS,
            SyncInstant {
                local: 0,
                reference: epoch_time_from(1_400_000_000, 0),
            },
        )
        .unwrap();

    // First "boot" stores the record
    let first = RebootManager::new(Box::new(FileRetention::new(&path)), clock, |_| {});
    first
        .store(
            RebootReason::SwWatchdog,
            RebootInfo::Watchdog {
                info1: 0xAA,
                info2: 0xBB,
            },
        )
        .unwrap();
    drop(first);
    assert!(path.exists());

    // Second "boot" reads it back with a fresh clock
    let second = RebootManager::new(
        Box::new(FileRetention::new(&path)),
        Arc::new(EpochClock::new()),
        |_| {},
    );
    let state = second.query().unwrap();
    assert_eq!(state.reason, RebootReason::SwWatchdog);
    assert_eq!(state.epoch_time_source, TimeSource::GNSS);
    assert!(state.epoch_time >= epoch_time_from(1_400_000_000, 0));
    assert_eq!(
        state.info,
        RebootInfo::Watchdog {
            info1: 0xAA,
            info2: 0xBB
        }
    );

    // Cleared after reading
    assert!(!path.exists());
    assert!(matches!(second.query(), Err(InfuseError::NotFound)));
}

#[test]
fn test_truncated_file_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reboot.bin");
    std::fs::write(&path, [0u8; 10]).unwrap();

    let m = RebootManager::new(
        Box::new(FileRetention::new(&path)),
        Arc::new(EpochClock::new()),
        |_| {},
    );
    assert!(matches!(m.query(), Err(InfuseError::NotFound)));
}
