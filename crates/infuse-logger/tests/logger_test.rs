//! Data logger behaviour over file-backed media, including recovery of the
//! write position after a restart.

use std::path::Path;
use std::sync::Arc;

use infuse_core::config::TdfConfig;
use infuse_core::{EpochClock, InfuseError, InfuseType};
use infuse_epacket::{DummyInterface, Epacket};
use infuse_logger::file_dir::list_containers;
use infuse_logger::logger::wrap_count;
use infuse_logger::{
    epacket_logger, DataLogger, FileDirBackend, FileFlash, FlashMapBackend, LoggerMask, TdfLogger,
};
use infuse_tdf::TdfParser;
use proptest::prelude::*;

fn flash_logger(path: &Path, blocks: u32, block_size: usize) -> DataLogger {
    let area = FileFlash::open(path, blocks as u64 * block_size as u64, block_size as u32).unwrap();
    let backend = FlashMapBackend::new("flash", area, block_size).unwrap();
    DataLogger::new(Box::new(backend)).unwrap()
}

fn wrap_of(logger: &DataLogger, block: u32) -> u8 {
    let mut header = [0u8; 2];
    logger.read(block, 0, &mut header).unwrap();
    header[0]
}

#[test]
fn test_wrap_and_recover_from_image() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("flash.bin");

    {
        let logger = flash_logger(&image, 8, 512);
        for i in 0..10u8 {
            logger.write(InfuseType::Tdf, &[i; 100]).unwrap();
        }
        let st = logger.state();
        assert_eq!(st.current_block, 10);
        assert_eq!(st.earliest_block, 2);
        for block in 2..8 {
            assert_eq!(wrap_of(&logger, block), 1, "block {block}");
        }
        for block in 8..10 {
            assert_eq!(wrap_of(&logger, block), 2, "block {block}");
        }
        logger.flush().unwrap();
    }

    let logger = flash_logger(&image, 8, 512);
    let st = logger.state();
    assert_eq!(st.current_block, 10);
    assert_eq!(st.earliest_block, 2);
    assert_eq!(st.boot_block, 10);

    let block = logger.read_block(9).unwrap();
    assert_eq!(block[1], InfuseType::Tdf.as_u8());
    assert_eq!(&block[2..102], &[9u8; 100]);
    assert!(matches!(
        logger.read_block(1),
        Err(InfuseError::NotFound)
    ));
}

#[test]
fn test_wrap_counter_reenters_at_one() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("flash.bin");
    let n = 4u32;

    {
        let logger = flash_logger(&image, n, 64);
        for _ in 0..254 * n {
            logger.write(InfuseType::Tdf, &[0xA5; 8]).unwrap();
        }
        assert_eq!(logger.state().earliest_block, 253 * n);
        assert_eq!(wrap_of(&logger, 254 * n - 1), 254);

        logger.write(InfuseType::Tdf, &[0x5A; 8]).unwrap();
        assert_eq!(wrap_of(&logger, 254 * n), 1);
    }

    let logger = flash_logger(&image, n, 64);
    let st = logger.state();
    assert_eq!(st.current_block, 254 * n + 1);
    assert_eq!(st.earliest_block, 253 * n + 1);
}

#[test]
fn test_file_dir_logger_fills_and_resets() {
    let dir = tempfile::tempdir().unwrap();
    let open = || {
        let backend = FileDirBackend::new("sd", dir.path(), 0x42, 128, 4, 2).unwrap();
        DataLogger::new(Box::new(backend)).unwrap()
    };

    {
        let logger = open();
        for i in 0..5u8 {
            logger.write(InfuseType::Tdf, &[i; 10]).unwrap();
        }
        assert_eq!(list_containers(dir.path()).unwrap().len(), 2);
    }

    let logger = open();
    let st = logger.state();
    assert_eq!(st.current_block, 5);
    assert_eq!(st.earliest_block, 0);
    // Full blocks are written, padded with the erase value
    let block = logger.read_block(4).unwrap();
    assert_eq!(&block[2..12], &[4u8; 10]);
    assert!(block[12..].iter().all(|b| *b == 0xFF));

    for _ in 5..8 {
        logger.write(InfuseType::Tdf, &[0; 10]).unwrap();
    }
    assert!(matches!(
        logger.write(InfuseType::Tdf, &[0; 10]),
        Err(InfuseError::NoMem)
    ));

    let mut progress = Vec::new();
    logger.erase(false, |n| progress.push(n)).unwrap();
    assert_eq!(progress, vec![4, 8]);
    assert!(list_containers(dir.path()).unwrap().is_empty());
    assert_eq!(logger.state().current_block, 0);
    logger.write(InfuseType::Tdf, &[1; 10]).unwrap();
}

#[test]
fn test_tdf_fan_out_to_flash_and_epacket() {
    let dir = tempfile::tempdir().unwrap();
    let flash = Arc::new(flash_logger(&dir.path().join("flash.bin"), 16, 256));

    let dummy = Arc::new(DummyInterface::new());
    let mut epacket = Epacket::new(Arc::new(EpochClock::new()), 0x10, 8);
    let handle = epacket.add_interface(dummy.clone());
    let epacket = Arc::new(epacket);
    let serial = epacket_logger(epacket.clone(), handle).unwrap();

    let mut tdf = TdfLogger::new(TdfConfig::default());
    tdf.add_backend(LoggerMask::FLASH, flash.clone()).unwrap();
    tdf.add_backend(LoggerMask::SERIAL, serial).unwrap();

    let t0 = 1_000_000_000_000_000u64;
    let both = LoggerMask::FLASH | LoggerMask::SERIAL;
    tdf.log(both, 0x100, 4, 1, t0, 0, &[0x11, 0x22, 0x33, 0x44]).unwrap();
    tdf.log(both, 0x100, 4, 1, t0 + 500, 0, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
    tdf.log(LoggerMask::FLASH, 0x101, 1, 1, 0, 0, &[7]).unwrap();
    tdf.flush(both).unwrap();

    let stored = flash.read_block(0).unwrap();
    let from_flash: Vec<(u16, u64)> = TdfParser::new(&stored[2..])
        .map_while(|p| p.ok())
        .map(|p| (p.id, p.time))
        .collect();
    assert_eq!(from_flash, vec![(0x100, t0), (0x100, t0 + 500), (0x101, 0)]);

    assert_eq!(epacket.process_tx(), 1);
    let frame = dummy.pop_sent().unwrap();
    assert_eq!(frame[0], InfuseType::Tdf.as_u8());
    let sent: Vec<(u16, u64)> = TdfParser::new(&frame[8..])
        .map(|p| p.unwrap())
        .map(|p| (p.id, p.time))
        .collect();
    assert_eq!(sent, vec![(0x100, t0), (0x100, t0 + 500)]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_ring_keeps_one_pass(n in 2u32..12, extra in 0u32..40) {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("flash.bin");
        let k = n + extra;
        {
            let logger = flash_logger(&image, n, 32);
            for i in 0..k {
                logger.write(InfuseType::Tdf, &i.to_le_bytes()).unwrap();
            }
            let st = logger.state();
            prop_assert_eq!(st.current_block - st.earliest_block, n);
            prop_assert_eq!(wrap_of(&logger, k - 1), wrap_count(k - 1, n));
        }

        let logger = flash_logger(&image, n, 32);
        let st = logger.state();
        prop_assert_eq!(st.current_block, k);
        prop_assert_eq!(st.earliest_block, k - n);
        let last = logger.read_block(k - 1).unwrap();
        prop_assert_eq!(&last[2..6], &(k - 1).to_le_bytes());
    }
}
