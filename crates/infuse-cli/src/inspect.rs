//! Offline inspection commands: TDF decoding, flash images, schedule tables

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use infuse_core::config::{InfuseConfig, ScheduleConfig};
use infuse_core::{InfuseError, InfuseType};
use infuse_logger::{BlockHeader, DataLogger, FileFlash, FlashMapBackend, BLOCK_HEADER_SIZE};
use infuse_task_runner::{Periodicity, Schedule};
use infuse_tdf::{definitions, TdfDataType, TdfParsed, TdfParser};

// ── TDF ───────────────────────────────────────────────────────────────────────

/// Bytes of `input`: the file it names, otherwise hex (whitespace and a
/// leading `0x` are ignored).
pub fn read_input(input: &str) -> Result<Vec<u8>> {
    let path = Path::new(input);
    if path.is_file() {
        return std::fs::read(path).with_context(|| format!("reading {}", path.display()));
    }
    parse_hex(input).with_context(|| format!("{input:?} is neither a file nor hex"))
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits");
    }
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair)?;
            u8::from_str_radix(text, 16).with_context(|| format!("bad hex byte {text:?}"))
        })
        .collect()
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn format_record(rec: &TdfParsed<'_>, json: bool) -> String {
    let name = definitions::name(rec.id).unwrap_or("?");
    let kind = match rec.data_type {
        TdfDataType::Single => String::new(),
        TdfDataType::TimeArray { period } => format!(" period={period}"),
        TdfDataType::IdxArray { start_idx } => format!(" start_idx={start_idx}"),
    };
    let mut line = format!(
        "id={} ({name}) time={} len={} count={}{kind}",
        rec.id, rec.time, rec.len, rec.count
    );
    for i in 0..rec.count as usize {
        let Some(sample) = rec.sample(i) else { break };
        let decoded = if json {
            definitions::decode_json(rec.id, sample).map(|v| v.to_string())
        } else {
            None
        };
        line.push_str(&format!("\n  [{i}] {}", decoded.unwrap_or_else(|| hex(sample))));
    }
    line
}

/// Render every record of `buf`, failing on the first malformed one.
pub fn decode_tdf(buf: &[u8], json: bool) -> Result<Vec<String>> {
    TdfParser::new(buf)
        .enumerate()
        .map(|(i, rec)| {
            rec.map(|r| format_record(&r, json))
                .with_context(|| format!("record {i} is malformed"))
        })
        .collect()
}

pub fn cmd_tdf_decode(input: &str, json: bool) -> Result<()> {
    let buf = read_input(input)?;
    for line in decode_tdf(&buf, json)? {
        println!("{line}");
    }
    Ok(())
}

// ── Flash images ──────────────────────────────────────────────────────────────

fn open_image(config: &InfuseConfig, image: Option<&Path>, create: bool) -> Result<DataLogger> {
    let flash = &config.logger.flash;
    let path = image
        .or(flash.image.as_deref())
        .context("no flash image given (--image or [logger.flash] image)")?;
    if !create && !path.exists() {
        bail!("flash image not found: {}", path.display());
    }
    let area = FileFlash::open(path, flash.area_size, flash.erase_size)
        .with_context(|| format!("opening flash image {}", path.display()))?;
    let backend = FlashMapBackend::new("flash", area, flash.block_size as usize)
        .context("flash geometry")?;
    DataLogger::new(Box::new(backend)).context("recovering logger state")
}

pub fn cmd_logger_info(config: &InfuseConfig, image: Option<&Path>) -> Result<()> {
    let logger = open_image(config, image, false)?;
    println!("{}", serde_json::to_string_pretty(&logger.state())?);
    Ok(())
}

/// Describe logical blocks `start..start + count` of `logger`.
pub fn dump_blocks(logger: &DataLogger, start: Option<u32>, count: Option<u32>) -> Result<Vec<String>> {
    let st = logger.state();
    let start = start.unwrap_or(st.earliest_block).max(st.earliest_block);
    let end = match count {
        Some(n) => start.saturating_add(n).min(st.current_block),
        None => st.current_block,
    };

    let mut out = Vec::new();
    for block in start..end {
        let raw = logger
            .read_block(block)
            .with_context(|| format!("reading block {block}"))?;
        let mut header = [0u8; BLOCK_HEADER_SIZE];
        header.copy_from_slice(&raw[..BLOCK_HEADER_SIZE]);
        let Some(header) = BlockHeader::decode(header) else {
            out.push(format!("block {block}: erased"));
            continue;
        };
        let payload = &raw[BLOCK_HEADER_SIZE..];
        match InfuseType::from_u8(header.block_type) {
            Some(InfuseType::Tdf) => {
                out.push(format!("block {block}: wrap={} TDF", header.wrap));
                // Unused block space parses as a reserved id and ends the stream
                for rec in TdfParser::new(payload) {
                    match rec {
                        Ok(r) => out.push(format!("  {}", format_record(&r, true))),
                        Err(InfuseError::Invalid(_)) => break,
                        Err(e) => return Err(e).context(format!("block {block}")),
                    }
                }
            }
            other => out.push(format!(
                "block {block}: wrap={} type={} {}",
                header.wrap,
                other.map_or_else(|| header.block_type.to_string(), |t| format!("{t:?}")),
                hex(payload)
            )),
        }
    }
    Ok(out)
}

pub fn cmd_logger_dump(
    config: &InfuseConfig,
    image: Option<&Path>,
    start: Option<u32>,
    count: Option<u32>,
) -> Result<()> {
    let logger = open_image(config, image, false)?;
    for line in dump_blocks(&logger, start, count)? {
        println!("{line}");
    }
    Ok(())
}

pub fn cmd_logger_erase(config: &InfuseConfig, image: Option<&Path>, all: bool) -> Result<()> {
    let logger = open_image(config, image, true)?;
    logger
        .erase(all, |erased| tracing::debug!(erased, "erase progress"))
        .context("erasing image")?;
    println!("erased {}", logger.name());
    Ok(())
}

// ── Schedules ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScheduleTable {
    schedules: Vec<ScheduleConfig>,
}

/// Check each schedule on its own, then the links between them.
pub fn validate_schedules(configs: &[ScheduleConfig]) -> Vec<(usize, Result<Schedule>)> {
    configs
        .iter()
        .enumerate()
        .map(|(i, config)| {
            let result = Schedule::from_config(config)
                .and_then(|s| s.validate().map(|_| s))
                .map_err(anyhow::Error::from)
                .and_then(|s| match s.periodicity {
                    Periodicity::After { schedule_idx, .. }
                        if schedule_idx as usize >= configs.len() =>
                    {
                        bail!("linked schedule {schedule_idx} does not exist")
                    }
                    _ => Ok(s),
                });
            (i, result)
        })
        .collect()
}

pub fn cmd_schedules_validate(path: &Path) -> Result<()> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let table: ScheduleTable =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut invalid = 0;
    for (i, result) in validate_schedules(&table.schedules) {
        match result {
            Ok(s) => println!("schedule {i}: ok (task {}, {:?})", s.task_id, s.periodicity),
            Err(e) => {
                invalid += 1;
                println!("schedule {i}: invalid: {e:#}");
            }
        }
    }
    if invalid > 0 {
        bail!("{invalid} of {} schedules invalid", table.schedules.len());
    }
    Ok(())
}
