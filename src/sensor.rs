use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobMatcher};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// One-wire thermal probes expose a directory named after their family
/// code and serial, e.g. `28-0316a279bbff` for DS18B20 parts.
const PROBE_PATTERN: &str = "28*";

/// Name of the two-line status file inside each probe directory.
const STATUS_FILE: &str = "w1_slave";

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("failed to scan {dir}: {source}")]
    Scan {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid probe pattern: {0}")]
    Pattern(#[from] globset::Error),
}

/// A discovered one-wire probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub id: String,
    pub status_file: PathBuf,
}

/// A single temperature capture. Produced fresh on every poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub celsius: f64,
    pub fahrenheit: f64,
}

/// Knobs for the ready-flag wait inside [read].
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Delay between re-reads while the probe reports a pending
    /// conversion.
    pub retry_delay: Duration,
    /// Bound on re-reads; exhaustion yields no reading for this cycle.
    pub max_retries: u32,
}

/// Scan `base_dir` for probe directories, in id order.
pub async fn discover(base_dir: &Path) -> Result<Vec<Probe>, SensorError> {
    let matcher = probe_matcher()?;

    let scan_err = |source| SensorError::Scan {
        dir: base_dir.to_path_buf(),
        source,
    };

    let mut probes = Vec::new();
    let mut entries = fs::read_dir(base_dir).await.map_err(scan_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let is_dir = entry.file_type().await.map_err(scan_err)?.is_dir();
        if is_dir && matcher.is_match(&name) {
            probes.push(Probe {
                status_file: entry.path().join(STATUS_FILE),
                id: name,
            });
        }
    }

    probes.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(probes)
}

fn probe_matcher() -> Result<GlobMatcher, globset::Error> {
    Ok(Glob::new(PROBE_PATTERN)?.compile_matcher())
}

/// Poll `probe` once, waiting out a pending conversion within the
/// configured retry budget.
///
/// Every failure mode -- unreadable file, stuck ready flag, missing or
/// garbled temperature marker -- yields `None`; the caller simply skips
/// this probe for the cycle.
pub async fn read(probe: &Probe, settings: &PollSettings) -> Option<Reading> {
    let mut attempts = 0;
    loop {
        let raw = match fs::read_to_string(&probe.status_file).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(probe = %probe.id, "failed to read status file: {e}");
                return None;
            }
        };

        match parse_status(&raw) {
            Status::Ready(reading) => return Some(reading),
            Status::Invalid => {
                debug!(probe = %probe.id, "no temperature in status file");
                return None;
            }
            Status::NotReady => {
                if attempts >= settings.max_retries {
                    warn!(
                        probe = %probe.id,
                        "probe not ready after {attempts} retries, skipping cycle"
                    );
                    return None;
                }
                attempts += 1;
                tokio::time::sleep(settings.retry_delay).await;
            }
        }
    }
}

enum Status {
    /// Conversion still pending, worth re-reading.
    NotReady,
    /// No temperature can be extracted from this file.
    Invalid,
    Ready(Reading),
}

/// Parse a raw `w1_slave` status file.
///
/// Line 1 ends in `YES` once the CRC check passed; line 2 carries the
/// temperature in millidegrees after a `t=` marker:
///
/// ```text
/// 73 01 4b 46 7f ff 0d 10 41 : crc=41 YES
/// 73 01 4b 46 7f ff 0d 10 41 t=23625
/// ```
fn parse_status(raw: &str) -> Status {
    let mut lines = raw.lines();
    let (Some(crc_line), Some(data_line)) = (lines.next(), lines.next()) else {
        return Status::Invalid;
    };

    if !crc_line.trim_end().ends_with("YES") {
        return Status::NotReady;
    }

    let Some(marker) = data_line.find("t=") else {
        return Status::Invalid;
    };
    let Ok(millidegrees) = data_line[marker + 2..].trim().parse::<f64>() else {
        return Status::Invalid;
    };

    let celsius = millidegrees / 1000.0;
    Status::Ready(Reading {
        celsius,
        fahrenheit: celsius * 9.0 / 5.0 + 32.0,
    })
}
