pub mod error;

use std::{fmt::Display, path::{Path, PathBuf}};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use error::*;

/// Name of the directory holding the backup tool's bookkeeping
pub const DATA_DIR_NAME: &str = "rdiff-backup-data";

const STATISTICS_PREFIX: &str = "session_statistics.";
const STATISTICS_SUFFIX: &str = ".data";

///
/// A point in time of the backup tree: the coarse epoch-seconds value used
/// for comparisons, and the exact suffix the backup tool used when naming
/// the snapshot's artifacts
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub epoch: i64,
    pub filestamp: String,
}

impl Timestamp {
    pub fn new(epoch: i64, filestamp: impl Into<String>) -> Self {
        Self { epoch, filestamp: filestamp.into() }
    }

    pub fn date_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.epoch, 0).single().unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.date_time().format("%Y-%m-%d %H:%M:%S"), self.filestamp)
    }
}

///
/// The `StartTime` found in one session statistics artifact
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatistics {
    pub filestamp: String,
    pub start_time: i64,
}

pub fn data_dir(backup_dir: &Path) -> PathBuf {
    backup_dir.join(DATA_DIR_NAME)
}

pub fn statistics_path(data_dir: &Path, filestamp: &str) -> PathBuf {
    data_dir.join(format!("{STATISTICS_PREFIX}{filestamp}{STATISTICS_SUFFIX}"))
}

///
/// Parses the backup tool's parsable listing output into epoch seconds,
/// newest first. Fails only if the listing reports a failed previous backup.
///
pub fn parse_listing<S: AsRef<str>>(lines: &[S]) -> Result<Vec<i64>> {
    let mut epochs = Vec::new();
    for line in lines.iter().map(|l| l.as_ref().trim()) {
        if line.is_empty() {
            continue;
        }
        if is_failed_backup_notice(line) {
            return Err(Error::CorruptedBackup(line.to_string()));
        }
        let epoch = line.split_whitespace().next().and_then(|t| t.parse::<i64>().ok());
        match epoch {
            Some(epoch) => epochs.push(epoch),
            None => warn!(line, "skipping malformed listing line"),
        }
    }

    epochs.sort_unstable_by(|a, b| b.cmp(a));
    Ok(epochs)
}

fn is_failed_backup_notice(line: &str) -> bool {
    let line = line.to_lowercase();
    match line.find("previous backup") {
        Some(idx) => line[idx..].contains("failed"),
        None => false,
    }
}

///
/// Reads the `StartTime` of every session statistics artifact in `data_dir`,
/// ordered by file name. Artifacts that cannot be read or parsed are skipped,
/// and a missing `data_dir` yields none.
///
pub async fn read_statistics(data_dir: &Path) -> Result<Vec<SessionStatistics>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(data_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(?data_dir, "backup data directory does not exist");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(filestamp) = name
            .strip_prefix(STATISTICS_PREFIX)
            .and_then(|n| n.strip_suffix(STATISTICS_SUFFIX))
        {
            names.push(filestamp.to_string());
        }
    }
    names.sort();

    let mut stats = Vec::with_capacity(names.len());
    for filestamp in names {
        let path = statistics_path(data_dir, &filestamp);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) => {
                warn!(?path, %err, "skipping unreadable statistics artifact");
                continue;
            }
        };
        match parse_start_time(&contents) {
            Some(start_time) => stats.push(SessionStatistics { filestamp, start_time }),
            None => warn!(?path, "statistics artifact has no usable StartTime"),
        }
    }

    Ok(stats)
}

///
/// Extracts the integer part of the `StartTime <epoch>.<fraction>` line
///
pub fn parse_start_time(contents: &str) -> Option<i64> {
    let value = find_value(contents, "StartTime")?;
    value.split('.').next()?.parse().ok()
}

fn find_value<'a>(contents: &'a str, key: &str) -> Option<&'a str> {
    contents.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some(k) if k == key => tokens.next(),
            _ => None,
        }
    })
}

///
/// Pairs every raw epoch with the filestamp of the statistics artifact whose
/// truncated `StartTime` matches it. Epochs without a match cannot be synced
/// and are dropped.
///
pub fn match_timestamps(raw: &[i64], stats: &[SessionStatistics]) -> Vec<Timestamp> {
    raw.iter()
        .filter_map(|&epoch| {
            let found = stats.iter().find(|s| s.start_time == epoch);
            if found.is_none() {
                warn!(epoch, "no statistics artifact matches timestamp, dropping it");
            }
            found.map(|s| Timestamp::new(epoch, s.filestamp.clone()))
        })
        .collect()
}

///
/// Discovers the retained timestamps of the backup at `backup_dir`, newest
/// first. The first entry, if any, is the mirror.
///
pub async fn discover<S: AsRef<str>>(backup_dir: &Path, listing: &[S]) -> Result<Vec<Timestamp>> {
    let raw = parse_listing(listing)?;
    let stats = read_statistics(&data_dir(backup_dir)).await?;
    let timestamps = match_timestamps(&raw, &stats);
    debug!(raw = raw.len(), matched = timestamps.len(), "discovered timestamps");

    Ok(timestamps)
}

///
/// Reads a numeric `key value` statistic from the artifact at `path`.
/// Fractional values are truncated.
///
pub async fn read_statistic(path: &Path, key: &str) -> Result<Option<u64>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(find_value(&contents, key)
        .and_then(|v| v.split('.').next())
        .and_then(|v| v.parse().ok()))
}
