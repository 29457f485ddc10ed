// In-memory repository backed by a JSON snapshot and an append-only change journal
use crate::application::errors::StorageError;
use crate::application::power_repository::{PowerRepository, RecordedReading, RollupCommit};
use crate::domain::device::{Device, DeviceStatus};
use crate::domain::power::{
    DaySummary, HourSummary, Resolution, RollupInput, RollupLevel, Sample, Summary, WeekSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const DEFAULT_COMPACT_AFTER: usize = 1024;

/// Logical tables. Every per-device vector is kept sorted oldest first so the
/// oldest N units are always a prefix.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Tables {
    /// Sequence number of the last journal entry folded into these tables.
    applied_seq: u64,
    next_id: u64,
    devices: BTreeMap<String, Device>,
    samples: BTreeMap<String, Vec<Sample>>,
    hour_summaries: BTreeMap<String, Vec<HourSummary>>,
    day_summaries: BTreeMap<String, Vec<DaySummary>>,
    week_summaries: BTreeMap<String, Vec<WeekSummary>>,
    hour_history: BTreeMap<String, Vec<HourSummary>>,
}

/// One committed transaction. Validated before it is written, so applying it
/// cannot fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Change {
    Device {
        device: Device,
    },
    Reading {
        sample: Sample,
        status: DeviceStatus,
    },
    Rollup {
        device_id: String,
        level: RollupLevel,
        summary: Summary,
        consumed: Vec<u64>,
        purged: Vec<u64>,
    },
    Purge {
        device_id: String,
        ids: Vec<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    seq: u64,
    change: Change,
}

impl Tables {
    fn ensure_device(&mut self, device_id: &str) -> &mut Device {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| Device::new(device_id.to_string()))
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry.change {
            Change::Device { device } => {
                self.devices.insert(device.device_id.clone(), device);
            }
            Change::Reading { sample, status } => {
                self.next_id = self.next_id.max(sample.id);
                self.ensure_device(&sample.device_id).status = status;
                insert_sorted(
                    self.samples.entry(sample.device_id.clone()).or_default(),
                    sample,
                    |s| (s.timestamp, s.id),
                );
            }
            Change::Rollup {
                device_id,
                level,
                summary,
                consumed,
                purged,
            } => {
                let consumed: HashSet<u64> = consumed.into_iter().collect();
                match level {
                    RollupLevel::MinuteToHour => {}
                    RollupLevel::HourToDay => {
                        if let Some(hours) = self.hour_summaries.get_mut(&device_id) {
                            hours.retain(|h| !consumed.contains(&h.id));
                        }
                    }
                    RollupLevel::DayToWeek => {
                        if let Some(days) = self.day_summaries.get_mut(&device_id) {
                            days.retain(|d| !consumed.contains(&d.id));
                        }
                    }
                }
                let mut dropped_samples: HashSet<u64> = purged.into_iter().collect();
                if level == RollupLevel::MinuteToHour {
                    dropped_samples.extend(consumed);
                }
                if let Some(samples) = self.samples.get_mut(&device_id) {
                    samples.retain(|s| !dropped_samples.contains(&s.id));
                }

                self.next_id = self.next_id.max(summary.id());
                self.insert_summary(&device_id, summary);
            }
            Change::Purge { device_id, ids } => {
                let ids: HashSet<u64> = ids.into_iter().collect();
                if let Some(samples) = self.samples.get_mut(&device_id) {
                    samples.retain(|s| !ids.contains(&s.id));
                }
            }
        }
        self.applied_seq = entry.seq;
    }

    fn insert_summary(&mut self, device_id: &str, summary: Summary) {
        match summary {
            Summary::Hour(hour) => {
                insert_sorted(
                    self.hour_history.entry(device_id.to_string()).or_default(),
                    hour.clone(),
                    |h| (h.window_start, h.id),
                );
                insert_sorted(
                    self.hour_summaries.entry(device_id.to_string()).or_default(),
                    hour,
                    |h| (h.window_start, h.id),
                );
            }
            Summary::Day(day) => insert_sorted(
                self.day_summaries.entry(device_id.to_string()).or_default(),
                day,
                |d| (d.date, d.id),
            ),
            Summary::Week(week) => insert_sorted(
                self.week_summaries.entry(device_id.to_string()).or_default(),
                week,
                |w| (w.week_start, w.id),
            ),
            Summary::Minute(_) => {}
        }
    }

    fn input_ids(&self, device_id: &str, level: RollupLevel) -> HashSet<u64> {
        match level {
            RollupLevel::MinuteToHour => ids_of(self.samples.get(device_id), |s| s.id),
            RollupLevel::HourToDay => ids_of(self.hour_summaries.get(device_id), |h| h.id),
            RollupLevel::DayToWeek => ids_of(self.day_summaries.get(device_id), |d| d.id),
        }
    }
}

fn ids_of<T>(rows: Option<&Vec<T>>, id_of: impl Fn(&T) -> u64) -> HashSet<u64> {
    rows.map(|rows| rows.iter().map(id_of).collect())
        .unwrap_or_default()
}

fn ensure_present(
    present: &HashSet<u64>,
    ids: &[u64],
    table: &'static str,
) -> Result<(), StorageError> {
    match ids.iter().find(|id| !present.contains(id)) {
        Some(&id) => Err(StorageError::MissingRecord { table, id }),
        None => Ok(()),
    }
}

fn level_table(level: RollupLevel) -> &'static str {
    match level {
        RollupLevel::MinuteToHour => "samples",
        RollupLevel::HourToDay => "hour_summaries",
        RollupLevel::DayToWeek => "day_summaries",
    }
}

fn insert_sorted<T, K: Ord>(rows: &mut Vec<T>, row: T, key: impl Fn(&T) -> K) {
    let k = key(&row);
    let idx = rows.partition_point(|r| key(r) <= k);
    rows.insert(idx, row);
}

#[derive(Debug)]
struct StorePaths {
    snapshot: PathBuf,
    journal: PathBuf,
}

impl StorePaths {
    fn new(snapshot: PathBuf) -> Self {
        let journal = snapshot.with_extension("journal");
        Self { snapshot, journal }
    }
}

#[derive(Debug, Default)]
struct Store {
    tables: Tables,
    /// Length of the journal's valid prefix.
    journal_len: u64,
    since_compaction: usize,
}

#[derive(Debug)]
pub struct SnapshotRepository {
    store: Mutex<Store>,
    paths: Option<StorePaths>,
    compact_after: usize,
}

impl SnapshotRepository {
    /// Volatile store, used for tests and when no snapshot path is configured.
    pub fn in_memory() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            paths: None,
            compact_after: DEFAULT_COMPACT_AFTER,
        }
    }

    /// Opens a durable store: loads the snapshot, then replays journal entries
    /// newer than it. A torn or unreadable journal tail is cut off.
    pub async fn open(
        path: impl AsRef<Path>,
        compact_after: usize,
    ) -> Result<Self, StorageError> {
        let paths = StorePaths::new(path.as_ref().to_path_buf());
        if let Some(parent) = paths.snapshot.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tables: Tables = match tokio::fs::read(&paths.snapshot).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };

        let replay = read_journal(&paths.journal).await?;
        let mut replayed = 0;
        for entry in replay.entries {
            // Entries at or below the snapshot's sequence were compacted already
            if entry.seq > tables.applied_seq {
                tables.apply(entry);
                replayed += 1;
            }
        }
        if replay.valid_len < replay.file_len {
            tracing::warn!(
                path = %paths.journal.display(),
                dropped_bytes = replay.file_len - replay.valid_len,
                "Discarding torn journal tail"
            );
            let file = OpenOptions::new().write(true).open(&paths.journal).await?;
            file.set_len(replay.valid_len).await?;
        }
        tracing::info!(
            path = %paths.snapshot.display(),
            replayed,
            "Opened power snapshot store"
        );

        Ok(Self {
            store: Mutex::new(Store {
                tables,
                journal_len: replay.valid_len,
                since_compaction: replayed,
            }),
            paths: Some(paths),
            compact_after: compact_after.max(1),
        })
    }

    /// Makes `change` durable, then applies it. A failed journal write leaves
    /// the visible state unchanged.
    async fn commit(&self, store: &mut Store, change: Change) -> Result<(), StorageError> {
        let entry = JournalEntry {
            seq: store.tables.applied_seq + 1,
            change,
        };
        let Some(paths) = &self.paths else {
            store.tables.apply(entry);
            return Ok(());
        };

        append_entry(&paths.journal, &mut store.journal_len, &entry).await?;
        store.tables.apply(entry);

        store.since_compaction += 1;
        if store.since_compaction >= self.compact_after {
            match compact(paths, store).await {
                Ok(()) => {
                    tracing::debug!(seq = store.tables.applied_seq, "Compacted power journal");
                    store.since_compaction = 0;
                }
                // The journal still holds every entry; compaction is retried on the next write
                Err(e) => tracing::warn!(error = %e, "Journal compaction failed"),
            }
        }
        Ok(())
    }
}

async fn append_entry(
    path: &Path,
    journal_len: &mut u64,
    entry: &JournalEntry,
) -> Result<(), StorageError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let written = async {
        file.write_all(&line).await?;
        file.sync_data().await
    }
    .await;
    if let Err(e) = written {
        // Cut any partial line so the next entry starts clean
        let _ = file.set_len(*journal_len).await;
        return Err(e.into());
    }

    *journal_len += line.len() as u64;
    Ok(())
}

struct Replay {
    entries: Vec<JournalEntry>,
    valid_len: u64,
    file_len: u64,
}

async fn read_journal(path: &Path) -> Result<Replay, StorageError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    let mut valid_len = 0usize;
    for line in bytes.split_inclusive(|b| *b == b'\n') {
        let Some(body) = line.strip_suffix(b"\n") else {
            break;
        };
        match serde_json::from_slice::<JournalEntry>(body) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        valid_len += line.len();
    }

    Ok(Replay {
        entries,
        valid_len: valid_len as u64,
        file_len: bytes.len() as u64,
    })
}

/// Folds the journal into a fresh snapshot. The snapshot lands first, so a
/// crash before truncation only leaves entries that replay will skip.
async fn compact(paths: &StorePaths, store: &mut Store) -> Result<(), StorageError> {
    write_snapshot(&paths.snapshot, &store.tables).await?;
    let file = OpenOptions::new().write(true).open(&paths.journal).await?;
    file.set_len(0).await?;
    store.journal_len = 0;
    Ok(())
}

async fn write_snapshot(path: &Path, tables: &Tables) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(tables)?;
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, bytes).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

#[async_trait]
impl PowerRepository for SnapshotRepository {
    async fn register_device(&self, device_id: &str) -> Result<Device, StorageError> {
        let mut store = self.store.lock().await;
        if let Some(device) = store.tables.devices.get(device_id) {
            return Ok(device.clone());
        }
        let device = Device::new(device_id.to_string());
        self.commit(
            &mut store,
            Change::Device {
                device: device.clone(),
            },
        )
        .await?;
        Ok(device)
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StorageError> {
        let store = self.store.lock().await;
        Ok(store.tables.devices.values().cloned().collect())
    }

    async fn record_reading(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        power_watts: f64,
        status: DeviceStatus,
    ) -> Result<RecordedReading, StorageError> {
        let mut store = self.store.lock().await;
        let previous = store
            .tables
            .devices
            .get(device_id)
            .map_or(DeviceStatus::Off, |d| d.status);
        let sample = Sample {
            id: store.tables.next_id + 1,
            device_id: device_id.to_string(),
            timestamp,
            power_watts,
        };

        self.commit(
            &mut store,
            Change::Reading {
                sample: sample.clone(),
                status,
            },
        )
        .await?;
        Ok(RecordedReading {
            sample,
            status_changed: previous != status,
        })
    }

    async fn pending_inputs(
        &self,
        device_id: &str,
        level: RollupLevel,
    ) -> Result<Vec<RollupInput>, StorageError> {
        let store = self.store.lock().await;
        let tables = &store.tables;
        let inputs = match level {
            RollupLevel::MinuteToHour => tables
                .samples
                .get(device_id)
                .map(|rows| rows.iter().map(RollupInput::from).collect()),
            RollupLevel::HourToDay => tables
                .hour_summaries
                .get(device_id)
                .map(|rows| rows.iter().map(RollupInput::from).collect()),
            RollupLevel::DayToWeek => tables
                .day_summaries
                .get(device_id)
                .map(|rows| rows.iter().map(RollupInput::from).collect()),
        };
        Ok(inputs.unwrap_or_default())
    }

    async fn commit_rollup(&self, commit: RollupCommit) -> Result<Summary, StorageError> {
        let mut store = self.store.lock().await;
        let tables = &store.tables;

        let inputs = tables.input_ids(&commit.device_id, commit.level);
        ensure_present(&inputs, &commit.consumed, level_table(commit.level))?;
        if !commit.purged.is_empty() {
            let samples = tables.input_ids(&commit.device_id, RollupLevel::MinuteToHour);
            ensure_present(&samples, &commit.purged, "samples")?;
        }

        let summary = commit
            .record
            .into_summary(tables.next_id + 1, &commit.device_id);
        self.commit(
            &mut store,
            Change::Rollup {
                device_id: commit.device_id,
                level: commit.level,
                summary: summary.clone(),
                consumed: commit.consumed,
                purged: commit.purged,
            },
        )
        .await?;
        Ok(summary)
    }

    async fn purge_samples(&self, device_id: &str, ids: &[u64]) -> Result<usize, StorageError> {
        let mut store = self.store.lock().await;
        let present = store.tables.input_ids(device_id, RollupLevel::MinuteToHour);
        let ids: Vec<u64> = ids.iter().copied().filter(|id| present.contains(id)).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = ids.len();
        self.commit(
            &mut store,
            Change::Purge {
                device_id: device_id.to_string(),
                ids,
            },
        )
        .await?;
        Ok(removed)
    }

    async fn latest(
        &self,
        device_id: &str,
        resolution: Resolution,
    ) -> Result<Option<Summary>, StorageError> {
        let store = self.store.lock().await;
        let tables = &store.tables;
        let latest = match resolution {
            Resolution::Minute => tables
                .samples
                .get(device_id)
                .and_then(|rows| rows.last())
                .cloned()
                .map(Summary::Minute),
            Resolution::Hour => tables
                .hour_summaries
                .get(device_id)
                .and_then(|rows| rows.last())
                // Aggregated hours are deleted; fall back to the permanent log
                .or_else(|| tables.hour_history.get(device_id).and_then(|rows| rows.last()))
                .cloned()
                .map(Summary::Hour),
            Resolution::Day => tables
                .day_summaries
                .get(device_id)
                .and_then(|rows| rows.last())
                .cloned()
                .map(Summary::Day),
            Resolution::Week => tables
                .week_summaries
                .get(device_id)
                .and_then(|rows| rows.last())
                .cloned()
                .map(Summary::Week),
        };
        Ok(latest)
    }

    async fn hour_history(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<HourSummary>, StorageError> {
        let store = self.store.lock().await;
        let rows = store
            .tables
            .hour_history
            .get(device_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let skip = rows.len().saturating_sub(limit);
        Ok(rows[skip..].to_vec())
    }
}
