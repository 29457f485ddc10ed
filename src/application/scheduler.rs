// Tick scheduler - Drives collection and cascading roll-ups once per minute
use crate::application::aggregator::WindowAggregator;
use crate::application::power_repository::PowerRepository;
use crate::application::telemetry_source::TelemetryCollector;
use crate::domain::power::RollupLevel;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Phases a device walks through within one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    Idle,
    AggregateMinute,
    AggregateHour,
    AggregateDay,
    AggregateWeek,
}

impl TickPhase {
    pub fn next(self) -> TickPhase {
        match self {
            TickPhase::Idle => TickPhase::AggregateMinute,
            TickPhase::AggregateMinute => TickPhase::AggregateHour,
            TickPhase::AggregateHour => TickPhase::AggregateDay,
            TickPhase::AggregateDay => TickPhase::AggregateWeek,
            TickPhase::AggregateWeek => TickPhase::Idle,
        }
    }

    /// The roll-up that produces this phase's resolution. The minute phase
    /// only collects raw samples.
    pub fn level(self) -> Option<RollupLevel> {
        match self {
            TickPhase::AggregateHour => Some(RollupLevel::MinuteToHour),
            TickPhase::AggregateDay => Some(RollupLevel::HourToDay),
            TickPhase::AggregateWeek => Some(RollupLevel::DayToWeek),
            TickPhase::Idle | TickPhase::AggregateMinute => None,
        }
    }
}

/// Fires once per wall-clock minute, however often it is polled.
#[derive(Debug, Default)]
pub struct MinuteClock {
    last_minute: Option<DateTime<Utc>>,
}

impl MinuteClock {
    /// Returns the minute bucket when `now` falls into a minute not seen before.
    pub fn observe(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let minute = now.duration_trunc(TimeDelta::minutes(1)).ok()?;
        if self.last_minute.is_some_and(|last| minute <= last) {
            return None;
        }
        self.last_minute = Some(minute);
        Some(minute)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub hour_summaries: usize,
    pub day_summaries: usize,
    pub week_summaries: usize,
    pub failed_passes: usize,
}

impl TickReport {
    fn record(&mut self, level: RollupLevel, produced: usize) {
        match level {
            RollupLevel::MinuteToHour => self.hour_summaries += produced,
            RollupLevel::HourToDay => self.day_summaries += produced,
            RollupLevel::DayToWeek => self.week_summaries += produced,
        }
    }

    fn merge(&mut self, other: TickReport) {
        self.hour_summaries += other.hour_summaries;
        self.day_summaries += other.day_summaries;
        self.week_summaries += other.week_summaries;
        self.failed_passes += other.failed_passes;
    }
}

pub struct TickScheduler {
    repository: Arc<dyn PowerRepository>,
    aggregator: WindowAggregator,
    collector: Option<TelemetryCollector>,
    clock: MinuteClock,
    /// Device/level passes that failed and must run again regardless of cascade.
    retry: HashSet<(String, RollupLevel)>,
    /// Devices whose every level has been walked once since startup. Until
    /// then the store may hold full batches left over from a previous run.
    swept: HashSet<String>,
}

impl TickScheduler {
    pub fn new(repository: Arc<dyn PowerRepository>, collector: Option<TelemetryCollector>) -> Self {
        Self {
            aggregator: WindowAggregator::new(repository.clone()),
            repository,
            collector,
            clock: MinuteClock::default(),
            retry: HashSet::new(),
            swept: HashSet::new(),
        }
    }

    /// Runs one tick for the minute bucket `minute`. Never fails: per-device,
    /// per-level errors are logged and queued for retry.
    pub async fn tick(&mut self, minute: DateTime<Utc>) -> TickReport {
        if let Some(collector) = &self.collector {
            collector.collect(minute).await;
        }

        let devices = match self.repository.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(error = %e, "Could not list devices, skipping tick");
                return TickReport {
                    failed_passes: 1,
                    ..TickReport::default()
                };
            }
        };

        let retry = &self.retry;
        let swept = &self.swept;
        let aggregator = &self.aggregator;
        let passes = devices.iter().map(|device| {
            let full_sweep = !swept.contains(&device.device_id);
            cascade_device(aggregator, retry, device.device_id.as_str(), full_sweep)
        });
        let outcomes = join_all(passes).await;

        let mut report = TickReport::default();
        let mut next_retry = HashSet::new();
        for (device, (device_report, failed)) in devices.iter().zip(outcomes) {
            if failed.is_empty() && self.swept.insert(device.device_id.clone()) {
                tracing::debug!(device_id = %device.device_id, "Startup sweep complete");
            }
            report.merge(device_report);
            next_retry.extend(failed);
        }
        self.retry = next_retry;

        if report.hour_summaries + report.day_summaries + report.week_summaries > 0
            || report.failed_passes > 0
        {
            tracing::info!(
                %minute,
                hours = report.hour_summaries,
                days = report.day_summaries,
                weeks = report.week_summaries,
                failed = report.failed_passes,
                "Tick complete"
            );
        }
        report
    }

    /// Polls the wall clock every `poll_interval` and ticks on each new minute
    /// until `shutdown` resolves.
    pub async fn run(mut self, poll_interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(?poll_interval, "Scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(minute) = self.clock.observe(Utc::now()) {
                        self.tick(minute).await;
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

/// Walks one device through the aggregate phases in level order. A level
/// runs when the previous one produced something, when it is pending a retry,
/// or on a full sweep. The first failure ends the walk for this device.
async fn cascade_device(
    aggregator: &WindowAggregator,
    retry: &HashSet<(String, RollupLevel)>,
    device_id: &str,
    full_sweep: bool,
) -> (TickReport, Vec<(String, RollupLevel)>) {
    let mut report = TickReport::default();
    let mut failed = Vec::new();
    let mut phase = TickPhase::AggregateMinute.next();
    let mut upstream_produced = true;

    while let Some(level) = phase.level() {
        let pending_retry = retry.contains(&(device_id.to_string(), level));
        if !upstream_produced && !pending_retry && !full_sweep {
            phase = phase.next();
            continue;
        }

        match aggregator.roll_up(device_id, level).await {
            Ok(produced) => {
                report.record(level, produced.len());
                upstream_produced = !produced.is_empty();
            }
            Err(e) => {
                tracing::error!(device_id, %level, error = %e, "Roll-up pass failed");
                report.failed_passes += 1;
                failed.push((device_id.to_string(), level));
                // Earlier batches of this pass may have landed upstream of the next level
                if let Some(next) = level.next() {
                    failed.push((device_id.to_string(), next));
                }
                break;
            }
        }
        phase = phase.next();
    }

    // Keep retries for levels skipped after a failure
    for level in RollupLevel::ALL {
        let key = (device_id.to_string(), level);
        if retry.contains(&key) && !failed.contains(&key) && level_after(phase, level) {
            failed.push(key);
        }
    }

    (report, failed)
}

/// True when `level` belongs to `phase` or a later aggregate phase.
fn level_after(phase: TickPhase, level: RollupLevel) -> bool {
    let mut current = phase;
    while let Some(l) = current.level() {
        if l == level {
            return true;
        }
        current = current.next();
    }
    false
}
