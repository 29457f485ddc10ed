// Window aggregator - Fixed-size FIFO roll-up of one device at one level
use crate::application::errors::AggregationError;
use crate::application::power_repository::{PowerRepository, RollupCommit};
use crate::domain::power::{RollupInput, RollupLevel, RollupRecord, Summary};
use std::sync::Arc;

#[derive(Clone)]
pub struct WindowAggregator {
    repository: Arc<dyn PowerRepository>,
}

impl WindowAggregator {
    pub fn new(repository: Arc<dyn PowerRepository>) -> Self {
        Self { repository }
    }

    /// Drains every full batch of `level` inputs for `device_id`, oldest first.
    ///
    /// Returns the summaries created, possibly none. Each batch is committed in
    /// its own transaction, so a failure leaves earlier batches applied and the
    /// failing one untouched for the next tick.
    pub async fn roll_up(
        &self,
        device_id: &str,
        level: RollupLevel,
    ) -> Result<Vec<Summary>, AggregationError> {
        let snapshot = self.repository.pending_inputs(device_id, level).await?;
        let (candidates, mut garbage) = partition_inputs(level, snapshot);
        let batch_size = level.batch_size();

        tracing::debug!(
            device_id,
            %level,
            pending = candidates.len(),
            garbage = garbage.len(),
            "Starting roll-up pass"
        );

        let mut produced = Vec::new();
        for batch in candidates.chunks_exact(batch_size) {
            let record = plan_batch(device_id, level, batch)?;
            let commit = RollupCommit {
                device_id: device_id.to_string(),
                level,
                record,
                consumed: batch.iter().map(|u| u.id).collect(),
                purged: garbage.iter().map(|u| u.id).collect(),
            };
            let summary = self.repository.commit_rollup(commit).await?;
            garbage.clear();

            tracing::info!(
                device_id,
                %level,
                average_power_watts = summary.average_power_watts(),
                "Rolled up batch"
            );
            produced.push(summary);
        }

        if !garbage.is_empty() {
            let ids: Vec<u64> = garbage.iter().map(|u| u.id).collect();
            let purged = self.repository.purge_samples(device_id, &ids).await?;
            tracing::debug!(device_id, purged, "Purged zero-power samples");
        }

        Ok(produced)
    }
}

/// Splits the snapshot into roll-up candidates and garbage. Only the minute
/// level produces garbage: readings with no positive power draw.
fn partition_inputs(
    level: RollupLevel,
    snapshot: Vec<RollupInput>,
) -> (Vec<RollupInput>, Vec<RollupInput>) {
    if level.filters_zero_power() {
        snapshot.into_iter().partition(|u| u.value > 0.0)
    } else {
        (snapshot, Vec::new())
    }
}

/// Validates one batch and computes its summary record.
fn plan_batch(
    device_id: &str,
    level: RollupLevel,
    batch: &[RollupInput],
) -> Result<RollupRecord, AggregationError> {
    let violation = |detail: String| AggregationError::InvariantViolation {
        device_id: device_id.to_string(),
        level,
        detail,
    };

    if batch.len() != level.batch_size() {
        return Err(violation(format!(
            "batch holds {} units, expected {}",
            batch.len(),
            level.batch_size()
        )));
    }
    if let Some(pair) = batch.windows(2).find(|w| w[1].bucket < w[0].bucket) {
        return Err(violation(format!(
            "unit {} at {} precedes unit {} at {}",
            pair[1].id, pair[1].bucket, pair[0].id, pair[0].bucket
        )));
    }
    if let Some(unit) = batch.iter().find(|u| !u.value.is_finite()) {
        return Err(violation(format!("unit {} has non-finite value", unit.id)));
    }

    let mean = batch.iter().map(|u| u.value).sum::<f64>() / batch.len() as f64;
    Ok(level.record(batch[0].bucket, mean))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::errors::StorageError;
    use crate::application::power_repository::RecordedReading;
    use crate::domain::device::{Device, DeviceStatus};
    use crate::domain::power::{HourSummary, Resolution};
    use crate::infrastructure::snapshot_repository::SnapshotRepository;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minute)
    }

    async fn record(repo: &dyn PowerRepository, device_id: &str, minute: i64, watts: f64) -> u64 {
        let status = DeviceStatus::from_power(watts, 0.0);
        repo.record_reading(device_id, at(minute), watts, status)
            .await
            .unwrap()
            .sample
            .id
    }

    async fn seeded(values: &[f64]) -> (Arc<SnapshotRepository>, WindowAggregator) {
        let repo = Arc::new(SnapshotRepository::in_memory());
        for (minute, value) in values.iter().enumerate() {
            record(repo.as_ref(), "plug", minute as i64, *value).await;
        }
        let aggregator = WindowAggregator::new(repo.clone());
        (repo, aggregator)
    }

    async fn pending(repo: &SnapshotRepository, level: RollupLevel) -> usize {
        repo.pending_inputs("plug", level).await.unwrap().len()
    }

    /// Delegates to an in-memory store but fails the `fail_on`-th commit.
    struct FailOnCommit {
        inner: Arc<SnapshotRepository>,
        commits: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl PowerRepository for FailOnCommit {
        async fn register_device(&self, device_id: &str) -> Result<Device, StorageError> {
            self.inner.register_device(device_id).await
        }

        async fn list_devices(&self) -> Result<Vec<Device>, StorageError> {
            self.inner.list_devices().await
        }

        async fn record_reading(
            &self,
            device_id: &str,
            timestamp: DateTime<Utc>,
            power_watts: f64,
            status: DeviceStatus,
        ) -> Result<RecordedReading, StorageError> {
            self.inner
                .record_reading(device_id, timestamp, power_watts, status)
                .await
        }

        async fn pending_inputs(
            &self,
            device_id: &str,
            level: RollupLevel,
        ) -> Result<Vec<RollupInput>, StorageError> {
            self.inner.pending_inputs(device_id, level).await
        }

        async fn commit_rollup(&self, commit: RollupCommit) -> Result<Summary, StorageError> {
            if self.commits.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StorageError::Unavailable("disk full".to_string()));
            }
            self.inner.commit_rollup(commit).await
        }

        async fn purge_samples(&self, device_id: &str, ids: &[u64]) -> Result<usize, StorageError> {
            self.inner.purge_samples(device_id, ids).await
        }

        async fn latest(
            &self,
            device_id: &str,
            resolution: Resolution,
        ) -> Result<Option<Summary>, StorageError> {
            self.inner.latest(device_id, resolution).await
        }

        async fn hour_history(
            &self,
            device_id: &str,
            limit: usize,
        ) -> Result<Vec<HourSummary>, StorageError> {
            self.inner.hour_history(device_id, limit).await
        }
    }

    #[tokio::test]
    async fn test_partial_batch_is_a_no_op() {
        let (repo, aggregator) = seeded(&[5.0; 59]).await;

        let produced = aggregator
            .roll_up("plug", RollupLevel::MinuteToHour)
            .await
            .unwrap();

        assert!(produced.is_empty());
        assert_eq!(pending(&repo, RollupLevel::MinuteToHour).await, 59);
    }

    #[tokio::test]
    async fn test_backlog_is_drained_in_whole_batches() {
        let values: Vec<f64> = (1..=150).map(|v| v as f64).collect();
        let (repo, aggregator) = seeded(&values).await;

        let produced = aggregator
            .roll_up("plug", RollupLevel::MinuteToHour)
            .await
            .unwrap();

        // floor(150 / 60) summaries, 30 samples left over
        assert_eq!(produced.len(), 2);
        assert_eq!(pending(&repo, RollupLevel::MinuteToHour).await, 30);
        assert_eq!(pending(&repo, RollupLevel::HourToDay).await, 2);

        match (&produced[0], &produced[1]) {
            (Summary::Hour(first), Summary::Hour(second)) => {
                assert_eq!(first.window_start, at(0));
                assert_eq!(first.average_power_watts, 30.5);
                assert_eq!(second.window_start, at(60));
                assert_eq!(second.average_power_watts, 90.5);
            }
            other => panic!("expected hour summaries, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_readings_are_filtered_and_purged() {
        let mut values = vec![0.0; 10];
        values.extend(std::iter::repeat_n(5.0, 60));
        let (repo, aggregator) = seeded(&values).await;

        let produced = aggregator
            .roll_up("plug", RollupLevel::MinuteToHour)
            .await
            .unwrap();

        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].average_power_watts(), 5.0);
        match &produced[0] {
            Summary::Hour(hour) => assert_eq!(hour.window_start, at(10)),
            other => panic!("expected hour summary, got {:?}", other),
        }
        assert_eq!(pending(&repo, RollupLevel::MinuteToHour).await, 0);
    }

    #[tokio::test]
    async fn test_zero_readings_are_purged_without_full_batch() {
        let mut values = vec![0.0; 5];
        values.extend([7.0; 3]);
        let (repo, aggregator) = seeded(&values).await;

        let produced = aggregator
            .roll_up("plug", RollupLevel::MinuteToHour)
            .await
            .unwrap();

        assert!(produced.is_empty());
        let remaining = repo
            .pending_inputs("plug", RollupLevel::MinuteToHour)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|u| u.value > 0.0));
    }

    #[tokio::test]
    async fn test_zero_purge_only_touches_aggregated_device() {
        let repo = Arc::new(SnapshotRepository::in_memory());
        for minute in 0..3 {
            record(repo.as_ref(), "plug", minute, 0.0).await;
            record(repo.as_ref(), "kettle", minute, 0.0).await;
        }
        let aggregator = WindowAggregator::new(repo.clone());

        aggregator
            .roll_up("plug", RollupLevel::MinuteToHour)
            .await
            .unwrap();

        assert_eq!(pending(&repo, RollupLevel::MinuteToHour).await, 0);
        let other = repo
            .pending_inputs("kettle", RollupLevel::MinuteToHour)
            .await
            .unwrap();
        assert_eq!(other.len(), 3);
        assert!(other.iter().all(|u| u.value == 0.0));
    }

    #[tokio::test]
    async fn test_zeros_inside_batch_are_skipped_for_mean_and_window_start() {
        let mut values = vec![0.0];
        values.extend([2.0; 30]);
        values.extend([0.0; 4]);
        values.extend([4.0; 30]);
        let (repo, aggregator) = seeded(&values).await;

        let produced = aggregator
            .roll_up("plug", RollupLevel::MinuteToHour)
            .await
            .unwrap();

        assert_eq!(produced.len(), 1);
        match &produced[0] {
            Summary::Hour(hour) => {
                assert_eq!(hour.window_start, at(1));
                assert_eq!(hour.average_power_watts, 3.0);
            }
            other => panic!("expected hour summary, got {:?}", other),
        }
        assert_eq!(pending(&repo, RollupLevel::MinuteToHour).await, 0);
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_earlier_batches_and_its_own_inputs() {
        let inner = Arc::new(SnapshotRepository::in_memory());
        for minute in 0..180 {
            record(inner.as_ref(), "plug", minute, 6.0).await;
        }
        let flaky = Arc::new(FailOnCommit {
            inner: inner.clone(),
            commits: AtomicUsize::new(0),
            fail_on: 2,
        });

        let result = WindowAggregator::new(flaky)
            .roll_up("plug", RollupLevel::MinuteToHour)
            .await;

        assert!(matches!(result, Err(AggregationError::TransientStorage(_))));
        assert_eq!(pending(&inner, RollupLevel::HourToDay).await, 1);
        let remaining = inner
            .pending_inputs("plug", RollupLevel::MinuteToHour)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 120);
        assert_eq!(remaining[0].bucket, at(60));

        let resumed = WindowAggregator::new(inner.clone())
            .roll_up("plug", RollupLevel::MinuteToHour)
            .await
            .unwrap();
        assert_eq!(resumed.len(), 2);
        assert_eq!(pending(&inner, RollupLevel::MinuteToHour).await, 0);
        assert_eq!(pending(&inner, RollupLevel::HourToDay).await, 3);
    }

    #[tokio::test]
    async fn test_upper_levels_keep_zero_averages() {
        let repo = Arc::new(SnapshotRepository::in_memory());
        let aggregator = WindowAggregator::new(repo.clone());
        for hour in 0..24 {
            let sample_id = record(repo.as_ref(), "plug", hour * 60, 1.0).await;
            let value = if hour < 12 { 0.0 } else { 2.0 };
            repo.commit_rollup(RollupCommit {
                device_id: "plug".to_string(),
                level: RollupLevel::MinuteToHour,
                record: RollupLevel::MinuteToHour.record(at(hour * 60), value),
                consumed: vec![sample_id],
                purged: vec![],
            })
            .await
            .unwrap();
        }

        let produced = aggregator
            .roll_up("plug", RollupLevel::HourToDay)
            .await
            .unwrap();

        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].average_power_watts(), 1.0);
        assert_eq!(produced[0].resolution(), Resolution::Day);
        assert_eq!(pending(&repo, RollupLevel::HourToDay).await, 0);
    }

    #[test]
    fn test_unordered_batch_is_rejected() {
        let mut batch: Vec<RollupInput> = (0..7)
            .map(|d| RollupInput::new(d as u64, at(d * 1440), 1.0))
            .collect();
        batch.swap(2, 3);

        let result = plan_batch("plug", RollupLevel::DayToWeek, &batch);
        assert!(matches!(
            result,
            Err(AggregationError::InvariantViolation { .. })
        ));
    }

    #[test]
    fn test_short_batch_is_rejected() {
        let batch: Vec<RollupInput> = (0..6)
            .map(|d| RollupInput::new(d as u64, at(d * 1440), 1.0))
            .collect();

        let result = plan_batch("plug", RollupLevel::DayToWeek, &batch);
        assert!(matches!(
            result,
            Err(AggregationError::InvariantViolation { .. })
        ));
    }
}
