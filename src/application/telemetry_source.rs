// Telemetry source trait and the collector that drains it into the sample store
use crate::application::errors::TelemetryError;
use crate::application::ingest_service::IngestService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Devices this source can be asked about.
    fn device_ids(&self) -> Vec<String>;

    /// Current power draw of one device in watts.
    async fn read_power(&self, device_id: &str) -> Result<f64, TelemetryError>;
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CollectReport {
    pub collected: usize,
    pub missed: usize,
}

#[derive(Clone)]
pub struct TelemetryCollector {
    source: Arc<dyn TelemetrySource>,
    ingest: IngestService,
}

impl TelemetryCollector {
    pub fn new(source: Arc<dyn TelemetrySource>, ingest: IngestService) -> Self {
        Self { source, ingest }
    }

    /// Reads every device once and stores the readings under `minute`.
    /// An unreachable device only means no sample for it this tick.
    pub async fn collect(&self, minute: DateTime<Utc>) -> CollectReport {
        let reads = self.source.device_ids().into_iter().map(|device_id| async move {
            let reading = self.source.read_power(&device_id).await;
            (device_id, reading)
        });

        let mut report = CollectReport::default();
        for (device_id, reading) in join_all(reads).await {
            let power_watts = match reading {
                Ok(watts) => watts,
                Err(e) => {
                    tracing::warn!(device_id = %device_id, error = %e, "No sample this tick");
                    report.missed += 1;
                    continue;
                }
            };

            match self.ingest.ingest(&device_id, minute, power_watts).await {
                Ok(_) => report.collected += 1,
                Err(e) => {
                    tracing::error!(device_id = %device_id, error = %e, "Failed to store sample");
                    report.missed += 1;
                }
            }
        }

        tracing::debug!(
            collected = report.collected,
            missed = report.missed,
            "Collected telemetry"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::power_repository::PowerRepository;
    use crate::domain::power::{Resolution, RollupLevel};
    use crate::infrastructure::snapshot_repository::SnapshotRepository;
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct FixedSource {
        readings: HashMap<String, Option<f64>>,
    }

    #[async_trait]
    impl TelemetrySource for FixedSource {
        fn device_ids(&self) -> Vec<String> {
            let mut ids: Vec<String> = self.readings.keys().cloned().collect();
            ids.sort();
            ids
        }

        async fn read_power(&self, device_id: &str) -> Result<f64, TelemetryError> {
            self.readings
                .get(device_id)
                .copied()
                .flatten()
                .ok_or_else(|| TelemetryError::Unreachable {
                    device_id: device_id.to_string(),
                    reason: "offline".to_string(),
                })
        }
    }

    #[tokio::test]
    async fn test_unreachable_device_does_not_block_others() {
        let repo = Arc::new(SnapshotRepository::in_memory());
        let source = FixedSource {
            readings: HashMap::from([
                ("fridge".to_string(), Some(120.0)),
                ("tv".to_string(), None),
            ]),
        };
        let collector = TelemetryCollector::new(
            Arc::new(source),
            IngestService::new(repo.clone(), 0.0),
        );
        let minute = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let report = collector.collect(minute).await;

        assert_eq!(report, CollectReport { collected: 1, missed: 1 });
        let latest = repo.latest("fridge", Resolution::Minute).await.unwrap();
        assert_eq!(latest.map(|s| s.average_power_watts()), Some(120.0));
        assert!(
            repo.pending_inputs("tv", RollupLevel::MinuteToHour)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
