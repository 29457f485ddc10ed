// Report service - Read-only queries for dashboards
use crate::application::errors::StorageError;
use crate::application::power_repository::PowerRepository;
use crate::domain::device::Device;
use crate::domain::power::{HourSummary, Resolution, Summary};
use std::sync::Arc;

const MAX_HISTORY_ENTRIES: usize = 24 * 31;

#[derive(Clone)]
pub struct ReportService {
    repository: Arc<dyn PowerRepository>,
}

impl ReportService {
    pub fn new(repository: Arc<dyn PowerRepository>) -> Self {
        Self { repository }
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, StorageError> {
        self.repository.list_devices().await
    }

    pub async fn latest(
        &self,
        device_id: &str,
        resolution: Resolution,
    ) -> Result<Option<Summary>, StorageError> {
        self.repository.latest(device_id, resolution).await
    }

    /// Permanent hourly log, capped to one month of entries.
    pub async fn hour_history(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<HourSummary>, StorageError> {
        self.repository
            .hour_history(device_id, limit.min(MAX_HISTORY_ENTRIES))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device::DeviceStatus;
    use crate::infrastructure::snapshot_repository::SnapshotRepository;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_latest_minute_is_newest_sample() {
        let repo = Arc::new(SnapshotRepository::in_memory());
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
        repo.record_reading("plug", t0, 1.0, DeviceStatus::On)
            .await
            .unwrap();
        repo.record_reading("plug", t0 + chrono::Duration::minutes(1), 2.0, DeviceStatus::On)
            .await
            .unwrap();

        let service = ReportService::new(repo);
        let latest = service.latest("plug", Resolution::Minute).await.unwrap();

        assert_eq!(latest.map(|s| s.average_power_watts()), Some(2.0));
        assert!(service.latest("plug", Resolution::Week).await.unwrap().is_none());
        assert!(service.latest("missing", Resolution::Hour).await.unwrap().is_none());
    }
}
