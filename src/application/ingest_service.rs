// Ingest service - Stores raw samples together with the device status they imply
use crate::application::errors::IngestError;
use crate::application::power_repository::PowerRepository;
use crate::domain::device::DeviceStatus;
use crate::domain::power::Sample;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct IngestService {
    repository: Arc<dyn PowerRepository>,
    status_threshold_watts: f64,
}

impl IngestService {
    pub fn new(repository: Arc<dyn PowerRepository>, status_threshold_watts: f64) -> Self {
        Self {
            repository,
            status_threshold_watts,
        }
    }

    /// Stores one reading. Duplicate timestamps are kept as separate samples
    /// and get averaged like any other reading.
    pub async fn ingest(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        power_watts: f64,
    ) -> Result<Sample, IngestError> {
        if device_id.is_empty() || !power_watts.is_finite() || power_watts < 0.0 {
            tracing::warn!(device_id, power_watts, "Rejected reading");
            return Err(IngestError::InvalidReading {
                device_id: device_id.to_string(),
                power_watts,
            });
        }

        let status = DeviceStatus::from_power(power_watts, self.status_threshold_watts);
        let recorded = self
            .repository
            .record_reading(device_id, timestamp, power_watts, status)
            .await?;
        if recorded.status_changed {
            tracing::info!(device_id, ?status, "Device status changed");
        }

        Ok(recorded.sample)
    }
}
