// Repository trait for power consumption storage
use crate::application::errors::StorageError;
use crate::domain::device::{Device, DeviceStatus};
use crate::domain::power::{
    HourSummary, Resolution, RollupInput, RollupLevel, RollupRecord, Sample, Summary,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Everything one roll-up batch changes. Applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct RollupCommit {
    pub device_id: String,
    pub level: RollupLevel,
    pub record: RollupRecord,
    /// Inputs folded into `record`; deleted from the level's input table.
    pub consumed: Vec<u64>,
    /// Zero-power samples dropped alongside the batch (minute level only).
    pub purged: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedReading {
    pub sample: Sample,
    pub status_changed: bool,
}

#[async_trait]
pub trait PowerRepository: Send + Sync {
    /// Registers the device if unknown. Returns the stored device either way.
    async fn register_device(&self, device_id: &str) -> Result<Device, StorageError>;

    async fn list_devices(&self) -> Result<Vec<Device>, StorageError>;

    /// Appends one raw sample and stores the status it implies, in one
    /// transaction. `status_changed` is `true` only when the stored status moved.
    async fn record_reading(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        power_watts: f64,
        status: DeviceStatus,
    ) -> Result<RecordedReading, StorageError>;

    /// Consistent snapshot of the device's not-yet-aggregated units at `level`,
    /// oldest first.
    async fn pending_inputs(
        &self,
        device_id: &str,
        level: RollupLevel,
    ) -> Result<Vec<RollupInput>, StorageError>;

    /// Persists the summary and deletes consumed and purged inputs in one
    /// transaction. Fails without side effects if any referenced input is gone.
    async fn commit_rollup(&self, commit: RollupCommit) -> Result<Summary, StorageError>;

    /// Deletes the given samples in one transaction. Returns how many were removed.
    async fn purge_samples(&self, device_id: &str, ids: &[u64]) -> Result<usize, StorageError>;

    /// Most recent record at the requested resolution.
    async fn latest(
        &self,
        device_id: &str,
        resolution: Resolution,
    ) -> Result<Option<Summary>, StorageError>;

    /// Newest `limit` entries of the permanent hourly log, in ascending order.
    async fn hour_history(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<HourSummary>, StorageError>;
}
