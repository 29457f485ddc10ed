// Error taxonomy for the aggregation pipeline
use crate::domain::power::RollupLevel;
use thiserror::Error;

/// Failure talking to a store. Always treated as transient: the caller
/// aborts the current pass and retries on the next tick.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("record {id} not found in {table}")]
    MissingRecord { table: &'static str, id: u64 },

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("transient storage failure: {0}")]
    TransientStorage(#[from] StorageError),

    #[error("invariant violated while rolling up {level} for {device_id}: {detail}")]
    InvariantViolation {
        device_id: String,
        level: RollupLevel,
        detail: String,
    },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid reading for {device_id}: {power_watts} W")]
    InvalidReading { device_id: String, power_watts: f64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry source unreachable for {device_id}: {reason}")]
    Unreachable { device_id: String, reason: String },

    #[error("malformed telemetry payload: {0}")]
    Malformed(String),
}
