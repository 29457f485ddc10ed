// Application layer - Use cases and storage contracts
pub mod aggregator;
pub mod errors;
pub mod ingest_service;
pub mod power_repository;
pub mod report_service;
pub mod scheduler;
pub mod telemetry_source;
