// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod shelly_source;
pub mod snapshot_repository;
