// Application state for HTTP handlers
use crate::application::ingest_service::IngestService;
use crate::application::report_service::ReportService;

#[derive(Clone)]
pub struct AppState {
    pub ingest_service: IngestService,
    pub report_service: ReportService,
    pub mains_voltage: f64,
}
