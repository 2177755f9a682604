pub mod config;
pub mod observability;
pub mod pipeline;
pub mod pipeline_config;

use std::sync::Arc;

use config::Settings;
use observability::MetricsSink;
use pipeline::{AdapterSet, Pipeline};
use pipeline_config::PipelineConfig;

/// Build a pipeline with adapters and policies resolved from `settings`.
pub fn build_pipeline(settings: &Settings, metrics: Arc<dyn MetricsSink>) -> Pipeline {
    let config = PipelineConfig::from_settings(settings);
    tracing::info!(
        app = %settings.app_name,
        version = config::APP_VERSION,
        workers = config.worker_pool_size,
        max_pages = config.max_pages,
        deadline_secs = config.request_deadline.as_secs(),
        "Building inspection pipeline"
    );
    Pipeline::new(config, AdapterSet::from_settings(settings), metrics)
}
