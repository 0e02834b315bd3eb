use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::engine::BuiltinEngineFactory;
use crate::core::pipeline::{PipelineContext, PipelineError};

/// Application state shared by all handlers
pub struct AppState {
    pub config: ServerConfig,
    pub pipeline: Arc<PipelineContext>,
}

impl AppState {
    /// Start the synthesis pipeline with the engines named in `config`
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>, PipelineError> {
        let factory = Arc::new(BuiltinEngineFactory::new(config.engine.clone()));
        let pipeline = PipelineContext::start(config.pipeline_config(), factory).await?;
        Ok(Self::with_pipeline(config, Arc::new(pipeline)))
    }

    /// Wrap an already running pipeline
    pub fn with_pipeline(config: ServerConfig, pipeline: Arc<PipelineContext>) -> Arc<Self> {
        Arc::new(Self { config, pipeline })
    }
}
