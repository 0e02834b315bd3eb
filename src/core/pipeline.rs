//! Request pipeline
//!
//! [`PipelineContext`] is built once at startup and shared by reference. It
//! owns the segmenter, the backend pool, the resource watchdog and the
//! optional segment cache, and exposes the streaming and complete synthesis
//! entry points.
//!
//! ```text
//! text ──► TextSegmenter ──► segments ──► BackendPool (bounded fan-out)
//!                                               │
//!                      sink ◄── AudioChunks ◄── StreamAssembler (reorder)
//! ```

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::cache::{CacheConfig, CacheStats, SegmentCache};
use crate::core::engine::{EngineFactory, HardwareCapabilities, SynthesisError, VoiceSettings};
use crate::core::pool::{
    BackendPool, PoolConfig, PoolError, PoolHealth, PoolPhase, PoolStatus, RecycleOutcome,
    RoutingConfig, UtilizationSnapshot,
};
use crate::core::segmenter::{SegmentationError, Segmentation, SegmenterConfig, TextSegmenter};
use crate::core::stream::{
    AudioChunk, ChunkingConfig, StreamAssembler, StreamMode, StreamRequest,
};
use crate::core::watchdog::{
    MemoryProbe, RecycleReason, ResourceWatchdog, SysinfoProbe, WatchdogConfig, WatchdogStats,
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error("No synthesis backend is available")]
    BackendUnavailable,

    #[error("Pipeline is shut down")]
    Closed,

    #[error(transparent)]
    Synthesis(SynthesisError),

    #[error("Segment {index} failed: {source}")]
    SegmentFailed { index: usize, source: PoolError },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Output sink failed: {0}")]
    Sink(String),
}

impl From<PoolError> for PipelineError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::BackendUnavailable => PipelineError::BackendUnavailable,
            PoolError::Closed => PipelineError::Closed,
            PoolError::Synthesis(e) => PipelineError::Synthesis(e),
        }
    }
}

/// Settings for every pipeline component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub segmenter: SegmenterConfig,
    pub pool: PoolConfig,
    pub routing: RoutingConfig,
    pub watchdog: WatchdogConfig,
    pub chunking: ChunkingConfig,
    pub cache: CacheConfig,
}

/// Append-only, order-preserving destination for audio bytes
#[async_trait]
pub trait OutputSink: Send {
    async fn write(&mut self, bytes: Bytes) -> Result<(), PipelineError>;
}

#[async_trait]
impl OutputSink for Vec<u8> {
    async fn write(&mut self, bytes: Bytes) -> Result<(), PipelineError> {
        self.extend_from_slice(&bytes);
        Ok(())
    }
}

#[async_trait]
impl OutputSink for mpsc::Sender<Bytes> {
    async fn write(&mut self, bytes: Bytes) -> Result<(), PipelineError> {
        self.send(bytes)
            .await
            .map_err(|_| PipelineError::Sink("receiver dropped".to_string()))
    }
}

/// A stream that has been segmented and admitted but not yet polled
pub struct PreparedStream {
    pub request_id: String,
    pub segment_count: usize,
    pub chunks: BoxStream<'static, Result<AudioChunk, PipelineError>>,
}

/// Result of [`PipelineContext::synthesize_complete`]
#[derive(Debug, Clone)]
pub struct CompleteAudio {
    /// Mono PCM16LE
    pub pcm: Bytes,
    pub sample_rate: u32,
    pub segment_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkSummary {
    pub request_id: String,
    pub segment_count: usize,
    pub chunks: usize,
    pub bytes: usize,
    pub cancelled: bool,
}

pub struct PipelineContext {
    segmenter: TextSegmenter,
    pool: Arc<BackendPool>,
    watchdog: Arc<ResourceWatchdog>,
    assembler: StreamAssembler,
    cache: Option<Arc<SegmentCache>>,
}

impl PipelineContext {
    /// Detect host capabilities, build the pool and start the watchdog
    pub async fn start(
        config: PipelineConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, PipelineError> {
        let capabilities = HardwareCapabilities::detect(&config.pool);
        Self::with_parts(config, factory, capabilities, Arc::new(SysinfoProbe::new())).await
    }

    /// Build with explicit capabilities and memory probe
    pub async fn with_parts(
        config: PipelineConfig,
        factory: Arc<dyn EngineFactory>,
        capabilities: HardwareCapabilities,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self, PipelineError> {
        let pool =
            BackendPool::initialize(config.pool, config.routing, factory, capabilities).await?;

        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(SegmentCache::new(&config.cache)));

        let watchdog = ResourceWatchdog::new(config.watchdog, Arc::clone(&pool), probe);
        watchdog.start();

        Ok(Self {
            segmenter: TextSegmenter::new(config.segmenter),
            assembler: StreamAssembler::new(Arc::clone(&pool), cache.clone(), config.chunking),
            pool,
            watchdog,
            cache,
        })
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn watchdog(&self) -> &Arc<ResourceWatchdog> {
        &self.watchdog
    }

    pub fn segment(&self, text: &str) -> Result<Segmentation, PipelineError> {
        Ok(self.segmenter.segment(text)?)
    }

    fn admit(&self) -> Result<(), PipelineError> {
        match self.pool.phase() {
            PoolPhase::Unavailable => Err(PipelineError::BackendUnavailable),
            PoolPhase::Closed => Err(PipelineError::Closed),
            _ => Ok(()),
        }
    }

    /// Segment `text` and prepare its ordered chunk stream
    pub fn stream_chunks(
        &self,
        text: &str,
        voice: &VoiceSettings,
        mode: StreamMode,
        cancel: CancellationToken,
    ) -> Result<PreparedStream, PipelineError> {
        let segmentation = self.segment(text)?;
        self.admit()?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let segment_count = segmentation.len();
        info!(
            request_id = %request_id,
            segments = segment_count,
            chars = segmentation.total_chars(),
            voice = %voice.voice,
            ?mode,
            "Starting synthesis"
        );

        let chunks = self.assembler.stream(
            StreamRequest {
                request_id: request_id.clone(),
                segmentation,
                voice: voice.clone(),
                mode,
            },
            cancel,
        );
        Ok(PreparedStream {
            request_id,
            segment_count,
            chunks,
        })
    }

    /// Best-effort byte stream; failed segments are skipped
    pub fn stream(
        &self,
        text: &str,
        voice: &VoiceSettings,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Bytes, PipelineError>>, PipelineError> {
        let prepared = self.stream_chunks(text, voice, StreamMode::BestEffort, cancel)?;
        Ok(prepared
            .chunks
            .map(|chunk| chunk.map(|c| c.bytes))
            .boxed())
    }

    /// Stream best-effort audio into `sink`
    pub async fn stream_to_sink(
        &self,
        text: &str,
        voice: &VoiceSettings,
        cancel: CancellationToken,
        sink: &mut dyn OutputSink,
    ) -> Result<SinkSummary, PipelineError> {
        let prepared =
            self.stream_chunks(text, voice, StreamMode::BestEffort, cancel.clone())?;
        let mut chunks = prepared.chunks;
        let mut summary = SinkSummary {
            request_id: prepared.request_id,
            segment_count: prepared.segment_count,
            chunks: 0,
            bytes: 0,
            cancelled: false,
        };

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            summary.bytes += chunk.bytes.len();
            summary.chunks += 1;
            sink.write(chunk.bytes).await?;
        }
        summary.cancelled = cancel.is_cancelled();
        debug!(
            request_id = %summary.request_id,
            chunks = summary.chunks,
            cancelled = summary.cancelled,
            "Sink stream finished"
        );
        Ok(summary)
    }

    /// Synthesize the whole text; any segment failure aborts the request
    pub async fn synthesize_complete(
        &self,
        text: &str,
        voice: &VoiceSettings,
    ) -> Result<CompleteAudio, PipelineError> {
        self.synthesize_complete_with_cancel(text, voice, CancellationToken::new())
            .await
    }

    /// [`Self::synthesize_complete`] that gives up with `Cancelled` once `cancel` fires
    pub async fn synthesize_complete_with_cancel(
        &self,
        text: &str,
        voice: &VoiceSettings,
        cancel: CancellationToken,
    ) -> Result<CompleteAudio, PipelineError> {
        let prepared = self.stream_chunks(text, voice, StreamMode::Strict, cancel.clone())?;
        let mut chunks = prepared.chunks;
        let mut pcm = BytesMut::new();
        let mut sample_rate = None;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            sample_rate.get_or_insert(chunk.sample_rate);
            pcm.extend_from_slice(&chunk.bytes);
        }
        if cancel.is_cancelled() {
            debug!(request_id = %prepared.request_id, "Complete synthesis cancelled");
            return Err(PipelineError::Cancelled);
        }

        Ok(CompleteAudio {
            pcm: pcm.freeze(),
            sample_rate: sample_rate.ok_or(PipelineError::BackendUnavailable)?,
            segment_count: prepared.segment_count,
        })
    }

    pub fn get_utilization_stats(&self) -> UtilizationSnapshot {
        self.pool.stats().snapshot()
    }

    pub fn reset_utilization_stats(&self) {
        self.pool.stats().reset();
    }

    pub fn get_watchdog_stats(&self) -> WatchdogStats {
        self.watchdog.stats()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn health(&self) -> PoolHealth {
        self.pool.health()
    }

    /// Recycle the pool now; a no-op while another recycle runs
    pub async fn recycle(&self) -> Result<RecycleOutcome, PipelineError> {
        Ok(self.watchdog.recycle(RecycleReason::Manual).await?)
    }

    /// Stop the watchdog and tear down the pool
    pub async fn shutdown(&self) {
        self.watchdog.stop().await;
        self.pool.shutdown().await;
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        info!("Pipeline shut down");
    }
}
