pub mod cache;
pub mod engine;
pub mod pipeline;
pub mod pool;
pub mod segmenter;
pub mod stream;
pub mod watchdog;

// Re-export commonly used types for convenience
pub use engine::{
    BackendKind, BuiltinEngineFactory, EngineConfig, EngineFactory, EngineInitError, EngineKind,
    HardwareCapabilities, SynthesisEngine, SynthesisError, SynthesisRequest, SynthesizedAudio,
    VoiceSettings,
};

pub use pool::{
    BackendPool, PoolConfig, PoolError, PoolHealth, PoolPhase, PoolStatus, RecycleOutcome,
    RecycleReport, RoutingConfig, UtilizationSnapshot,
};

pub use segmenter::{
    Segment, SegmentState, Segmentation, SegmentationError, SegmenterConfig, TextSegmenter,
};

pub use stream::{AudioChunk, ChunkingConfig, StreamMode};

pub use watchdog::{PressureLevel, RecycleReason, ResourceWatchdog, WatchdogConfig, WatchdogStats};

pub use cache::{CacheConfig, CacheStats};

pub use pipeline::{CompleteAudio, OutputSink, PipelineConfig, PipelineContext, PipelineError};
