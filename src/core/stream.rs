//! Ordered audio streaming
//!
//! Segments of one request are synthesized concurrently and complete in any
//! order. [`StreamAssembler`] fans them out to the backend pool, then emits
//! their audio strictly in segment order, sliced into [`AudioChunk`]s.
//!
//! A segment that finishes early waits in a [`ReorderBuffer`] until every
//! earlier segment has been emitted or skipped. Failed segments are skipped in
//! [`StreamMode::BestEffort`] and end the stream with an error in
//! [`StreamMode::Strict`].
//!
//! Cancellation is cooperative. The request token is checked between chunk
//! emissions and while waiting for completions; cancelling stops dispatch of
//! segments that have not started. Calls already running on an engine finish
//! and their results are discarded.

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::cache::SegmentCache;
use crate::core::engine::{SynthesisRequest, SynthesizedAudio, VoiceSettings};
use crate::core::pipeline::PipelineError;
use crate::core::pool::{BackendPool, PoolError};
use crate::core::segmenter::{Segment, SegmentState, Segmentation};
use crate::utils::audio::pcm16_le_bytes;

/// Output is 16-bit PCM
pub const BYTES_PER_SAMPLE: usize = 2;

/// Chunk duration by total request length
///
/// Short requests use small chunks so playback starts sooner; long requests
/// use larger chunks to cut per-chunk overhead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Requests up to this many characters use `short_chunk_ms`
    pub short_text_chars: usize,
    /// Requests up to this many characters use `medium_chunk_ms`
    pub medium_text_chars: usize,
    pub short_chunk_ms: u32,
    pub medium_chunk_ms: u32,
    pub long_chunk_ms: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            short_text_chars: 200,
            medium_text_chars: 1000,
            short_chunk_ms: 100,
            medium_chunk_ms: 200,
            long_chunk_ms: 400,
        }
    }
}

impl ChunkingConfig {
    pub fn chunk_duration_ms(&self, total_chars: usize) -> u32 {
        if total_chars <= self.short_text_chars {
            self.short_chunk_ms
        } else if total_chars <= self.medium_text_chars {
            self.medium_chunk_ms
        } else {
            self.long_chunk_ms
        }
    }

    /// Chunk size in bytes, always a whole number of samples
    pub fn chunk_bytes(&self, total_chars: usize, sample_rate: u32) -> usize {
        let samples =
            self.chunk_duration_ms(total_chars) as u64 * sample_rate as u64 / 1000;
        (samples.max(1) as usize) * BYTES_PER_SAMPLE
    }
}

/// Failure handling for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Skip failed segments
    #[default]
    BestEffort,
    /// End the stream on the first failed segment
    Strict,
}

/// A slice of one segment's PCM16LE audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub segment_index: usize,
    /// Position within the segment, from 0
    pub chunk_seq: usize,
    pub bytes: Bytes,
    pub is_final_for_segment: bool,
    pub sample_rate: u32,
}

/// Releases items in index order regardless of arrival order
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next_expected: usize,
    total: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(total: usize) -> Self {
        Self {
            next_expected: 0,
            total,
            pending: BTreeMap::new(),
        }
    }

    /// Accept item `index`; returns every item that is now in order
    ///
    /// Duplicates and indices already released are ignored.
    pub fn push(&mut self, index: usize, item: T) -> Vec<(usize, T)> {
        if index < self.next_expected || index >= self.total {
            return Vec::new();
        }
        self.pending.entry(index).or_insert(item);

        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next_expected) {
            ready.push((self.next_expected, item));
            self.next_expected += 1;
        }
        ready
    }

    pub fn next_expected(&self) -> usize {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn is_complete(&self) -> bool {
        self.next_expected >= self.total
    }
}

/// Split PCM bytes into chunks of `chunk_bytes`; empty audio yields one empty chunk
pub fn split_chunks(pcm: Bytes, chunk_bytes: usize) -> Vec<Bytes> {
    if pcm.is_empty() {
        return vec![Bytes::new()];
    }
    let size = chunk_bytes.max(BYTES_PER_SAMPLE);
    (0..pcm.len())
        .step_by(size)
        .map(|start| pcm.slice(start..(start + size).min(pcm.len())))
        .collect()
}

/// One request's worth of segments
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub request_id: String,
    pub segmentation: Segmentation,
    pub voice: VoiceSettings,
    pub mode: StreamMode,
}

type SegmentResult = Result<Arc<SynthesizedAudio>, PoolError>;

#[derive(Clone)]
pub struct StreamAssembler {
    pool: Arc<BackendPool>,
    cache: Option<Arc<SegmentCache>>,
    chunking: ChunkingConfig,
}

impl StreamAssembler {
    pub fn new(
        pool: Arc<BackendPool>,
        cache: Option<Arc<SegmentCache>>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            chunking,
        }
    }

    /// Ordered chunk stream for `request`
    ///
    /// Nothing is dispatched until the stream is first polled. Dropping the
    /// stream cancels segments that have not started.
    pub fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<AudioChunk, PipelineError>> {
        let pool = Arc::clone(&self.pool);
        let cache = self.cache.clone();
        let chunking = self.chunking.clone();

        let stream = async_stream::stream! {
            let StreamRequest { request_id, segmentation, voice, mode } = request;
            let total = segmentation.len();
            let total_chars = segmentation.total_chars();
            let mut segments = segmentation.segments;
            let started = Instant::now();

            let dispatch = cancel.child_token();
            let _dispatch_guard = dispatch.clone().drop_guard();
            let (tx, mut rx) = mpsc::unbounded_channel::<(usize, SegmentResult)>();

            for segment in &mut segments {
                if dispatch.is_cancelled() {
                    debug!(request_id = %request_id, segment = segment.index, "Dispatch stopped");
                    break;
                }
                segment.state = SegmentState::InFlight;
                spawn_segment(
                    Arc::clone(&pool),
                    cache.clone(),
                    segment.clone(),
                    voice.clone(),
                    dispatch.clone(),
                    tx.clone(),
                );
            }
            drop(tx);

            let mut reorder = ReorderBuffer::new(total);
            let mut chunk_bytes = None;
            let mut first_chunk = true;
            let mut cancelled = false;

            'receive: while !reorder.is_complete() {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    received = rx.recv() => received,
                };
                let Some((index, result)) = received else {
                    cancelled = cancel.is_cancelled();
                    if !cancelled {
                        warn!(
                            request_id = %request_id,
                            missing_from = reorder.next_expected(),
                            "Segment tasks ended before every segment completed"
                        );
                    }
                    break;
                };

                for (index, result) in reorder.push(index, result) {
                    match result {
                        Ok(audio) => {
                            let size = *chunk_bytes.get_or_insert_with(|| {
                                chunking.chunk_bytes(total_chars, audio.sample_rate)
                            });
                            let pcm = Bytes::from(pcm16_le_bytes(&audio.samples));
                            let chunks = split_chunks(pcm, size);
                            let last = chunks.len() - 1;

                            for (chunk_seq, bytes) in chunks.into_iter().enumerate() {
                                if cancel.is_cancelled() {
                                    cancelled = true;
                                    break 'receive;
                                }
                                if first_chunk {
                                    first_chunk = false;
                                    info!(
                                        request_id = %request_id,
                                        ttfa_ms = started.elapsed().as_millis() as u64,
                                        "First audio chunk ready"
                                    );
                                }
                                yield Ok(AudioChunk {
                                    segment_index: index,
                                    chunk_seq,
                                    bytes,
                                    is_final_for_segment: chunk_seq == last,
                                    sample_rate: audio.sample_rate,
                                });
                            }
                            segments[index].state = SegmentState::Done;
                        }
                        Err(err) => {
                            segments[index].state = SegmentState::Failed;
                            match mode {
                                StreamMode::BestEffort => {
                                    warn!(
                                        request_id = %request_id,
                                        segment = index,
                                        error = %err,
                                        "Skipping failed segment"
                                    );
                                }
                                StreamMode::Strict => {
                                    dispatch.cancel();
                                    yield Err(PipelineError::SegmentFailed { index, source: err });
                                    return;
                                }
                            }
                        }
                    }
                }
            }

            if cancelled {
                dispatch.cancel();
                info!(
                    request_id = %request_id,
                    emitted_through = reorder.next_expected(),
                    "Stream cancelled"
                );
                return;
            }

            let done = segments.iter().filter(|s| s.state == SegmentState::Done).count();
            info!(
                request_id = %request_id,
                segments = total,
                done,
                failed = total - done,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stream complete"
            );
        };

        Box::pin(stream)
    }
}

fn spawn_segment(
    pool: Arc<BackendPool>,
    cache: Option<Arc<SegmentCache>>,
    segment: Segment,
    voice: VoiceSettings,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<(usize, SegmentResult)>,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = synthesize_segment(&pool, cache.as_deref(), &segment, &voice) => result,
        };
        // Receiver is gone once the stream ends; the result is discarded
        let _ = tx.send((segment.index, result));
    });
}

async fn synthesize_segment(
    pool: &BackendPool,
    cache: Option<&SegmentCache>,
    segment: &Segment,
    voice: &VoiceSettings,
) -> SegmentResult {
    if let Some(cache) = cache
        && let Some(hit) = cache.get(&segment.text, voice).await
    {
        debug!(segment = segment.index, "Segment cache hit");
        return Ok(hit);
    }

    let output = pool
        .process(segment.index, SynthesisRequest::new(segment.text.as_str(), voice))
        .await?;
    let audio = Arc::new(output.audio);
    if let Some(cache) = cache {
        cache.insert(&segment.text, voice, Arc::clone(&audio)).await;
    }
    Ok(audio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_releases_chains() {
        let mut buffer = ReorderBuffer::new(4);
        assert!(buffer.push(2, "c").is_empty());
        assert!(buffer.push(1, "b").is_empty());
        assert_eq!(buffer.buffered(), 2);

        let ready = buffer.push(0, "a");
        assert_eq!(ready, vec![(0, "a"), (1, "b"), (2, "c")]);
        assert_eq!(buffer.next_expected(), 3);
        assert!(!buffer.is_complete());

        assert_eq!(buffer.push(3, "d"), vec![(3, "d")]);
        assert!(buffer.is_complete());
    }

    #[test]
    fn test_reorder_ignores_stale_and_out_of_range() {
        let mut buffer = ReorderBuffer::new(2);
        assert_eq!(buffer.push(0, 1), vec![(0, 1)]);
        assert!(buffer.push(0, 99).is_empty());
        assert!(buffer.push(7, 99).is_empty());
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn test_chunk_duration_by_length() {
        let config = ChunkingConfig::default();
        assert_eq!(config.chunk_duration_ms(50), 100);
        assert_eq!(config.chunk_duration_ms(500), 200);
        assert_eq!(config.chunk_duration_ms(5000), 400);

        // 100 ms at 24 kHz, 16-bit
        assert_eq!(config.chunk_bytes(50, 24_000), 4_800);
        assert_eq!(config.chunk_bytes(50, 24_000) % BYTES_PER_SAMPLE, 0);
    }

    #[test]
    fn test_split_chunks() {
        let pcm = Bytes::from(vec![0u8; 10]);
        let chunks = split_chunks(pcm, 4);
        let sizes: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let empty = split_chunks(Bytes::new(), 4);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].is_empty());
    }
}
