//! Composite chunk readers that stitch together a file prefix, a spill
//! file, and an in-memory tail into a single chunk stream.
//!
//! Two shapes are built from the same `CompositeChunkedReader`: the
//! Overwrite variant chains (spill file → in-memory tail); the Append
//! variant chains (original file → spill file → in-memory tail).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::chunk_reader::{ChunkHandler, ChunkReadResult, ChunkReader};
use crate::error::{ChunkReaderError, ErrorKind};

/// Shared between a `StagingBuffer` and any chunk streams it has produced,
/// so cancellation can be surfaced across that boundary. Mirrors
/// `original_source`'s `struct sharedinfo`.
#[derive(Debug, Default)]
pub struct SharedInfo {
    pub stop_reading: AtomicBool,
}

/// Reads from a snapshotted in-memory tail, starting at offset 0, handing
/// out a fresh copy of `chunk_size` bytes each call until exhausted.
pub struct CacheChunkedReader {
    data: Bytes,
    pos: usize,
    chunk_size: usize,
}

impl CacheChunkedReader {
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            pos: 0,
            chunk_size,
        }
    }

    fn next_chunk(&mut self, shared: &SharedInfo, handler: ChunkHandler) {
        if shared.stop_reading.load(Ordering::Acquire) {
            handler(ChunkReadResult {
                data: Bytes::new(),
                error: Some(ChunkReaderError::Stopped),
            });
            return;
        }
        if self.pos >= self.data.len() {
            handler(ChunkReadResult {
                data: Bytes::new(),
                error: Some(ChunkReaderError::EndOfFile),
            });
            return;
        }
        let end = (self.pos + self.chunk_size).min(self.data.len());
        let slice = self.data.slice(self.pos..end);
        self.pos = end;
        let is_eof = self.pos >= self.data.len();
        handler(ChunkReadResult {
            data: slice,
            error: if is_eof {
                Some(ChunkReaderError::EndOfFile)
            } else {
                None
            },
        });
    }
}

enum Stage {
    File(Arc<ChunkReader>),
    Cache(CacheChunkedReader),
}

/// A fixed ordered chain of stages, drained front to back. Only the truly
/// final stage's terminal chunk is allowed to carry `end_of_file` to the
/// caller; earlier stages' terminal chunks are delivered as a plain
/// success (if non-empty) or elided entirely (if empty), and the reader
/// transparently falls through to the next stage.
pub struct CompositeChunkedReader {
    stages: Mutex<VecDeque<Stage>>,
    shared: Arc<SharedInfo>,
}

impl CompositeChunkedReader {
    pub(crate) fn new(stages: Vec<Stage>, shared: Arc<SharedInfo>) -> Arc<Self> {
        Arc::new(Self {
            stages: Mutex::new(stages.into_iter().collect()),
            shared,
        })
    }

    pub(crate) fn overwrite(spill: Arc<ChunkReader>, tail: CacheChunkedReader, shared: Arc<SharedInfo>) -> Arc<Self> {
        Self::new(vec![Stage::File(spill), Stage::Cache(tail)], shared)
    }

    pub(crate) fn append(
        original: Arc<ChunkReader>,
        spill: Arc<ChunkReader>,
        tail: CacheChunkedReader,
        shared: Arc<SharedInfo>,
    ) -> Arc<Self> {
        Self::new(
            vec![Stage::File(original), Stage::File(spill), Stage::Cache(tail)],
            shared,
        )
    }

    pub(crate) fn cache_only(tail: CacheChunkedReader, shared: Arc<SharedInfo>) -> Arc<Self> {
        Self::new(vec![Stage::Cache(tail)], shared)
    }

    pub(crate) fn file_then_cache(file: Arc<ChunkReader>, tail: CacheChunkedReader, shared: Arc<SharedInfo>) -> Arc<Self> {
        Self::new(vec![Stage::File(file), Stage::Cache(tail)], shared)
    }

    pub fn stop(&self) {
        self.shared.stop_reading.store(true, Ordering::Release);
    }

    pub fn next_chunk(self: &Arc<Self>, handler: ChunkHandler) {
        if self.shared.stop_reading.load(Ordering::Acquire) {
            handler(ChunkReadResult {
                data: Bytes::new(),
                error: Some(ChunkReaderError::Stopped),
            });
            return;
        }

        let (front, is_last_stage) = {
            let mut stages = self.stages.lock();
            let front = stages.pop_front();
            (front, stages.is_empty())
        };

        match front {
            None => handler(ChunkReadResult {
                data: Bytes::new(),
                error: Some(ChunkReaderError::EndOfFile),
            }),
            Some(Stage::File(reader)) => {
                let this = Arc::clone(self);
                let requeue = Arc::clone(&reader);
                reader.next_chunk(Box::new(move |result| {
                    this.handle_stage_result(result, is_last_stage, handler, move |composite| {
                        composite.stages.lock().push_front(Stage::File(requeue));
                    });
                }));
            }
            Some(Stage::Cache(mut cache)) => {
                let this = Arc::clone(self);
                let shared = Arc::clone(&self.shared);
                cache.next_chunk(&shared, Box::new(move |result| {
                    this.handle_stage_result(result, is_last_stage, handler, move |composite| {
                        composite.stages.lock().push_front(Stage::Cache(cache));
                    });
                }));
            }
        }
    }

    fn handle_stage_result(
        self: &Arc<Self>,
        result: ChunkReadResult,
        is_last_stage: bool,
        handler: ChunkHandler,
        requeue: impl FnOnce(&Arc<Self>),
    ) {
        let is_eof = matches!(&result.error, Some(e) if e.kind() == ErrorKind::EndOfFile);
        if !is_eof {
            requeue(self);
            handler(result);
            return;
        }
        if is_last_stage {
            // Genuine end of the composite stream: pass the terminal
            // marker through unchanged, including any residual bytes.
            handler(result);
            return;
        }
        if !result.data.is_empty() {
            handler(ChunkReadResult {
                data: result.data,
                error: None,
            });
        } else {
            self.next_chunk(handler);
        }
    }
}
