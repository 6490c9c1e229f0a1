//! Per-open-file prefetching reader. Issues one-at-a-time (up to two
//! in-flight) async reads through a [`HotDoubleBuffer`], servicing caller
//! chunk requests from whatever arrives first: a prefetched buffer or the
//! caller's own request.

use std::fs::File;
use std::future::Future;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use futures::future::BoxFuture;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::double_buffer::HotDoubleBuffer;
use crate::engine::{next_chunk_async, Engine, ReadChunkOp};
use crate::error::{ChunkReaderError, ErrorKind};

/// Result delivered to a [`ChunkHandler`]: the bytes read (possibly empty)
/// plus an optional terminal/failure condition. `error.is_none()` means a
/// plain successful chunk.
pub struct ChunkReadResult {
    pub data: Bytes,
    pub error: Option<ChunkReaderError>,
}

pub type ChunkHandler = Box<dyn FnOnce(ChunkReadResult) + Send>;

/// Per-open-file prefetching reader. See module docs.
pub struct ChunkReader {
    pub(crate) engine: Arc<Engine>,
    path: PathBuf,
    pub(crate) file: Mutex<File>,
    file_size: u64,
    chunk_size: usize,
    double_buffer: HotDoubleBuffer,
    pos_to_schedule: AtomicU64,
    pub(crate) bytes_read_by_worker: AtomicU64,
    in_flight_count: AtomicUsize,
    queued_caller_handlers: Mutex<VecDeque<ChunkHandler>>,
    queued_ready_buffers: SegQueue<(Bytes, Option<ErrorKind>)>,
    pub(crate) stopped: AtomicBool,
}

impl ChunkReader {
    pub(crate) fn open(
        engine: Arc<Engine>,
        path: &Path,
        chunk_size: usize,
    ) -> Result<Arc<Self>, ChunkReaderError> {
        let file = File::open(path).map_err(|source| ChunkReaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let file_size = file
            .metadata()
            .map_err(|source| ChunkReaderError::Open {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        Ok(Arc::new(Self {
            engine,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            file_size,
            chunk_size,
            double_buffer: HotDoubleBuffer::new(chunk_size),
            pos_to_schedule: AtomicU64::new(0),
            bytes_read_by_worker: AtomicU64::new(0),
            in_flight_count: AtomicUsize::new(0),
            queued_caller_handlers: Mutex::new(VecDeque::new()),
            queued_ready_buffers: SegQueue::new(),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Same as `open`, but seeks the file to `start_offset` first so a
    /// resumed consumer doesn't re-read bytes it already checkpointed.
    /// See SPEC_FULL.md §4.7.
    pub(crate) fn open_from(
        engine: Arc<Engine>,
        path: &Path,
        chunk_size: usize,
        start_offset: u64,
    ) -> Result<Arc<Self>, ChunkReaderError> {
        let reader = Self::open(engine, path, chunk_size)?;
        reader
            .file
            .lock()
            .seek(SeekFrom::Start(start_offset))
            .map_err(|source| ChunkReaderError::Open {
                path: reader.path.clone(),
                source,
            })?;
        reader.pos_to_schedule.store(start_offset, Ordering::Release);
        reader
            .bytes_read_by_worker
            .store(start_offset, Ordering::Release);
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Cumulative bytes the worker has read. Doubles as a resume
    /// checkpoint for `open_from`.
    pub fn checkpoint(&self) -> u64 {
        self.bytes_read_by_worker.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Requests that the reader stop. In-flight reads still complete and
    /// deliver their results; subsequent `next_chunk` calls observe
    /// `stopped` immediately.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// See `spec.md` §4.3 for the full algorithm this implements.
    pub fn next_chunk(self: &Arc<Self>, handler: ChunkHandler) {
        if self.stopped.load(Ordering::Acquire) {
            handler(ChunkReadResult {
                data: Bytes::new(),
                error: Some(ChunkReaderError::Stopped),
            });
            return;
        }

        if let Some((data, kind)) = self.queued_ready_buffers.pop() {
            handler(ChunkReadResult {
                data,
                error: kind.map(Self::error_for_kind),
            });
            self.maybe_prefetch_second_leg();
            return;
        }

        let handlers_len = self.queued_caller_handlers.lock().len();
        if self.in_flight_count.load(Ordering::Acquire) > handlers_len {
            // An outstanding prefetch hasn't returned a buffer yet; this
            // handler will be matched against it (or a later one) in FIFO
            // order once `on_read_complete` runs.
            self.queued_caller_handlers.lock().push_back(handler);
            self.maybe_prefetch_second_leg();
            return;
        }

        if self.pos_to_schedule.load(Ordering::Acquire) >= self.file_size {
            handler(ChunkReadResult {
                data: Bytes::new(),
                error: Some(ChunkReaderError::EndOfFile),
            });
            return;
        }

        self.queued_caller_handlers.lock().push_back(handler);
        self.schedule_read();
        self.maybe_prefetch_second_leg();
    }

    fn maybe_prefetch_second_leg(self: &Arc<Self>) {
        if self.in_flight_count.load(Ordering::Acquire) < 2
            && self.pos_to_schedule.load(Ordering::Acquire) < self.file_size
        {
            self.schedule_read();
        }
    }

    fn schedule_read(self: &Arc<Self>) {
        let view = self.double_buffer.get_and_swap();
        let idx = view.index();
        let offset = self
            .pos_to_schedule
            .fetch_add(self.chunk_size as u64, Ordering::AcqRel);
        self.in_flight_count.fetch_add(1, Ordering::AcqRel);
        self.engine.enqueue_read_chunk(ReadChunkOp {
            reader: Arc::clone(self),
            file_offset: offset,
            view_idx: idx,
        });
    }

    fn error_for_kind(kind: ErrorKind) -> ChunkReaderError {
        match kind {
            ErrorKind::EndOfFile => ChunkReaderError::EndOfFile,
            ErrorKind::Stopped => ChunkReaderError::Stopped,
            _ => ChunkReaderError::Read {
                message: "read failed".to_string(),
            },
        }
    }

    /// Performs the actual blocking read on the worker thread; called by
    /// [`crate::engine::Engine`]'s worker loop after the re-enqueue
    /// predicate has already been checked.
    pub(crate) fn perform_read(&self, file_offset: u64) -> (Vec<u8>, ErrorKind) {
        let mut file = self.file.lock();
        if let Err(_e) = file.seek(SeekFrom::Start(file_offset)) {
            return (Vec::new(), ErrorKind::ReadFailure);
        }
        let mut buf = vec![0u8; self.chunk_size];
        match file.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                let total = self.bytes_read_by_worker.fetch_add(n as u64, Ordering::AcqRel) + n as u64;
                let kind = if n == 0 || total >= self.file_size {
                    ErrorKind::EndOfFile
                } else {
                    ErrorKind::Success
                };
                (buf, kind)
            }
            Err(_e) => (Vec::new(), ErrorKind::ReadFailure),
        }
    }

    pub(crate) fn view_is_hot(&self, idx: usize) -> bool {
        self.double_buffer.view(idx).is_hot()
    }

    pub(crate) fn fill_view(&self, idx: usize, data: &[u8], kind: ErrorKind) {
        self.double_buffer.view(idx).fill(data, Some(kind));
    }

    /// Called (via the post hook) once a worker read for `view_idx` has
    /// landed. Copies the slot out, decrements in-flight count, and
    /// delivers to whichever caller is waiting — a queued handler, if any,
    /// else a fresh slot in `queued_ready_buffers`.
    pub(crate) fn on_read_complete(self: Arc<Self>, view_idx: usize) {
        let (data, kind) = self.double_buffer.view(view_idx).take();
        self.in_flight_count.fetch_sub(1, Ordering::AcqRel);
        let data = data.freeze();
        match self.queued_caller_handlers.lock().pop_front() {
            Some(handler) => handler(ChunkReadResult {
                data,
                error: kind.map(Self::error_for_kind),
            }),
            None => self.queued_ready_buffers.push((data, kind)),
        }
    }
}

/// Owning handle over a [`ChunkReader`] that implements `futures::Stream`,
/// for callers that prefer `.await`-style iteration to the raw
/// `next_chunk` callback API. Matches `spec.md`'s `ChunkedStream` entity:
/// wraps a `ChunkReader` and requests it to stop when dropped.
///
/// Each poll awaits exactly one `next_chunk` call; the stream ends after
/// the first `end_of_file` (yielding a final item first if that read
/// still carried data) or after any other error, which is surfaced as
/// `Some(Err(_))` and then treated as exhausted.
pub struct ChunkedStream {
    reader: Arc<ChunkReader>,
    pending: Option<BoxFuture<'static, ChunkReadResult>>,
    done: bool,
}

impl ChunkedStream {
    pub fn new(reader: Arc<ChunkReader>) -> Self {
        Self {
            reader,
            pending: None,
            done: false,
        }
    }

    pub fn reader(&self) -> &Arc<ChunkReader> {
        &self.reader
    }

    pub fn stop(&self) {
        self.reader.stop();
    }
}

impl From<Arc<ChunkReader>> for ChunkedStream {
    fn from(reader: Arc<ChunkReader>) -> Self {
        Self::new(reader)
    }
}

impl Stream for ChunkedStream {
    type Item = Result<Bytes, ChunkReaderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.pending.is_none() {
            let reader = Arc::clone(&this.reader);
            this.pending = Some(Box::pin(next_chunk_async_owned(reader)));
        }

        let result = futures::ready!(this.pending.as_mut().unwrap().as_mut().poll(cx));
        this.pending = None;

        match result.error {
            None => Poll::Ready(Some(Ok(result.data))),
            Some(ChunkReaderError::EndOfFile) => {
                this.done = true;
                if result.data.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(result.data)))
                }
            }
            Some(e) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

impl Drop for ChunkedStream {
    fn drop(&mut self) {
        self.reader.stop();
    }
}

fn next_chunk_async_owned(reader: Arc<ChunkReader>) -> impl Future<Output = ChunkReadResult> {
    async move { next_chunk_async(&reader).await }
}
