//! Single background worker that serializes filesystem operations behind a
//! request queue, delivering completions back to the caller's execution
//! context through an application-supplied post hook.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;

use crate::chunk_reader::{ChunkHandler, ChunkReadResult, ChunkReader};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};
use crate::operation_queue::OperationQueue;
use crate::path_primitives;
use crate::waitable_flag::WaitableFlag;

/// Schedules a boxed task for execution on the application's own execution
/// context. The engine's worker thread calls `post`; it must not run the
/// task itself.
pub trait PostHook: Send + Sync + 'static {
    fn post(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs posted tasks immediately, on whichever thread calls `post` — which,
/// for this engine, is the worker thread. Useful for tests and simple
/// synchronous hosts; production applications with their own event loop
/// should post onto it instead (e.g. a `tokio::sync::mpsc` channel drained
/// by a task on the application context).
pub struct InlinePostHook;

impl PostHook for InlinePostHook {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// A [`PostHook`] backed by an unbounded Tokio channel. The application
/// drains the paired receiver on its own task: `while let Some(task) =
/// rx.recv().await { task(); }`.
pub struct ChannelPostHook {
    tx: tokio::sync::mpsc::UnboundedSender<Box<dyn FnOnce() + Send>>,
}

impl ChannelPostHook {
    pub fn new() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<Box<dyn FnOnce() + Send>>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PostHook for ChannelPostHook {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        // A closed receiver means the application has torn down its event
        // loop; dropping the task is the best-effort shutdown behavior
        // `spec.md` §4.1 describes ("pending handlers may or may not run").
        let _ = self.tx.send(task);
    }
}

type FileCompletion = Box<dyn FnOnce(Result<Bytes, EngineError>) + Send>;
type UnitCompletion = Box<dyn FnOnce(Result<(), EngineError>) + Send>;

pub(crate) struct ReadChunkOp {
    pub(crate) reader: Arc<ChunkReader>,
    pub(crate) file_offset: u64,
    pub(crate) view_idx: usize,
}

enum Operation {
    ReadFile(PathBuf, FileCompletion),
    WriteFile(PathBuf, Bytes, UnitCompletion),
    AppendFile(PathBuf, Bytes, UnitCompletion),
    ReadChunk(ReadChunkOp),
}

/// The Async FS Engine. Blocking path operations run on the caller's
/// thread; `async_*` operations enqueue onto a FIFO drained by a single
/// dedicated worker thread, with completions delivered through `post`.
pub struct Engine {
    queue: Arc<OperationQueue<Operation>>,
    flag: Arc<WaitableFlag>,
    post: Arc<dyn PostHook>,
    done: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(post: Arc<dyn PostHook>, config: EngineConfig) -> Arc<Self> {
        let queue = Arc::new(OperationQueue::new());
        let flag = Arc::new(WaitableFlag::new());
        let done = Arc::new(AtomicBool::new(false));

        let worker_queue = Arc::clone(&queue);
        let worker_flag = Arc::clone(&flag);
        let worker_post = Arc::clone(&post);
        let worker_done = Arc::clone(&done);
        let worker = thread::Builder::new()
            .name("afs-engine-worker".into())
            .spawn(move || Self::process_queue(worker_queue, worker_flag, worker_post, worker_done))
            .expect("failed to spawn async fs engine worker thread");

        Arc::new(Self {
            queue,
            flag,
            post,
            done,
            worker: Some(worker),
            config,
        })
    }

    /// Convenience constructor for tests and simple synchronous hosts: uses
    /// [`InlinePostHook`].
    pub fn new_inline() -> Arc<Self> {
        Self::new(Arc::new(InlinePostHook), EngineConfig::default())
    }

    pub fn default_chunk_size(&self) -> usize {
        self.config.default_chunk_size
    }

    fn process_queue(
        queue: Arc<OperationQueue<Operation>>,
        flag: Arc<WaitableFlag>,
        post: Arc<dyn PostHook>,
        done: Arc<AtomicBool>,
    ) {
        loop {
            flag.wait();
            flag.reset();
            loop {
                if done.load(Ordering::Acquire) {
                    return;
                }
                match queue.pop_front() {
                    Some(op) => Self::perform_next_operation(op, &queue, &post),
                    None => break,
                }
            }
            if done.load(Ordering::Acquire) {
                return;
            }
        }
    }

    #[tracing::instrument(skip(op, queue, post), level = "trace")]
    fn perform_next_operation(op: Operation, queue: &OperationQueue<Operation>, post: &Arc<dyn PostHook>) {
        match op {
            Operation::ReadFile(path, completion) => {
                let result = path_primitives::read_file(&path).map(Bytes::from);
                post.post(Box::new(move || completion(result)));
            }
            Operation::WriteFile(path, data, completion) => {
                let result = path_primitives::write_file(&path, &data);
                post.post(Box::new(move || completion(result)));
            }
            Operation::AppendFile(path, data, completion) => {
                let result = path_primitives::append_to_file(&path, &data);
                post.post(Box::new(move || completion(result)));
            }
            Operation::ReadChunk(read_chunk_op) => {
                Self::perform_read_chunk(read_chunk_op, queue, post);
            }
        }
    }

    /// The out-of-order / buffer-hot re-enqueue rule central to `spec.md`
    /// §4.1: if the worker's cumulative read position doesn't match the
    /// requested offset, or the target slot hasn't been drained by the
    /// caller yet, put the operation back at the tail instead of servicing
    /// it — this is the only overtaking the operation queue allows.
    fn perform_read_chunk(op: ReadChunkOp, queue: &OperationQueue<Operation>, post: &Arc<dyn PostHook>) {
        let ReadChunkOp {
            reader,
            file_offset,
            view_idx,
        } = op;

        if reader.is_stopped() {
            reader.fill_view(view_idx, &[], ErrorKind::Stopped);
            post.post(Box::new(move || reader.on_read_complete(view_idx)));
            return;
        }

        if reader.bytes_read_by_worker.load(Ordering::Acquire) != file_offset
            || reader.view_is_hot(view_idx)
        {
            queue.requeue(Operation::ReadChunk(ReadChunkOp {
                reader,
                file_offset,
                view_idx,
            }));
            return;
        }

        let (data, kind) = reader.perform_read(file_offset);
        reader.fill_view(view_idx, &data, kind);
        post.post(Box::new(move || reader.on_read_complete(view_idx)));
    }

    pub(crate) fn enqueue_read_chunk(&self, op: ReadChunkOp) {
        self.queue.push_back(Operation::ReadChunk(op));
        self.flag.set();
    }

    // ---- blocking path primitives ----

    pub fn exists(&self, path: &Path) -> Result<bool, EngineError> {
        path_primitives::exists(path)
    }

    pub fn remove_file(&self, path: &Path) -> Result<bool, EngineError> {
        path_primitives::remove_file(path)
    }

    pub fn move_path(&self, from: &Path, to: &Path) -> Result<(), EngineError> {
        path_primitives::move_path(from, to)
    }

    pub fn copy_file(&self, from: &Path, to: &Path) -> Result<(), EngineError> {
        path_primitives::copy_file(from, to)
    }

    pub fn copy_directory(&self, from: &Path, to: &Path) -> Result<(), EngineError> {
        path_primitives::copy_directory(from, to)
    }

    pub fn remove_directory(&self, path: &Path) -> Result<usize, EngineError> {
        path_primitives::remove_directory(path)
    }

    pub fn create_directory(&self, path: &Path, parents: bool) -> Result<bool, EngineError> {
        path_primitives::create_directory(path, parents)
    }

    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>, EngineError> {
        path_primitives::read_file(path)
    }

    pub fn write_file(&self, path: &Path, data: &[u8]) -> Result<(), EngineError> {
        path_primitives::write_file(path, data)
    }

    pub fn append_to_file(&self, path: &Path, data: &[u8]) -> Result<(), EngineError> {
        path_primitives::append_to_file(path, data)
    }

    // ---- async operations ----

    #[tracing::instrument(skip(self, completion), level = "debug")]
    pub fn async_read(
        &self,
        path: &Path,
        completion: Box<dyn FnOnce(Result<Bytes, EngineError>) + Send>,
    ) {
        self.queue
            .push_back(Operation::ReadFile(path.to_path_buf(), completion));
        self.flag.set();
    }

    #[tracing::instrument(skip(self, data, completion), level = "debug")]
    pub fn async_write(
        &self,
        path: &Path,
        data: Bytes,
        completion: Box<dyn FnOnce(Result<(), EngineError>) + Send>,
    ) {
        self.queue
            .push_back(Operation::WriteFile(path.to_path_buf(), data, completion));
        self.flag.set();
    }

    #[tracing::instrument(skip(self, data, completion), level = "debug")]
    pub fn async_append(
        &self,
        path: &Path,
        data: Bytes,
        completion: Box<dyn FnOnce(Result<(), EngineError>) + Send>,
    ) {
        self.queue
            .push_back(Operation::AppendFile(path.to_path_buf(), data, completion));
        self.flag.set();
    }

    /// Opens `path` and starts a [`ChunkReader`]. Fails `InvalidChunkSize`
    /// if `chunk_size == 0`; fails to open (`open_failure`) if `path` is
    /// not an openable regular file.
    pub fn make_chunked_stream(
        self: &Arc<Self>,
        path: &Path,
        chunk_size: usize,
    ) -> Result<Arc<ChunkReader>, EngineError> {
        if chunk_size == 0 {
            return Err(EngineError::InvalidChunkSize);
        }
        ChunkReader::open(Arc::clone(self), path, chunk_size).map_err(|e| EngineError::Open {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })
    }

    /// Same as `make_chunked_stream`, but resumes from `start_offset`
    /// instead of the beginning of the file. See SPEC_FULL.md §4.7.
    pub fn make_chunked_stream_from(
        self: &Arc<Self>,
        path: &Path,
        chunk_size: usize,
        start_offset: u64,
    ) -> Result<Arc<ChunkReader>, EngineError> {
        if chunk_size == 0 {
            return Err(EngineError::InvalidChunkSize);
        }
        ChunkReader::open_from(Arc::clone(self), path, chunk_size, start_offset).map_err(|e| {
            EngineError::Open {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            }
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
        self.flag.set();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Awaitable wrapper over [`ChunkReader::next_chunk`] for callers that
/// prefer `.await` to an explicit completion closure — the Rust-native
/// reading of `spec.md` §9's "model async calls as a future/promise"
/// redesign note.
pub async fn next_chunk_async(reader: &Arc<ChunkReader>) -> ChunkReadResult {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let handler: ChunkHandler = Box::new(move |result| {
        let _ = tx.send(result);
    });
    reader.next_chunk(handler);
    rx.await
        .unwrap_or(ChunkReadResult {
            data: Bytes::new(),
            error: Some(crate::error::ChunkReaderError::Stopped),
        })
}
