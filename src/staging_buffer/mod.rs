//! In-memory tail with transparent spill to a temporary file, exposed in
//! two flavors — Overwrite and Append — that differ in how `read_all`,
//! `save_all_contents`, and `make_chunked_stream` compose their sources.
//!
//! Grounded on `original_source/src/io/async/swap/swapping_buffer*.{h,cpp}`;
//! the inheritance hierarchy there (`SwappingBuffer` base +
//! `SwappingBufferOverwrite`/`SwappingBufferAppend`) is expressed here as a
//! `StagingKind` sum type held by composition, per `spec.md` §9.

pub mod composite;

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::chunk_reader::ChunkReader;
use crate::config::StagingBufferConfig;
use crate::engine::Engine;
use crate::error::{EngineError, ErrorKind, StagingBufferError};

use composite::{CacheChunkedReader, CompositeChunkedReader, SharedInfo};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Distinguishes the Overwrite and Append variants without an
/// implementation-inheritance hierarchy (`spec.md` §9's explicit redesign
/// note — Rust has no class inheritance to fall back on).
#[derive(Debug, Clone)]
pub enum StagingKind {
    Overwrite,
    Append { original_path: PathBuf },
}

pub type SizeCb = Box<dyn FnOnce(u64) + Send>;
pub type ClearCb = Box<dyn FnOnce() + Send>;
pub type AppendOkCb = Box<dyn FnOnce(u64) + Send>;
pub type AppendErrCb = Box<dyn FnOnce(StagingBufferError) + Send>;
pub type ReadAllCb = Box<dyn FnOnce(Result<Bytes, StagingBufferError>) + Send>;
pub type CommitCb = Box<dyn FnOnce(Result<(), StagingBufferError>) + Send>;
pub type StreamCb = Box<dyn FnOnce(Result<Arc<CompositeChunkedReader>, StagingBufferError>) + Send>;

enum PendingOp {
    Size(SizeCb),
    Clear(ClearCb),
    ReadAll(ReadAllCb),
    SaveAllContents(PathBuf, CommitCb),
    MakeChunkedStream(usize, StreamCb),
}

/// An `append` call whose `ok`/`err` must wait for the spill it triggered
/// (directly or as a follow-up) to settle, per `spec.md` §4.4.1's
/// `postSwapRoutine(ec, len, ok, err)`.
type DeferredAppend = (AppendOkCb, AppendErrCb, u64);

struct Inner {
    current_buf: BytesMut,
    spill_buf: BytesMut,
    real_size: u64,
    on_disk: bool,
    swapping: bool,
    error: bool,
    first_swap_attempt: bool,
    follow_up_spill: bool,
    pending_ops: VecDeque<PendingOp>,
    deferred_appends: VecDeque<DeferredAppend>,
}

/// Growable byte container that transparently spills to a temporary file
/// once its in-memory footprint exceeds `config.max_buffer_size`. See
/// `spec.md` §4.4–§4.6 for the full contract.
pub struct StagingBuffer {
    engine: Arc<Engine>,
    kind: StagingKind,
    tmp_path: PathBuf,
    config: StagingBufferConfig,
    inner: Mutex<Inner>,
}

impl StagingBuffer {
    fn new(engine: Arc<Engine>, root_dir: &Path, kind: StagingKind, config: StagingBufferConfig) -> Arc<Self> {
        let session_id = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = root_dir.join(&config.swap_subdir).join(session_id.to_string());
        Arc::new(Self {
            engine,
            kind,
            tmp_path,
            config,
            inner: Mutex::new(Inner {
                current_buf: BytesMut::new(),
                spill_buf: BytesMut::new(),
                real_size: 0,
                on_disk: false,
                swapping: false,
                error: false,
                first_swap_attempt: true,
                follow_up_spill: false,
                pending_ops: VecDeque::new(),
                deferred_appends: VecDeque::new(),
            }),
        })
    }

    pub fn overwrite(engine: Arc<Engine>, root_dir: &Path, config: StagingBufferConfig) -> Arc<Self> {
        Self::new(engine, root_dir, StagingKind::Overwrite, config)
    }

    pub fn append_to(
        engine: Arc<Engine>,
        root_dir: &Path,
        original_path: PathBuf,
        config: StagingBufferConfig,
    ) -> Arc<Self> {
        Self::new(engine, root_dir, StagingKind::Append { original_path }, config)
    }

    pub fn kind(&self) -> &StagingKind {
        &self.kind
    }

    pub fn is_on_disk(&self) -> bool {
        self.inner.lock().on_disk
    }

    pub fn has_errored(&self) -> bool {
        self.inner.lock().error
    }

    // ---- §4.4.1 append state machine ----

    /// Per `spec.md` §4.4.1: `ok`/`err` fire immediately only in the plain
    /// in-memory-append case. Whenever this call starts a spill — directly,
    /// because the chunk itself is oversized or the buffer would overflow,
    /// or as a follow-up queued behind a spill already in flight — `ok`/`err`
    /// are deferred until that spill (and any chain of follow-ups it
    /// provokes) settles in `post_swap_routine`.
    #[tracing::instrument(skip(self, chunk, ok, err), level = "trace")]
    pub fn append(self: &Arc<Self>, chunk: Bytes, ok: AppendOkCb, err: AppendErrCb) {
        let max = self.config.max_buffer_size;
        let mut need_new_spill = false;
        let real_size;
        let mut immediate_ok = None;
        {
            let mut inner = self.inner.lock();
            let would_fit = inner.current_buf.len() + chunk.len() < max;
            let oversized = chunk.len() > max;
            inner.current_buf.extend_from_slice(&chunk);
            inner.real_size += chunk.len() as u64;
            real_size = inner.real_size;

            let spill_triggered = if would_fit || oversized {
                if oversized {
                    if inner.swapping {
                        inner.follow_up_spill = true;
                    } else {
                        need_new_spill = true;
                    }
                    true
                } else {
                    false
                }
            } else if inner.swapping {
                inner.follow_up_spill = true;
                true
            } else {
                need_new_spill = true;
                true
            };

            if spill_triggered {
                inner.deferred_appends.push_back((ok, err, real_size));
            } else {
                immediate_ok = Some(ok);
            }
        }
        if need_new_spill {
            self.start_swapping();
        }
        if let Some(ok) = immediate_ok {
            ok(real_size);
        }
    }

    fn start_swapping(self: &Arc<Self>) {
        let (data, is_first) = {
            let mut inner = self.inner.lock();
            std::mem::swap(&mut inner.current_buf, &mut inner.spill_buf);
            inner.current_buf.clear();
            inner.swapping = true;
            (inner.spill_buf.clone().freeze(), !inner.on_disk)
        };
        debug!(bytes = data.len(), is_first, "starting staging buffer spill");
        self.dispatch_spill(data, is_first);
    }

    fn dispatch_spill(self: &Arc<Self>, data: Bytes, is_first: bool) {
        let this = Arc::clone(self);
        let completion: Box<dyn FnOnce(Result<(), EngineError>) + Send> =
            Box::new(move |result| this.post_swap_routine(result));
        let use_write = matches!(self.kind, StagingKind::Overwrite) && is_first;
        if use_write {
            self.engine.async_write(&self.tmp_path, data, completion);
        } else {
            self.engine.async_append(&self.tmp_path, data, completion);
        }
    }

    /// Implements the retry-once-on-first-attempt rule and the
    /// pending-operation drain described in `spec.md` §4.4.
    fn post_swap_routine(self: &Arc<Self>, result: Result<(), EngineError>) {
        let mut inner = self.inner.lock();
        inner.swapping = false;
        match result {
            Ok(()) => {
                inner.on_disk = true;
                if inner.follow_up_spill {
                    inner.follow_up_spill = false;
                    drop(inner);
                    // Another spill is needed before any deferred op can
                    // see a consistent on-disk state; defer draining to
                    // that spill's own completion.
                    self.start_swapping();
                } else {
                    let pending = std::mem::take(&mut inner.pending_ops);
                    let deferred = std::mem::take(&mut inner.deferred_appends);
                    drop(inner);
                    for (ok, _err, real_size) in deferred {
                        ok(real_size);
                    }
                    self.drain_pending(pending);
                }
            }
            Err(e) if inner.first_swap_attempt && is_retryable(&e) => {
                inner.first_swap_attempt = false;
                let data = inner.spill_buf.clone().freeze();
                let is_first = !inner.on_disk;
                drop(inner);
                if let Some(parent) = self.tmp_path.parent() {
                    let _ = self.engine.create_directory(parent, true);
                }
                self.dispatch_spill(data, is_first);
            }
            Err(e) => {
                error!(error = %e, "staging buffer spill failed permanently");
                inner.error = true;
                let pending = std::mem::take(&mut inner.pending_ops);
                let mut deferred = std::mem::take(&mut inner.deferred_appends);
                drop(inner);
                self.fail_pending(pending);
                // Only the first waiter can be handed the real `EngineError`
                // (it isn't `Clone`); the rest of this settle's waiters get
                // the same generic `Errored` collateral-failure classification
                // `fail_pending` already uses for queued ops.
                if let Some((_ok, err, _real_size)) = deferred.pop_front() {
                    err(StagingBufferError::Spill { source: e });
                }
                for (_ok, err, _real_size) in deferred {
                    err(StagingBufferError::Errored);
                }
            }
        }
    }

    fn drain_pending(self: &Arc<Self>, pending: VecDeque<PendingOp>) {
        for op in pending {
            match op {
                PendingOp::Size(cb) => self.do_size(cb),
                PendingOp::Clear(cb) => self.do_clear(cb),
                PendingOp::ReadAll(cb) => self.do_read_all(cb),
                PendingOp::SaveAllContents(dest, cb) => self.do_save_all_contents(dest, cb),
                PendingOp::MakeChunkedStream(chunk_size, cb) => self.do_make_chunked_stream(chunk_size, cb),
            }
        }
    }

    fn fail_pending(self: &Arc<Self>, pending: VecDeque<PendingOp>) {
        for op in pending {
            match op {
                PendingOp::Size(cb) => self.do_size(cb),
                PendingOp::Clear(cb) => self.do_clear(cb),
                PendingOp::ReadAll(cb) => cb(Err(StagingBufferError::Errored)),
                PendingOp::SaveAllContents(_, cb) => cb(Err(StagingBufferError::Errored)),
                PendingOp::MakeChunkedStream(_, cb) => cb(Err(StagingBufferError::Errored)),
            }
        }
    }

    // ---- size / clear ----

    pub fn size(self: &Arc<Self>, cb: SizeCb) {
        let mut inner = self.inner.lock();
        if inner.swapping {
            inner.pending_ops.push_back(PendingOp::Size(cb));
        } else {
            drop(inner);
            self.do_size(cb);
        }
    }

    fn do_size(self: &Arc<Self>, cb: SizeCb) {
        cb(self.inner.lock().real_size);
    }

    pub fn clear(self: &Arc<Self>, cb: ClearCb) {
        let mut inner = self.inner.lock();
        if inner.swapping {
            inner.pending_ops.push_back(PendingOp::Clear(cb));
        } else {
            drop(inner);
            self.do_clear(cb);
        }
    }

    fn do_clear(self: &Arc<Self>, cb: ClearCb) {
        let mut inner = self.inner.lock();
        inner.current_buf.clear();
        inner.spill_buf.clear();
        inner.real_size = 0;
        if inner.on_disk {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
        inner.on_disk = false;
        inner.error = false;
        drop(inner);
        cb();
    }

    /// A successful `save_all_contents` has moved or copied every byte the
    /// buffer held out to `dest`; leaves the buffer empty and off-disk so
    /// it can be reused for a fresh write/append session, and so a stale
    /// `on_disk` flag never outlives the spill file it described.
    fn reset_after_commit(&self) {
        let mut inner = self.inner.lock();
        inner.current_buf.clear();
        inner.current_buf.shrink_to_fit();
        inner.spill_buf.clear();
        inner.spill_buf.shrink_to_fit();
        inner.real_size = 0;
        let was_on_disk = inner.on_disk;
        inner.on_disk = false;
        drop(inner);
        if was_on_disk {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }

    // ---- read_all / save_all_contents / make_chunked_stream ----

    pub fn read_all(self: &Arc<Self>, cb: ReadAllCb) {
        let mut inner = self.inner.lock();
        if inner.swapping {
            inner.pending_ops.push_back(PendingOp::ReadAll(cb));
        } else {
            drop(inner);
            self.do_read_all(cb);
        }
    }

    pub fn save_all_contents(self: &Arc<Self>, dest: PathBuf, cb: CommitCb) {
        let mut inner = self.inner.lock();
        if inner.error {
            drop(inner);
            cb(Err(StagingBufferError::Errored));
            return;
        }
        if inner.swapping {
            inner.pending_ops.push_back(PendingOp::SaveAllContents(dest, cb));
        } else {
            drop(inner);
            self.do_save_all_contents(dest, cb);
        }
    }

    pub fn make_chunked_stream(self: &Arc<Self>, chunk_size: usize, cb: StreamCb) {
        let mut inner = self.inner.lock();
        if inner.swapping {
            inner.pending_ops.push_back(PendingOp::MakeChunkedStream(chunk_size, cb));
        } else {
            drop(inner);
            self.do_make_chunked_stream(chunk_size, cb);
        }
    }

    fn do_read_all(self: &Arc<Self>, cb: ReadAllCb) {
        match self.kind.clone() {
            StagingKind::Overwrite => self.do_read_all_overwrite(cb),
            StagingKind::Append { original_path } => self.do_read_all_append(original_path, cb),
        }
    }

    fn do_read_all_overwrite(self: &Arc<Self>, cb: ReadAllCb) {
        let (on_disk, tail) = {
            let inner = self.inner.lock();
            (inner.on_disk, inner.current_buf.clone().freeze())
        };
        if !on_disk {
            cb(Ok(tail));
            return;
        }
        self.engine.async_read(
            &self.tmp_path,
            Box::new(move |result| match result {
                Ok(spilled) => {
                    let mut combined = BytesMut::with_capacity(spilled.len() + tail.len());
                    combined.extend_from_slice(&spilled);
                    combined.extend_from_slice(&tail);
                    cb(Ok(combined.freeze()));
                }
                Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
            }),
        );
    }

    fn do_read_all_append(self: &Arc<Self>, original_path: PathBuf, cb: ReadAllCb) {
        let (on_disk, tail) = {
            let inner = self.inner.lock();
            (inner.on_disk, inner.current_buf.clone().freeze())
        };
        let tmp = self.tmp_path.clone();
        let this = Arc::clone(self);
        self.engine.async_read(
            &original_path,
            Box::new(move |orig_result| {
                let original = match orig_result {
                    Ok(b) => b,
                    Err(e) => {
                        cb(Err(StagingBufferError::Commit { source: e }));
                        return;
                    }
                };
                if !on_disk {
                    let mut combined = BytesMut::with_capacity(original.len() + tail.len());
                    combined.extend_from_slice(&original);
                    combined.extend_from_slice(&tail);
                    cb(Ok(combined.freeze()));
                    return;
                }
                this.engine.async_read(
                    &tmp,
                    Box::new(move |spill_result| match spill_result {
                        Ok(spilled) => {
                            let mut combined =
                                BytesMut::with_capacity(original.len() + spilled.len() + tail.len());
                            combined.extend_from_slice(&original);
                            combined.extend_from_slice(&spilled);
                            combined.extend_from_slice(&tail);
                            cb(Ok(combined.freeze()));
                        }
                        Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
                    }),
                );
            }),
        );
    }

    fn do_save_all_contents(self: &Arc<Self>, dest: PathBuf, cb: CommitCb) {
        match self.kind.clone() {
            StagingKind::Overwrite => self.do_save_all_contents_overwrite(dest, cb),
            StagingKind::Append { .. } => self.do_save_all_contents_append(dest, cb),
        }
    }

    fn do_save_all_contents_overwrite(self: &Arc<Self>, dest: PathBuf, cb: CommitCb) {
        let (on_disk, tail) = {
            let inner = self.inner.lock();
            (inner.on_disk, inner.current_buf.clone().freeze())
        };
        if !on_disk {
            Self::write_with_retry(Arc::clone(self), dest, tail, cb, true);
            return;
        }
        let this = Arc::clone(self);
        let tmp = self.tmp_path.clone();
        let dest2 = dest.clone();
        self.engine.async_append(
            &self.tmp_path,
            tail,
            Box::new(move |result| match result {
                Ok(()) => Self::move_with_retry(this, tmp, dest2, cb, true),
                Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
            }),
        );
    }

    fn write_with_retry(self_arc: Arc<Self>, dest: PathBuf, data: Bytes, cb: CommitCb, first_attempt: bool) {
        let self_for_retry = Arc::clone(&self_arc);
        let dest_for_retry = dest.clone();
        let data_for_retry = data.clone();
        let engine = Arc::clone(&self_arc.engine);
        engine.async_write(
            &dest,
            data,
            Box::new(move |result| match result {
                Ok(()) => {
                    self_arc.reset_after_commit();
                    cb(Ok(()));
                }
                Err(e) if first_attempt && is_retryable(&e) => {
                    if let Some(parent) = dest_for_retry.parent() {
                        let _ = self_for_retry.engine.create_directory(parent, true);
                    }
                    Self::write_with_retry(self_for_retry, dest_for_retry, data_for_retry, cb, false);
                }
                Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
            }),
        );
    }

    fn move_with_retry(self_arc: Arc<Self>, tmp: PathBuf, dest: PathBuf, cb: CommitCb, first_attempt: bool) {
        match self_arc.engine.move_path(&tmp, &dest) {
            Ok(()) => {
                self_arc.reset_after_commit();
                cb(Ok(()));
            }
            Err(e) if first_attempt && is_retryable(&e) => {
                if let Some(parent) = dest.parent() {
                    let _ = self_arc.engine.create_directory(parent, true);
                }
                Self::move_with_retry(self_arc, tmp, dest, cb, false);
            }
            Err(_) => cb(Err(StagingBufferError::Commit {
                source: append_failure(&dest),
            })),
        }
    }

    fn do_save_all_contents_append(self: &Arc<Self>, dest: PathBuf, cb: CommitCb) {
        let (on_disk, tail) = {
            let inner = self.inner.lock();
            (inner.on_disk, inner.current_buf.clone().freeze())
        };
        if !on_disk {
            let this = Arc::clone(self);
            self.engine.async_append(
                &dest,
                tail,
                Box::new(move |result| match result {
                    Ok(()) => {
                        this.reset_after_commit();
                        cb(Ok(()));
                    }
                    Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
                }),
            );
            return;
        }
        match self.engine.make_chunked_stream(&self.tmp_path, self.config.disk_move_size) {
            Ok(reader) => Self::stream_append_chunks(Arc::clone(self), reader, dest, tail, cb),
            Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
        }
    }

    fn stream_append_chunks(
        self_arc: Arc<Self>,
        reader: Arc<ChunkReader>,
        dest: PathBuf,
        tail: Bytes,
        cb: CommitCb,
    ) {
        let reader_for_continue = Arc::clone(&reader);
        let engine = Arc::clone(&self_arc.engine);
        reader.next_chunk(Box::new(move |result| {
            let is_eof = matches!(&result.error, Some(e) if e.kind() == ErrorKind::EndOfFile);
            if is_eof {
                if !result.data.is_empty() {
                    let self_arc2 = Arc::clone(&self_arc);
                    let dest2 = dest.clone();
                    let tail2 = tail.clone();
                    engine.async_append(
                        &dest,
                        result.data,
                        Box::new(move |r| match r {
                            Ok(()) => Self::finish_append_save(self_arc2, dest2, tail2, cb),
                            Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
                        }),
                    );
                } else {
                    Self::finish_append_save(self_arc, dest, tail, cb);
                }
                return;
            }
            let self_arc2 = Arc::clone(&self_arc);
            let dest2 = dest.clone();
            let tail2 = tail.clone();
            engine.async_append(
                &dest,
                result.data,
                Box::new(move |r| match r {
                    Ok(()) => Self::stream_append_chunks(self_arc2, reader_for_continue, dest2, tail2, cb),
                    Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
                }),
            );
        }));
    }

    fn finish_append_save(self_arc: Arc<Self>, dest: PathBuf, tail: Bytes, cb: CommitCb) {
        let engine = Arc::clone(&self_arc.engine);
        engine.async_append(
            &dest,
            tail,
            Box::new(move |result| match result {
                Ok(()) => {
                    // Hygiene fix over the distilled source: the spill
                    // temp file is deleted once its content has landed
                    // at `dest`. See SPEC_FULL.md §9 / DESIGN.md.
                    self_arc.reset_after_commit();
                    cb(Ok(()));
                }
                Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
            }),
        );
    }

    fn do_make_chunked_stream(self: &Arc<Self>, chunk_size: usize, cb: StreamCb) {
        match self.kind.clone() {
            StagingKind::Overwrite => self.do_make_chunked_stream_overwrite(chunk_size, cb),
            StagingKind::Append { original_path } => {
                self.do_make_chunked_stream_append(original_path, chunk_size, cb)
            }
        }
    }

    fn do_make_chunked_stream_overwrite(self: &Arc<Self>, chunk_size: usize, cb: StreamCb) {
        let (on_disk, tail) = {
            let inner = self.inner.lock();
            (inner.on_disk, inner.current_buf.clone().freeze())
        };
        let shared = Arc::new(SharedInfo::default());
        if !on_disk {
            cb(Ok(CompositeChunkedReader::cache_only(
                CacheChunkedReader::new(tail, chunk_size),
                shared,
            )));
            return;
        }
        match self.engine.make_chunked_stream(&self.tmp_path, chunk_size) {
            Ok(spill_reader) => cb(Ok(CompositeChunkedReader::overwrite(
                spill_reader,
                CacheChunkedReader::new(tail, chunk_size),
                shared,
            ))),
            Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
        }
    }

    fn do_make_chunked_stream_append(self: &Arc<Self>, original_path: PathBuf, chunk_size: usize, cb: StreamCb) {
        let (on_disk, tail) = {
            let inner = self.inner.lock();
            (inner.on_disk, inner.current_buf.clone().freeze())
        };
        let shared = Arc::new(SharedInfo::default());
        let original_reader = match self.engine.make_chunked_stream(&original_path, chunk_size) {
            Ok(r) => r,
            Err(e) => {
                cb(Err(StagingBufferError::Commit { source: e }));
                return;
            }
        };
        if !on_disk {
            cb(Ok(CompositeChunkedReader::file_then_cache(
                original_reader,
                CacheChunkedReader::new(tail, chunk_size),
                shared,
            )));
            return;
        }
        match self.engine.make_chunked_stream(&self.tmp_path, chunk_size) {
            Ok(spill_reader) => cb(Ok(CompositeChunkedReader::append(
                original_reader,
                spill_reader,
                CacheChunkedReader::new(tail, chunk_size),
                shared,
            ))),
            Err(e) => cb(Err(StagingBufferError::Commit { source: e })),
        }
    }
}

fn is_retryable(e: &EngineError) -> bool {
    matches!(e.kind(), ErrorKind::OpenFailure | ErrorKind::InvalidArgument)
}

fn append_failure(path: &Path) -> EngineError {
    EngineError::Append {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::Other, "move failed after retry"),
    }
}

