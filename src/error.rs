use std::path::PathBuf;

use snafu::Snafu;

/// Coarse classification shared by every fallible operation in this crate.
///
/// Mirrors the `(ErrorKind, message)` pair exposed at the engine's external
/// boundary; Rust call sites that stay inside the crate use the richer
/// per-module [`Snafu`] enums below and reach for `.kind()` only when they
/// need to cross an API boundary that isn't itself `Result`-shaped (e.g. a
/// completion closure).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    Success,
    InternalFailure,
    InvalidArgument,
    OperationNotPermitted,
    OpenFailure,
    ReadFailure,
    WriteFailure,
    AppendFailure,
    EndOfFile,
    UnknownError,
    Stopped,
}

/// Errors raised by the synchronous path primitives and the async engine's
/// dispatch of `ReadFile`/`WriteFile`/`AppendFile`/`ReadChunk` operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("path {} is a symlink or special file", path.display()))]
    NotAdmitted { path: PathBuf },

    #[snafu(display("refusing to copy {} onto itself", path.display()))]
    SelfCopy { path: PathBuf },

    #[snafu(display("could not open {}: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed reading {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed writing {}: {source}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed appending to {}: {source}", path.display()))]
    Append {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("chunk size must be non-zero"))]
    InvalidChunkSize,

    #[snafu(display("engine has been shut down"))]
    Stopped,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotAdmitted { .. } => ErrorKind::InvalidArgument,
            EngineError::SelfCopy { .. } => ErrorKind::OperationNotPermitted,
            EngineError::Open { .. } => ErrorKind::OpenFailure,
            EngineError::Read { .. } => ErrorKind::ReadFailure,
            EngineError::Write { .. } => ErrorKind::WriteFailure,
            EngineError::Append { .. } => ErrorKind::AppendFailure,
            EngineError::InvalidChunkSize => ErrorKind::InvalidArgument,
            EngineError::Stopped => ErrorKind::Stopped,
        }
    }
}

/// Errors surfaced while prefetching chunks for a single open file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChunkReaderError {
    #[snafu(display("could not open {} for chunked reading: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("read failed: {message}"))]
    Read { message: String },

    #[snafu(display("reader has been stopped"))]
    Stopped,

    #[snafu(display("end of file"))]
    EndOfFile,
}

impl ChunkReaderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChunkReaderError::Open { .. } => ErrorKind::OpenFailure,
            ChunkReaderError::Read { .. } => ErrorKind::ReadFailure,
            ChunkReaderError::Stopped => ErrorKind::Stopped,
            ChunkReaderError::EndOfFile => ErrorKind::EndOfFile,
        }
    }
}

/// Errors raised by [`crate::staging_buffer::StagingBuffer`] operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StagingBufferError {
    #[snafu(display("spill write failed: {source}"))]
    Spill { source: EngineError },

    #[snafu(display("commit to destination failed: {source}"))]
    Commit { source: EngineError },

    #[snafu(display("buffer is in a fatal error state from a prior spill failure"))]
    Errored,

    #[snafu(display("chunked read failed: {source}"))]
    Chunk { source: ChunkReaderError },
}

impl StagingBufferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StagingBufferError::Spill { source } | StagingBufferError::Commit { source } => {
                source.kind()
            }
            StagingBufferError::Errored => ErrorKind::WriteFailure,
            StagingBufferError::Chunk { source } => source.kind(),
        }
    }
}
