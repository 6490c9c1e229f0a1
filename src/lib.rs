//! An asynchronous filesystem I/O engine with a spill-to-disk staging
//! buffer for building large writes and appends.
//!
//! The engine serializes filesystem operations behind a request queue and
//! a single background worker, delivering completions to the caller's
//! execution context through an application-supplied post hook. A
//! [`staging_buffer::StagingBuffer`] accepts data piecewise, transparently
//! spilling its in-memory tail to a temporary file once it grows past a
//! configured threshold, and exposes read-all, chunked-read, and
//! commit-to-destination operations over the logical concatenation of
//! (original file, if any) + (in-memory tail) + (spilled tail).

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)]

#[macro_use]
extern crate tracing;

pub mod chunk_reader;
pub mod config;
pub mod double_buffer;
pub mod engine;
pub mod error;
pub mod operation_queue;
pub mod path_primitives;
pub mod staging_buffer;
pub mod waitable_flag;

pub use chunk_reader::{ChunkHandler, ChunkReadResult, ChunkReader, ChunkedStream};
pub use config::{EngineConfig, StagingBufferConfig};
pub use double_buffer::{BufferView, HotDoubleBuffer};
pub use engine::{next_chunk_async, ChannelPostHook, Engine, InlinePostHook, PostHook};
pub use error::{ChunkReaderError, EngineError, ErrorKind, StagingBufferError};
pub use operation_queue::OperationQueue;
pub use staging_buffer::StagingBuffer;
pub use waitable_flag::WaitableFlag;
