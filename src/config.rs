use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 2 MiB. Spill threshold for a [`crate::staging_buffer::StagingBuffer`]'s
/// in-memory tail.
pub const MAX_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Default prefetch chunk size for [`crate::chunk_reader::ChunkReader`],
/// matching a typical OS page size.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// 4096 * 64. Chunk size used while streaming a spill file into the
/// destination during the Append variant's `saveAllContents`.
pub const DISK_MOVE_SIZE: usize = DEFAULT_CHUNK_SIZE * 64;

/// Default root under which spill files are created.
pub const SWAP_SUBDIR: &str = "/tmp";

/// Tunables for a [`crate::engine::Engine`] and the staging buffers it
/// constructs. Deserializable so a host application can load it from its
/// own configuration file, the way `vector_buffers::config::BufferConfig`
/// is loaded as part of a larger config tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StagingBufferConfig {
    /// In-memory byte threshold before a spill to disk is triggered.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Chunk size used when streaming a spill file into the destination
    /// during `saveAllContents` on the Append variant.
    #[serde(default = "default_disk_move_size")]
    pub disk_move_size: usize,

    /// Directory under which spill files are created, joined onto a
    /// buffer's configured root directory. The default (`/tmp`) is
    /// absolute, so it is used as-is regardless of the root directory a
    /// given `StagingBuffer` was constructed with — `PathBuf::join`
    /// treats joining an absolute path as replacing, not nesting. Set
    /// this to a relative path (e.g. `.`) to spill under the buffer's
    /// own root instead.
    #[serde(default = "default_swap_subdir")]
    pub swap_subdir: PathBuf,
}

impl Default for StagingBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            disk_move_size: default_disk_move_size(),
            swap_subdir: default_swap_subdir(),
        }
    }
}

fn default_max_buffer_size() -> usize {
    MAX_BUFFER_SIZE
}

fn default_disk_move_size() -> usize {
    DISK_MOVE_SIZE
}

fn default_swap_subdir() -> PathBuf {
    PathBuf::from(SWAP_SUBDIR)
}

/// Tunables for the [`crate::engine::Engine`] itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Default chunk size used by `make_chunked_stream` when the caller
    /// does not specify one.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
