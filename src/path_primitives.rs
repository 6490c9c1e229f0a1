//! Blocking operations on the host filesystem. These execute on the calling
//! thread — the Async FS Engine calls them from its worker thread for the
//! asynchronous entry points, and exposes them directly for the synchronous
//! ones.

use std::fs;
use std::path::Path;

use snafu::ResultExt;

use crate::error::{self, EngineError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum AdmittedKind {
    NotFound,
    Regular,
    Directory,
}

/// Rejects symlinks and other special files; only regular files,
/// directories, and non-existent paths are "admitted".
fn check_path_admitted(path: &Path) -> Result<AdmittedKind, EngineError> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AdmittedKind::NotFound),
        Err(e) => Err(EngineError::Open {
            path: path.to_path_buf(),
            source: e,
        }),
        Ok(meta) => {
            let file_type = meta.file_type();
            if file_type.is_symlink() {
                Err(error::NotAdmittedSnafu { path }.build())
            } else if file_type.is_dir() {
                Ok(AdmittedKind::Directory)
            } else if file_type.is_file() {
                Ok(AdmittedKind::Regular)
            } else {
                Err(error::NotAdmittedSnafu { path }.build())
            }
        }
    }
}

/// `true` if `path` is a regular file or directory; `false` if absent.
/// Fails with `NotAdmitted` if `path` is a symlink or special file.
pub fn exists(path: &Path) -> Result<bool, EngineError> {
    Ok(!matches!(check_path_admitted(path)?, AdmittedKind::NotFound))
}

/// Removes `path` if it is a regular file. Returns `false` if absent.
/// Rejects non-regular files (including directories).
pub fn remove_file(path: &Path) -> Result<bool, EngineError> {
    match check_path_admitted(path)? {
        AdmittedKind::NotFound => Ok(false),
        AdmittedKind::Directory => Err(error::NotAdmittedSnafu { path }.build()),
        AdmittedKind::Regular => {
            fs::remove_file(path).context(error::WriteSnafu { path })?;
            Ok(true)
        }
    }
}

fn destination_under(to: &Path, from: &Path) -> Result<std::path::PathBuf, EngineError> {
    if check_path_admitted(to)? == AdmittedKind::Directory {
        let leaf = from.file_name().ok_or_else(|| {
            error::NotAdmittedSnafu { path: from }.build()
        })?;
        Ok(to.join(leaf))
    } else {
        Ok(to.to_path_buf())
    }
}

/// Moves `from` to `to`. If `to` is an existing directory, renames into it
/// under `from`'s leaf name.
pub fn move_path(from: &Path, to: &Path) -> Result<(), EngineError> {
    check_path_admitted(from)?;
    let real_to = destination_under(to, from)?;
    fs::rename(from, &real_to).context(error::WriteSnafu { path: real_to })
}

/// Copies `from` to `to`. `from` must be a regular file. If `to` is an
/// existing directory, copies into it under the source's leaf name. Fails
/// with `SelfCopy` if `from` and `to` refer to the same file.
pub fn copy_file(from: &Path, to: &Path) -> Result<(), EngineError> {
    if check_path_admitted(from)? != AdmittedKind::Regular {
        return Err(error::NotAdmittedSnafu { path: from }.build());
    }
    let real_to = destination_under(to, from)?;
    if same_file(from, &real_to).unwrap_or(false) {
        return Err(error::SelfCopySnafu { path: from }.build());
    }
    fs::copy(from, &real_to).context(error::WriteSnafu { path: real_to })?;
    Ok(())
}

/// Recursively copies a directory tree, ignoring entries that are neither
/// regular files nor directories. If `to` is an existing directory, copies
/// *into* it as `to/<from.leaf>`.
pub fn copy_directory(from: &Path, to: &Path) -> Result<(), EngineError> {
    if check_path_admitted(from)? != AdmittedKind::Directory {
        return Err(error::NotAdmittedSnafu { path: from }.build());
    }
    let real_to = destination_under(to, from)?;
    copy_directory_inner(from, &real_to)
}

fn copy_directory_inner(from: &Path, to: &Path) -> Result<(), EngineError> {
    fs::create_dir_all(to).context(error::WriteSnafu { path: to })?;
    for entry in fs::read_dir(from).context(error::ReadSnafu { path: from })? {
        let entry = entry.context(error::ReadSnafu { path: from })?;
        let file_type = entry.file_type().context(error::ReadSnafu { path: from })?;
        let dest = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_directory_inner(&entry.path(), &dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest).context(error::WriteSnafu { path: dest })?;
        }
        // symlinks and special files are silently ignored, per spec.
    }
    Ok(())
}

/// Recursively removes a directory tree. Returns the number of entries
/// removed (0 if `path` was absent).
pub fn remove_directory(path: &Path) -> Result<usize, EngineError> {
    match check_path_admitted(path)? {
        AdmittedKind::NotFound => Ok(0),
        AdmittedKind::Regular => Err(error::NotAdmittedSnafu { path }.build()),
        AdmittedKind::Directory => {
            let count = count_entries(path)?;
            fs::remove_dir_all(path).context(error::WriteSnafu { path })?;
            Ok(count)
        }
    }
}

fn count_entries(path: &Path) -> Result<usize, EngineError> {
    let mut count = 0;
    for entry in fs::read_dir(path).context(error::ReadSnafu { path })? {
        let entry = entry.context(error::ReadSnafu { path })?;
        count += 1;
        if entry.file_type().context(error::ReadSnafu { path })?.is_dir() {
            count += count_entries(&entry.path())?;
        }
    }
    Ok(count)
}

/// Creates a directory. If `parents` is set, acts idempotently and creates
/// intermediates (`true` whether or not it already existed). Otherwise
/// requires the parent to exist and the target to be absent.
pub fn create_directory(path: &Path, parents: bool) -> Result<bool, EngineError> {
    if parents {
        fs::create_dir_all(path).context(error::WriteSnafu { path })?;
        Ok(true)
    } else {
        match check_path_admitted(path)? {
            AdmittedKind::NotFound => {
                fs::create_dir(path).context(error::WriteSnafu { path })?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub fn read_file(path: &Path) -> Result<Vec<u8>, EngineError> {
    check_path_admitted(path)?;
    fs::read(path).context(error::ReadSnafu { path })
}

pub fn write_file(path: &Path, data: &[u8]) -> Result<(), EngineError> {
    fs::write(path, data).context(error::WriteSnafu { path })
}

pub fn append_to_file(path: &Path, data: &[u8]) -> Result<(), EngineError> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(error::OpenSnafu { path })?;
    file.write_all(data).context(error::AppendSnafu { path })
}

/// Compares two paths by device + inode rather than by string equality, so
/// `copy_file`'s self-copy rejection is robust to two different paths that
/// resolve to the same underlying file (hardlinks, `.`/`..` components,
/// bind mounts). Mirrors the device/inode accessors `file-source-common`'s
/// `metadata_ext` exposes for duplicate-file detection.
#[cfg(unix)]
pub fn same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let a_meta = fs::metadata(a)?;
    let b_meta = fs::metadata(b)?;
    Ok(a_meta.dev() == b_meta.dev() && a_meta.ino() == b_meta.ino())
}

#[cfg(not(unix))]
pub fn same_file(a: &Path, b: &Path) -> std::io::Result<bool> {
    Ok(fs::canonicalize(a)? == fs::canonicalize(b)?)
}
