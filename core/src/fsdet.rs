//! Deterministic filesystem wrappers (C4): every governance-critical read
//! goes through these instead of raw OS iteration, so directory order never
//! leaks into replay-sensitive state.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::entropy::{charge_entropy, EntropyError, EntropySource};

/// Filesystem wrapper errors.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("io error reading `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Entropy(#[from] EntropyError),
}

fn charge(context: &str) -> Result<(), FsError> {
    charge_entropy(EntropySource::Filesystem, context).map_err(FsError::Entropy)
}

/// Sorted directory listing (file and directory names, not full paths).
pub fn listdir_deterministic(dir: &Path) -> Result<Vec<String>, FsError> {
    charge("listdir")?;
    let mut names: Vec<String> = fs::read_dir(dir)
        .map_err(|e| FsError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

/// Sorted, depth-first recursive walk returning full paths.
pub fn walk_deterministic(root: &Path) -> Result<Vec<PathBuf>, FsError> {
    charge("walk")?;
    let mut out = Vec::new();
    walk_into(root, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk_into(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), FsError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| FsError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            walk_into(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Sorted glob-style suffix match (no external glob crate dependency: this
/// only needs simple suffix matching for the cases governance code exercises).
pub fn glob_deterministic(root: &Path, suffix: &str) -> Result<Vec<PathBuf>, FsError> {
    Ok(walk_deterministic(root)?
        .into_iter()
        .filter(|p| p.to_string_lossy().ends_with(suffix))
        .collect())
}

/// Read a file's bytes, charging FILESYSTEM entropy.
pub fn read_file_deterministic(path: &Path) -> Result<Vec<u8>, FsError> {
    charge("read_file")?;
    fs::read(path).map_err(|e| FsError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Sorted recursive search for files matching `suffix` under `root`.
pub fn find_files_deterministic(root: &Path, suffix: &str) -> Result<Vec<PathBuf>, FsError> {
    glob_deterministic(root, suffix)
}

/// Atomically write `contents` to `path` via temp-file-then-rename, charging
/// FILESYSTEM entropy. The governance-critical write side of C4: evidence
/// export and any other write-once artifact goes through this instead of a
/// bare `fs::write`.
pub fn write_file_deterministic(path: &Path, contents: &[u8]) -> Result<(), FsError> {
    charge("write_file")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(|e| FsError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    fs::rename(&tmp, path).map_err(|e| FsError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}
