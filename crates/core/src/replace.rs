//! Output promotion and cleanup of partial outputs.
//!
//! A finished temp file is moved onto its final path in one step, so the
//! final path either holds a complete output or nothing. Partial outputs from
//! failed or interrupted encodes are moved to a discard directory or deleted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur while moving outputs around.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Failed to move the temp file onto the final path.
    #[error("Failed to promote {path}: {source}")]
    PromoteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to move or delete a partial output.
    #[error("Failed to discard {path}: {source}")]
    DiscardFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Generates a non-clashing path inside `dir` for a discarded file.
///
/// Uses the file name as-is when free, otherwise `<name>.<timestamp>`
/// where timestamp is Unix epoch seconds.
pub fn discard_path(dir: &Path, file: &Path) -> PathBuf {
    let name = file.file_name().map(|n| n.to_owned()).unwrap_or_default();
    let candidate = dir.join(&name);
    if !candidate.exists() {
        return candidate;
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut stamped = name;
    stamped.push(format!(".{}", timestamp));
    dir.join(stamped)
}

/// Move a file, falling back to copy + delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Moves a finished temp output onto its final path.
///
/// The temp file lives in the same directory as the final path, so the
/// rename is atomic. If rename fails (e.g. ZFS or network filesystem quirks)
/// the contents are copied to a sibling and renamed from there, which keeps
/// the final path free of partial data.
///
/// # Arguments
///
/// * `tmp_path` - Completed encoder output
/// * `final_path` - Destination path
pub fn promote_output(tmp_path: &Path, final_path: &Path) -> Result<(), ReplaceError> {
    let promote_err = |source| ReplaceError::PromoteFailed {
        path: final_path.to_path_buf(),
        source,
    };

    if fs::rename(tmp_path, final_path).is_ok() {
        return Ok(());
    }

    let mut staging = final_path.as_os_str().to_owned();
    staging.push(".promote");
    let staging = PathBuf::from(staging);

    if let Err(e) = fs::copy(tmp_path, &staging) {
        let _ = fs::remove_file(&staging);
        return Err(promote_err(e));
    }
    if let Err(e) = fs::rename(&staging, final_path) {
        let _ = fs::remove_file(&staging);
        return Err(promote_err(e));
    }
    fs::remove_file(tmp_path).map_err(promote_err)
}

/// Removes a partial output, or moves it into `discard_dir` when one is set.
///
/// # Returns
///
/// * `Ok(Some(path))` - where the partial output was moved to
/// * `Ok(None)` - the file was deleted, or there was nothing to clean up
/// * `Err(ReplaceError::DiscardFailed)` - the file could not be moved or deleted
pub fn discard_partial(tmp_path: &Path, discard_dir: Option<&Path>) -> Result<Option<PathBuf>, ReplaceError> {
    let discard_err = |source| ReplaceError::DiscardFailed {
        path: tmp_path.to_path_buf(),
        source,
    };

    if !tmp_path.exists() {
        return Ok(None);
    }

    match discard_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(discard_err)?;
            let target = discard_path(dir, tmp_path);
            move_file(tmp_path, &target).map_err(discard_err)?;
            Ok(Some(target))
        }
        None => {
            fs::remove_file(tmp_path).map_err(discard_err)?;
            Ok(None)
        }
    }
}
