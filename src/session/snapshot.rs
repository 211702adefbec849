//! Hard-shutdown snapshots of a session home
//!
//! The copy runs after the child has exited but makes no assumption about
//! cooperation: entries that vanish between listing and copying are skipped,
//! and symlinks are copied only when their target currently resolves. The
//! result approximates "what was actually durable at the time of the crash".

use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::common::{Error, Result};

/// Recursively copy `src` into `dst`, which must not be inside `src`
///
/// Returns the number of regular files copied. Modification times are
/// preserved so the snapshot is plausible to age-sensitive application code.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut copied = 0u64;

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            // Entry vanished between listing and stat - benign race with
            // the just-exited process's own cleanup
            Err(e) if is_not_found(&e) => continue,
            Err(e) => {
                return Err(Error::Internal(format!(
                    "snapshot walk failed under {}: {}",
                    src.display(),
                    e
                )))
            }
        };

        let relative = match entry.path().strip_prefix(src) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink_if_resolvable(entry.path(), &target);
        } else {
            match copy_file_with_times(entry.path(), &target) {
                Ok(()) => copied += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(copied)
}

/// Copy a symlink only when its target currently resolves; otherwise skip
fn copy_symlink_if_resolvable(src: &Path, dst: &Path) {
    // metadata() follows the link; failure means a dangling target
    if std::fs::metadata(src).is_err() {
        tracing::debug!(path = %src.display(), "skipping dangling symlink in snapshot");
        return;
    }
    let link_target = match std::fs::read_link(src) {
        Ok(target) => target,
        Err(_) => return,
    };
    #[cfg(unix)]
    {
        let _ = std::os::unix::fs::symlink(&link_target, dst);
    }
    #[cfg(not(unix))]
    {
        let _ = (link_target, dst);
    }
}

fn copy_file_with_times(src: &Path, dst: &Path) -> io::Result<()> {
    let metadata = std::fs::metadata(src)?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;

    let mut times = std::fs::FileTimes::new();
    if let Ok(modified) = metadata.modified() {
        times = times.set_modified(modified);
    }
    if let Ok(accessed) = metadata.accessed() {
        times = times.set_accessed(accessed);
    }
    if let Ok(file) = std::fs::File::options().write(true).open(dst) {
        // Timestamp restoration is cosmetic; a failure never loses data
        let _ = file.set_times(times);
    }
    Ok(())
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|e| e.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}
