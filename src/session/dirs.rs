//! Durable and scratch directory management for sessions
//!
//! A session's home directory must survive any number of child launches and
//! is only removed when the whole session is disposed. Cleanup is best
//! effort: entries vanishing mid-walk are a benign race with the child's own
//! cleanup, and residual failures are logged rather than failing the test.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::Result;

static NEXT_ROOT_ID: AtomicU32 = AtomicU32::new(0);

/// Allocates directories for one session and deletes them on disposal
#[derive(Debug)]
pub struct DirAllocator {
    root: PathBuf,
    allocated: Vec<PathBuf>,
    next_id: u32,
}

impl DirAllocator {
    /// Create an allocator rooted under the system temp directory
    pub fn new(session: &str) -> Result<Self> {
        let root = std::env::temp_dir().join(format!(
            "remotestep-{}-{}-{}",
            sanitize(session),
            std::process::id(),
            NEXT_ROOT_ID.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            allocated: Vec::new(),
            next_id: 0,
        })
    }

    /// Create a fresh, empty, writable directory and register it for cleanup
    pub fn allocate(&mut self, label: &str) -> Result<PathBuf> {
        let dir = self.root.join(format!("{}-{}", label, self.next_id));
        self.next_id += 1;
        std::fs::create_dir_all(&dir)?;
        self.allocated.push(dir.clone());
        Ok(dir)
    }

    /// Create an unregistered scratch directory that cleans itself up
    pub fn scratch(&self) -> Result<tempfile::TempDir> {
        let dir = tempfile::Builder::new()
            .prefix("scratch-")
            .tempdir_in(&self.root)?;
        Ok(dir)
    }

    /// Delete every allocated directory, best effort
    pub fn dispose(&mut self) {
        for dir in self.allocated.drain(..) {
            remove_tree_tolerant(&dir);
        }
        remove_tree_tolerant(&self.root);
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Recursively delete a tree, tolerating concurrent deletion
///
/// A file that disappears mid-walk is not an error; anything else is logged
/// and otherwise ignored.
pub fn remove_tree_tolerant(path: &Path) {
    match remove_tree(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not fully remove directory");
        }
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let entry_path = entry.path();
        // Symlinks are removed as files, never followed
        let is_dir = entry
            .file_type()
            .map(|t| t.is_dir() && !t.is_symlink())
            .unwrap_or(false);
        let result = if is_dir {
            remove_tree(&entry_path)
        } else {
            std::fs::remove_file(&entry_path)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    match std::fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
