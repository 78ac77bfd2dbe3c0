//! Temp directory bookkeeping.
//!
//! Every directory the run creates is registered in a
//! [`TempDirRegistry`] at creation time. The registry is append-only
//! during the run and is drained exactly once at teardown, either
//! explicitly via [`TempDirRegistry::drain`] or by `Drop` when the run
//! unwinds.

use std::io;
use std::path::{Path, PathBuf};

/// Outcome of draining the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Directories deleted, or already gone.
    pub removed: usize,
    /// Directories whose deletion failed.
    pub failed: usize,
    /// Directories left in place because retention was requested.
    pub retained: usize,
}

/// Ordered list of directories to delete when the run ends.
#[derive(Debug)]
pub struct TempDirRegistry {
    dirs: Vec<PathBuf>,
    retain: bool,
    drained: bool,
}

impl TempDirRegistry {
    /// `retain` keeps every directory on disk (`--keep_tmp_dirs`).
    pub fn new(retain: bool) -> Self {
        Self {
            dirs: Vec::new(),
            retain,
            drained: false,
        }
    }

    /// Register an existing directory for deletion.
    pub fn register(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        tracing::debug!(dir = %dir.display(), "Registered directory for cleanup");
        self.dirs.push(dir);
    }

    /// Create a fresh temp directory and register it.
    pub fn create(&mut self, prefix: &str) -> io::Result<PathBuf> {
        let dir = make_temp_dir(prefix)?;
        self.register(dir.clone());
        Ok(dir)
    }

    /// Registered directories in registration order.
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Delete every registered directory once. Later calls do nothing.
    ///
    /// Failures are logged per entry and never stop the remaining
    /// deletions, inside a directory or across directories. Missing
    /// directories count as removed.
    pub fn drain(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.drained {
            return report;
        }
        self.drained = true;
        let dirs = std::mem::take(&mut self.dirs);

        if self.retain {
            report.retained = dirs.len();
            for dir in &dirs {
                tracing::info!(dir = %dir.display(), "Keeping directory, `--keep_tmp_dirs` was set");
            }
            return report;
        }

        for dir in &dirs {
            tracing::info!(dir = %dir.display(), "Removing directory");
            match remove_tree(dir) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove directory");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

impl Drop for TempDirRegistry {
    fn drop(&mut self) {
        if !self.drained {
            self.drain();
        }
    }
}

/// Create a temp directory that nobody owns; the caller decides whether
/// to register it.
pub fn make_temp_dir(prefix: &str) -> io::Result<PathBuf> {
    Ok(tempfile::Builder::new().prefix(prefix).tempdir()?.keep())
}

/// Remove `path` and everything below it, carrying on past entries that
/// cannot be removed. Symlinks are removed, never followed. Returns the
/// first failure.
fn remove_tree(path: &Path) -> io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        other => other?,
    };
    if !meta.is_dir() {
        return logged(path, ignore_missing(std::fs::remove_file(path)));
    }

    let mut first_err = None;
    match std::fs::read_dir(path) {
        Ok(entries) => {
            for entry in entries {
                let result = match entry {
                    Ok(entry) => remove_tree(&entry.path()),
                    Err(e) => logged(path, Err(e)),
                };
                if let Err(e) = result {
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Failed to list directory");
            first_err.get_or_insert(e);
        }
    }
    if let Err(e) = logged(path, ignore_missing(std::fs::remove_dir(path))) {
        first_err.get_or_insert(e);
    }
    first_err.map_or(Ok(()), Err)
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn logged(path: &Path, result: io::Result<()>) -> io::Result<()> {
    if let Err(e) = &result {
        tracing::debug!(path = %path.display(), error = %e, "Failed to remove entry");
    }
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
