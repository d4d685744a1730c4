//! Per-request scratch directories that are removed exactly once.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::GatewayResult;

const WORKSPACE_PREFIX: &str = "apsaraflow_";

/// Opens scratch workspaces under a fixed root, or the system temp directory.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceManager {
    root: Option<PathBuf>,
}

impl WorkspaceManager {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn open(&self) -> GatewayResult<ScratchWorkspace> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match &self.root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let path = dir.path().to_path_buf();
        debug!(workspace = %path.display(), "scratch workspace opened");
        Ok(ScratchWorkspace {
            path,
            dir: Some(dir),
            tracked: Vec::new(),
        })
    }
}

/// Exclusively owned temporary directory plus any files created next to it.
#[derive(Debug)]
pub struct ScratchWorkspace {
    path: PathBuf,
    dir: Option<TempDir>,
    tracked: Vec<PathBuf>,
}

impl ScratchWorkspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Path of the archive that sits beside the directory (`<dir>.zip`). The
    /// path is tracked and removed together with the workspace.
    pub fn sibling_archive(&mut self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".zip");
        let archive = self.path.with_file_name(name);
        self.track(archive.clone());
        archive
    }

    /// Registers a file outside the directory for removal on release.
    pub fn track(&mut self, path: PathBuf) {
        if !self.tracked.contains(&path) {
            self.tracked.push(path);
        }
    }

    pub fn is_released(&self) -> bool {
        self.dir.is_none()
    }

    /// Removes the directory tree and every tracked file. Targets that are
    /// already gone are ignored; other errors are logged. Safe to call more
    /// than once.
    pub fn release(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if let Err(err) = dir.close()
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(workspace = %self.path.display(), error = %err, "failed to remove workspace");
        }
        for path in self.tracked.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove tracked file");
                }
            }
        }
        debug!(workspace = %self.path.display(), "scratch workspace released");
    }
}

impl Drop for ScratchWorkspace {
    fn drop(&mut self) {
        self.release();
    }
}
