use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

/// Scratch directory private to one run.
///
/// Layout: `source.mp4`, `frames/` (extracted), `processed/` (inpainted,
/// renumbered) and `output.mp4`. Removed by [`RunWorkspace::close`], or on
/// drop if the run unwinds.
pub(crate) struct RunWorkspace {
    dir: TempDir,
}

impl RunWorkspace {
    /// Create the directory tree on the blocking pool.
    pub(crate) async fn create(root: &Path, task_id: &str) -> io::Result<Self> {
        let root = root.to_path_buf();
        let prefix = format!("run-{task_id}-");
        tokio::task::spawn_blocking(move || Self::create_in(&root, &prefix))
            .await
            .map_err(io::Error::other)?
    }

    fn create_in(root: &Path, prefix: &str) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(root)?;
        std::fs::create_dir(dir.path().join("frames"))?;
        std::fs::create_dir(dir.path().join("processed"))?;
        debug!(path = %dir.path().display(), "run workspace created");
        Ok(Self { dir })
    }

    pub(crate) fn source_path(&self) -> PathBuf {
        self.dir.path().join("source.mp4")
    }

    pub(crate) fn frames_dir(&self) -> PathBuf {
        self.dir.path().join("frames")
    }

    pub(crate) fn processed_dir(&self) -> PathBuf {
        self.dir.path().join("processed")
    }

    pub(crate) fn output_path(&self) -> PathBuf {
        self.dir.path().join("output.mp4")
    }

    pub(crate) async fn close(self) {
        let path = self.dir.path().to_path_buf();
        let removed = tokio::task::spawn_blocking(move || self.dir.close())
            .await
            .map_err(io::Error::other)
            .and_then(|r| r);
        if let Err(e) = removed {
            warn!(path = %path.display(), error = %e, "failed to remove run workspace");
        }
    }
}
