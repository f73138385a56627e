//! Request-scoped scratch directories

use crate::guard::Artifact;
use crate::Result;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ARTIFACT_NAME: &str = "guard.py";

/// Temporary directory owned by exactly one execution.
///
/// Removed by [`ScratchDir::release`] on the normal path and by `Drop` on
/// every other path.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl ScratchDir {
    /// Create a uniquely named directory under `root` (system temp dir if `None`)
    pub fn create(root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("stockade-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let path = dir.path().to_path_buf();
        tracing::debug!(path = %path.display(), "scratch directory created");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the guarded artifact into the directory
    pub fn write_artifact(&self, artifact: &Artifact) -> Result<PathBuf> {
        let path = self.path.join(ARTIFACT_NAME);
        std::fs::write(&path, artifact.source.as_bytes())?;
        Ok(path)
    }

    /// Remove the directory and everything the child left in it
    pub fn release(mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            dir.close()?;
            tracing::debug!(path = %self.path.display(), "scratch directory removed");
        }
        Ok(())
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch directory");
            }
        }
    }
}
