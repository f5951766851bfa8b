//! Pid files under a run directory.
//!
//! Each process records itself as `<run dir>/pids/<pid>` containing its
//! program name.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

const PIDS_DIR: &str = "pids";

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("failed to create pid directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write pid file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

pub type Result<T> = std::result::Result<T, PidFileError>;

/// Directory pid files are kept in.
pub fn pids_dir(run_dir: &Path) -> PathBuf {
    run_dir.join(PIDS_DIR)
}

/// Path of pid file `name`, unless `name` is already inside the pid
/// directory.
pub fn pid_path(run_dir: &Path, name: impl AsRef<Path>) -> PathBuf {
    let dir = pids_dir(run_dir);
    let name = name.as_ref();
    if name.starts_with(&dir) {
        name.to_path_buf()
    } else {
        dir.join(name)
    }
}

/// Remove every pid file and the pid directory itself. Best effort.
pub fn remove_all(run_dir: &Path) {
    let dir = pids_dir(run_dir);
    let Ok(entries) = fs::read_dir(&dir) else {
        return;
    };
    for entry in entries.flatten() {
        if let Err(e) = fs::remove_file(entry.path()) {
            warn!(path = %entry.path().display(), error = %e, "Failed to remove pid file");
        }
    }
    let _ = fs::remove_dir(&dir);
}

/// Pid file of this process; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(run_dir: &Path, name: &str) -> Result<Self> {
        let dir = pids_dir(run_dir);
        fs::create_dir_all(&dir).map_err(|source| PidFileError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(std::process::id().to_string());
        let write = |path: &Path| -> io::Result<()> {
            let mut f = fs::File::create(path)?;
            writeln!(f, "{name}")
        };
        write(&path).map_err(|source| PidFileError::Write {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), name, "Pid file created");
        Ok(PidFile { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
        }
    }
}
