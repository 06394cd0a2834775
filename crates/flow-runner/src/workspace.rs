use anyhow::{anyhow, Result};
use std::fs;
use std::path::Path;
use tracing::warn;

/// What `prepare_workspace` did with the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceStatus {
    Created,
    Recreated,
    Reused,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Created => "created",
            WorkspaceStatus::Recreated => "recreated",
            WorkspaceStatus::Reused => "reused",
        }
    }
}

/// Makes `path` usable as a trial workspace.
///
/// A missing directory is created with its parents. An existing one is
/// deleted and recreated when `overwrite` is set, otherwise kept untouched so
/// repeated trials can reuse cached artifacts. Both existing-directory cases
/// log a warning. Nothing is ever removed at the end of a trial.
pub fn prepare_workspace(path: &Path, overwrite: bool) -> Result<WorkspaceStatus> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        return Ok(WorkspaceStatus::Created);
    }
    if !path.is_dir() {
        return Err(anyhow!(
            "workspace {} exists and is not a directory",
            path.display()
        ));
    }

    if overwrite {
        fs::remove_dir_all(path)?;
        fs::create_dir_all(path)?;
        warn!(
            workspace = %path.display(),
            "existing workspace deleted; set overwrite_workspace=false to keep it"
        );
        Ok(WorkspaceStatus::Recreated)
    } else {
        warn!(
            workspace = %path.display(),
            "workspace already exists; set overwrite_workspace=true to replace it"
        );
        Ok(WorkspaceStatus::Reused)
    }
}
