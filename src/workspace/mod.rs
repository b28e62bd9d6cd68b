//! Workspace manifest and project record store.
//!
//! Every read-modify-write cycle on either file runs under that file's lock
//! so concurrent writers (the orchestrator and the reconciler, or two
//! processes) cannot lose each other's updates. Files are replaced
//! atomically, so lock-free readers always see a complete document.

mod atomic;
mod manifest;
mod projects;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::lock::FileLock;
use crate::paths::SandboxPaths;

pub use atomic::write_atomic;
pub use manifest::{WorkspaceFolder, WorkspaceManifest};
pub use projects::{APP_PROJECT_TYPE, AppMarker, ProjectRecord, SanitizeStats, dedupe_projects};

/// Errors reading, writing or locking the manifest files.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ManifestError + '_ {
    move |source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_error(path: &Path) -> impl FnOnce(serde_json::Error) -> ManifestError + '_ {
    move |source| ManifestError::Json {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a file, returning `None` when it does not exist.
fn read_file(path: &Path) -> Result<Option<Vec<u8>>, ManifestError> {
    match std::fs::read(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path)(e)),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ManifestError> {
    read_file(path)?
        .map(|raw| serde_json::from_slice(&raw).map_err(json_error(path)))
        .transpose()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ManifestError> {
    let raw = serde_json::to_vec(value).map_err(json_error(path))?;
    write_atomic(path, &raw).map_err(io_error(path))
}

/// Store for the workspace manifest and the project record list.
#[derive(Debug, Clone)]
pub struct Workspace {
    paths: SandboxPaths,
    lock_timeout: Duration,
}

impl Workspace {
    pub fn new(paths: SandboxPaths, lock_timeout: Duration) -> Self {
        Self {
            paths,
            lock_timeout,
        }
    }

    pub fn paths(&self) -> &SandboxPaths {
        &self.paths
    }

    fn lock(&self, path: &Path) -> Result<FileLock, ManifestError> {
        FileLock::acquire(path, self.lock_timeout).map_err(|source| ManifestError::Lock {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_manifest_file(&self) -> Result<Option<WorkspaceManifest>, ManifestError> {
        let path = self.paths.workspace_file();
        read_file(&path)?
            .map(|raw| WorkspaceManifest::from_json(&raw).map_err(json_error(&path)))
            .transpose()
    }

    fn write_manifest_file(&self, manifest: &WorkspaceManifest) -> Result<(), ManifestError> {
        let path = self.paths.workspace_file();
        let raw = manifest.to_json().map_err(json_error(&path))?;
        write_atomic(&path, raw.as_bytes()).map_err(io_error(&path))
    }

    /// Read the manifest. A missing file is an empty manifest.
    pub fn load_manifest(&self) -> Result<WorkspaceManifest, ManifestError> {
        Ok(self.read_manifest_file()?.unwrap_or_default())
    }

    /// Read the manifest, failing if the file does not exist.
    pub fn read_existing_manifest(&self) -> Result<WorkspaceManifest, ManifestError> {
        self.read_manifest_file()?.ok_or_else(|| ManifestError::Io {
            path: self.paths.workspace_file(),
            source: io::Error::new(io::ErrorKind::NotFound, "workspace manifest not found"),
        })
    }

    /// Overwrite the manifest.
    pub fn write_manifest(&self, manifest: &WorkspaceManifest) -> Result<(), ManifestError> {
        let _guard = self.lock(&self.paths.workspace_lock())?;
        self.write_manifest_file(manifest)
    }

    /// Read-modify-write the manifest under its lock.
    ///
    /// `update` returns whether it changed anything; unchanged manifests are
    /// not rewritten.
    pub fn update_manifest<R>(
        &self,
        update: impl FnOnce(&mut WorkspaceManifest) -> (bool, R),
    ) -> Result<R, ManifestError> {
        let _guard = self.lock(&self.paths.workspace_lock())?;
        let mut manifest = self.load_manifest()?;
        let (changed, result) = update(&mut manifest);
        if changed {
            self.write_manifest_file(&manifest)?;
        }
        Ok(result)
    }

    /// Add a folder to the manifest. Returns false if it was already listed.
    pub fn add_folder(&self, path: &str) -> Result<bool, ManifestError> {
        let added = self.update_manifest(|manifest| {
            let added = manifest.add_folder(path);
            (added, added)
        })?;
        if added {
            log::info!("Added project to workspace: {}", path);
        }
        Ok(added)
    }

    /// Folder paths in manifest order.
    pub fn list_folders(&self) -> Result<Vec<String>, ManifestError> {
        Ok(self.load_manifest()?.folder_paths())
    }

    /// Read the project records. A missing file is an empty list.
    pub fn load_projects(&self) -> Result<Vec<ProjectRecord>, ManifestError> {
        Ok(read_json(&self.paths.projects_file())?.unwrap_or_default())
    }

    /// Overwrite the project records.
    pub fn write_projects(&self, projects: &[ProjectRecord]) -> Result<(), ManifestError> {
        let _guard = self.lock(&self.paths.projects_lock())?;
        write_json(&self.paths.projects_file(), &projects)
    }

    /// Read-modify-write the project records under their lock.
    pub fn update_projects<R>(
        &self,
        update: impl FnOnce(&mut Vec<ProjectRecord>) -> (bool, R),
    ) -> Result<R, ManifestError> {
        let _guard = self.lock(&self.paths.projects_lock())?;
        let mut projects = self.load_projects()?;
        let (changed, result) = update(&mut projects);
        if changed {
            write_json(&self.paths.projects_file(), &projects)?;
        }
        Ok(result)
    }

    /// Append a project unless a record with its `_id` exists. Returns true when added.
    pub fn register_project(&self, project: &ProjectRecord) -> Result<bool, ManifestError> {
        let id = project.id().map(str::to_string);
        self.update_projects(|projects| {
            let exists = projects.iter().any(|p| p.id().is_some() && p.id() == id.as_deref());
            if exists {
                return (false, false);
            }
            projects.push(project.clone());
            (true, true)
        })
    }

    /// Remove every record whose slug is `slug`. Returns how many were removed.
    pub fn remove_projects_by_slug(&self, slug: &str) -> Result<usize, ManifestError> {
        self.update_projects(|projects| {
            let before = projects.len();
            projects.retain(|p| p.slug() != Some(slug));
            let removed = before - projects.len();
            (removed > 0, removed)
        })
    }

    /// Repair the project list: drop records without `_id` and repeated `_id`s.
    ///
    /// The file is always rewritten, which also normalizes its formatting.
    pub fn sanitize_projects(&self) -> Result<SanitizeStats, ManifestError> {
        let stats = self.update_projects(|projects| {
            let (kept, stats) = dedupe_projects(std::mem::take(projects));
            *projects = kept;
            (true, stats)
        })?;
        if stats.missing_id + stats.duplicates > 0 {
            log::info!(
                "Sanitized project list: kept {}, dropped {} without _id, {} duplicates",
                stats.kept,
                stats.missing_id,
                stats.duplicates
            );
        }
        Ok(stats)
    }
}
