//! Sandbox Orchestrator: project loading, commits and backups across folders.
//!
//! Per-folder work (push then hard reset, or a backup push) runs as one unit
//! on its own thread while holding that folder's lock, so a manual commit and
//! a shutdown backup never interleave on the same working copy.

mod fanout;
mod setup;
mod status;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{
    GitIdentity, SandboxConfig, ensure_git_config, install_sandbox_json, load_git_identity,
};
use crate::credentials::CredentialProvider;
use crate::error::SandboxError;
use crate::git::{PushOutcome, RepoDriver, validate_branch, validate_name};
use crate::lock::FileLock;
use crate::paths::SandboxPaths;
use crate::protocol::{ActiveProjectsResult, CommitResult};
use crate::workspace::{ProjectRecord, Workspace, write_atomic};

pub use fanout::FanOut;
pub use setup::{verify_ssh_mode, write_key_pair};
pub use status::{
    JsonLinesStatusChannel, LogStatusChannel, STATUS_GROUPS, SandboxStatus, StatusChannel,
    StatusError, StatusUpdate,
};

/// Commit message of every shutdown backup.
pub const BACKUP_COMMIT_MESSAGE: &str = "Backup changes";

/// Branch all folders are backed up to when shutting down at `at`.
pub fn backup_branch_name(at: DateTime<Utc>) -> String {
    at.format("backup-%Y-%m-%d-%H-%M-%S").to_string()
}

fn lock_folder(paths: &SandboxPaths, folder: &str, timeout: Duration) -> Result<FileLock, SandboxError> {
    Ok(FileLock::acquire(&paths.folder_lock(folder), timeout)?)
}

/// Everything a per-folder unit needs, cloned onto its thread.
#[derive(Clone)]
struct FolderJob {
    driver: RepoDriver,
    paths: SandboxPaths,
    author: GitIdentity,
    lock_timeout: Duration,
}

impl FolderJob {
    /// Push `branch` and reset the working copy to it.
    fn commit(&self, folder: &str, branch: &str, message: &str) -> Result<PushOutcome, SandboxError> {
        let _guard = lock_folder(&self.paths, folder, self.lock_timeout)?;
        let path = self.paths.project_dir(folder);
        log::info!("Saving {}", path.display());

        let outcome = self.driver.push(&path, branch, message, &self.author)?;
        if !outcome.is_skipped() {
            self.driver.hard_reset(&path, branch)?;
        }
        Ok(outcome)
    }

    fn backup(&self, folder: &str, branch: &str) -> Result<PushOutcome, SandboxError> {
        let _guard = lock_folder(&self.paths, folder, self.lock_timeout)?;
        let path = self.paths.project_dir(folder);
        log::info!("Backing up {} to {}", path.display(), branch);

        Ok(self
            .driver
            .push(&path, branch, BACKUP_COMMIT_MESSAGE, &self.author)?)
    }
}

/// Top-level coordinator of one sandbox.
#[derive(Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    paths: SandboxPaths,
    workspace: Workspace,
    credentials: Arc<CredentialProvider>,
    driver: RepoDriver,
    status: Arc<dyn StatusChannel>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, status: Arc<dyn StatusChannel>) -> Self {
        let paths = config.paths();
        let credentials = Arc::new(CredentialProvider::new(&paths));
        let driver = RepoDriver::new(
            Arc::clone(&credentials),
            config.remote_base.clone(),
            paths.workspace_dir(),
        );
        let workspace = Workspace::new(paths.clone(), config.lock_timeout);

        Self {
            config,
            paths,
            workspace,
            credentials,
            driver,
            status,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn paths(&self) -> &SandboxPaths {
        &self.paths
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn credentials(&self) -> &Arc<CredentialProvider> {
        &self.credentials
    }

    /// Best-effort repairs run once at process start. Failures are logged only.
    pub fn startup(&self, sandbox_json: Option<&str>) {
        if let Err(e) = install_sandbox_json(&self.paths, sandbox_json) {
            log::error!("Failed to install sandbox config: {}", e);
        }
        if let Err(e) = verify_ssh_mode(&self.paths) {
            log::error!("Failed to restrict ssh key permissions: {}", e);
        }
        match ensure_git_config(&self.paths) {
            Ok(true) => log::debug!("Restored .gitconfig from mirror"),
            Ok(false) => {}
            Err(e) => log::error!("Failed to restore .gitconfig: {}", e),
        }
        if let Err(e) = self.workspace.sanitize_projects() {
            log::warn!("Failed to sanitize saved projects: {}", e);
        }
    }

    fn publish(&self, status: SandboxStatus) {
        let update = StatusUpdate {
            sandbox_id: self.config.identity.id.clone(),
            status,
        };
        match self.status.publish(&update, STATUS_GROUPS) {
            Ok(()) => log::info!("Sent {:?} for sandbox {}", status, update.sandbox_id),
            Err(e) => log::error!("Failed to send {:?}: {}", status, e),
        }
    }

    /// Announce that the sandbox is up. Fire-and-forget.
    pub fn set_running_status(&self) {
        self.publish(SandboxStatus::Running);
    }

    fn folder_job(&self, author: GitIdentity) -> FolderJob {
        FolderJob {
            driver: self.driver.clone(),
            paths: self.paths.clone(),
            author,
            lock_timeout: self.config.lock_timeout,
        }
    }

    /// Clone the repository for `slug` unless its folder exists, then list it
    /// in the workspace. Runs under the folder's lock.
    fn open_project_folder(&self, owner: &str, slug: &str) -> Result<FileLock, SandboxError> {
        validate_name(slug, "slug")?;
        let guard = lock_folder(&self.paths, slug, self.config.lock_timeout)?;

        let path = self.paths.project_dir(slug);
        if path.exists() {
            log::info!("{} already exists, adding to workspace", path.display());
        } else {
            self.driver.clone_repo(owner, slug)?;
            log::info!("Cloned {}/{}", owner, slug);
        }
        self.workspace.add_folder(slug)?;
        Ok(guard)
    }

    /// Register, clone (once) and open a project.
    pub fn load_project(&self, owner: &str, project: ProjectRecord) -> Result<(), SandboxError> {
        let slug = project.slug().unwrap_or_default().to_string();
        self.try_load_project(owner, project).map_err(|e| {
            log::error!("Failed to load project {}: {}", slug, e);
            SandboxError::Load {
                slug,
                source: Box::new(e),
            }
        })
    }

    fn try_load_project(&self, owner: &str, mut project: ProjectRecord) -> Result<(), SandboxError> {
        let slug = project
            .slug()
            .ok_or_else(|| SandboxError::InvalidProject("project has no slug".into()))?
            .to_string();
        let id = project
            .id()
            .ok_or_else(|| SandboxError::InvalidProject(format!("project {} has no _id", slug)))?
            .to_string();
        validate_name(&slug, "slug")?;

        project.strip_transient();
        if self.workspace.register_project(&project)? {
            log::info!("Added project to list [{}] {}", id, slug);
        }

        let _guard = self.open_project_folder(owner, &slug)?;

        if let Some(marker) = project.app_marker() {
            let path = self.paths.project_dir(&slug).join(marker.file_name());
            let contents = serde_json::to_vec(&marker).map_err(io::Error::from)?;
            write_atomic(&path, &contents)?;
        }

        log::info!(
            "Loaded {} {} {}",
            slug,
            project.project_type.as_deref().unwrap_or("-"),
            project.language.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    /// Folders currently open in the workspace.
    pub fn active_projects(&self) -> ActiveProjectsResult {
        match self.workspace.read_existing_manifest() {
            Ok(manifest) => ActiveProjectsResult::active(manifest.folder_paths()),
            Err(e) => {
                log::error!("Failed to read active projects: {}", e);
                ActiveProjectsResult::failed()
            }
        }
    }

    /// Push every selected folder to `branch` and reset it to the pushed tip.
    ///
    /// `project_slug` selects one folder; `None` or an empty slug selects all
    /// of them. Units run concurrently and are all awaited; any failure fails
    /// the whole call.
    pub fn commit_project(
        &self,
        branch: &str,
        message: &str,
        project_slug: Option<&str>,
    ) -> CommitResult {
        match self.try_commit_project(branch, message, project_slug) {
            Ok(()) => CommitResult::success("Commit Successful"),
            Err(e) => {
                log::error!("Commit to {} failed: {}", branch, e);
                CommitResult::error(format!("Commit failed: {}", e))
            }
        }
    }

    fn try_commit_project(
        &self,
        branch: &str,
        message: &str,
        project_slug: Option<&str>,
    ) -> Result<(), SandboxError> {
        // An empty slug means every folder.
        let project_slug = project_slug.filter(|slug| !slug.is_empty());
        validate_branch(branch)?;
        let manifest = self.workspace.read_existing_manifest()?;
        let author = load_git_identity(&self.paths)?;

        let folders: Vec<String> = manifest
            .folder_paths()
            .into_iter()
            .filter(|folder| project_slug.is_none_or(|slug| folder == slug))
            .collect();
        if let (Some(slug), true) = (project_slug, folders.is_empty()) {
            log::warn!("{} is not in the workspace, nothing to commit", slug);
        }

        let job = self.folder_job(author);
        let units = folders.into_iter().map(|folder| {
            let job = job.clone();
            let branch = branch.to_string();
            let message = message.to_string();
            (folder.clone(), move || job.commit(&folder, &branch, &message))
        });

        let mut first_error = None;
        for (folder, result) in FanOut::spawn(units).settle(self.config.unit_timeout) {
            match result {
                Ok(outcome) => log::info!("Saved {}: {:?}", folder, outcome),
                Err(e) => {
                    log::error!("Saving {} failed: {}", folder, e);
                    first_error.get_or_insert(e.in_unit(folder));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Push every workspace folder to one fresh backup branch and return its name.
    ///
    /// With `force` unset or `true`, per-folder failures are logged and
    /// swallowed after all folders settle. With `force == Some(false)` the
    /// first failure is returned without waiting for the remaining folders.
    pub fn backup(&self, force: Option<bool>) -> Result<String, SandboxError> {
        let manifest = self.workspace.read_existing_manifest()?;
        let author = load_git_identity(&self.paths)?;
        let branch = backup_branch_name(Utc::now());
        validate_branch(&branch)?;

        let job = self.folder_job(author);
        let units = manifest.folder_paths().into_iter().map(|folder| {
            let job = job.clone();
            let branch = branch.clone();
            (folder.clone(), move || job.backup(&folder, &branch))
        });
        let fan_out = FanOut::spawn(units);
        log::info!("Backing up {} folders to {}", fan_out.len(), branch);

        if force.unwrap_or(true) {
            for (folder, result) in fan_out.settle(self.config.unit_timeout) {
                if let Err(e) = result {
                    log::error!("Error saving {}, continuing: {}", folder, e);
                }
            }
        } else {
            fan_out.fail_fast(self.config.unit_timeout)?;
        }
        Ok(branch)
    }

    /// Back up all folders and broadcast the final status.
    ///
    /// This is the last thing the sandbox does; nothing may be assumed to run
    /// after it.
    pub fn shutdown(&self, force: Option<bool>) -> SandboxStatus {
        log::info!("Shutting down");
        let status = match self.backup(force) {
            Ok(branch) => {
                log::info!("Backup to {} complete", branch);
                SandboxStatus::ShuttingDownReady
            }
            Err(e) => {
                log::error!("Backup before shutdown failed: {}", e);
                SandboxStatus::ShuttingDownError
            }
        };
        self.publish(status);
        status
    }
}
