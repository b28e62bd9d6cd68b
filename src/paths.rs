//! Sandbox home directory path management
//!
//! This module provides the `SandboxPaths` struct which manages every fixed
//! location the sandbox reads or writes under the home directory:
//!
//! ```text
//! <home>/
//! ├── .ssh/
//! │   ├── id_rsa                    # private key (0400)
//! │   └── id_rsa.pub                # public key (0400)
//! ├── .gitconfig                    # git identity used for commits
//! ├── workspace/
//! │   ├── workspace.code-workspace  # {folders, settings}
//! │   └── <slug>/                   # one working copy per project
//! └── .local/share/
//!     ├── projects.json             # loaded project records
//!     ├── sandbox.json              # sandbox identity config
//!     ├── .gitconfig                # mirrored git identity
//!     └── locks/
//!         ├── workspace.lock
//!         ├── projects.lock
//!         └── folder-<slug>.lock
//! ```

use std::path::PathBuf;

/// Manages all filesystem paths rooted at the sandbox home directory
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    home: PathBuf,
}

impl SandboxPaths {
    /// Creates a new SandboxPaths rooted at the given home directory
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Returns the ssh directory: `{home}/.ssh`
    pub fn ssh_dir(&self) -> PathBuf {
        self.home.join(".ssh")
    }

    /// Returns the private key path: `{home}/.ssh/id_rsa`
    pub fn private_key(&self) -> PathBuf {
        self.ssh_dir().join("id_rsa")
    }

    /// Returns the public key path: `{home}/.ssh/id_rsa.pub`
    pub fn public_key(&self) -> PathBuf {
        self.ssh_dir().join("id_rsa.pub")
    }

    /// Returns the root of all project working copies: `{home}/workspace`
    pub fn workspace_dir(&self) -> PathBuf {
        self.home.join("workspace")
    }

    /// Returns the workspace manifest path: `{home}/workspace/workspace.code-workspace`
    pub fn workspace_file(&self) -> PathBuf {
        self.workspace_dir().join("workspace.code-workspace")
    }

    /// Returns the working copy of a project: `{home}/workspace/{slug}`
    pub fn project_dir(&self, slug: &str) -> PathBuf {
        self.workspace_dir().join(slug)
    }

    /// Returns the shared data directory: `{home}/.local/share`
    pub fn share_dir(&self) -> PathBuf {
        self.home.join(".local").join("share")
    }

    /// Returns the project record list: `{home}/.local/share/projects.json`
    pub fn projects_file(&self) -> PathBuf {
        self.share_dir().join("projects.json")
    }

    /// Returns the sandbox config: `{home}/.local/share/sandbox.json`
    pub fn sandbox_config(&self) -> PathBuf {
        self.share_dir().join("sandbox.json")
    }

    /// Returns the git identity file: `{home}/.gitconfig`
    pub fn gitconfig(&self) -> PathBuf {
        self.home.join(".gitconfig")
    }

    /// Returns the mirrored git identity: `{home}/.local/share/.gitconfig`
    pub fn gitconfig_mirror(&self) -> PathBuf {
        self.share_dir().join(".gitconfig")
    }

    /// Returns the lock directory: `{home}/.local/share/locks`
    pub fn locks_dir(&self) -> PathBuf {
        self.share_dir().join("locks")
    }

    /// Lock guarding read-modify-write cycles of the workspace manifest
    pub fn workspace_lock(&self) -> PathBuf {
        self.locks_dir().join("workspace.lock")
    }

    /// Lock guarding read-modify-write cycles of the project list
    pub fn projects_lock(&self) -> PathBuf {
        self.locks_dir().join("projects.lock")
    }

    /// Lock serializing git work on one project folder
    ///
    /// Separators in nested folder paths are flattened to `_`.
    pub fn folder_lock(&self, slug: &str) -> PathBuf {
        let name = slug.replace(['/', '\\'], "_");
        self.locks_dir().join(format!("folder-{}.lock", name))
    }
}
