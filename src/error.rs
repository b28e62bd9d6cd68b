use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::git::GitError;
use crate::workspace::ManifestError;

/// Errors surfaced by sandbox operations.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error(transparent)]
    Git(GitError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The ssh key pair could not be loaded.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Identity, `sandbox.json` or `.gitconfig` problems.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to load project {slug}: {source}")]
    Load {
        slug: String,
        #[source]
        source: Box<SandboxError>,
    },

    #[error("invalid project: {0}")]
    InvalidProject(String),

    /// A per-folder unit failed inside a fan-out.
    #[error("{label}: {source}")]
    Unit {
        label: String,
        #[source]
        source: Box<SandboxError>,
    },

    #[error("{label} did not finish within {timeout:?}")]
    TimedOut { label: String, timeout: Duration },

    /// The unit's thread ended without reporting (it panicked).
    #[error("{0} stopped without reporting a result")]
    UnitLost(String),
}

impl SandboxError {
    /// Attach the folder a fan-out unit was working on.
    pub fn in_unit(self, label: impl Into<String>) -> Self {
        Self::Unit {
            label: label.into(),
            source: Box::new(self),
        }
    }
}

/// Key loading failures keep their own variant even when a git operation
/// hit them.
impl From<GitError> for SandboxError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::Credential(e) => Self::Credential(e),
            other => Self::Git(other),
        }
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
