//! Repository driver: snapshot commits, branches, pushes, hard resets and clones.
//!
//! Everything runs through libgit2. A `Repository` is opened at the start of
//! each operation and dropped at its end; handles are never shared between
//! operations or threads.

use std::cell::Cell;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{
    BranchType, CertificateCheckStatus, ErrorCode, FetchOptions, IndexAddOption, Oid,
    PushOptions, RemoteCallbacks, Repository, ResetType, StatusOptions,
};
use thiserror::Error;

use crate::config::GitIdentity;
use crate::credentials::{CredentialError, CredentialProvider};

/// Remote every push goes to.
pub const ORIGIN: &str = "origin";

/// Errors returned by repository operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// The folder has no `.git` metadata.
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),
    #[error("clone of {url} failed: {source}")]
    Clone {
        url: String,
        #[source]
        source: git2::Error,
    },
    #[error("push of {branch} from {path} failed: {source}")]
    Push {
        path: PathBuf,
        branch: String,
        #[source]
        source: git2::Error,
    },
    #[error("reset of {path} to {branch} failed: {source}")]
    Reset {
        path: PathBuf,
        branch: String,
        #[source]
        source: git2::Error,
    },
    #[error("commit in {path} failed: {source}")]
    Commit {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },
    /// The ssh key pair could not be loaded for an auth challenge.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Why a push did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingFolder,
    NotARepository,
    NoChanges,
}

/// Result of a best-effort branch creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    Created,
    AlreadyExists,
    Failed(String),
}

/// Result of a snapshot commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Oid),
    /// Working tree matches `HEAD`; no commit was written.
    NoChanges,
}

/// Result of a composite push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Skipped(SkipReason),
    Pushed { commit: Oid, branch: BranchOutcome },
}

impl PushOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Validate that an owner or slug is usable as a URL and path segment.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings containing `/` or `\` (path separators)
/// - Strings starting with `-` or `.`
/// - Strings containing null bytes or control characters
pub fn validate_name(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!("{} cannot contain '..'", name)));
    }
    if value.contains('/') || value.contains('\\') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain path separators",
            name
        )));
    }
    if value.starts_with('-') || value.starts_with('.') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '{}'",
            name,
            &value[..1]
        )));
    }
    if value.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Validate a local branch name.
pub fn validate_branch(branch: &str) -> Result<(), GitError> {
    if branch.starts_with('-') {
        return Err(GitError::InvalidInput(
            "branch cannot start with '-'".to_string(),
        ));
    }
    if !git2::Reference::is_valid_name(&format!("refs/heads/{}", branch)) {
        return Err(GitError::InvalidInput(format!(
            "invalid branch name: {:?}",
            branch
        )));
    }
    Ok(())
}

/// Open the repository in `path`, mapping a missing `.git` to `NotARepository`.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    Repository::open(path).map_err(|e| {
        if e.code() == ErrorCode::NotFound {
            GitError::NotARepository(path.to_path_buf())
        } else {
            GitError::Git(e)
        }
    })
}

/// Whether the working tree differs from `HEAD` (tracked or untracked files).
fn has_changes(repo: &Repository) -> Result<bool, git2::Error> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    Ok(!repo.statuses(Some(&mut opts))?.is_empty())
}

/// Stage every new, modified and deleted path and commit it on top of `HEAD`.
fn commit_all(repo: &Repository, message: &str, author: &GitIdentity) -> Result<Oid, git2::Error> {
    let mut index = repo.index()?;
    index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"], None)?;
    index.write()?;
    let tree = repo.find_tree(index.write_tree()?)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => None,
        Err(e) => return Err(e),
    };
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

    let signature = author.signature()?;
    repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        message,
        &tree,
        &parents,
    )
}

fn branch_at(repo: &Repository, name: &str, at: Option<Oid>) -> BranchOutcome {
    let commit = match at {
        Some(oid) => repo.find_commit(oid),
        None => repo.head().and_then(|head| head.peel_to_commit()),
    };
    let commit = match commit {
        Ok(commit) => commit,
        Err(e) => return BranchOutcome::Failed(e.message().to_string()),
    };

    match repo.branch(name, &commit, false) {
        Ok(_) => BranchOutcome::Created,
        Err(e) if e.code() == ErrorCode::Exists => BranchOutcome::AlreadyExists,
        Err(e) => BranchOutcome::Failed(e.message().to_string()),
    }
}

/// Drives git operations for project folders under one workspace directory.
#[derive(Debug, Clone)]
pub struct RepoDriver {
    credentials: Arc<CredentialProvider>,
    remote_base: String,
    workspace_dir: PathBuf,
}

impl RepoDriver {
    pub fn new(
        credentials: Arc<CredentialProvider>,
        remote_base: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            credentials,
            remote_base: remote_base.into(),
            workspace_dir: workspace_dir.into(),
        }
    }

    /// `<remote_base>/<owner>/<slug>.git`
    pub fn remote_url(&self, owner: &str, slug: &str) -> Result<String, GitError> {
        validate_name(owner, "owner")?;
        validate_name(slug, "slug")?;
        Ok(format!(
            "{}/{}/{}.git",
            self.remote_base.trim_end_matches('/'),
            owner,
            slug
        ))
    }

    /// Canonical working copy of a slug.
    pub fn local_path(&self, slug: &str) -> PathBuf {
        self.workspace_dir.join(slug)
    }

    /// Callbacks for authenticated network operations.
    ///
    /// Keys are loaded on the first auth challenge, so local remotes never
    /// touch them. A second challenge on the same operation means the server
    /// refused the key; libgit2 would otherwise ask forever. A key that
    /// cannot be loaded is parked in `key_error` so the caller can report it
    /// instead of libgit2's flattened message.
    fn remote_callbacks<'a>(
        &'a self,
        key_error: &'a Cell<Option<CredentialError>>,
    ) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        let mut attempts = 0u32;
        callbacks.credentials(move |_url, username_from_url, _allowed| {
            attempts += 1;
            if attempts > 1 {
                return Err(git2::Error::from_str("ssh key was rejected by the remote"));
            }
            self.credentials.git_credential(username_from_url).map_err(|e| {
                let flat = git2::Error::from_str(&e.to_string());
                key_error.set(Some(e));
                flat
            })
        });
        // The sandbox only talks to its own git server.
        callbacks.certificate_check(|_cert, _host| Ok(CertificateCheckStatus::CertificateOk));
        callbacks
    }

    /// Commit the whole working tree of `path`.
    ///
    /// Returns `NoChanges` without writing anything when the tree matches `HEAD`.
    pub fn commit(
        &self,
        path: &Path,
        message: &str,
        author: &GitIdentity,
    ) -> Result<CommitOutcome, GitError> {
        let repo = open_repository(path)?;
        let wrap = |source| GitError::Commit {
            path: path.to_path_buf(),
            source,
        };

        if !has_changes(&repo).map_err(wrap)? {
            return Ok(CommitOutcome::NoChanges);
        }
        let oid = commit_all(&repo, message, author).map_err(wrap)?;
        log::info!("Committed {} in {}", oid, path.display());
        Ok(CommitOutcome::Committed(oid))
    }

    /// Create branch `name` at `at` (or `HEAD`). Never fails the caller.
    pub fn create_branch(&self, path: &Path, name: &str, at: Option<Oid>) -> BranchOutcome {
        match open_repository(path) {
            Ok(repo) => branch_at(&repo, name, at),
            Err(e) => BranchOutcome::Failed(e.to_string()),
        }
    }

    /// Snapshot the working tree and push it to `origin/<branch>`.
    ///
    /// Missing folders, folders without `.git` and clean trees are skipped.
    /// Any failure after the commit is written is returned as `Push`.
    pub fn push(
        &self,
        path: &Path,
        branch: &str,
        message: &str,
        author: &GitIdentity,
    ) -> Result<PushOutcome, GitError> {
        validate_branch(branch)?;

        if !path.exists() {
            log::info!("Folder {} does not exist, skipping push", path.display());
            return Ok(PushOutcome::Skipped(SkipReason::MissingFolder));
        }
        let repo = match open_repository(path) {
            Ok(repo) => repo,
            Err(GitError::NotARepository(_)) => {
                log::info!("{} is not a git repository, skipping push", path.display());
                return Ok(PushOutcome::Skipped(SkipReason::NotARepository));
            }
            Err(e) => return Err(e),
        };

        let commit_error = |source| GitError::Commit {
            path: path.to_path_buf(),
            source,
        };
        if !has_changes(&repo).map_err(commit_error)? {
            log::info!("No changes in {}, skipping push", path.display());
            return Ok(PushOutcome::Skipped(SkipReason::NoChanges));
        }
        let commit = commit_all(&repo, message, author).map_err(commit_error)?;

        let branch_outcome = branch_at(&repo, branch, Some(commit));
        match &branch_outcome {
            BranchOutcome::Created => log::debug!("Created branch {} at {}", branch, commit),
            BranchOutcome::AlreadyExists => log::debug!("Branch {} already exists", branch),
            BranchOutcome::Failed(reason) => {
                log::warn!("Could not create branch {} in {}: {}", branch, path.display(), reason)
            }
        }

        let key_error = Cell::new(None);
        if let Err(source) = self.push_branch(&repo, branch, &key_error) {
            return Err(match key_error.take() {
                Some(e) => GitError::Credential(e),
                None => GitError::Push {
                    path: path.to_path_buf(),
                    branch: branch.to_string(),
                    source,
                },
            });
        }
        log::info!("Pushed {} of {} at {}", branch, path.display(), commit);

        Ok(PushOutcome::Pushed {
            commit,
            branch: branch_outcome,
        })
    }

    fn push_branch(
        &self,
        repo: &Repository,
        branch: &str,
        key_error: &Cell<Option<CredentialError>>,
    ) -> Result<(), git2::Error> {
        let mut remote = repo.find_remote(ORIGIN)?;
        let mut callbacks = self.remote_callbacks(key_error);
        // Per-ref rejections are not errors to libgit2 unless reported here.
        callbacks.push_update_reference(|refname, status| match status {
            Some(reason) => Err(git2::Error::from_str(&format!(
                "remote rejected {}: {}",
                refname, reason
            ))),
            None => Ok(()),
        });

        let mut opts = PushOptions::new();
        opts.remote_callbacks(callbacks);
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        remote.push(&[refspec.as_str()], Some(&mut opts))
    }

    /// Reset index and working tree of `path` to the tip of local `branch`.
    pub fn hard_reset(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        let repo = open_repository(path)?;
        let wrap = |source| GitError::Reset {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            source,
        };

        let tip = repo
            .find_branch(branch, BranchType::Local)
            .and_then(|b| b.get().peel_to_commit())
            .map_err(wrap)?;
        repo.reset(tip.as_object(), ResetType::Hard, None)
            .map_err(wrap)?;
        log::info!("Reset {} to {} ({})", path.display(), branch, tip.id());
        Ok(())
    }

    /// Clone `<owner>/<slug>` into the slug's working copy and return its path.
    ///
    /// A partially created folder is removed when the clone fails.
    pub fn clone_repo(&self, owner: &str, slug: &str) -> Result<PathBuf, GitError> {
        let url = self.remote_url(owner, slug)?;
        let dest = self.local_path(slug);
        let dest_existed = dest.exists();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        log::info!("Cloning {} into {}", url, dest.display());
        let key_error = Cell::new(None);
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(self.remote_callbacks(&key_error));
        let result = git2::build::RepoBuilder::new()
            .fetch_options(fetch)
            .clone(&url, &dest);

        match result {
            Ok(_) => {
                log::info!("Cloned {}", url);
                Ok(dest)
            }
            Err(source) => {
                if !dest_existed {
                    let _ = std::fs::remove_dir_all(&dest);
                }
                match key_error.take() {
                    Some(e) => Err(GitError::Credential(e)),
                    None => Err(GitError::Clone { url, source }),
                }
            }
        }
    }
}
