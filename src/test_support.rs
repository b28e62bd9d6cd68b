//! Fixtures shared by the unit tests: seeded bare remotes and sandbox homes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use git2::{Repository, RepositoryInitOptions, Signature};
use tempfile::TempDir;

use crate::config::{GitIdentity, SandboxConfig, SandboxIdentity};
use crate::orchestrator::{Sandbox, StatusUpdate};

pub const TEST_SANDBOX_ID: &str = "sb-test";

pub fn author() -> GitIdentity {
    GitIdentity {
        name: "Test Author".into(),
        email: "author@example.com".into(),
    }
}

/// `file://` prefix so remote URLs resolve to `<root>/<owner>/<slug>.git`.
pub fn file_remote_base(root: &Path) -> String {
    format!("file://{}", root.display())
}

/// Create a bare remote at `<root>/<owner>/<slug>.git` with one commit on `main`.
pub fn init_remote(root: &Path, owner: &str, slug: &str) -> PathBuf {
    let path = root.join(owner).join(format!("{}.git", slug));
    let mut opts = RepositoryInitOptions::new();
    opts.bare(true).initial_head("main");
    let repo = Repository::init_opts(&path, &opts).unwrap();

    let sig = Signature::now("Seed", "seed@example.com").unwrap();
    let blob = repo.blob(format!("# {}\n", slug).as_bytes()).unwrap();
    let mut builder = repo.treebuilder(None).unwrap();
    builder.insert("README.md", blob, 0o100644).unwrap();
    let tree = repo.find_tree(builder.write().unwrap()).unwrap();
    repo.commit(Some("refs/heads/main"), &sig, &sig, "Initial commit", &tree, &[])
        .unwrap();
    path
}

/// Number of commits reachable from `refname`.
pub fn commit_count(repo_path: &Path, refname: &str) -> usize {
    let repo = Repository::open(repo_path).unwrap();
    let oid = repo.revparse_single(refname).unwrap().id();
    let mut walk = repo.revwalk().unwrap();
    walk.push(oid).unwrap();
    walk.count()
}

/// Message of the commit at the tip of `branch`, if the branch exists.
pub fn branch_tip_message(repo_path: &Path, branch: &str) -> Option<String> {
    let repo = Repository::open(repo_path).unwrap();
    let commit = repo
        .find_reference(&format!("refs/heads/{}", branch))
        .ok()?
        .peel_to_commit()
        .ok()?;
    commit.message().map(str::to_string)
}

/// Names of all branches in a (bare) repository.
pub fn branch_names(repo_path: &Path) -> Vec<String> {
    let repo = Repository::open(repo_path).unwrap();
    let mut names: Vec<String> = repo
        .branches(Some(git2::BranchType::Local))
        .unwrap()
        .map(|b| b.unwrap().0.name().unwrap().unwrap().to_string())
        .collect();
    names.sort();
    names
}

/// A sandbox rooted in a temp dir, cloning from bare remotes under `remotes`.
pub struct TestSandbox {
    pub dir: TempDir,
    pub remotes: PathBuf,
    pub sandbox: Sandbox,
    pub statuses: Receiver<StatusUpdate>,
}

impl TestSandbox {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let remotes = dir.path().join("remotes");
        let identity = SandboxIdentity {
            id: TEST_SANDBOX_ID.into(),
            local_user: "coder".into(),
            home_dir: dir.path().join("home"),
        };
        let mut config =
            SandboxConfig::new(identity).with_remote_base(file_remote_base(&remotes));
        config.unit_timeout = Duration::from_secs(60);
        config.lock_timeout = Duration::from_secs(10);

        let (tx, statuses) = crossbeam_channel::unbounded();
        let sandbox = Sandbox::new(config, Arc::new(tx));
        author().install(sandbox.paths()).unwrap();

        Self {
            dir,
            remotes,
            sandbox,
            statuses,
        }
    }

    pub fn remote(&self, owner: &str, slug: &str) -> PathBuf {
        init_remote(&self.remotes, owner, slug)
    }

    pub fn project_dir(&self, slug: &str) -> PathBuf {
        self.sandbox.paths().project_dir(slug)
    }
}
