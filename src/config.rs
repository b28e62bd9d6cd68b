//! Sandbox identity, runtime settings and the small config files the sandbox owns.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::DEFAULT_LOCK_TIMEOUT;
use crate::paths::SandboxPaths;
use crate::workspace::write_atomic;

/// Git server used when `GIT_SSH_HOST` is not set.
pub const DEFAULT_GIT_SSH_HOST: &str = "gitea.gitea.svc.cluster.local";

/// Local account used when `LOCAL_USER` is not set.
pub const DEFAULT_LOCAL_USER: &str = "coder";

/// Environment variable carrying a raw `sandbox.json` to install at startup.
pub const SANDBOX_JSON_ENV: &str = "sandbox.json";

const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Errors returned while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("git identity {path} has no {key}")]
    MissingGitIdentity { path: PathBuf, key: &'static str },
    #[error("failed to read git config: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Who this sandbox is. Fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxIdentity {
    pub id: String,
    pub local_user: String,
    pub home_dir: PathBuf,
}

impl SandboxIdentity {
    /// Read `SANDBOX_ID`, `LOCAL_USER` and `HOME_DIR` from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the identity from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let id = lookup("SANDBOX_ID")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingVar("SANDBOX_ID"))?;
        let local_user = lookup("LOCAL_USER")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LOCAL_USER.to_string());
        let home_dir = lookup("HOME_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/home").join(&local_user));

        Ok(Self {
            id,
            local_user,
            home_dir,
        })
    }

    /// Path layout rooted at this sandbox's home directory.
    pub fn paths(&self) -> SandboxPaths {
        SandboxPaths::new(&self.home_dir)
    }
}

/// Runtime settings for the sandbox core.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub identity: SandboxIdentity,
    /// Prefix of every remote URL, e.g. `ssh://git@host`.
    pub remote_base: String,
    /// Longest a fan-out join waits for its units.
    pub unit_timeout: Duration,
    /// Longest any manifest or folder lock is waited for.
    pub lock_timeout: Duration,
    /// Poll period of the manifest watcher.
    pub watch_interval: Duration,
}

/// Remote prefix for an ssh git host.
pub fn ssh_remote_base(host: &str) -> String {
    format!("ssh://git@{}", host)
}

impl SandboxConfig {
    /// Defaults for everything except the identity.
    pub fn new(identity: SandboxIdentity) -> Self {
        Self {
            identity,
            remote_base: ssh_remote_base(DEFAULT_GIT_SSH_HOST),
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            watch_interval: DEFAULT_WATCH_INTERVAL,
        }
    }

    /// Load identity and settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load identity and settings from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new(SandboxIdentity::from_lookup(&lookup)?);

        if let Some(host) = lookup("GIT_SSH_HOST").filter(|v| !v.is_empty()) {
            config.remote_base = ssh_remote_base(&host);
        }
        if let Some(raw) = lookup("SANDBOX_UNIT_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "SANDBOX_UNIT_TIMEOUT_SECS",
                value: raw.clone(),
            })?;
            config.unit_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Replace the remote prefix (e.g. a `file://` root in tests).
    pub fn with_remote_base(mut self, base: impl Into<String>) -> Self {
        self.remote_base = base.into();
        self
    }

    pub fn paths(&self) -> SandboxPaths {
        self.identity.paths()
    }
}

/// The `user` block of `sandbox.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
}

/// Contents of `.local/share/sandbox.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub sandbox: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    pub user: SandboxUser,
}

impl SandboxSettings {
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_vec(self)?;
        write_atomic(path, &json)?;
        Ok(())
    }
}

/// Install a raw `sandbox.json` handed over through the environment.
///
/// Returns true when a file was written.
pub fn install_sandbox_json(paths: &SandboxPaths, raw: Option<&str>) -> io::Result<bool> {
    let Some(raw) = raw else {
        return Ok(false);
    };
    write_atomic(&paths.sandbox_config(), raw.as_bytes())?;
    log::info!("Installed sandbox config at {}", paths.sandbox_config().display());
    Ok(true)
}

/// Commit author identity stored in `.gitconfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

fn quote_config_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

impl GitIdentity {
    /// Read `user.name` and `user.email` from a gitconfig file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = git2::Config::open(path)?;
        let get = |key: &'static str| {
            config
                .get_string(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingGitIdentity {
                    path: path.to_path_buf(),
                    key,
                })
        };

        Ok(Self {
            name: get("user.name")?,
            email: get("user.email")?,
        })
    }

    /// Render as a gitconfig `[user]` section.
    pub fn to_gitconfig(&self) -> String {
        format!(
            "[user]\n\tname = {}\n\temail = {}\n",
            quote_config_value(&self.name),
            quote_config_value(&self.email)
        )
    }

    /// A commit signature timestamped now.
    pub fn signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }

    /// Write the identity to `~/.gitconfig` and its mirror under `.local/share`.
    pub fn install(&self, paths: &SandboxPaths) -> io::Result<()> {
        let contents = self.to_gitconfig();
        write_atomic(&paths.gitconfig(), contents.as_bytes())?;
        write_atomic(&paths.gitconfig_mirror(), contents.as_bytes())?;
        Ok(())
    }
}

/// Restore `~/.gitconfig` from the mirrored copy when one exists.
///
/// The home directory may be recreated between sessions while `.local/share`
/// persists, so the mirror is the source of truth.
pub fn ensure_git_config(paths: &SandboxPaths) -> io::Result<bool> {
    let mirror = paths.gitconfig_mirror();
    if !mirror.exists() {
        return Ok(false);
    }
    let contents = std::fs::read(&mirror)?;
    write_atomic(&paths.gitconfig(), &contents)?;
    Ok(true)
}

/// Load the commit author, restoring the gitconfig from its mirror first.
pub fn load_git_identity(paths: &SandboxPaths) -> Result<GitIdentity, ConfigError> {
    ensure_git_config(paths)?;
    GitIdentity::load(&paths.gitconfig())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn identity_requires_sandbox_id() {
        let err = SandboxIdentity::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("SANDBOX_ID")));
    }

    #[test]
    fn identity_defaults_home_from_local_user() {
        let identity = SandboxIdentity::from_lookup(lookup_from(&[("SANDBOX_ID", "sb-1")])).unwrap();
        assert_eq!(identity.local_user, "coder");
        assert_eq!(identity.home_dir, PathBuf::from("/home/coder"));

        let identity = SandboxIdentity::from_lookup(lookup_from(&[
            ("SANDBOX_ID", "sb-1"),
            ("LOCAL_USER", "alice"),
        ]))
        .unwrap();
        assert_eq!(identity.home_dir, PathBuf::from("/home/alice"));
    }

    #[test]
    fn identity_prefers_explicit_home() {
        let identity = SandboxIdentity::from_lookup(lookup_from(&[
            ("SANDBOX_ID", "sb-1"),
            ("LOCAL_USER", "alice"),
            ("HOME_DIR", "/srv/sandbox"),
        ]))
        .unwrap();
        assert_eq!(identity.home_dir, PathBuf::from("/srv/sandbox"));
        assert_eq!(
            identity.paths().workspace_dir(),
            PathBuf::from("/srv/sandbox/workspace")
        );
    }

    #[test]
    fn config_reads_host_and_timeout() {
        let config = SandboxConfig::from_lookup(lookup_from(&[
            ("SANDBOX_ID", "sb-1"),
            ("GIT_SSH_HOST", "git.internal"),
            ("SANDBOX_UNIT_TIMEOUT_SECS", "42"),
        ]))
        .unwrap();
        assert_eq!(config.remote_base, "ssh://git@git.internal");
        assert_eq!(config.unit_timeout, Duration::from_secs(42));

        let config = SandboxConfig::from_lookup(lookup_from(&[("SANDBOX_ID", "sb-1")])).unwrap();
        assert_eq!(config.remote_base, "ssh://git@gitea.gitea.svc.cluster.local");
    }

    #[test]
    fn config_rejects_bad_timeout() {
        let err = SandboxConfig::from_lookup(lookup_from(&[
            ("SANDBOX_ID", "sb-1"),
            ("SANDBOX_UNIT_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn git_identity_round_trips_through_gitconfig() {
        let dir = tempdir().unwrap();
        let paths = SandboxPaths::new(dir.path());
        let identity = GitIdentity {
            name: "Ada \"The Countess\" Lovelace".into(),
            email: "ada@example.com".into(),
        };

        identity.install(&paths).unwrap();
        assert!(paths.gitconfig_mirror().exists());
        assert_eq!(GitIdentity::load(&paths.gitconfig()).unwrap(), identity);
    }

    #[test]
    fn ensure_git_config_restores_from_mirror() {
        let dir = tempdir().unwrap();
        let paths = SandboxPaths::new(dir.path());
        assert!(!ensure_git_config(&paths).unwrap());

        let identity = GitIdentity {
            name: "Grace Hopper".into(),
            email: "grace@example.com".into(),
        };
        identity.install(&paths).unwrap();
        std::fs::remove_file(paths.gitconfig()).unwrap();

        assert_eq!(load_git_identity(&paths).unwrap(), identity);
    }

    #[test]
    fn missing_email_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".gitconfig");
        std::fs::write(&path, "[user]\n\tname = Someone\n").unwrap();

        let err = GitIdentity::load(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingGitIdentity {
                key: "user.email",
                ..
            }
        ));
    }

    #[test]
    fn sandbox_settings_use_wire_field_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sandbox.json");
        let settings = SandboxSettings {
            sandbox: "sb-1".into(),
            domain: Some("example.com".into()),
            token: None,
            organization: Some("org-1".into()),
            user: SandboxUser {
                id: "u1".into(),
                email: "u1@example.com".into(),
            },
        };
        settings.write(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["user"]["_id"], "u1");
        assert_eq!(raw["sandbox"], "sb-1");
        let back: SandboxSettings = serde_json::from_value(raw).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn install_sandbox_json_writes_raw_content() {
        let dir = tempdir().unwrap();
        let paths = SandboxPaths::new(dir.path());

        assert!(!install_sandbox_json(&paths, None).unwrap());
        assert!(install_sandbox_json(&paths, Some("{\"sandbox\":\"x\"}")).unwrap());
        assert_eq!(
            std::fs::read_to_string(paths.sandbox_config()).unwrap(),
            "{\"sandbox\":\"x\"}"
        );
    }
}
