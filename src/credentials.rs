//! SSH key credentials for outbound git operations.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::SandboxPaths;

/// User name presented to the git ssh server.
pub const SSH_USER: &str = "git";

/// Errors returned while loading the key pair.
#[derive(Error, Debug)]
pub enum CredentialError {
    /// A key file is missing or unreadable.
    #[error("failed to load ssh key {path}: {source}")]
    KeyLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// libgit2 refused the loaded key material.
    #[error("failed to build ssh credential: {0}")]
    Ssh(#[from] git2::Error),
}

/// An ssh key pair held in memory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

fn read_key(path: &Path) -> Result<String, CredentialError> {
    std::fs::read_to_string(path).map_err(|source| CredentialError::KeyLoad {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the sandbox key pair on first use and keeps it for the process lifetime.
///
/// Built once at startup and shared with every git operation that needs
/// authentication. There is no reload: a new key pair needs a restart.
#[derive(Debug)]
pub struct CredentialProvider {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
    keys: OnceLock<KeyPair>,
}

impl CredentialProvider {
    /// Provider reading the fixed key locations under the sandbox home.
    pub fn new(paths: &SandboxPaths) -> Self {
        Self {
            private_key_path: paths.private_key(),
            public_key_path: paths.public_key(),
            keys: OnceLock::new(),
        }
    }

    /// Return the cached key pair, reading both files on the first call.
    pub fn key_pair(&self) -> Result<&KeyPair, CredentialError> {
        if let Some(keys) = self.keys.get() {
            return Ok(keys);
        }

        let private_key = read_key(&self.private_key_path)?;
        let public_key = read_key(&self.public_key_path)?;
        log::debug!("Loaded ssh key pair from {}", self.private_key_path.display());

        // A concurrent first call may have won the race; either pair came
        // from the same files.
        Ok(self.keys.get_or_init(|| KeyPair {
            public_key,
            private_key,
        }))
    }

    /// Seed the cache with a pair handed in by the caller.
    ///
    /// Returns false when a pair was already cached; the cached pair is kept.
    pub fn prime(&self, keys: KeyPair) -> bool {
        self.keys.set(keys).is_ok()
    }

    /// Build a libgit2 ssh credential from the cached pair.
    pub fn git_credential(&self, username: Option<&str>) -> Result<git2::Cred, CredentialError> {
        let keys = self.key_pair()?;
        Ok(git2::Cred::ssh_key_from_memory(
            username.unwrap_or(SSH_USER),
            Some(&keys.public_key),
            &keys.private_key,
            None,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_keys(paths: &SandboxPaths, private: &str, public: &str) {
        std::fs::create_dir_all(paths.ssh_dir()).unwrap();
        std::fs::write(paths.private_key(), private).unwrap();
        std::fs::write(paths.public_key(), public).unwrap();
    }

    #[test]
    fn missing_keys_fail_with_key_load() {
        let dir = tempdir().unwrap();
        let provider = CredentialProvider::new(&SandboxPaths::new(dir.path()));

        let err = provider.key_pair().unwrap_err();
        let CredentialError::KeyLoad { path, .. } = err else {
            panic!("expected KeyLoad, got {:?}", err);
        };
        assert!(path.ends_with("id_rsa"));
    }

    #[test]
    fn missing_public_key_fails() {
        let dir = tempdir().unwrap();
        let paths = SandboxPaths::new(dir.path());
        std::fs::create_dir_all(paths.ssh_dir()).unwrap();
        std::fs::write(paths.private_key(), "PRIVATE").unwrap();

        let provider = CredentialProvider::new(&paths);
        let err = provider.key_pair().unwrap_err();
        let CredentialError::KeyLoad { path, .. } = err else {
            panic!("expected KeyLoad, got {:?}", err);
        };
        assert!(path.ends_with("id_rsa.pub"));
    }

    #[test]
    fn keys_are_read_once_and_cached() {
        let dir = tempdir().unwrap();
        let paths = SandboxPaths::new(dir.path());
        write_keys(&paths, "PRIVATE-1", "PUBLIC-1");

        let provider = CredentialProvider::new(&paths);
        assert_eq!(provider.key_pair().unwrap().private_key, "PRIVATE-1");

        // Rewriting or removing the files does not affect the cached pair.
        write_keys(&paths, "PRIVATE-2", "PUBLIC-2");
        std::fs::remove_file(paths.private_key()).unwrap();
        let keys = provider.key_pair().unwrap();
        assert_eq!(keys.private_key, "PRIVATE-1");
        assert_eq!(keys.public_key, "PUBLIC-1");
    }

    #[test]
    fn prime_only_fills_an_empty_cache() {
        let dir = tempdir().unwrap();
        let provider = CredentialProvider::new(&SandboxPaths::new(dir.path()));

        assert!(provider.prime(KeyPair {
            public_key: "pub".into(),
            private_key: "priv".into(),
        }));
        assert!(!provider.prime(KeyPair {
            public_key: "other".into(),
            private_key: "other".into(),
        }));
        assert_eq!(provider.key_pair().unwrap().public_key, "pub");
    }

    #[test]
    fn debug_output_hides_private_key() {
        let keys = KeyPair {
            public_key: "ssh-rsa AAA".into(),
            private_key: "-----BEGIN SECRET".into(),
        };
        let rendered = format!("{:?}", keys);
        assert!(rendered.contains("ssh-rsa AAA"));
        assert!(!rendered.contains("BEGIN SECRET"));
    }
}
