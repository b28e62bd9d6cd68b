//! First-time user setup and ssh key housekeeping.

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;

use crate::config::{GitIdentity, SandboxSettings, SandboxUser};
use crate::credentials::KeyPair;
use crate::error::SandboxError;
use crate::paths::SandboxPaths;
use crate::protocol::SetupUserRequest;

use super::Sandbox;

/// Owner read-only.
const KEY_MODE: u32 = 0o400;

/// Write both key files and restrict them to owner read-only.
///
/// Existing (read-only) key files are replaced.
pub fn write_key_pair(paths: &SandboxPaths, keys: &KeyPair) -> io::Result<()> {
    fs::create_dir_all(paths.ssh_dir())?;
    for (path, contents) in [
        (paths.private_key(), &keys.private_key),
        (paths.public_key(), &keys.public_key),
    ] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::write(&path, contents)?;
        fs::set_permissions(&path, Permissions::from_mode(KEY_MODE))?;
    }
    Ok(())
}

/// Re-apply mode 0400 to the key pair if a private key is installed.
///
/// Returns whether the keys were found.
pub fn verify_ssh_mode(paths: &SandboxPaths) -> io::Result<bool> {
    if !paths.private_key().exists() {
        return Ok(false);
    }
    fs::set_permissions(paths.private_key(), Permissions::from_mode(KEY_MODE))?;
    fs::set_permissions(paths.public_key(), Permissions::from_mode(KEY_MODE))?;
    log::info!("Verified ssh key permissions");
    Ok(true)
}

impl Sandbox {
    /// Install the user's keys, sandbox config and git identity, then open
    /// any initial repositories.
    pub fn setup_user(&self, request: &SetupUserRequest) -> Result<(), SandboxError> {
        self.try_setup_user(request).inspect_err(|e| {
            log::error!("Setup of user {} failed: {}", request.user.id, e);
        })
    }

    fn try_setup_user(&self, request: &SetupUserRequest) -> Result<(), SandboxError> {
        let user = &request.user;
        match &request.organization {
            Some(org) => log::info!("Setting up user {} in organization {}", user.id, org),
            None => log::info!("Setting up user {}", user.id),
        }

        write_key_pair(&self.paths, &request.ssh)?;

        SandboxSettings {
            sandbox: self.config.identity.id.clone(),
            domain: request.domain.clone(),
            token: request.token.clone(),
            organization: request.organization.clone(),
            user: SandboxUser {
                id: user.id.clone(),
                email: user.email.clone(),
            },
        }
        .write(&self.paths.sandbox_config())?;

        GitIdentity {
            name: user.display_name(),
            email: user.email.clone(),
        }
        .install(&self.paths)?;

        if self.credentials.prime(request.ssh.clone()) {
            log::debug!("Cached ssh key pair for user {}", user.id);
        }

        for repo in &request.init_repositories {
            self.open_project_folder(&repo.username, &repo.repository_name)?;
        }

        log::info!("Setup of user {} done", user.id);
        Ok(())
    }
}
