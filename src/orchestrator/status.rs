//! Lifecycle status broadcast.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Subscriber groups every status update is addressed to.
pub const STATUS_GROUPS: &[&str] = &["CREATORS_STUDIO", "BUILD_SERVER"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
    Running,
    ShuttingDownReady,
    ShuttingDownError,
}

/// `{sandboxId, status}` as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub sandbox_id: String,
    pub status: SandboxStatus,
}

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("failed to write status: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode status: {0}")]
    Json(#[from] serde_json::Error),
    #[error("status receiver is gone")]
    Closed,
}

/// Outbound, fire-and-forget status transport.
pub trait StatusChannel: Send + Sync {
    fn publish(&self, update: &StatusUpdate, groups: &[&str]) -> Result<(), StatusError>;
}

/// Only logs the update.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusChannel;

impl StatusChannel for LogStatusChannel {
    fn publish(&self, update: &StatusUpdate, groups: &[&str]) -> Result<(), StatusError> {
        log::info!(
            "Status {:?} for sandbox {} -> {}",
            update.status,
            update.sandbox_id,
            groups.join(",")
        );
        Ok(())
    }
}

/// Appends one JSON object per update to a file.
#[derive(Debug, Clone)]
pub struct JsonLinesStatusChannel {
    path: PathBuf,
}

#[derive(Serialize)]
struct AddressedUpdate<'a> {
    groups: &'a [&'a str],
    #[serde(flatten)]
    update: &'a StatusUpdate,
}

impl JsonLinesStatusChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusChannel for JsonLinesStatusChannel {
    fn publish(&self, update: &StatusUpdate, groups: &[&str]) -> Result<(), StatusError> {
        let mut line = serde_json::to_vec(&AddressedUpdate { groups, update })?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

impl StatusChannel for Sender<StatusUpdate> {
    fn publish(&self, update: &StatusUpdate, _groups: &[&str]) -> Result<(), StatusError> {
        self.send(update.clone()).map_err(|_| StatusError::Closed)
    }
}
