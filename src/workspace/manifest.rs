//! The editor workspace manifest (`workspace.code-workspace`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of the manifest's `folders` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceFolder {
    pub path: String,
    /// Keys the editor may add (`name`, ...), kept as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkspaceFolder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            extra: Map::new(),
        }
    }
}

/// `{folders, settings}` as written by the editor.
///
/// Folder order is addition order and is preserved on rewrite. `settings` and
/// any unknown top-level keys are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    #[serde(default)]
    pub folders: Vec<WorkspaceFolder>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkspaceManifest {
    pub fn contains(&self, path: &str) -> bool {
        self.folders.iter().any(|f| f.path == path)
    }

    /// Append `path` unless it is already listed. Returns true when added.
    pub fn add_folder(&mut self, path: &str) -> bool {
        if self.contains(path) {
            return false;
        }
        self.folders.push(WorkspaceFolder::new(path));
        true
    }

    /// Folder paths in manifest order.
    pub fn folder_paths(&self) -> Vec<String> {
        self.folders.iter().map(|f| f.path.clone()).collect()
    }

    /// Editor-style pretty JSON (two-space indent).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
