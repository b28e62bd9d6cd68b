//! Loaded project records (`.local/share/projects.json`).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Project type that gets a `<slug>.graph-app.json` marker on load.
pub const APP_PROJECT_TYPE: &str = "APP";

/// Field sent along with projects that is never stored.
const TRANSIENT_FIELDS: &[&str] = &["generatedSocketGroups"];

/// Metadata of one loaded project. Unknown fields are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        rename = "projectType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub project_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectRecord {
    /// `_id`, treating an empty string as missing.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn slug(&self) -> Option<&str> {
        self.slug.as_deref().filter(|slug| !slug.is_empty())
    }

    pub fn is_app(&self) -> bool {
        self.project_type.as_deref() == Some(APP_PROJECT_TYPE)
    }

    /// The marker to seed for APP projects; `None` for other types.
    pub fn app_marker(&self) -> Option<AppMarker> {
        if !self.is_app() {
            return None;
        }
        Some(AppMarker {
            id: self.id()?.to_string(),
            slug: self.slug()?.to_string(),
            name: self.name.clone(),
        })
    }

    /// Drop fields that only matter to the caller of a load.
    pub fn strip_transient(&mut self) {
        for field in TRANSIENT_FIELDS {
            self.extra.remove(*field);
        }
    }
}

/// Identity file seeded into the folder of an APP project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMarker {
    #[serde(rename = "_id")]
    pub id: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AppMarker {
    /// `<slug>.graph-app.json`, lower-cased.
    pub fn file_name(&self) -> String {
        format!("{}.graph-app.json", self.slug.to_lowercase())
    }
}

/// Outcome of a sanitize pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeStats {
    pub kept: usize,
    pub missing_id: usize,
    pub duplicates: usize,
}

/// Drop records without an `_id` and every repeat of an `_id` after its first
/// occurrence, keeping the original order.
pub fn dedupe_projects(projects: Vec<ProjectRecord>) -> (Vec<ProjectRecord>, SanitizeStats) {
    let mut seen = HashSet::new();
    let mut stats = SanitizeStats::default();
    let mut kept = Vec::with_capacity(projects.len());

    for project in projects {
        let Some(id) = project.id() else {
            stats.missing_id += 1;
            continue;
        };
        if !seen.insert(id.to_string()) {
            stats.duplicates += 1;
            continue;
        }
        kept.push(project);
    }

    stats.kept = kept.len();
    (kept, stats)
}
