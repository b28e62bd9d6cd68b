use serde::{Deserialize, Serialize};

use crate::credentials::KeyPair;
use crate::workspace::ProjectRecord;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Profile part of a user handed to `setupUser`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// User handed to `setupUser`. Other user fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub profile: UserProfile,
}

impl SetupUser {
    /// `<first> <last>` as used for the commit author.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.profile.first_name, self.profile.last_name)
            .trim()
            .to_string()
    }
}

/// A repository to clone and open during setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRepository {
    pub username: String,
    pub repository_name: String,
}

/// Parameters of `setupUser`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupUserRequest {
    pub user: SetupUser,
    pub ssh: KeyPair,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub init_repositories: Vec<InitRepository>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Parameters of `loadProject`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProjectRequest {
    pub owner_username: String,
    pub project: ProjectRecord,
}

/// Parameters of the `shutdown` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownEvent {
    #[serde(default)]
    pub force: Option<bool>,
}

/// `{success: true, message}` or `{error: true, message}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    #[serde(default, skip_serializing_if = "is_false")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    pub message: String,
}

impl CommitResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            error: false,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: true,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success && !self.error
    }
}

/// `{success: true, payload: [path...]}` or `{error: true}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActiveProjectsResult {
    Active { success: bool, payload: Vec<String> },
    Failed { error: bool },
}

impl ActiveProjectsResult {
    pub fn active(payload: Vec<String>) -> Self {
        Self::Active {
            success: true,
            payload,
        }
    }

    pub fn failed() -> Self {
        Self::Failed { error: true }
    }

    pub fn folders(&self) -> Option<&[String]> {
        match self {
            Self::Active { payload, .. } => Some(payload),
            Self::Failed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_commit_result_shapes() {
        assert_eq!(
            serde_json::to_value(CommitResult::success("Commit Successful")).unwrap(),
            json!({"success": true, "message": "Commit Successful"})
        );
        assert_eq!(
            serde_json::to_value(CommitResult::error("Commit failed")).unwrap(),
            json!({"error": true, "message": "Commit failed"})
        );
    }

    #[test]
    fn test_active_projects_shapes() {
        let active = ActiveProjectsResult::active(vec!["demo".into()]);
        assert_eq!(
            serde_json::to_value(&active).unwrap(),
            json!({"success": true, "payload": ["demo"]})
        );
        assert_eq!(
            serde_json::to_value(ActiveProjectsResult::failed()).unwrap(),
            json!({"error": true})
        );

        let back: ActiveProjectsResult =
            serde_json::from_value(json!({"success": true, "payload": ["a", "b"]})).unwrap();
        assert_eq!(back.folders().unwrap(), ["a", "b"]);
    }

    #[test]
    fn test_deserialize_setup_user_request() {
        let raw = json!({
            "user": {
                "_id": "u1",
                "email": "ada@example.com",
                "profile": {"firstName": "Ada", "lastName": "Lovelace"},
                "roles": ["admin"]
            },
            "ssh": {"publicKey": "ssh-rsa AAAA", "privateKey": "-----BEGIN-----"},
            "organization": "org-1",
            "initRepositories": [{"username": "alice", "repositoryName": "demo"}]
        });

        let req: SetupUserRequest = serde_json::from_value(raw).unwrap();

        assert_eq!(req.user.display_name(), "Ada Lovelace");
        assert_eq!(req.ssh.public_key, "ssh-rsa AAAA");
        assert_eq!(req.init_repositories[0].repository_name, "demo");
        assert!(req.token.is_none());
    }

    #[test]
    fn test_deserialize_load_project_request() {
        let raw = json!({
            "ownerUsername": "alice",
            "project": {"_id": "p1", "slug": "demo", "projectType": "APP"}
        });
        let req: LoadProjectRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.owner_username, "alice");
        assert!(req.project.is_app());
    }

    #[test]
    fn test_shutdown_force_is_optional() {
        let event: ShutdownEvent = serde_json::from_str("{}").unwrap();
        assert_eq!(event.force, None);
        let event: ShutdownEvent = serde_json::from_str(r#"{"force":false}"#).unwrap();
        assert_eq!(event.force, Some(false));
    }
}
