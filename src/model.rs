use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Sentinel mime type marking a metadata row as a directory.
pub const DIRECTORY_MIME: &str = "directory";

/// A metadata row in the `files` table: either a directory or a regular
/// file. Directories carry their absolute logical path in `path`; regular
/// files are located through `directory_id` + `name`. At most one row per
/// (directory, name) has `current = true`; the other rows are earlier or
/// in-flight versions that share the name but differ by UUID and byte-store
/// payload.
#[derive(Debug, Clone, FromRow)]
pub struct File {
    pub id: i64,
    pub uuid: String,
    pub project_id: i64,
    pub name: String,
    pub owner_id: i64,
    pub path: Option<String>,
    pub directory_id: i64,
    pub size: i64,
    pub checksum: String,
    pub mime_type: String,
    pub media_type_description: String,
    pub current: bool,
    pub uses_uuid: Option<String>,
    pub uses_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl File {
    pub fn is_dir(&self) -> bool {
        self.mime_type == DIRECTORY_MIME
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// Logical path of this entry within its project. Directories know their
    /// own path; files are composed from the enclosing directory's path.
    pub fn logical_path(&self, dir_path: &str) -> String {
        if self.is_dir() {
            return self.path.clone().unwrap_or_else(|| "/".to_string());
        }

        if dir_path == "/" {
            format!("/{}", self.name)
        } else {
            format!("{}/{}", dir_path, self.name)
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub team_id: i64,
    pub size: i64,
    pub file_count: i64,
    pub directory_count: i64,
    /// JSON-encoded histogram of media-type description -> file count.
    pub file_types: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn file_types_histogram(&self) -> std::collections::HashMap<String, i64> {
        if self.file_types.is_empty() {
            return std::collections::HashMap::new();
        }

        serde_json::from_str(&self.file_types).unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub globus_user: Option<String>,
    pub api_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn has_globus_account(&self) -> bool {
        matches!(&self.globus_user, Some(u) if !u.is_empty())
    }
}

pub const TRANSFER_STATE_OPEN: &str = "open";
pub const TRANSFER_STATE_CLOSED: &str = "closed";

/// A sanctioned window during which an external agent may read and write a
/// project. Created on first access to a (transfer-type, user, project)
/// triple, closed by daemon action, activity timeout, or row deletion.
#[derive(Debug, Clone, FromRow)]
pub struct TransferRequest {
    pub id: i64,
    pub uuid: String,
    pub state: String,
    pub project_id: i64,
    pub owner_id: i64,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRequest {
    pub fn is_closed(&self) -> bool {
        self.state == TRANSFER_STATE_CLOSED
    }
}

pub const REQUEST_FILE_STATE_UPLOADING: &str = "uploading";
pub const REQUEST_FILE_STATE_DONE: &str = "done";

/// Per in-flight file created or modified during a transfer request. Points
/// at the non-current File row that is the under-construction version; the
/// row is deleted once the completed upload is externally acknowledged.
#[derive(Debug, Clone, FromRow)]
pub struct TransferRequestFile {
    pub id: i64,
    pub uuid: String,
    pub project_id: i64,
    pub owner_id: i64,
    pub transfer_request_id: i64,
    pub directory_id: i64,
    pub name: String,
    pub file_id: i64,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Globus sub-record of a transfer request: the ACL grant handed to the
/// transfer agent and the identity it was granted to. Persisted so that a
/// restarted daemon can hydrate its registry without re-granting ACLs.
#[derive(Debug, Clone, FromRow)]
pub struct GlobusTransfer {
    pub id: i64,
    pub uuid: String,
    pub transfer_request_id: i64,
    pub globus_acl_id: String,
    pub globus_identity_id: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Splits a project-relative logical path into (directory path, name).
pub fn split_logical_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_logical_path() {
        assert_eq!(
            split_logical_path("/a.txt"),
            ("/".to_string(), "a.txt".to_string())
        );
        assert_eq!(
            split_logical_path("/a/b/c.txt"),
            ("/a/b".to_string(), "c.txt".to_string())
        );
        assert_eq!(
            split_logical_path("plain"),
            ("/".to_string(), "plain".to_string())
        );
    }

    #[test]
    fn test_file_logical_path_for_file_in_root() {
        let f = file_named("a.txt", "text/plain");
        assert_eq!(f.logical_path("/"), "/a.txt");
    }

    #[test]
    fn test_file_logical_path_for_nested_file() {
        let f = file_named("a.txt", "text/plain");
        assert_eq!(f.logical_path("/data/runs"), "/data/runs/a.txt");
    }

    #[test]
    fn test_dir_uses_own_path() {
        let mut d = file_named("runs", DIRECTORY_MIME);
        d.path = Some("/data/runs".to_string());
        assert_eq!(d.logical_path("/ignored"), "/data/runs");
        assert!(d.is_dir());
        assert!(!d.is_file());
    }

    fn file_named(name: &str, mime: &str) -> File {
        File {
            id: 1,
            uuid: "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".to_string(),
            project_id: 1,
            name: name.to_string(),
            owner_id: 1,
            path: None,
            directory_id: 1,
            size: 0,
            checksum: String::new(),
            mime_type: mime.to_string(),
            media_type_description: String::new(),
            current: true,
            uses_uuid: None,
            uses_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
