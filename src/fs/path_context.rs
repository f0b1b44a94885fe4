/// Decoded form of a virtual path
/// `/{transfer-type}/{user-id}/{project-id}/{sub-path}`. Numeric components
/// that are missing or unparsable become zero; path components are opaque
/// identifiers and are never percent-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathContext {
    pub transfer_type: String,
    pub user_id: i64,
    pub project_id: i64,
    /// Project-relative sub-path: "/" at the project root, "/a/b.txt" below
    /// it, empty above project depth.
    pub path: String,
}

pub const GLOBUS_TRANSFER_TYPE: &str = "globus";

/// Transfer types exposed at the root of the virtual tree.
pub const TRANSFER_TYPES: &[&str] = &[GLOBUS_TRANSFER_TYPE];

impl PathContext {
    pub fn parse(p: &str) -> PathContext {
        let parts: Vec<&str> = p.splitn(5, '/').collect();

        let transfer_type = parts.get(1).copied().unwrap_or("").to_string();
        let user_id = numeric_component(parts.get(2));
        let project_id = numeric_component(parts.get(3));

        let path = match parts.len() {
            5 => format!("/{}", parts[4]),
            4 => "/".to_string(),
            _ => String::new(),
        };

        PathContext {
            transfer_type,
            user_id,
            project_id,
            path,
        }
    }

    pub fn is_root(&self) -> bool {
        self.transfer_type.is_empty()
    }

    pub fn is_transfer_type(&self) -> bool {
        !self.transfer_type.is_empty() && self.user_id == 0
    }

    pub fn is_user(&self) -> bool {
        self.user_id != 0 && self.project_id == 0
    }

    pub fn is_project(&self) -> bool {
        self.project_id != 0 && (self.path.is_empty() || self.path == "/")
    }

    /// True for paths strictly below a project root.
    pub fn is_path(&self) -> bool {
        self.project_id != 0 && self.path.len() > 1
    }

    pub fn is_globus_transfer_type(&self) -> bool {
        self.transfer_type == GLOBUS_TRANSFER_TYPE
    }

    /// Key identifying the (transfer-type, user, project) triple; used by
    /// the transfer registry and the lock table.
    pub fn project_key(&self) -> String {
        format!("/{}/{}/{}", self.transfer_type, self.user_id, self.project_id)
    }

    /// Project-relative logical path for database lookups. "/" at or above
    /// the project root.
    pub fn fs_path(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }

    /// Project-relative logical path of `name` inside this context.
    pub fn to_fs_path(&self, name: &str) -> String {
        let base = self.fs_path();
        if base == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", base, name)
        }
    }
}

fn numeric_component(part: Option<&&str>) -> i64 {
    part.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0)
}

/// Compose a child virtual path from a parent virtual path and a name.
pub fn join_virtual_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_parsing() {
        let tests = [
            ("/globus/1/1", "globus", 1, 1, "/"),
            ("/globus/1/1/abc", "globus", 1, 1, "/abc"),
            ("/globus/1/1/abc/def/ghi.txt", "globus", 1, 1, "/abc/def/ghi.txt"),
            ("/globus/1", "globus", 1, 0, ""),
            ("/globus", "globus", 0, 0, ""),
        ];

        for (path, transfer_type, user_id, project_id, rest) in tests {
            let ctx = PathContext::parse(path);
            assert_eq!(ctx.transfer_type, transfer_type, "path: {}", path);
            assert_eq!(ctx.user_id, user_id, "path: {}", path);
            assert_eq!(ctx.project_id, project_id, "path: {}", path);
            assert_eq!(ctx.path, rest, "path: {}", path);
        }
    }

    #[test]
    fn test_depth_predicates() {
        assert!(PathContext::parse("/").is_root());
        assert!(PathContext::parse("/globus").is_transfer_type());
        assert!(PathContext::parse("/globus/1").is_user());
        assert!(PathContext::parse("/globus/1/7").is_project());
        assert!(PathContext::parse("/globus/1/7/a.txt").is_path());
        assert!(!PathContext::parse("/globus/1/7/a.txt").is_project());
    }

    #[test]
    fn test_invalid_numbers_become_zero() {
        let ctx = PathContext::parse("/globus/bogus/alsobogus/x");
        assert_eq!(ctx.user_id, 0);
        assert_eq!(ctx.project_id, 0);
    }

    #[test]
    fn test_project_key() {
        let ctx = PathContext::parse("/globus/1/7/data/a.txt");
        assert_eq!(ctx.project_key(), "/globus/1/7");
    }

    #[test]
    fn test_fs_path_composition() {
        let project_root = PathContext::parse("/globus/1/7");
        assert_eq!(project_root.fs_path(), "/");
        assert_eq!(project_root.to_fs_path("a.txt"), "/a.txt");

        let nested = PathContext::parse("/globus/1/7/data");
        assert_eq!(nested.fs_path(), "/data");
        assert_eq!(nested.to_fs_path("a.txt"), "/data/a.txt");
    }

    #[test]
    fn test_join_virtual_path() {
        assert_eq!(join_virtual_path("/", "globus"), "/globus");
        assert_eq!(join_virtual_path("/globus/1", "7"), "/globus/1/7");
    }
}
