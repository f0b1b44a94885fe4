use crate::error::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Deterministic mapping from file UUID to an on-disk payload path. Payloads
/// are sharded two levels deep using the second hyphen-delimited group of
/// the canonical UUID form: `root/uuid[9..11]/uuid[11..13]/uuid`.
#[derive(Debug, Clone)]
pub struct ByteStore {
    root: PathBuf,
}

impl ByteStore {
    pub fn new(root: impl Into<PathBuf>) -> ByteStore {
        ByteStore { root: root.into() }
    }

    /// On-disk path holding the bytes for `uuid`.
    pub fn file_path(&self, uuid: &str) -> PathBuf {
        self.dir_path(uuid).join(uuid)
    }

    /// Shard directory containing the payload for `uuid`.
    pub fn dir_path(&self, uuid: &str) -> PathBuf {
        let (first, second) = shard_components(uuid);
        self.root.join(first).join(second)
    }

    /// Create the shard directories for `uuid` with mkdir -p semantics.
    pub fn create_dirs(&self, uuid: &str) -> Result<()> {
        let dir = self.dir_path(uuid);
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Remove the payload for `uuid`, used when a released file deduplicates
    /// against an existing payload with the same checksum.
    pub fn remove(&self, uuid: &str) -> Result<()> {
        fs::remove_file(self.file_path(uuid))?;
        Ok(())
    }
}

/// The two shard levels come from the second hyphen-delimited UUID group,
/// i.e. characters 9..11 and 11..13 of the canonical 8-4-4-4-12 form. UUIDs
/// in the database are always canonical; anything shorter falls back to the
/// root to avoid panicking on corrupt rows.
fn shard_components(uuid: &str) -> (&str, &str) {
    if uuid.len() >= 13 && uuid.is_char_boundary(9) {
        (&uuid[9..11], &uuid[11..13])
    } else {
        ("", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_path_shards_on_second_uuid_group() {
        let store = ByteStore::new("/mcfs");
        let path = store.file_path("1234abcd-ef01-2345-6789-0123456789ab");
        assert_eq!(
            path,
            PathBuf::from("/mcfs/ef/01/1234abcd-ef01-2345-6789-0123456789ab")
        );
    }

    #[test]
    fn test_dir_path_is_parent_of_file_path() {
        let store = ByteStore::new("/mcfs");
        let uuid = "1234abcd-ef01-2345-6789-0123456789ab";
        assert_eq!(
            store.file_path(uuid).parent().unwrap(),
            store.dir_path(uuid)
        );
    }

    #[test]
    fn test_create_dirs_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ByteStore::new(tmp.path());
        let uuid = "1234abcd-ef01-2345-6789-0123456789ab";

        store.create_dirs(uuid).unwrap();
        store.create_dirs(uuid).unwrap();

        assert!(store.dir_path(uuid).is_dir());
    }

    #[test]
    fn test_short_uuid_falls_back_to_root() {
        let store = ByteStore::new("/mcfs");
        assert_eq!(store.file_path("short"), PathBuf::from("/mcfs/short"));
    }
}
