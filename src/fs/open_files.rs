use crate::model::File;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// A file currently being written through this bridge: the in-flight
/// metadata row plus a streaming checksum over the bytes acknowledged by the
/// kernel write path.
pub struct OpenFile {
    pub file: File,
    hasher: Mutex<HasherState>,
}

struct HasherState {
    context: md5::Context,
    bytes_hashed: u64,
}

impl OpenFile {
    fn new(file: File) -> OpenFile {
        OpenFile {
            file,
            hasher: Mutex::new(HasherState {
                context: md5::Context::new(),
                bytes_hashed: 0,
            }),
        }
    }

    /// Feed bytes in the order writes are acknowledged. The hasher is never
    /// rewound, even when a writer seeks backwards.
    pub fn consume(&self, data: &[u8]) {
        let mut state = self.hasher.lock();
        state.context.consume(data);
        state.bytes_hashed += data.len() as u64;
    }

    /// Lowercase hex digest of everything hashed so far, or an empty string
    /// when nothing was hashed. The running state is preserved so a tracker
    /// entry can outlive the release that reads it.
    pub fn checksum(&self) -> String {
        let state = self.hasher.lock();
        if state.bytes_hashed == 0 {
            return String::new();
        }
        format!("{:x}", state.context.clone().compute())
    }
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("file", &self.file.name)
            .field("bytes_hashed", &self.hasher.lock().bytes_hashed)
            .finish()
    }
}

/// Process-wide map from virtual path to the file being written there by
/// this bridge. Each transfer sees its own version of a mutating file; the
/// tracker is what routes reads and writes to that version.
#[derive(Debug, Default)]
pub struct OpenFileTracker {
    files: RwLock<HashMap<String, Arc<OpenFile>>>,
}

impl OpenFileTracker {
    pub fn new() -> OpenFileTracker {
        OpenFileTracker::default()
    }

    /// Register an in-flight file, initializing a fresh hasher.
    pub fn store(&self, vpath: &str, file: File) {
        self.files
            .write()
            .insert(vpath.to_string(), Arc::new(OpenFile::new(file)));
    }

    pub fn get(&self, vpath: &str) -> Option<Arc<OpenFile>> {
        self.files.read().get(vpath).cloned()
    }

    pub fn get_file(&self, vpath: &str) -> Option<File> {
        self.files.read().get(vpath).map(|of| of.file.clone())
    }

    pub fn delete(&self, vpath: &str) {
        self.files.write().remove(vpath);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_file() -> File {
        File {
            id: 1,
            uuid: "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".to_string(),
            project_id: 7,
            name: "a.txt".to_string(),
            owner_id: 1,
            path: None,
            directory_id: 2,
            size: 0,
            checksum: String::new(),
            mime_type: "text/plain".to_string(),
            media_type_description: String::new(),
            current: false,
            uses_uuid: None,
            uses_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_store_get_delete() {
        let tracker = OpenFileTracker::new();
        tracker.store("/globus/1/7/a.txt", test_file());

        assert!(tracker.get("/globus/1/7/a.txt").is_some());
        assert!(tracker.get("/globus/1/7/b.txt").is_none());

        tracker.delete("/globus/1/7/a.txt");
        assert!(tracker.get("/globus/1/7/a.txt").is_none());
    }

    #[test]
    fn test_checksum_matches_write_order() {
        let tracker = OpenFileTracker::new();
        tracker.store("/globus/1/7/a.txt", test_file());

        let open_file = tracker.get("/globus/1/7/a.txt").unwrap();
        open_file.consume(b"hel");
        open_file.consume(b"lo");

        assert_eq!(open_file.checksum(), format!("{:x}", md5::compute(b"hello")));
    }

    #[test]
    fn test_checksum_empty_when_nothing_hashed() {
        let tracker = OpenFileTracker::new();
        tracker.store("/globus/1/7/a.txt", test_file());

        let open_file = tracker.get("/globus/1/7/a.txt").unwrap();
        assert_eq!(open_file.checksum(), "");
    }

    #[test]
    fn test_checksum_survives_reading() {
        let tracker = OpenFileTracker::new();
        tracker.store("/globus/1/7/a.txt", test_file());

        let open_file = tracker.get("/globus/1/7/a.txt").unwrap();
        open_file.consume(b"one");
        let first = open_file.checksum();
        let second = open_file.checksum();
        assert_eq!(first, second);

        // Further writes keep extending the original stream.
        open_file.consume(b"two");
        assert_eq!(
            open_file.checksum(),
            format!("{:x}", md5::compute(b"onetwo"))
        );
    }

    #[test]
    fn test_store_resets_hasher() {
        let tracker = OpenFileTracker::new();
        tracker.store("/globus/1/7/a.txt", test_file());
        tracker.get("/globus/1/7/a.txt").unwrap().consume(b"stale");

        tracker.store("/globus/1/7/a.txt", test_file());
        assert_eq!(tracker.get("/globus/1/7/a.txt").unwrap().checksum(), "");
    }
}
