use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An open descriptor onto a byte-store payload. The mutex serializes reads
/// and writes on a single handle; operations on distinct handles proceed in
/// parallel. I/O is positional, so no seek state is shared.
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) file: Mutex<File>,
    pub flags: i32,
    /// Full virtual path this handle was opened through.
    pub vpath: String,
    /// Project key used for lock-table checks on the write path.
    pub project_key: String,
    written: AtomicU64,
}

impl FileHandle {
    pub fn new(file: File, flags: i32, vpath: String, project_key: String) -> FileHandle {
        FileHandle {
            file: Mutex::new(file),
            flags,
            vpath,
            project_key,
            written: AtomicU64::new(0),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & libc::O_ACCMODE == libc::O_RDONLY
    }

    pub fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

/// Allocates kernel-facing handle ids and owns the live handles.
#[derive(Debug)]
pub struct HandleTable {
    handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
    next_fh: Mutex<u64>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            handles: RwLock::new(HashMap::new()),
            next_fh: Mutex::new(1),
        }
    }

    pub fn insert(&self, handle: FileHandle) -> u64 {
        let fh = {
            let mut next = self.next_fh.lock();
            let fh = *next;
            // Handles are ephemeral; wrapping on overflow is harmless.
            *next = next.wrapping_add(1);
            fh
        };

        self.handles.write().insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.read().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.write().remove(&fh)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        HandleTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_allocation_and_removal() {
        let table = HandleTable::new();
        let tmp = tempfile::tempfile().unwrap();
        let fh = table.insert(FileHandle::new(
            tmp,
            libc::O_RDONLY,
            "/globus/1/7/a.txt".to_string(),
            "/globus/1/7".to_string(),
        ));

        let handle = table.get(fh).unwrap();
        assert!(handle.is_read_only());
        assert_eq!(handle.vpath, "/globus/1/7/a.txt");

        assert!(table.remove(fh).is_some());
        assert!(table.get(fh).is_none());
    }

    #[test]
    fn test_write_accounting() {
        let tmp = tempfile::tempfile().unwrap();
        let handle = FileHandle::new(
            tmp,
            libc::O_WRONLY,
            "/globus/1/7/a.txt".to_string(),
            "/globus/1/7".to_string(),
        );

        assert!(!handle.is_read_only());
        handle.add_written(3);
        handle.add_written(2);
        assert_eq!(handle.bytes_written(), 5);
    }
}
