use crate::model::File;
use fuser::FUSE_ROOT_ID;
use parking_lot::RwLock;
use std::collections::HashMap;

/// 64-bit FNV-1a over the full virtual path. Inode numbers must be stable
/// across listings of the same logical file.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Inode number for a virtual path. The root maps to the FUSE root inode;
/// everything else is the FNV-1a hash of the path.
pub fn inode_for_path(vpath: &str) -> u64 {
    if vpath == "/" {
        FUSE_ROOT_ID
    } else {
        fnv1a64(vpath.as_bytes())
    }
}

#[derive(Debug, Clone)]
pub struct NodeData {
    pub ino: u64,
    pub vpath: String,
    /// Cached metadata row for entries at or below a project root. The
    /// authoritative copy lives in the database; this cache only spares a
    /// lookup on the hot getattr/open paths.
    pub file: Option<File>,
}

/// Maps inode numbers handed to the kernel back to virtual paths and cached
/// metadata. Because inodes derive deterministically from paths, inserting
/// the same path twice is idempotent.
#[derive(Debug)]
pub struct NodeTable {
    nodes: RwLock<HashMap<u64, NodeData>>,
}

impl NodeTable {
    pub fn new() -> NodeTable {
        let table = NodeTable {
            nodes: RwLock::new(HashMap::new()),
        };
        table.insert("/".to_string(), None);
        table
    }

    /// Insert a node for a virtual path, returning its inode number.
    pub fn insert(&self, vpath: String, file: Option<File>) -> u64 {
        let ino = inode_for_path(&vpath);
        self.nodes.write().insert(ino, NodeData { ino, vpath, file });
        ino
    }

    pub fn get(&self, ino: u64) -> Option<NodeData> {
        self.nodes.read().get(&ino).cloned()
    }

    pub fn vpath(&self, ino: u64) -> Option<String> {
        self.nodes.read().get(&ino).map(|n| n.vpath.clone())
    }

    pub fn remove(&self, ino: u64) {
        if ino != FUSE_ROOT_ID {
            self.nodes.write().remove(&ino);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        NodeTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a64_known_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_root_maps_to_fuse_root_id() {
        assert_eq!(inode_for_path("/"), FUSE_ROOT_ID);
    }

    #[test]
    fn test_inode_is_stable_across_insertions() {
        let table = NodeTable::new();
        let first = table.insert("/globus/1/7/a.txt".to_string(), None);
        let second = table.insert("/globus/1/7/a.txt".to_string(), None);
        assert_eq!(first, second);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_distinct_projects_get_distinct_inodes() {
        assert_ne!(
            inode_for_path("/globus/1/7/a.txt"),
            inode_for_path("/globus/1/8/a.txt")
        );
    }

    #[test]
    fn test_lookup_round_trip() {
        let table = NodeTable::new();
        let ino = table.insert("/globus/1/7".to_string(), None);
        assert_eq!(table.vpath(ino).as_deref(), Some("/globus/1/7"));
        table.remove(ino);
        assert!(table.get(ino).is_none());
    }
}
