use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Advisory lock keyed by project key (`/{type}/{user}/{project}`). The task
/// monitor takes the lock while it retires completed request files; writes
/// on a locked project fail with EIO, reads are unaffected.
#[derive(Debug, Default)]
pub struct FsLockTable {
    locks: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl FsLockTable {
    pub fn new() -> FsLockTable {
        FsLockTable::default()
    }

    pub fn lock(&self, key: &str) {
        self.locks
            .write()
            .entry(key.to_string())
            .or_insert_with(Utc::now);
    }

    pub fn unlock(&self, key: &str) {
        self.locks.write().remove(key);
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.read().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock_cycle() {
        let table = FsLockTable::new();
        assert!(!table.is_locked("/globus/1/7"));

        table.lock("/globus/1/7");
        assert!(table.is_locked("/globus/1/7"));
        assert!(!table.is_locked("/globus/1/8"));

        table.unlock("/globus/1/7");
        assert!(!table.is_locked("/globus/1/7"));
    }

    #[test]
    fn test_lock_is_idempotent() {
        let table = FsLockTable::new();
        table.lock("/globus/1/7");
        table.lock("/globus/1/7");
        table.unlock("/globus/1/7");
        assert!(!table.is_locked("/globus/1/7"));
    }
}
