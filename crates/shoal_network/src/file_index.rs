//! File index registry — per-peer table of shared file metadata.
//!
//! Entries are keyed by `(owner, file_name)`. The index does not keep a
//! session alive: visibility is decided by the directory view, and entries
//! are purged when their owner's session is evicted.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// A file a peer advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub owner: PeerId,
    pub file_name: String,
    pub size_bytes: u64,
    pub shared_at: DateTime<Utc>,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Same size as before; nothing changed.
    Unchanged,
}

/// The index itself: owner → (file name → entry). Names are kept sorted per
/// owner so listings come out in a stable order.
#[derive(Debug, Default)]
pub struct FileTable {
    by_owner: HashMap<PeerId, BTreeMap<String, FileEntry>>,
}

impl FileTable {
    /// Insert or update `(owner, file_name)`. Repeating the call with the
    /// same arguments leaves the table exactly as one call did.
    pub fn upsert(&mut self, owner: &PeerId, file_name: &str, size_bytes: u64) -> Upsert {
        let files = self.by_owner.entry(owner.clone()).or_default();
        match files.get_mut(file_name) {
            Some(entry) if entry.size_bytes == size_bytes => Upsert::Unchanged,
            Some(entry) => {
                entry.size_bytes = size_bytes;
                entry.shared_at = Utc::now();
                Upsert::Updated
            }
            None => {
                files.insert(
                    file_name.to_string(),
                    FileEntry {
                        owner: owner.clone(),
                        file_name: file_name.to_string(),
                        size_bytes,
                        shared_at: Utc::now(),
                    },
                );
                Upsert::Inserted
            }
        }
    }

    /// Remove one entry. Returns whether anything was removed; absence is
    /// not an error.
    pub fn remove(&mut self, owner: &PeerId, file_name: &str) -> bool {
        let Some(files) = self.by_owner.get_mut(owner) else {
            return false;
        };
        let removed = files.remove(file_name).is_some();
        if files.is_empty() {
            self.by_owner.remove(owner);
        }
        removed
    }

    /// Drop every entry owned by `owner`. Returns how many were dropped.
    pub fn remove_owner(&mut self, owner: &PeerId) -> usize {
        self.by_owner.remove(owner).map_or(0, |files| files.len())
    }

    /// All entries of one owner, sorted by file name.
    pub fn files_of(&self, owner: &PeerId) -> impl Iterator<Item = &FileEntry> {
        self.by_owner.get(owner).into_iter().flat_map(|files| files.values())
    }

    pub fn get(&self, owner: &PeerId, file_name: &str) -> Option<&FileEntry> {
        self.by_owner.get(owner)?.get(file_name)
    }

    /// Every entry in the index.
    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.by_owner.values().flat_map(|files| files.values())
    }

    pub fn len(&self) -> usize {
        self.by_owner.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_owner.is_empty()
    }
}

/// Concurrency-safe handle around the file table. Acquire after the session
/// store's guard, never before.
#[derive(Debug, Default)]
pub struct FileIndex {
    inner: RwLock<FileTable>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FileTable> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, FileTable> {
        self.inner.write()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> PeerId {
        PeerId::from_string("alice")
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut table = FileTable::default();
        assert_eq!(table.upsert(&alice(), "book.pdf", 1000), Upsert::Inserted);
        let first = table.get(&alice(), "book.pdf").cloned().unwrap();

        assert_eq!(table.upsert(&alice(), "book.pdf", 1000), Upsert::Unchanged);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&alice(), "book.pdf"), Some(&first));
    }

    #[test]
    fn test_upsert_updates_size() {
        let mut table = FileTable::default();
        table.upsert(&alice(), "book.pdf", 1000);
        assert_eq!(table.upsert(&alice(), "book.pdf", 2000), Upsert::Updated);
        assert_eq!(table.get(&alice(), "book.pdf").unwrap().size_bytes, 2000);
    }

    #[test]
    fn test_same_name_different_owners() {
        let mut table = FileTable::default();
        let bob = PeerId::from_string("bob");
        table.upsert(&alice(), "notes.txt", 10);
        table.upsert(&bob, "notes.txt", 20);
        assert_eq!(table.len(), 2);
        assert_eq!(table.files_of(&bob).count(), 1);
    }

    #[test]
    fn test_remove_absent_is_not_an_error() {
        let mut table = FileTable::default();
        assert!(!table.remove(&alice(), "ghost.txt"));
        table.upsert(&alice(), "real.txt", 1);
        assert!(table.remove(&alice(), "real.txt"));
        assert!(!table.remove(&alice(), "real.txt"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_files_of_sorted_by_name() {
        let mut table = FileTable::default();
        table.upsert(&alice(), "c.txt", 3);
        table.upsert(&alice(), "a.txt", 1);
        table.upsert(&alice(), "b.txt", 2);
        let names: Vec<&str> = table.files_of(&alice()).map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn test_remove_owner_purges_everything() {
        let mut table = FileTable::default();
        table.upsert(&alice(), "a", 1);
        table.upsert(&alice(), "b", 2);
        table.upsert(&PeerId::from_string("bob"), "c", 3);
        assert_eq!(table.remove_owner(&alice()), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove_owner(&alice()), 0);
    }
}
