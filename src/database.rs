//! # Key/Value Facade
//!
//! [`Database`] ties the tree to the pager and drives the commit protocol.
//! Every successful mutation runs:
//!
//! 1. the copy-on-write tree mutation (staging new pages, freeing old
//!    ones),
//! 2. [`Pager::flush`]: free-list rewrite, file growth, overlay copy-out,
//!    first fsync,
//! 3. the master-page write and second fsync.
//!
//! The master page is the only commit point. A crash after step 2 but
//! before step 3 leaves orphaned pages in the file while the master still
//! references the previous snapshot, so reopening recovers that snapshot
//! exactly.

use std::path::Path;

use eyre::Result;
use tracing::debug;

use crate::btree::{lookup, BTree, Cmp, TreeIter};
use crate::storage::Pager;

/// How [`Database::update`] treats an existing or missing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Only insert; refuse to touch an existing key.
    Insert,
    /// Only overwrite; refuse to create a missing key.
    Update,
    /// Insert or overwrite.
    Upsert,
}

#[derive(Debug)]
pub struct Database {
    pager: Pager,
    root: u64,
}

impl Database {
    /// Open a database file, creating it when absent, and recover the last
    /// committed snapshot.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (pager, root) = Pager::open(path.as_ref())?;
        Ok(Self { pager, root })
    }

    /// Look up a key. Returns `None` for absent keys, which includes keys
    /// outside the accepted size range.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(lookup(&self.pager, self.root, key)?.map(<[u8]>::to_vec))
    }

    /// Insert or overwrite a key and commit.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tree = BTree::new(&mut self.pager, self.root);
        tree.insert(key, value)?;
        self.root = tree.root();
        self.commit()
    }

    /// Delete a key and commit. Deleting an absent key returns `false`
    /// without touching the file.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let mut tree = BTree::new(&mut self.pager, self.root);
        let deleted = tree.delete(key)?;
        if !deleted {
            return Ok(false);
        }
        self.root = tree.root();
        self.commit()?;
        Ok(true)
    }

    /// Write a key under the given mode. Returns whether the write was
    /// applied; `Ok(false)` means the mode refused (insert over an existing
    /// key, update of a missing one).
    pub fn update(&mut self, key: &[u8], value: &[u8], mode: WriteMode) -> Result<bool> {
        let exists = lookup(&self.pager, self.root, key)?.is_some();
        match mode {
            WriteMode::Insert if exists => return Ok(false),
            WriteMode::Update if !exists => return Ok(false),
            _ => {}
        }
        self.set(key, value)?;
        Ok(true)
    }

    /// Position an iterator relative to `key`. The iterator borrows the
    /// database, so mutations wait until it is dropped.
    pub fn seek(&self, key: &[u8], cmp: Cmp) -> Result<TreeIter<'_, Pager>> {
        TreeIter::seek(&self.pager, self.root, key, cmp)
    }

    /// Close the database. All committed state is already durable; this
    /// just tears down the mappings and the file handle.
    pub fn close(self) -> Result<()> {
        debug!("closing database");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.pager.flush()?;
        self.pager.write_master(self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_scratch() -> (tempfile::TempDir, std::path::PathBuf, Database) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::open(&path).unwrap();
        (dir, path, db)
    }

    #[test]
    fn fresh_database_is_empty() {
        let (_dir, _path, db) = open_scratch();

        assert!(db.get(b"foo").unwrap().is_none());
    }

    #[test]
    fn set_then_get_roundtrips() {
        let (_dir, _path, mut db) = open_scratch();

        db.set(b"ab", b"one").unwrap();
        db.set(b"cd", b"two").unwrap();
        db.set(b"ab", b"ONE").unwrap();

        assert_eq!(db.get(b"ab").unwrap(), Some(b"ONE".to_vec()));
        assert_eq!(db.get(b"cd").unwrap(), Some(b"two".to_vec()));
        assert!(db.get(b"xyz").unwrap().is_none());
    }

    #[test]
    fn committed_state_survives_reopen() {
        let (_dir, path, mut db) = open_scratch();
        db.set(b"key", b"value").unwrap();
        db.close().unwrap();

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn crash_before_master_write_recovers_the_previous_snapshot() {
        let (_dir, path, mut db) = open_scratch();
        db.set(b"alpha", b"one").unwrap();

        // Run a second mutation up to the first fsync, then "lose power"
        // before the master page is rewritten: the pages are in the file
        // but nothing references them.
        let mut tree = BTree::new(&mut db.pager, db.root);
        tree.insert(b"beta", b"two").unwrap();
        db.root = tree.root();
        db.pager.flush().unwrap();
        drop(db);

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get(b"alpha").unwrap(), Some(b"one".to_vec()));
        assert!(db.get(b"beta").unwrap().is_none());
    }

    #[test]
    fn failed_tree_mutation_leaves_no_staged_pages_behind() {
        let (_dir, _path, mut db) = open_scratch();
        db.set(b"key", b"value").unwrap();

        let oversize = vec![0u8; crate::config::MAX_VALUE_SIZE + 1];
        assert!(db.set(b"key", &oversize).is_err());
        assert_eq!(db.pager.staged_count(), 0);

        assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
    }
}
