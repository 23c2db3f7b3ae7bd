//! # Pager
//!
//! Owns the page file, its mmap regions, the staged-page overlay, and the
//! free-list. All reads and writes of pages go through here.
//!
//! Page ids below `flushed` are durable and served straight from the
//! mapping. Newly created pages are staged in an id-ordered overlay and get
//! ids `flushed..`; they reach the file only in [`Pager::flush`]. A page
//! recycled from the free-list keeps its old id and is written into the
//! mapping in place. A recycled id is unreferenced by the last durable
//! master page, so a crash before commit cannot observe the overwrite.
//!
//! ## Free-list rewrite
//!
//! The chain's own pages come from the pool the chain manages, which makes
//! the commit-time rewrite order-sensitive:
//!
//! 1. Peel head nodes whose ids have been popped since the last commit;
//!    each peeled page is itself freed. A partially consumed node leaves
//!    its unpopped ids as `remaining`.
//! 2. Draw reuse ids off the `freed` stack (consuming further chain nodes
//!    as `remaining` drains) until they can host the surviving ids.
//! 3. Emit `remaining` then `pending` as new chain nodes, preferring the
//!    reuse ids over fresh ones; fresh pages come from [`Pager::append`],
//!    never [`Pager::allocate`], to avoid recursing into the list being
//!    rewritten.
//! 4. Publish `pending` as reusable and stamp `total` on the new head.
//!
//! Each rewrite consumes about as many pages as it produces, so the chain
//! does not grow across free/reuse cycles.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, trace};

use crate::config::{FILE_GROWTH_DIVISOR, PAGE_SIZE};

use super::freelist::{self, FreeList, FreeListNode, FreeListView, FREE_LIST_CAP};
use super::master::MasterHeader;
use super::mmap::MmapSet;
use super::PageStore;

/// Durable state published by a successful [`Pager::flush`].
#[derive(Debug, Clone, Copy)]
pub struct PagerMeta {
    pub flushed: u64,
    pub free_list_head: u64,
}

#[derive(Debug)]
pub struct Pager {
    file: std::fs::File,
    file_size: u64,
    map: MmapSet,
    /// Pages durable in the file; ids `[1, flushed)` are valid on disk.
    flushed: u64,
    /// Fresh pages awaiting flush, keyed by id `>= flushed`, id-ordered so
    /// the flush copy-out is deterministic.
    staged: BTreeMap<u64, Box<[u8]>>,
    free_list: FreeList,
}

impl Pager {
    /// Open or create the page file and recover the last committed state.
    /// Returns the pager and the tree root recorded in the master page
    /// (0 for a fresh file).
    pub fn open(path: &Path) -> Result<(Self, u64)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        let map = MmapSet::new(&file, file_size)?;
        let mut pager = Self {
            file,
            file_size,
            map,
            flushed: 1,
            staged: BTreeMap::new(),
            free_list: FreeList::new(),
        };

        if file_size == 0 {
            debug!(path = %path.display(), "created database file");
            return Ok((pager, 0));
        }

        let (root, flushed, head) = {
            let master = MasterHeader::from_bytes(pager.map.page(0))?;
            (master.root(), master.flushed(), master.free_list_head())
        };
        let file_pages = file_size / PAGE_SIZE as u64;
        ensure!(
            flushed >= 1 && flushed <= file_pages,
            "invalid master page: flushed count {} outside 1..={}",
            flushed,
            file_pages
        );
        ensure!(
            root < flushed,
            "invalid master page: root {} not below flushed count {}",
            root,
            flushed
        );
        ensure!(
            head < flushed,
            "invalid master page: free-list head {} not below flushed count {}",
            head,
            flushed
        );

        pager.flushed = flushed;
        if head != 0 {
            pager.read_free_list(head)?;
        }
        debug!(path = %path.display(), root, flushed, free_list_head = head, "opened database file");
        Ok((pager, root))
    }

    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    fn page_count(&self) -> u64 {
        self.flushed + self.staged.len() as u64
    }

    fn check_id(&self, id: u64) -> Result<()> {
        ensure!(
            id >= 1 && id < self.page_count(),
            "page id {} out of bounds (flushed {}, staged {})",
            id,
            self.flushed,
            self.staged.len()
        );
        Ok(())
    }

    /// Borrow a page, transparently across durable and staged pages.
    pub fn load(&self, id: u64) -> Result<&[u8]> {
        self.check_id(id)?;
        if id >= self.flushed {
            Ok(self.staged.get(&id).expect("staged overlay missing a page"))
        } else {
            Ok(self.map.page(id))
        }
    }

    /// Stage a page under a recycled id when the free-list has one, else
    /// append it under a fresh id.
    pub fn allocate(&mut self, page: Box<[u8]>) -> Result<u64> {
        assert!(page.len() <= PAGE_SIZE, "page exceeds page size");
        match self.free_list.pop() {
            Some(id) => {
                trace!(page = id, "recycling freed page");
                self.write(id, &page)?;
                Ok(id)
            }
            None => Ok(self.append(page)),
        }
    }

    /// Stage a page under a fresh id, bypassing the free-list. The
    /// free-list rewrite publishes its own chain pages through this.
    pub fn append(&mut self, page: Box<[u8]>) -> u64 {
        assert!(page.len() <= PAGE_SIZE, "page exceeds page size");
        let id = self.flushed + self.staged.len() as u64;
        trace!(page = id, "staging appended page");
        self.staged.insert(id, page);
        id
    }

    /// Overwrite an existing page: staged pages are replaced in the
    /// overlay, durable pages are rewritten in place through the mapping.
    pub fn write(&mut self, id: u64, page: &[u8]) -> Result<()> {
        assert!(page.len() <= PAGE_SIZE, "page exceeds page size");
        self.check_id(id)?;
        if id < self.flushed {
            self.map.page_mut(id)[..page.len()].copy_from_slice(page);
        } else {
            self.staged.insert(id, page.to_vec().into_boxed_slice());
        }
        Ok(())
    }

    /// Hand a durable page to the free-list.
    pub fn free(&mut self, id: u64) -> Result<()> {
        ensure!(
            id >= 1 && id < self.flushed,
            "cannot free page {}: not a durable page",
            id
        );
        debug!(page = id, "freeing page");
        self.free_list.free(id);
        Ok(())
    }

    /// Make every staged page durable: rewrite the free-list chain, grow
    /// the file and mapping, copy the overlay out in id order, fsync.
    pub fn flush(&mut self) -> Result<PagerMeta> {
        self.write_free_list()?;
        self.grow()?;

        for (&id, page) in &self.staged {
            trace!(page = id, "copying staged page into the mapping");
            self.map.page_mut(id)[..page.len()].copy_from_slice(page);
        }

        self.file.sync_all().wrap_err("fsync data pages")?;

        self.flushed += self.staged.len() as u64;
        self.staged.clear();
        debug!(flushed = self.flushed, "flushed staged pages");

        Ok(PagerMeta {
            flushed: self.flushed,
            free_list_head: self.free_list.head(),
        })
    }

    /// Write and fsync the master page. Must follow a successful
    /// [`Pager::flush`]; together they form the two-fsync commit.
    pub fn write_master(&mut self, root: u64) -> Result<()> {
        assert!(
            self.staged.is_empty(),
            "master write with unflushed staged pages"
        );
        MasterHeader::new(root, self.flushed, self.free_list.head()).write_to(self.map.page_mut(0));
        self.file.sync_all().wrap_err("fsync master page")
    }

    fn grow(&mut self) -> Result<()> {
        let need = self.page_count();
        let mut file_pages = self.file_size / PAGE_SIZE as u64;
        if file_pages < need {
            while file_pages < need {
                file_pages += (file_pages / FILE_GROWTH_DIVISOR).max(1);
            }
            let new_size = file_pages * PAGE_SIZE as u64;
            self.file
                .set_len(new_size)
                .wrap_err_with(|| format!("failed to extend file to {new_size} bytes"))?;
            self.file_size = new_size;
        }
        self.map.grow(&self.file, need * PAGE_SIZE as u64)
    }

    /// Mutable access to a page wherever it currently lives.
    fn page_mut_any(&mut self, id: u64) -> Result<&mut [u8]> {
        self.check_id(id)?;
        if id >= self.flushed {
            Ok(self
                .staged
                .get_mut(&id)
                .expect("staged overlay missing a page"))
        } else {
            Ok(self.map.page_mut(id))
        }
    }

    fn read_free_list(&mut self, head: u64) -> Result<()> {
        let mut newest_first: Vec<u64> = Vec::new();
        let mut expected_total = 0u64;
        let mut first = true;
        let mut node_id = head;
        while node_id != 0 {
            let view = FreeListView::new(self.load(node_id)?)?;
            if first {
                expected_total = view.total();
                first = false;
            }
            for i in (0..view.size()).rev() {
                newest_first.push(view.entry(i));
            }
            node_id = view.next();
        }
        ensure!(
            newest_first.len() as u64 == expected_total,
            "free list corrupted: head records {} ids but the chain holds {}",
            expected_total,
            newest_first.len()
        );
        self.free_list.reset_from_chain(head, newest_first);
        debug!(head, ids = expected_total, "read free list");
        Ok(())
    }

    fn write_free_list(&mut self) -> Result<()> {
        if self.free_list.popped == 0 && self.free_list.pending.is_empty() {
            return Ok(());
        }
        assert!(
            self.free_list.popped <= self.free_list.total,
            "free list popped more ids than the chain holds"
        );

        // 1. Peel chain nodes whose ids were consumed by allocations.
        let mut remaining: Vec<u64> = Vec::new();
        let mut popped = self.free_list.popped;
        while popped > 0 {
            let head = self.free_list.head;
            assert!(head != 0, "free list chain underflow");
            let (size, next, keep): (usize, u64, Vec<u64>) = {
                let view = FreeListView::new(self.load(head)?)?;
                let size = view.size();
                let keep = if size > popped {
                    (0..size - popped).map(|i| view.entry(i)).collect()
                } else {
                    Vec::new()
                };
                (size, view.next(), keep)
            };
            self.free_list.free(head);
            trace!(page = head, "peeled free-list node");
            if popped >= size {
                popped -= size;
            } else {
                remaining = keep;
                popped = 0;
            }
            self.free_list.head = next;
            self.free_list.total -= size;
        }

        // 2. Draw reuse ids so the rewrite does not have to grow the file.
        // The freed stack and the chain tail stay aligned, so each drawn id
        // is the id stored at the tail of `remaining`.
        let mut reuse: Vec<u64> = Vec::new();
        while self.free_list.free_count() > 0
            && reuse.len() * FREE_LIST_CAP < self.free_list.pending.len() + remaining.len()
        {
            if remaining.is_empty() {
                let head = self.free_list.head;
                assert!(head != 0, "free list chain underflow");
                let (size, next) = {
                    let view = FreeListView::new(self.load(head)?)?;
                    remaining = (0..view.size()).map(|i| view.entry(i)).collect();
                    (view.size(), view.next())
                };
                self.free_list.free(head);
                trace!(page = head, "consumed free-list node for reuse");
                self.free_list.head = next;
                self.free_list.total -= size;
            }
            let id = self.free_list.take_reusable();
            let tail = remaining.pop().expect("reuse outran the chain contents");
            debug_assert_eq!(id, tail, "freed stack diverged from chain order");
            reuse.push(id);
        }

        // 3. Emit surviving ids, then the newly pending ids.
        let pending = self.free_list.pending.clone();
        self.emit_chain(&remaining, &mut reuse)?;
        self.emit_chain(&pending, &mut reuse)?;

        // 4. Everything pending is reusable from the next mutation on.
        self.free_list.publish_pending();

        // 5. Stamp the total on the new head so the next open can size the
        // freed stack up front.
        let head = self.free_list.head;
        assert!(head != 0, "free list rewrite finished without a head");
        let total = self.free_list.total as u64;
        freelist::set_total(self.page_mut_any(head)?, total);
        Ok(())
    }

    fn emit_chain(&mut self, ids: &[u64], reuse: &mut Vec<u64>) -> Result<()> {
        for chunk in ids.chunks(FREE_LIST_CAP) {
            let mut node = FreeListNode::new(chunk.len(), self.free_list.head);
            for (i, &id) in chunk.iter().enumerate() {
                node.set_entry(i, id);
            }
            let head = if reuse.is_empty() {
                self.append(node.into_page())
            } else {
                let id = reuse.remove(0);
                self.write(id, node.as_bytes())?;
                id
            };
            trace!(page = head, ids = chunk.len(), "wrote free-list node");
            self.free_list.head = head;
            self.free_list.total += chunk.len();
        }
        Ok(())
    }
}

impl PageStore for Pager {
    fn load(&self, id: u64) -> Result<&[u8]> {
        Pager::load(self, id)
    }

    fn allocate(&mut self, page: Box<[u8]>) -> Result<u64> {
        Pager::allocate(self, page)
    }

    fn free(&mut self, id: u64) -> Result<()> {
        Pager::free(self, id)
    }
}
