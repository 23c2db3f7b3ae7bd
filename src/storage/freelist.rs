//! Persistent free-list of reusable page ids.
//!
//! On disk the list is a singly linked chain of pages:
//!
//! ```text
//! | kind | size | total            | next | ids        |
//! | 2B   | 2B   | 8B (head only)   | 8B   | size * 8B  |
//! ```
//!
//! `next` links toward older nodes and ends at page id 0. `total` is only
//! meaningful on the head node, where it records the number of reusable ids
//! across the whole chain.
//!
//! In memory, [`FreeList`] keeps the reusable ids as a stack (`freed`), the
//! ids freed since the last commit (`pending`), and the number of pops
//! since the last commit (`popped`). The commit-time rewrite of the chain
//! lives in the pager, because the chain's own pages come from the resource
//! the list manages; this module only holds the state and the node codec.
//!
//! Freeing the same id twice is a corruption of the copy-on-write
//! bookkeeping and panics.

use eyre::{ensure, Result};
use hashbrown::HashSet;
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_SIZE;

/// On-disk page kind for free-list nodes (tree nodes use 1 and 2).
pub const FREE_LIST_KIND: u16 = 3;

pub const FREE_LIST_HEADER_SIZE: usize = std::mem::size_of::<FreeListHeader>();

/// Ids one chain node can hold.
pub const FREE_LIST_CAP: usize = (PAGE_SIZE - FREE_LIST_HEADER_SIZE) / 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FreeListHeader {
    kind: U16,
    size: U16,
    total: U64,
    next: U64,
}

const _: () = assert!(FREE_LIST_HEADER_SIZE == 20);
const _: () = assert!(FREE_LIST_CAP >= 1);

impl FreeListHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= FREE_LIST_HEADER_SIZE,
            "buffer too small for free-list header: {} < {}",
            data.len(),
            FREE_LIST_HEADER_SIZE
        );
        let header = Self::ref_from_bytes(&data[..FREE_LIST_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read free-list header: {:?}", e))?;
        ensure!(
            header.kind.get() == FREE_LIST_KIND,
            "page is not a free-list node: kind {}",
            header.kind.get()
        );
        Ok(header)
    }

    pub fn size(&self) -> usize {
        self.size.get() as usize
    }

    pub fn total(&self) -> u64 {
        self.total.get()
    }

    pub fn next(&self) -> u64 {
        self.next.get()
    }
}

/// Borrowed view of one chain node.
#[derive(Debug, Clone, Copy)]
pub struct FreeListView<'a> {
    data: &'a [u8],
}

impl<'a> FreeListView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        FreeListHeader::from_bytes(data)?;
        Ok(Self { data })
    }

    fn header(&self) -> &FreeListHeader {
        FreeListHeader::from_bytes(self.data).unwrap()
    }

    pub fn size(&self) -> usize {
        self.header().size()
    }

    pub fn total(&self) -> u64 {
        self.header().total()
    }

    pub fn next(&self) -> u64 {
        self.header().next()
    }

    pub fn entry(&self, i: usize) -> u64 {
        assert!(i < self.size(), "free-list entry {i} out of bounds");
        let pos = FREE_LIST_HEADER_SIZE + i * 8;
        u64::from_le_bytes(self.data[pos..pos + 8].try_into().unwrap())
    }
}

/// Owned builder for a fresh chain node.
pub struct FreeListNode {
    data: Box<[u8]>,
}

impl FreeListNode {
    pub fn new(size: usize, next: u64) -> Self {
        assert!(size <= FREE_LIST_CAP, "free-list node overflows capacity");
        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let header = FreeListHeader {
            kind: U16::new(FREE_LIST_KIND),
            size: U16::new(size as u16),
            total: U64::new(0),
            next: U64::new(next),
        };
        data[..FREE_LIST_HEADER_SIZE].copy_from_slice(header.as_bytes());
        Self { data }
    }

    pub fn set_entry(&mut self, i: usize, id: u64) {
        let pos = FREE_LIST_HEADER_SIZE + i * 8;
        self.data[pos..pos + 8].copy_from_slice(&id.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_page(self) -> Box<[u8]> {
        self.data
    }
}

/// Stamp `total` into the header of an existing chain node page.
pub fn set_total(page: &mut [u8], total: u64) {
    let header = FreeListHeader::mut_from_bytes(&mut page[..FREE_LIST_HEADER_SIZE])
        .expect("free-list header layout");
    assert_eq!(header.kind.get(), FREE_LIST_KIND, "page is not a free-list node");
    header.total = U64::new(total);
}

/// In-memory free-list state.
#[derive(Debug, Default)]
pub struct FreeList {
    /// Head chain node, 0 when the list has never been written.
    pub(crate) head: u64,
    /// Ids stored across the on-disk chain.
    pub(crate) total: usize,
    /// Reusable ids; a stack, most recently listed on top.
    pub(crate) freed: Vec<u64>,
    /// Ids freed since the last chain write.
    pub(crate) pending: Vec<u64>,
    /// Pops since the last chain write.
    pub(crate) popped: usize,
    /// Membership of `freed` and `pending`, for double-free detection.
    cache: HashSet<u64>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn free_count(&self) -> usize {
        self.freed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Queue an id for reuse. Panics if the id is already queued or
    /// reusable: a double free means the copy-on-write bookkeeping lost
    /// track of a live page.
    pub fn free(&mut self, id: u64) {
        assert!(self.cache.insert(id), "double free of page {id}");
        self.pending.push(id);
    }

    /// Take the most recently listed reusable id, if any.
    pub fn pop(&mut self) -> Option<u64> {
        let id = self.freed.pop()?;
        self.popped += 1;
        self.cache.remove(&id);
        Some(id)
    }

    /// Take a reusable id for rewriting the chain itself. Unlike [`pop`],
    /// this does not count toward `popped`: the chain rewrite accounts for
    /// these ids directly.
    ///
    /// [`pop`]: FreeList::pop
    pub(crate) fn take_reusable(&mut self) -> u64 {
        let id = self.freed.pop().expect("free list exhausted during chain rewrite");
        self.cache.remove(&id);
        id
    }

    /// Replace the in-memory state with ids read from a chain, given in
    /// most-recently-listed-first order.
    pub(crate) fn reset_from_chain(&mut self, head: u64, newest_first: Vec<u64>) {
        self.head = head;
        self.total = newest_first.len();
        self.cache = newest_first.iter().copied().collect();
        assert!(
            self.cache.len() == newest_first.len(),
            "free list chain holds a duplicate id"
        );
        self.freed = newest_first;
        self.freed.reverse();
        self.pending.clear();
        self.popped = 0;
    }

    /// Move `pending` into `freed` after the chain holding them is staged.
    pub(crate) fn publish_pending(&mut self) {
        self.freed.append(&mut self.pending);
        self.popped = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_20_bytes() {
        assert_eq!(FREE_LIST_HEADER_SIZE, 20);
    }

    #[test]
    fn capacity_fills_the_page() {
        assert_eq!(FREE_LIST_CAP, (PAGE_SIZE - 20) / 8);
        assert!(FREE_LIST_HEADER_SIZE + FREE_LIST_CAP * 8 <= PAGE_SIZE);
    }

    #[test]
    fn node_roundtrips_entries_and_links() {
        let mut node = FreeListNode::new(3, 42);
        node.set_entry(0, 7);
        node.set_entry(1, 8);
        node.set_entry(2, 9);

        let page = node.into_page();
        let view = FreeListView::new(&page).unwrap();
        assert_eq!(view.size(), 3);
        assert_eq!(view.next(), 42);
        assert_eq!(view.entry(0), 7);
        assert_eq!(view.entry(2), 9);
    }

    #[test]
    fn set_total_updates_header_in_place() {
        let node = FreeListNode::new(1, 0);
        let mut page = node.into_page();

        set_total(&mut page, 99);

        let view = FreeListView::new(&page).unwrap();
        assert_eq!(view.total(), 99);
    }

    #[test]
    fn view_rejects_wrong_kind() {
        let page = [0u8; PAGE_SIZE];
        assert!(FreeListView::new(&page).is_err());
    }

    #[test]
    fn pop_is_last_in_first_out() {
        let mut list = FreeList::new();
        list.free(10);
        list.free(20);
        list.publish_pending();

        assert_eq!(list.pop(), Some(20));
        assert_eq!(list.pop(), Some(10));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn pop_counts_toward_popped() {
        let mut list = FreeList::new();
        list.free(10);
        list.publish_pending();

        list.pop();
        assert_eq!(list.popped, 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut list = FreeList::new();
        list.free(10);
        list.free(10);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn freeing_a_published_id_panics() {
        let mut list = FreeList::new();
        list.free(10);
        list.publish_pending();
        list.free(10);
    }

    #[test]
    fn popped_id_may_be_freed_again() {
        let mut list = FreeList::new();
        list.free(10);
        list.publish_pending();

        assert_eq!(list.pop(), Some(10));
        list.free(10);
        assert_eq!(list.pending_count(), 1);
    }

    #[test]
    fn reset_from_chain_orders_pops_newest_first() {
        let mut list = FreeList::new();
        list.reset_from_chain(5, vec![30, 20, 10]);

        assert_eq!(list.head(), 5);
        assert_eq!(list.total, 3);
        assert_eq!(list.pop(), Some(30));
        assert_eq!(list.pop(), Some(20));
        assert_eq!(list.pop(), Some(10));
    }
}
