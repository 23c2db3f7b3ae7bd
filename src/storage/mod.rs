//! # Storage Layer
//!
//! Everything below the B+ tree: the page file, its memory mappings, the
//! staged-page overlay, the persistent free-list, and the master page that
//! anchors commits.
//!
//! ## Page file layout
//!
//! ```text
//! page 0            master page: sig | root | flushed | free-list head
//! pages 1..flushed  durable tree nodes and free-list nodes
//! pages flushed..   staged in memory, durable after the next flush
//! ```
//!
//! ## Mapping discipline
//!
//! The file is mapped as a list of regions whose sizes double. Growth only
//! ever *appends* a region at the current tail offset; nothing is remapped,
//! so a `&[u8]` page view handed out by [`Pager::load`] stays valid for as
//! long as the database is open. The borrow checker layers a stronger
//! session-local rule on top: readers borrow the pager, so no flush can run
//! while a view or iterator is alive.
//!
//! ## Commit protocol
//!
//! [`Pager::flush`] makes the staged pages durable (free-list write, file
//! and mapping growth, overlay copy-out, fsync); the follow-up master-page
//! write plus a second fsync is the single atomic commit point. A crash
//! between the two fsyncs leaves unreferenced pages behind but the master
//! still names the previous snapshot.

mod freelist;
mod master;
mod mem;
mod mmap;
mod pager;

pub use freelist::{FreeList, FreeListHeader, FREE_LIST_CAP, FREE_LIST_HEADER_SIZE};
pub use master::{MasterHeader, MASTER_SIG};
pub use mem::MemPageStore;
pub use mmap::MmapSet;
pub use pager::{Pager, PagerMeta};

use eyre::Result;

/// Seam between the B+ tree and its page storage.
///
/// The production implementation is [`Pager`]; [`MemPageStore`] backs tree
/// unit tests without touching a file.
pub trait PageStore {
    /// Borrow the page with the given id.
    fn load(&self, id: u64) -> Result<&[u8]>;

    /// Stage a new page and return its id, recycling a free page id when
    /// one is available.
    fn allocate(&mut self, page: Box<[u8]>) -> Result<u64>;

    /// Mark a durable page as reusable.
    fn free(&mut self, id: u64) -> Result<()>;
}
