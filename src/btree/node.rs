//! # B+ Tree Node Codec
//!
//! A node is one page interpreted as a slotted record:
//!
//! ```text
//! | type | nkeys | pointers     | offsets      | packed key/value slots        |
//! | 2B   | 2B    | nkeys * 8B   | nkeys * 2B   | per slot: klen(2B) vlen(2B)   |
//! |      |       |              |              |           key    value        |
//! ```
//!
//! All integers are little-endian. The offset array stores, for slots
//! `1..=nkeys`, the byte offset of the slot relative to the start of the
//! key/value region; slot 0's offset is implicitly zero, and the `nkeys`-th
//! offset marks the end of the used bytes, which doubles as the node size.
//!
//! Two views exist over this layout:
//!
//! - [`NodeRef`] borrows a page (typically straight out of the mmap) and
//!   exposes read accessors that return slices into the page.
//! - [`NodeBuf`] owns a scratch buffer, sized at one page for nodes built
//!   in place or two pages for copy-on-write results that may overflow
//!   before splitting. [`NodeBuf::into_page`] shrinks the buffer to the
//!   serialized size before it is handed to the pager.
//!
//! Index arguments out of range are programmer errors and panic, matching
//! the corruption taxonomy of the rest of the crate: the codec is only ever
//! driven by tree code that has already established the bounds.

use crate::config::{
    KEY_LEN_SIZE, NODE_HEADER_SIZE, OFFSET_SIZE, PAGE_SIZE, POINTER_SIZE, VAL_LEN_SIZE,
};

/// On-disk discriminator values. Free-list pages use 3 (see `storage`).
const INTERNAL_KIND: u16 = 1;
const LEAF_KIND: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Internal,
    Leaf,
}

impl NodeType {
    pub fn raw(self) -> u16 {
        match self {
            NodeType::Internal => INTERNAL_KIND,
            NodeType::Leaf => LEAF_KIND,
        }
    }

    fn from_raw(raw: u16) -> NodeType {
        match raw {
            INTERNAL_KIND => NodeType::Internal,
            LEAF_KIND => NodeType::Leaf,
            other => panic!("unknown node type {other}"),
        }
    }
}

fn read_u16(data: &[u8], pos: usize) -> usize {
    u16::from_le_bytes(data[pos..pos + 2].try_into().unwrap()) as usize
}

fn write_u16(data: &mut [u8], pos: usize, val: usize) {
    debug_assert!(val <= u16::MAX as usize);
    data[pos..pos + 2].copy_from_slice(&(val as u16).to_le_bytes());
}

/// Borrowed read-only view over a node page.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    data: &'a [u8],
}

impl<'a> NodeRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn node_type(&self) -> NodeType {
        NodeType::from_raw(read_u16(self.data, 0) as u16)
    }

    pub fn nkeys(&self) -> usize {
        read_u16(self.data, 2)
    }

    pub fn ptr(&self, i: usize) -> u64 {
        assert!(i < self.nkeys(), "pointer index {i} out of bounds");
        let pos = NODE_HEADER_SIZE + i * POINTER_SIZE;
        u64::from_le_bytes(self.data[pos..pos + 8].try_into().unwrap())
    }

    /// Offset of slot `i` relative to the key/value region, `i` in
    /// `[0, nkeys]`. Slot 0 is implicitly at offset zero; `offset(nkeys)`
    /// is the end of the used bytes.
    pub fn offset(&self, i: usize) -> usize {
        let nkeys = self.nkeys();
        assert!(i <= nkeys, "offset index {i} out of bounds");
        if i == 0 {
            return 0;
        }
        read_u16(self.data, offset_pos(nkeys, i))
    }

    /// Absolute byte position of slot `i`, `i` in `[0, nkeys]`.
    pub fn kv_pos(&self, i: usize) -> usize {
        let nkeys = self.nkeys();
        assert!(i <= nkeys, "slot index {i} out of bounds");
        NODE_HEADER_SIZE + nkeys * (POINTER_SIZE + OFFSET_SIZE) + self.offset(i)
    }

    /// Serialized size of the node in bytes.
    pub fn size(&self) -> usize {
        self.kv_pos(self.nkeys())
    }

    pub fn key(&self, i: usize) -> &'a [u8] {
        assert!(i < self.nkeys(), "key index {i} out of bounds");
        let pos = self.kv_pos(i);
        let klen = read_u16(self.data, pos);
        let start = pos + KEY_LEN_SIZE + VAL_LEN_SIZE;
        &self.data[start..start + klen]
    }

    pub fn value(&self, i: usize) -> &'a [u8] {
        assert!(i < self.nkeys(), "value index {i} out of bounds");
        let pos = self.kv_pos(i);
        let klen = read_u16(self.data, pos);
        let vlen = read_u16(self.data, pos + KEY_LEN_SIZE);
        let start = pos + KEY_LEN_SIZE + VAL_LEN_SIZE + klen;
        &self.data[start..start + vlen]
    }

    /// Greatest slot index whose key is less than or equal to `key`.
    ///
    /// Slot 0 carries the subtree sentinel, which is by construction the
    /// smallest key reachable here, so the scan starts at slot 1 and slot 0
    /// is always a valid answer.
    pub fn find_le(&self, key: &[u8]) -> usize {
        let mut found = 0;
        for i in 1..self.nkeys() {
            if self.key(i) <= key {
                found = i;
            } else {
                break;
            }
        }
        found
    }
}

fn offset_pos(nkeys: usize, i: usize) -> usize {
    debug_assert!(i >= 1 && i <= nkeys);
    NODE_HEADER_SIZE + nkeys * POINTER_SIZE + (i - 1) * OFFSET_SIZE
}

/// Owned scratch buffer for building nodes.
pub struct NodeBuf {
    data: Vec<u8>,
}

impl NodeBuf {
    /// A zeroed single-page buffer.
    pub fn page() -> Self {
        Self {
            data: vec![0; PAGE_SIZE],
        }
    }

    /// A zeroed double-page buffer for copy-on-write results that may
    /// overflow one page before splitting.
    pub fn scratch() -> Self {
        Self {
            data: vec![0; 2 * PAGE_SIZE],
        }
    }

    /// Copy of an existing page, used to detach a node from the pager
    /// before mutating the tree around it.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    pub fn as_node(&self) -> NodeRef<'_> {
        NodeRef::new(&self.data)
    }

    pub fn size(&self) -> usize {
        self.as_node().size()
    }

    pub fn set_header(&mut self, ty: NodeType, nkeys: usize) {
        write_u16(&mut self.data, 0, ty.raw() as usize);
        write_u16(&mut self.data, 2, nkeys);
    }

    pub fn set_ptr(&mut self, i: usize, ptr: u64) {
        assert!(i < self.as_node().nkeys(), "pointer index {i} out of bounds");
        let pos = NODE_HEADER_SIZE + i * POINTER_SIZE;
        self.data[pos..pos + 8].copy_from_slice(&ptr.to_le_bytes());
    }

    fn set_offset(&mut self, i: usize, offset: usize) {
        let nkeys = self.as_node().nkeys();
        assert!(i <= nkeys, "offset index {i} out of bounds");
        if i == 0 {
            return;
        }
        write_u16(&mut self.data, offset_pos(nkeys, i), offset);
    }

    /// Write pointer, key, and value at slot `i` and cascade the `i+1`-th
    /// offset. The header must already hold the final key count, and slots
    /// must be written in ascending order because each offset is derived
    /// from the previous one.
    pub fn write_slot(&mut self, i: usize, ptr: u64, key: &[u8], value: &[u8]) {
        self.set_ptr(i, ptr);

        let pos = self.as_node().kv_pos(i);
        write_u16(&mut self.data, pos, key.len());
        write_u16(&mut self.data, pos + KEY_LEN_SIZE, value.len());
        let start = pos + KEY_LEN_SIZE + VAL_LEN_SIZE;
        self.data[start..start + key.len()].copy_from_slice(key);
        self.data[start + key.len()..start + key.len() + value.len()].copy_from_slice(value);

        let next = self.as_node().offset(i) + KEY_LEN_SIZE + VAL_LEN_SIZE + key.len() + value.len();
        self.set_offset(i + 1, next);
    }

    /// Copy `n` slots (pointers, offsets, packed bytes) from `src` starting
    /// at `src_idx` into this node starting at `dst_idx`. Offsets are
    /// rebased so the copied slots pack against whatever this node already
    /// holds. This is the primitive every copy-on-write mutation composes.
    pub fn copy_range(&mut self, src: NodeRef<'_>, dst_idx: usize, src_idx: usize, n: usize) {
        assert!(
            dst_idx + n <= self.as_node().nkeys(),
            "destination range out of bounds"
        );
        assert!(src_idx + n <= src.nkeys(), "source range out of bounds");
        if n == 0 {
            return;
        }

        for i in 0..n {
            self.set_ptr(dst_idx + i, src.ptr(src_idx + i));
        }

        let src_base = src.offset(src_idx);
        let dst_base = self.as_node().offset(dst_idx);
        for i in 1..=n {
            let offset = dst_base + src.offset(src_idx + i) - src_base;
            self.set_offset(dst_idx + i, offset);
        }

        let start = src.kv_pos(src_idx);
        let end = src.kv_pos(src_idx + n);
        let dst = self.as_node().kv_pos(dst_idx);
        self.data[dst..dst + (end - start)].copy_from_slice(&src.data[start..end]);
    }

    /// Shrink to the serialized size and hand the buffer over, asserting
    /// the page-size bound every stored node must satisfy.
    pub fn into_page(mut self) -> Box<[u8]> {
        let size = self.size();
        assert!(size <= PAGE_SIZE, "node overflows page size: {size}");
        self.data.truncate(size);
        self.data.into_boxed_slice()
    }
}
