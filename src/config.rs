//! Central configuration constants.
//!
//! Derived values live next to their inputs so they cannot drift apart;
//! the const assertions at the bottom enforce the relationships that the
//! node codec and pager rely on.

/// Size of every on-disk page. The master page, tree nodes, and free-list
/// nodes all occupy exactly one page.
pub const PAGE_SIZE: usize = 4096;

/// Node header: type discriminator (u16) plus key count (u16).
pub const NODE_HEADER_SIZE: usize = 4;
/// Child page id, one per slot (unused in leaves).
pub const POINTER_SIZE: usize = 8;
/// Per-slot entry in the offset array.
pub const OFFSET_SIZE: usize = 2;
/// Key length prefix inside a packed slot.
pub const KEY_LEN_SIZE: usize = 2;
/// Value length prefix inside a packed slot.
pub const VAL_LEN_SIZE: usize = 2;

/// Bytes available to a single key/value pair occupying a node alone.
const MAX_PAIR_SPACE: usize = PAGE_SIZE
    - NODE_HEADER_SIZE
    - POINTER_SIZE
    - OFFSET_SIZE
    - KEY_LEN_SIZE
    - VAL_LEN_SIZE;

/// Largest accepted key. One third of the single-pair space.
pub const MAX_KEY_SIZE: usize = MAX_PAIR_SPACE / 3;

/// Largest accepted value. Whatever the single-pair space leaves after
/// the key, so a maximal pair always fits in a node by itself.
pub const MAX_VALUE_SIZE: usize = MAX_PAIR_SPACE - MAX_KEY_SIZE;

/// Initial mmap coverage, in pages. Doubled until the file fits.
pub const MIN_MMAP_PAGES: usize = 2;

/// The file grows by at least `pages / FILE_GROWTH_DIVISOR` whole pages
/// (and never less than one) whenever it must be extended.
pub const FILE_GROWTH_DIVISOR: u64 = 8;

const _: () = assert!(MAX_KEY_SIZE + MAX_VALUE_SIZE == MAX_PAIR_SPACE);
const _: () = assert!(
    NODE_HEADER_SIZE
        + POINTER_SIZE
        + OFFSET_SIZE
        + KEY_LEN_SIZE
        + VAL_LEN_SIZE
        + MAX_KEY_SIZE
        + MAX_VALUE_SIZE
        <= PAGE_SIZE
);
const _: () = assert!(PAGE_SIZE.is_power_of_two());
