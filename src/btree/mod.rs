//! Copy-on-write B+ tree: node codec, mutation algorithms, iteration.

mod iter;
mod node;
pub mod tree;

pub use iter::{Cmp, TreeIter};
pub use node::{NodeBuf, NodeRef, NodeType};
pub use tree::{lookup, BTree};
