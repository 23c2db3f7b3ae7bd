//! Master page header.
//!
//! Page 0 is the single atomic commit point: it names the tree root, the
//! durable page count, and the free-list head. It is rewritten (and fsynced)
//! only after the pages it references are themselves durable, so at every
//! crash-consistent point it describes a complete snapshot.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// 16-byte file signature at the start of page 0.
pub const MASTER_SIG: &[u8; 16] = b"burrowdb format1";

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterHeader {
    sig: [u8; 16],
    root: U64,
    flushed: U64,
    free_list_head: U64,
}

const _: () = assert!(std::mem::size_of::<MasterHeader>() == 40);

impl MasterHeader {
    pub fn new(root: u64, flushed: u64, free_list_head: u64) -> Self {
        Self {
            sig: *MASTER_SIG,
            root: U64::new(root),
            flushed: U64::new(flushed),
            free_list_head: U64::new(free_list_head),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let size = std::mem::size_of::<Self>();
        ensure!(
            bytes.len() >= size,
            "buffer too small for master header: {} < {}",
            bytes.len(),
            size
        );
        let header = Self::ref_from_bytes(&bytes[..size])
            .map_err(|e| eyre::eyre!("failed to read master header: {:?}", e))?;
        ensure!(&header.sig == MASTER_SIG, "invalid database signature");
        Ok(header)
    }

    pub fn write_to(&self, page: &mut [u8]) {
        page[..std::mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.get()
    }

    pub fn free_list_head(&self) -> u64 {
        self.free_list_head.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_40_bytes() {
        assert_eq!(std::mem::size_of::<MasterHeader>(), 40);
    }

    #[test]
    fn roundtrips_through_bytes() {
        let mut page = [0u8; 64];
        MasterHeader::new(3, 17, 9).write_to(&mut page);

        let header = MasterHeader::from_bytes(&page).unwrap();
        assert_eq!(header.root(), 3);
        assert_eq!(header.flushed(), 17);
        assert_eq!(header.free_list_head(), 9);
    }

    #[test]
    fn rejects_wrong_signature() {
        let mut page = [0u8; 64];
        MasterHeader::new(1, 2, 0).write_to(&mut page);
        page[0] ^= 0xFF;

        let result = MasterHeader::from_bytes(&page);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_short_buffer() {
        let page = [0u8; 16];
        assert!(MasterHeader::from_bytes(&page).is_err());
    }
}
