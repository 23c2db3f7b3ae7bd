//! Append-only set of memory-mapped regions over the page file.
//!
//! The first region covers at least [`MIN_MMAP_PAGES`] pages and is doubled
//! until it spans the file. When the file later outgrows the mapped range a
//! new region of the current total size is mapped at the tail offset, so
//! coverage doubles with each growth while every existing region stays at
//! its original address. Handed-out page slices therefore remain valid for
//! the lifetime of the set; there is no `mremap` anywhere.
//!
//! Regions may extend past the end of the file. That is fine as long as
//! nobody touches the unbacked tail, which the pager guarantees by bounds-
//! checking every access against its page counters and by growing the file
//! before copying staged pages out.

use std::fs::File;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use crate::config::{MIN_MMAP_PAGES, PAGE_SIZE};

#[derive(Debug)]
pub struct MmapSet {
    /// Total mapped bytes across all regions. Always a multiple of
    /// `PAGE_SIZE` and a doubling of the initial size.
    mapped: u64,
    regions: Vec<MmapMut>,
}

impl MmapSet {
    /// Map a file, choosing an initial region size of at least two pages
    /// doubled until it covers `file_size` bytes.
    pub fn new(file: &File, file_size: u64) -> Result<Self> {
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "file size {} is not a multiple of the page size {}",
            file_size,
            PAGE_SIZE
        );

        let mut mapped = (MIN_MMAP_PAGES * PAGE_SIZE) as u64;
        while mapped < file_size {
            mapped *= 2;
        }

        // SAFETY: mapping a file we hold open read/write. This is sound
        // because:
        // 1. The database file is single-writer and not shared with other
        //    processes while open, so nobody mutates it under us.
        // 2. The mapping may extend past EOF, but the pager never reads or
        //    writes a page beyond the file's page count.
        // 3. The region is owned by this set and dropped with it, never
        //    unmapped while borrowed (enforced by the borrow checker).
        let region = unsafe {
            MmapOptions::new()
                .len(mapped as usize)
                .map_mut(file)
                .wrap_err("failed to map database file")?
        };

        Ok(Self {
            mapped,
            regions: vec![region],
        })
    }

    /// Bytes currently covered by the mapping.
    pub fn mapped_len(&self) -> u64 {
        self.mapped
    }

    /// Extend coverage to at least `need` bytes by appending regions at the
    /// tail offset, doubling total coverage each time.
    pub fn grow(&mut self, file: &File, need: u64) -> Result<()> {
        while self.mapped < need {
            // SAFETY: same conditions as in `new`; additionally the new
            // region starts exactly where the mapped range ends, so regions
            // tile the file without overlap.
            let region = unsafe {
                MmapOptions::new()
                    .offset(self.mapped)
                    .len(self.mapped as usize)
                    .map_mut(file)
                    .wrap_err("failed to map additional region")?
            };
            self.regions.push(region);
            self.mapped *= 2;
        }
        Ok(())
    }

    /// Borrow the mapped bytes of a page. The caller must have validated
    /// the id against the file's page count; a miss here means the pager's
    /// counters are corrupt.
    pub fn page(&self, id: u64) -> &[u8] {
        let mut start = 0u64;
        for region in &self.regions {
            let pages = (region.len() / PAGE_SIZE) as u64;
            if id < start + pages {
                let offset = ((id - start) as usize) * PAGE_SIZE;
                return &region[offset..offset + PAGE_SIZE];
            }
            start += pages;
        }
        panic!("page {id} beyond mapped regions");
    }

    /// Mutable variant of [`MmapSet::page`].
    pub fn page_mut(&mut self, id: u64) -> &mut [u8] {
        let mut start = 0u64;
        for region in &mut self.regions {
            let pages = (region.len() / PAGE_SIZE) as u64;
            if id < start + pages {
                let offset = ((id - start) as usize) * PAGE_SIZE;
                return &mut region[offset..offset + PAGE_SIZE];
            }
            start += pages;
        }
        panic!("page {id} beyond mapped regions");
    }
}
