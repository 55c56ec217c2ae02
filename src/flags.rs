// Copyright 2026 The Numaheap Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Allocation request flags
//!
//! A request may pin one or more page-size classes and may mark the
//! pinning as a hint only. With no page-size bit set, every class
//! matches.

/// 256 KiB page-size class
pub const PGSIZE_256K: usize = 256 * 1024;
/// 2 MiB page-size class
pub const PGSIZE_2M: usize = 2 * 1024 * 1024;
/// 16 MiB page-size class
pub const PGSIZE_16M: usize = 16 * 1024 * 1024;
/// 256 MiB page-size class
pub const PGSIZE_256M: usize = 256 * 1024 * 1024;
/// 512 MiB page-size class
pub const PGSIZE_512M: usize = 512 * 1024 * 1024;
/// 1 GiB page-size class
pub const PGSIZE_1G: usize = 1024 * 1024 * 1024;
/// 4 GiB page-size class
pub const PGSIZE_4G: usize = 4 * 1024 * 1024 * 1024;
/// 16 GiB page-size class
pub const PGSIZE_16G: usize = 16 * 1024 * 1024 * 1024;

bitflags::bitflags! {
    /// Flags accepted by every allocation entry point
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Page-size bits are a preference, not a requirement
        const SIZE_HINT_ONLY = 1 << 0;

        /// Serve the request from 256 KiB pages
        const PAGE_256K = 1 << 1;

        /// Serve the request from 2 MiB pages
        const PAGE_2M = 1 << 2;

        /// Serve the request from 16 MiB pages
        const PAGE_16M = 1 << 3;

        /// Serve the request from 256 MiB pages
        const PAGE_256M = 1 << 4;

        /// Serve the request from 512 MiB pages
        const PAGE_512M = 1 << 5;

        /// Serve the request from 1 GiB pages
        const PAGE_1G = 1 << 6;

        /// Serve the request from 4 GiB pages
        const PAGE_4G = 1 << 7;

        /// Serve the request from 16 GiB pages
        const PAGE_16G = 1 << 8;
    }
}

impl AllocFlags {
    /// The page-size bits alone, with the hint bit stripped
    #[inline]
    pub fn size_flags(self) -> AllocFlags {
        self & !AllocFlags::SIZE_HINT_ONLY
    }

    /// The flag bit naming a page-size class, if the class is known
    pub fn for_page_size(page_sz: usize) -> Option<AllocFlags> {
        match page_sz {
            PGSIZE_256K => Some(AllocFlags::PAGE_256K),
            PGSIZE_2M => Some(AllocFlags::PAGE_2M),
            PGSIZE_16M => Some(AllocFlags::PAGE_16M),
            PGSIZE_256M => Some(AllocFlags::PAGE_256M),
            PGSIZE_512M => Some(AllocFlags::PAGE_512M),
            PGSIZE_1G => Some(AllocFlags::PAGE_1G),
            PGSIZE_4G => Some(AllocFlags::PAGE_4G),
            PGSIZE_16G => Some(AllocFlags::PAGE_16G),
            _ => None,
        }
    }

    /// Does memory of the given page size satisfy this request?
    ///
    /// A request with no page-size bit set matches every page size.
    /// Otherwise the page size must map to one of the set bits; page
    /// sizes outside the known classes match nothing.
    pub fn matches_page_size(self, page_sz: usize) -> bool {
        let size_flags = self.size_flags();
        if size_flags.is_empty() {
            return true;
        }
        match AllocFlags::for_page_size(page_sz) {
            Some(bit) => size_flags.contains(bit),
            None => false,
        }
    }
}
