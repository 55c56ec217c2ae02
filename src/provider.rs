// Copyright 2026 The Numaheap Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Page provider interface
//!
//! The allocator never maps memory itself. Growth asks the provider
//! for a run of freshly populated pages inside a memseg list; shrink
//! hands whole pages back. Providers are internally thread-safe and
//! may block on kernel calls; the heap lock is deliberately held
//! across provider calls to serialize growth.

use crate::config::MemsegList;
use crate::Result;

/// A run of pages obtained from the provider
///
/// The pages are virtually contiguous within a single memseg list:
/// slots `seg_idx .. seg_idx + n_segs` of `msl_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegBulk {
    /// Memseg list the pages live in
    pub msl_index: usize,
    /// First page slot of the run
    pub seg_idx: usize,
    /// Number of pages obtained
    pub n_segs: usize,
}

/// The low-level page provider consumed by the allocator
pub trait PageProvider: Send + Sync {
    /// Populate `n_segs` fresh pages of `page_sz` on `socket`
    ///
    /// Returns a virtually contiguous run inside one memseg list, or
    /// `None` if the provider cannot satisfy the request. With
    /// `exact` set, the provider must return exactly `n_segs` pages
    /// or nothing.
    fn alloc_seg_bulk(
        &self,
        n_segs: usize,
        page_sz: usize,
        socket: u32,
        exact: bool,
    ) -> Option<SegBulk>;

    /// Release one page slot back to the system
    fn free_seg(&self, msl: &MemsegList, seg_idx: usize) -> Result<()>;

    /// Release a run of page slots back to the system
    fn free_seg_bulk(&self, msl: &MemsegList, seg_idx: usize, n_segs: usize) -> Result<()> {
        for seg in seg_idx..seg_idx + n_segs {
            self.free_seg(msl, seg)?;
        }
        Ok(())
    }

    /// Whether `[addr, addr + len)` is physically contiguous
    fn is_contig(&self, msl: &MemsegList, addr: usize, len: usize) -> bool;
}
