// Copyright 2026 The Numaheap Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Memory configuration
//!
//! The process-wide memory topology the allocator consumes: the
//! memseg lists (virtual reservations of a fixed page-size class on a
//! specific socket), the runs populated at boot, the online sockets,
//! and the mode flags. The configuration is immutable once a context
//! has been built over it.

use core::cell::Cell;

use crate::align::is_aligned;
use crate::{HeapError, Result};

/// One memseg list: a virtual-address reservation on one socket,
/// carved into `n_segs` pages of a single page-size class. Pages are
/// populated on demand by the page provider.
#[derive(Debug, Clone)]
pub struct MemsegList {
    /// Position of this list in [`MemoryConfig::memseg_lists`]
    pub index: usize,
    /// Base virtual address of the reservation
    pub base_va: usize,
    /// Page size of every page in this list
    pub page_sz: usize,
    /// Number of page slots in the reservation
    pub n_segs: usize,
    /// NUMA socket the backing pages belong to
    pub socket_id: u32,
}

impl MemsegList {
    /// Create a new memseg list descriptor
    pub fn new(index: usize, base_va: usize, page_sz: usize, n_segs: usize, socket_id: u32) -> Self {
        Self { index, base_va, page_sz, n_segs, socket_id }
    }

    /// Total length of the reservation in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.n_segs * self.page_sz
    }

    /// Whether the reservation holds no page slots
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n_segs == 0
    }

    /// One past the highest address of the reservation
    #[inline]
    pub fn end_va(&self) -> usize {
        self.base_va + self.len()
    }

    /// Whether an address falls inside the reservation
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_va && addr < self.end_va()
    }

    /// Virtual address of a page slot
    #[inline]
    pub fn seg_addr(&self, seg_idx: usize) -> usize {
        self.base_va + seg_idx * self.page_sz
    }

    /// Page-slot index covering an address inside the reservation
    #[inline]
    pub fn seg_index(&self, addr: usize) -> usize {
        (addr - self.base_va) / self.page_sz
    }
}

/// A run of consecutive page slots within one memseg list
///
/// The boot-time configuration lists the IOVA-contiguous runs already
/// populated when the primary process starts; each becomes one
/// initial free element.
#[derive(Debug, Clone, Copy)]
pub struct SegRun {
    /// Memseg list the run belongs to
    pub msl_index: usize,
    /// First page slot of the run
    pub seg_idx: usize,
    /// Number of consecutive page slots
    pub n_segs: usize,
}

/// Process-wide memory configuration consumed by the allocator
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// All memseg lists, indexed by [`MemsegList::index`]
    pub memseg_lists: Vec<MemsegList>,

    /// IOVA-contiguous runs populated at boot, registered by `init`
    pub initial_runs: Vec<SegRun>,

    /// Online sockets, in index order for cross-socket fallback
    pub sockets: Vec<u32>,

    /// Upper bound on socket ids; sizes the per-socket heap array
    pub max_sockets: usize,

    /// Legacy mode: the heaps are fixed at boot, no growth or shrink
    pub legacy_mode: bool,

    /// Whether huge pages are available at all. When false, socket
    /// affinity is meaningless and every request is treated as ANY.
    pub hugepages_enabled: bool,

    /// Whether this process is the primary. Only a primary registers
    /// boot memory and grows or shrinks heaps.
    pub primary: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memseg_lists: Vec::new(),
            initial_runs: Vec::new(),
            sockets: vec![0],
            max_sockets: 1,
            legacy_mode: false,
            hugepages_enabled: true,
            primary: true,
        }
    }
}

impl MemoryConfig {
    /// Number of online sockets
    #[inline]
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Socket id at the given enumeration position
    #[inline]
    pub fn socket_id_by_idx(&self, idx: usize) -> u32 {
        self.sockets[idx]
    }

    /// Validate internal consistency before a context is built
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_sockets == 0 {
            return Err(HeapError::InvalidArgs);
        }
        if self.sockets.iter().any(|&s| s as usize >= self.max_sockets) {
            return Err(HeapError::InvalidArgs);
        }
        for (i, msl) in self.memseg_lists.iter().enumerate() {
            if msl.index != i
                || msl.base_va == 0
                || msl.n_segs == 0
                || !msl.page_sz.is_power_of_two()
                || !is_aligned(msl.base_va, msl.page_sz)
                || msl.socket_id as usize >= self.max_sockets
            {
                return Err(HeapError::InvalidArgs);
            }
        }
        for run in &self.initial_runs {
            let msl = self
                .memseg_lists
                .get(run.msl_index)
                .ok_or(HeapError::InvalidArgs)?;
            if run.n_segs == 0 || run.seg_idx + run.n_segs > msl.n_segs {
                return Err(HeapError::InvalidArgs);
            }
        }
        Ok(())
    }
}

std::thread_local! {
    static THREAD_SOCKET: Cell<u32> = Cell::new(0);
}

/// Register the calling thread's NUMA socket
///
/// The cross-socket dispatcher resolves an ANY-socket request to this
/// value. Threads that never register resolve to socket 0.
pub fn set_thread_socket(socket: u32) {
    THREAD_SOCKET.with(|s| s.set(socket));
}

/// The calling thread's registered NUMA socket
pub fn thread_socket() -> u32 {
    THREAD_SOCKET.with(|s| s.get())
}
