// Copyright 2026 The Numaheap Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-socket malloc heap
//!
//! A heap owns every element carved from the memseg lists of one
//! socket: an address-ordered index over all elements and an array of
//! segregated free lists. All mutation happens under the heap's lock,
//! which lives in the owning context; the heap itself is plain state.

use core::fmt;
use core::ptr::null_mut;
use std::collections::BTreeSet;

use crate::align::cache_line_roundup;
use crate::config::MemsegList;
use crate::elem::{self, Element, N_FREELISTS};
use crate::flags::AllocFlags;
use crate::provider::PageProvider;
use crate::stats::SocketStats;

/// One socket's heap
///
/// Free lists are intrusive doubly-linked lists threaded through the
/// in-band element headers; `by_addr` indexes every element (free and
/// busy) by virtual address for ordered iteration and insert.
pub struct Heap {
    /// Socket this heap serves
    pub(crate) socket_id: u32,
    /// Sum of all element sizes currently linked
    pub(crate) total_size: usize,
    /// Number of live allocations
    pub(crate) alloc_count: usize,
    /// Segregated free-list heads
    pub(crate) free_head: [*mut Element; N_FREELISTS],
    /// Every element, keyed by address
    pub(crate) by_addr: BTreeSet<usize>,
}

// Raw element pointers are only ever touched under the owning
// context's per-heap lock.
unsafe impl Send for Heap {}

impl Heap {
    /// Create an empty heap for one socket
    pub(crate) fn new(socket_id: u32) -> Self {
        Self {
            socket_id,
            total_size: 0,
            alloc_count: 0,
            free_head: [null_mut(); N_FREELISTS],
            by_addr: BTreeSet::new(),
        }
    }

    /// Lowest-address element across all memseg lists of this heap
    #[cfg(test)]
    pub(crate) fn first(&self) -> *mut Element {
        match self.by_addr.iter().next() {
            Some(&addr) => addr as *mut Element,
            None => null_mut(),
        }
    }

    /// Put a FREE element on the list matching its data size
    pub(crate) unsafe fn free_list_insert(&mut self, elem: *mut Element) {
        let idx = elem::elem_free_list_index(elem);
        let head = self.free_head[idx];
        (*elem).free_prev = null_mut();
        (*elem).free_next = head;
        if !head.is_null() {
            (*head).free_prev = elem;
        }
        self.free_head[idx] = elem;
    }

    /// Take a FREE element off its list
    pub(crate) unsafe fn free_list_remove(&mut self, elem: *mut Element) {
        let idx = elem::elem_free_list_index(elem);
        let prev = (*elem).free_prev;
        let next = (*elem).free_next;
        if self.free_head[idx] == elem {
            self.free_head[idx] = next;
        }
        if !prev.is_null() {
            (*prev).free_next = next;
        }
        if !next.is_null() {
            (*next).free_prev = prev;
        }
        (*elem).free_prev = null_mut();
        (*elem).free_next = null_mut();
    }

    /// Find a free element able to hold the request
    ///
    /// Scans free-list classes from the one matching `size` upward.
    /// The first fit whose page size matches the request's page-size
    /// flags wins; the first fit regardless of page size is kept as a
    /// fallback and returned only when the flags are a hint.
    pub(crate) unsafe fn find_suitable_element(
        &self,
        size: usize,
        flags: AllocFlags,
        align: usize,
        bound: usize,
        contig: bool,
        provider: &dyn PageProvider,
    ) -> Option<*mut Element> {
        let mut alt_elem: Option<*mut Element> = None;

        for idx in elem::free_list_index(size)..N_FREELISTS {
            let mut e = self.free_head[idx];
            while !e.is_null() {
                if elem::can_hold(e, size, align, bound, contig, provider) {
                    if flags.matches_page_size((*e).page_sz()) {
                        return Some(e);
                    }
                    if alt_elem.is_none() {
                        alt_elem = Some(e);
                    }
                }
                e = (*e).free_next;
            }
        }

        if flags.contains(AllocFlags::SIZE_HINT_ONLY) {
            return alt_elem;
        }
        None
    }

    /// Satisfy a request from existing free elements only
    ///
    /// Rounds size and alignment up to a cache line, then carves the
    /// first suitable element. Returns the payload address, or `None`
    /// with no side effects.
    pub(crate) unsafe fn alloc(
        &mut self,
        size: usize,
        flags: AllocFlags,
        align: usize,
        bound: usize,
        contig: bool,
        provider: &dyn PageProvider,
    ) -> Option<*mut u8> {
        let size = cache_line_roundup(size);
        let align = cache_line_roundup(align);

        let found = self.find_suitable_element(size, flags, align, bound, contig, provider)?;
        let busy = elem::alloc(self, found, size, align, bound, contig, provider)?;
        self.alloc_count += 1;

        Some(elem::payload_addr(busy) as *mut u8)
    }

    /// Expand the heap with a fresh memory area
    ///
    /// Installs `[start, start + len)` as a single FREE element,
    /// merging with adjacent free memory if the area extends an
    /// existing run. Returns the (possibly merged) element.
    pub(crate) unsafe fn add_memory(
        &mut self,
        msl: *const MemsegList,
        start: usize,
        len: usize,
    ) -> *mut Element {
        let elem = start as *mut Element;
        elem::init(elem, self as *mut Heap, msl, len);
        elem::insert(self, elem);
        let elem = elem::join_adjacent_free(self, elem);
        self.free_list_insert(elem);
        self.total_size += len;
        elem
    }

    /// Snapshot free-list totals and counts
    pub(crate) fn get_stats(&self) -> SocketStats {
        let mut stats = SocketStats {
            total_bytes: self.total_size,
            alloc_count: self.alloc_count,
            ..SocketStats::default()
        };

        unsafe {
            for head in self.free_head.iter() {
                let mut e = *head;
                while !e.is_null() {
                    stats.free_count += 1;
                    stats.free_bytes += (*e).size;
                    if (*e).size > stats.greatest_free_size {
                        stats.greatest_free_size = (*e).size;
                    }
                    e = (*e).free_next;
                }
            }
        }

        stats.alloc_bytes = stats.total_bytes - stats.free_bytes;
        stats
    }

    /// Write heap totals and every element to a dump stream
    pub(crate) fn dump(&self, f: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(f, "Heap size: {:#x}", self.total_size)?;
        writeln!(f, "Heap alloc count: {}", self.alloc_count)?;
        for &addr in &self.by_addr {
            unsafe { elem::dump(addr as *const Element, f)? };
        }
        Ok(())
    }

    /// Walk every structure and assert the heap's invariants
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        use crate::elem::{cookies_ok, ElemState};
        use std::collections::HashSet;

        unsafe {
            // collect free-list membership and check list structure
            let mut listed: HashSet<usize> = HashSet::new();
            for (idx, head) in self.free_head.iter().enumerate() {
                let mut e = *head;
                let mut prev: *mut Element = null_mut();
                while !e.is_null() {
                    assert_eq!((*e).free_prev, prev, "free list back-link broken");
                    assert_eq!((*e).state(), Some(ElemState::Free));
                    assert_eq!(elem::elem_free_list_index(e), idx, "element in wrong class");
                    assert!(listed.insert(e as usize), "element on two free lists");
                    prev = e;
                    e = (*e).free_next;
                }
            }

            let mut total = 0;
            let mut busy = 0;
            let mut free_seen = 0;
            for &addr in &self.by_addr {
                let e = addr as *mut Element;
                assert!(cookies_ok(e), "bad cookies at {addr:#x}");
                total += (*e).size;
                match (*e).state() {
                    Some(ElemState::Busy) => {
                        busy += 1;
                        assert!(!listed.contains(&addr), "busy element on a free list");
                    }
                    Some(ElemState::Free) => {
                        free_seen += 1;
                        assert!(listed.contains(&addr), "free element not on a free list");
                    }
                    other => panic!("unexpected linked state {other:?}"),
                }
                let next = (*e).next;
                if !next.is_null() {
                    assert_eq!((*next).prev, e, "adjacency back-link broken");
                    assert_eq!(next as usize, addr + (*e).size, "non-adjacent next link");
                    assert_eq!((*next).msl, (*e).msl, "next link crosses memseg lists");
                    assert!(
                        !((*e).is_free() && (*next).is_free()),
                        "two adjacent free elements"
                    );
                }
            }

            assert_eq!(total, self.total_size, "total_size out of sync");
            assert_eq!(busy, self.alloc_count, "alloc_count out of sync");
            assert_eq!(free_seen, listed.len(), "free list holds unlinked elements");
        }
    }
}
