// Copyright 2026 The Numaheap Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Allocator context
//!
//! A context binds the memory configuration, the page provider and
//! one locked heap per socket. Every public operation goes through a
//! context; a process-wide default can be installed once for callers
//! that do not thread one around.
//!
//! Growth policy: a failed allocation first tries to expand the
//! preferred socket's heap, page-size class by page-size class,
//! smallest first, with explicitly requested classes taking strict
//! precedence. Only then does the dispatcher fall back to other
//! sockets. Shrink is symmetric: freeing a region that covers whole
//! pages hides them from the heap and returns them to the provider.

use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

use log::{debug, error};
use spin::{Mutex, Once};

use crate::align::align_up;
use crate::config::{self, MemoryConfig, MemsegList};
use crate::elem::{self, ElemState, ELEM_HEADER_LEN, ELEM_OVERHEAD, ELEM_TRAILER_LEN};
use crate::flags::AllocFlags;
use crate::heap::Heap;
use crate::provider::PageProvider;
use crate::stats::SocketStats;
use crate::{HeapError, Result};

/// The allocator: per-socket heaps over a memory configuration and a
/// page provider
pub struct HeapContext {
    cfg: MemoryConfig,
    provider: Arc<dyn PageProvider>,
    /// One heap per socket id, indexed directly; boxed so element
    /// back-references stay valid when the context moves
    heaps: Box<[Mutex<Heap>]>,
}

impl HeapContext {
    /// Build a context and register all boot-populated memory
    ///
    /// Walks the configuration's IOVA-contiguous runs and installs
    /// each as an initial FREE element in the heap of its socket.
    /// Secondary processes register nothing.
    pub fn new(cfg: MemoryConfig, provider: Arc<dyn PageProvider>) -> Result<Self> {
        cfg.validate()?;

        let heaps: Box<[Mutex<Heap>]> = (0..cfg.max_sockets)
            .map(|s| Mutex::new(Heap::new(s as u32)))
            .collect();

        let ctx = Self { cfg, provider, heaps };

        if ctx.cfg.primary {
            for run in &ctx.cfg.initial_runs {
                let msl = &ctx.cfg.memseg_lists[run.msl_index];
                let start = msl.seg_addr(run.seg_idx);
                let len = run.n_segs * msl.page_sz;
                let mut heap = ctx.heaps[msl.socket_id as usize].lock();
                unsafe { heap.add_memory(msl as *const MemsegList, start, len) };
                debug!("Added {}M to heap on socket {}", len >> 20, msl.socket_id);
            }
        }

        Ok(ctx)
    }

    /// The configuration this context was built over
    pub fn memory_config(&self) -> &MemoryConfig {
        &self.cfg
    }

    /// Whether heaps may grow and shrink at all
    #[inline]
    fn can_resize_heaps(&self) -> bool {
        self.cfg.primary && !self.cfg.legacy_mode
    }

    /// Request enough fresh pages of one page-size class to guarantee
    /// the allocation fits, and install them as heap memory
    ///
    /// On any failure every newly obtained page is released and the
    /// heap is left exactly as it was.
    fn try_expand_heap(
        &self,
        heap: &mut Heap,
        pg_sz: usize,
        elt_size: usize,
        socket: u32,
        flags: AllocFlags,
        align: usize,
        bound: usize,
        contig: bool,
    ) -> Result<()> {
        let align = align.max(ELEM_HEADER_LEN.next_power_of_two());
        let map_len = align_up(align + elt_size + ELEM_TRAILER_LEN, pg_sz);
        let n_segs = map_len / pg_sz;

        let bulk = self
            .provider
            .alloc_seg_bulk(n_segs, pg_sz, socket, true)
            .ok_or(HeapError::NoMemory)?;

        let msl = match self.cfg.memseg_lists.get(bulk.msl_index) {
            Some(msl)
                if bulk.n_segs == n_segs
                    && msl.socket_id == socket
                    && msl.page_sz == pg_sz
                    && bulk.seg_idx + bulk.n_segs <= msl.n_segs =>
            {
                msl
            }
            _ => {
                error!("page provider returned an invalid segment run");
                return Err(HeapError::NoMemory);
            }
        };
        let map_addr = msl.seg_addr(bulk.seg_idx);

        // we may have wanted contiguous memory but not gotten it
        if contig && !self.provider.is_contig(msl, map_addr, map_len) {
            debug!("couldn't allocate physically contiguous space");
            let _ = self.provider.free_seg_bulk(msl, bulk.seg_idx, bulk.n_segs);
            return Err(HeapError::NoMemory);
        }

        let new_elem = unsafe { heap.add_memory(msl as *const MemsegList, map_addr, map_len) };

        // confirm the request can now be satisfied; if not, undo
        let found = unsafe {
            heap.find_suitable_element(elt_size, flags, align, bound, contig, &*self.provider)
        };
        if found.is_none() {
            unsafe {
                heap.free_list_remove(new_elem);
                elem::hide_region(heap, new_elem, map_addr, map_len);
            }
            heap.total_size -= map_len;
            let _ = self.provider.free_seg_bulk(msl, bulk.seg_idx, bulk.n_segs);
            return Err(HeapError::NoMemory);
        }

        debug!("Heap on socket {} was expanded by {}MB", socket, map_len >> 20);
        Ok(())
    }

    /// Pick the sequence of page-size classes to try for growth on
    /// one socket
    ///
    /// Explicitly requested classes go first, smallest first, and are
    /// tried without the hint bit so the in-growth re-check stays
    /// strict. Remaining classes are only tried when no class was
    /// requested or the request is a hint, after re-checking whether
    /// earlier growth already made the request satisfiable under
    /// relaxed flags.
    #[allow(clippy::too_many_arguments)]
    fn alloc_mem_on_socket(
        &self,
        heap: &mut Heap,
        size: usize,
        socket: u32,
        flags: AllocFlags,
        align: usize,
        bound: usize,
        contig: bool,
    ) -> Result<()> {
        let size_hint = flags.contains(AllocFlags::SIZE_HINT_ONLY);
        let size_flags = flags.size_flags();

        let mut requested_pg_sz = Vec::new();
        let mut other_pg_sz = Vec::new();
        for msl in &self.cfg.memseg_lists {
            if msl.socket_id != socket {
                continue;
            }
            if !size_flags.is_empty() && size_flags.matches_page_size(msl.page_sz) {
                requested_pg_sz.push(msl.page_sz);
            } else if size_flags.is_empty() || size_hint {
                other_pg_sz.push(msl.page_sz);
            }
        }
        requested_pg_sz.sort_unstable();
        requested_pg_sz.dedup();
        other_pg_sz.sort_unstable();
        other_pg_sz.dedup();

        for &pg_sz in &requested_pg_sz {
            if self
                .try_expand_heap(heap, pg_sz, size, socket, size_flags, align, bound, contig)
                .is_ok()
            {
                return Ok(());
            }
        }
        if other_pg_sz.is_empty() {
            return Err(HeapError::NoMemory);
        }

        // earlier growth plus relaxed page-size constraints may
        // already cover the request
        let found = unsafe {
            heap.find_suitable_element(size, flags, align, bound, contig, &*self.provider)
        };
        if found.is_some() {
            return Ok(());
        }

        for &pg_sz in &other_pg_sz {
            if self
                .try_expand_heap(heap, pg_sz, size, socket, flags, align, bound, contig)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(HeapError::NoMemory)
    }

    /// Allocate from one socket's heap, growing it on demand
    fn heap_alloc_on_socket(
        &self,
        size: usize,
        socket: u32,
        flags: AllocFlags,
        align: usize,
        bound: usize,
        contig: bool,
    ) -> Option<NonNull<u8>> {
        let heap_lock = self.heaps.get(socket as usize)?;
        let mut heap = heap_lock.lock();

        let align = if align == 0 { 1 } else { align };
        let provider = &*self.provider;

        // fixed heaps get one attempt, with all flags
        if !self.can_resize_heaps() {
            let ret = unsafe { heap.alloc(size, flags, align, bound, contig, provider) };
            return NonNull::new(ret?);
        }

        // strict page-size match first: even if this fails, growth of
        // an appropriate page-size class may still serve the request
        let size_flags = flags.size_flags();
        if let Some(ret) = unsafe { heap.alloc(size, size_flags, align, bound, contig, provider) } {
            return NonNull::new(ret);
        }

        if self
            .alloc_mem_on_socket(&mut heap, size, socket, flags, align, bound, contig)
            .is_ok()
        {
            let ret = unsafe { heap.alloc(size, flags, align, bound, contig, provider) };
            if ret.is_none() {
                error!("Error allocating from heap");
            }
            return NonNull::new(ret?);
        }
        None
    }

    /// Allocate a byte range
    ///
    /// `socket` of `None` means ANY: the request resolves to the
    /// calling thread's socket and, on failure, falls back to every
    /// other online socket in index order. A pinned socket never
    /// falls back. Returns `None` on any failure.
    ///
    /// # Arguments
    ///
    /// * `type_tag` - optional debugging tag, not interpreted
    /// * `size` - payload bytes, rounded up to a cache line
    /// * `socket` - preferred socket, or `None` for ANY
    /// * `flags` - page-size constraints and the hint bit
    /// * `align` - payload alignment, a power of two (0 for none)
    /// * `bound` - the payload must not cross a multiple of this
    ///   power of two (0 for none)
    /// * `contig` - require physically contiguous backing
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &self,
        type_tag: Option<&str>,
        size: usize,
        socket: Option<u32>,
        flags: AllocFlags,
        align: usize,
        bound: usize,
        contig: bool,
    ) -> Option<NonNull<u8>> {
        let _ = type_tag;

        if size == 0
            || (align != 0 && !align.is_power_of_two())
            || (bound != 0 && !bound.is_power_of_two())
        {
            return None;
        }

        // without huge pages socket affinity means nothing
        let socket_arg = if self.cfg.hugepages_enabled { socket } else { None };

        let socket_id = socket_arg.unwrap_or_else(config::thread_socket);
        if socket_id as usize >= self.cfg.max_sockets {
            return None;
        }

        let ret = self.heap_alloc_on_socket(size, socket_id, flags, align, bound, contig);
        if ret.is_some() || socket_arg.is_some() {
            return ret;
        }

        // try the other heaps
        for idx in 0..self.cfg.socket_count() {
            let cur_socket = self.cfg.socket_id_by_idx(idx);
            if cur_socket == socket_id {
                continue;
            }
            let ret = self.heap_alloc_on_socket(size, cur_socket, flags, align, bound, contig);
            if ret.is_some() {
                return ret;
            }
        }
        None
    }

    /// Look up the element behind a payload pointer and lock its heap
    ///
    /// Fails if the cookies do not validate, the element is not BUSY,
    /// or its heap back-reference does not belong to this context.
    unsafe fn lock_owning_heap(
        &self,
        ptr: *mut u8,
    ) -> Result<(spin::MutexGuard<'_, Heap>, *mut elem::Element)> {
        if ptr.is_null() {
            return Err(HeapError::InvalidArgs);
        }
        let e = elem::from_payload(ptr).ok_or(HeapError::Corrupted)?;
        if (*e).state() != Some(ElemState::Busy) {
            return Err(HeapError::Corrupted);
        }

        let heap_ptr = (*e).heap;
        let socket = (*e).heap_socket().ok_or(HeapError::Corrupted)?;
        let heap_lock = self
            .heaps
            .get(socket as usize)
            .ok_or(HeapError::Corrupted)?;
        let guard = heap_lock.lock();
        if !core::ptr::eq(&*guard as *const Heap, heap_ptr as *const Heap) {
            return Err(HeapError::Corrupted);
        }
        Ok((guard, e))
    }

    /// Free an allocation
    ///
    /// Marks the element FREE, merges it with adjacent free
    /// neighbours, and returns any whole pages the merged element
    /// covers back to the provider. Page release is best effort:
    /// provider failures are swallowed, the bytes stay hidden.
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        unsafe {
            let (mut heap, e) = self.lock_owning_heap(ptr)?;

            // the element may merge backwards, so read the memseg
            // list before freeing
            let msl = (*e).msl;
            let page_sz = (*msl).page_sz;

            (*e).set_state(ElemState::Free);
            let e = elem::free(&mut heap, e);
            heap.alloc_count -= 1;

            // anything after this is a bonus
            if !self.can_resize_heaps() {
                return Ok(());
            }

            // check if we can hand memory back to the system
            let len = (*e).size;
            if len < page_sz {
                return Ok(());
            }
            let start = e as usize;
            let end = start + len;
            let mut aligned_start = align_up(start, page_sz);
            let mut aligned_end = crate::align::align_down(end, page_sz);

            // a boundary remainder must have room to stand as an
            // element of its own; keep a page back rather than leave
            // an unrepresentable sliver
            if aligned_start != start && aligned_start - start < ELEM_OVERHEAD {
                aligned_start += page_sz;
            }
            if aligned_end != end && end - aligned_end < ELEM_OVERHEAD {
                aligned_end -= page_sz;
            }

            if aligned_end <= aligned_start {
                return Ok(());
            }
            let aligned_len = aligned_end - aligned_start;
            if aligned_len < page_sz {
                return Ok(());
            }

            heap.free_list_remove(e);
            elem::hide_region(&mut heap, e, aligned_start, aligned_len);
            heap.total_size -= aligned_len;

            // we don't really care if the provider fails here; the
            // lock stays held so shrink serializes with growth
            let n_segs = aligned_len / page_sz;
            let first_seg = (*msl).seg_index(aligned_start);
            for seg in first_seg..first_seg + n_segs {
                if self.provider.free_seg(&*msl, seg).is_err() {
                    debug!("could not return page {} of memseg list {}", seg, (*msl).index);
                }
            }
            debug!(
                "Heap on socket {} was shrunk by {}MB",
                heap.socket_id,
                aligned_len >> 20
            );
        }
        Ok(())
    }

    /// Grow an allocation in place
    ///
    /// Fails with [`HeapError::NotResizable`] when the element cannot
    /// be extended where it sits. Never relocates.
    pub fn resize(&self, ptr: *mut u8, size: usize) -> Result<()> {
        unsafe {
            let (mut heap, e) = self.lock_owning_heap(ptr)?;
            elem::resize(&mut heap, e, size)
        }
    }

    /// Statistics snapshot for one socket's heap
    pub fn get_stats(&self, socket: u32) -> Result<SocketStats> {
        let heap_lock = self
            .heaps
            .get(socket as usize)
            .ok_or(HeapError::InvalidArgs)?;
        Ok(heap_lock.lock().get_stats())
    }

    /// Write one heap's totals and every element to `f`
    ///
    /// Best effort: write errors are swallowed, like the rest of the
    /// diagnostics path.
    pub fn dump(&self, socket: u32, f: &mut dyn fmt::Write) -> Result<()> {
        let heap_lock = self
            .heaps
            .get(socket as usize)
            .ok_or(HeapError::InvalidArgs)?;
        if heap_lock.lock().dump(f).is_err() {
            debug!("heap dump truncated by write failure");
        }
        Ok(())
    }
}

static DEFAULT_CONTEXT: Once<HeapContext> = Once::new();

/// Install the process-wide default context
///
/// Walks the configuration's boot memory exactly like
/// [`HeapContext::new`]. Fails with [`HeapError::BadState`] if a
/// default context is already installed.
pub fn init(cfg: MemoryConfig, provider: Arc<dyn PageProvider>) -> Result<&'static HeapContext> {
    let ctx = HeapContext::new(cfg, provider)?;
    let mut installed = false;
    let r = DEFAULT_CONTEXT.call_once(|| {
        installed = true;
        ctx
    });
    if installed {
        Ok(r)
    } else {
        Err(HeapError::BadState)
    }
}

/// The process-wide default context, if one has been installed
pub fn default_context() -> Option<&'static HeapContext> {
    DEFAULT_CONTEXT.get()
}

/// Allocate from the default context; see [`HeapContext::alloc`]
#[allow(clippy::too_many_arguments)]
pub fn alloc(
    type_tag: Option<&str>,
    size: usize,
    socket: Option<u32>,
    flags: AllocFlags,
    align: usize,
    bound: usize,
    contig: bool,
) -> Option<NonNull<u8>> {
    default_context()?.alloc(type_tag, size, socket, flags, align, bound, contig)
}

/// Free through the default context; see [`HeapContext::free`]
pub fn free(ptr: *mut u8) -> Result<()> {
    default_context().ok_or(HeapError::BadState)?.free(ptr)
}

/// Resize through the default context; see [`HeapContext::resize`]
pub fn resize(ptr: *mut u8, size: usize) -> Result<()> {
    default_context().ok_or(HeapError::BadState)?.resize(ptr, size)
}

/// Stats through the default context; see [`HeapContext::get_stats`]
pub fn get_stats(socket: u32) -> Result<SocketStats> {
    default_context().ok_or(HeapError::BadState)?.get_stats(socket)
}

/// Dump through the default context; see [`HeapContext::dump`]
pub fn dump(socket: u32, f: &mut dyn fmt::Write) -> Result<()> {
    default_context().ok_or(HeapError::BadState)?.dump(socket, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegRun;
    use crate::elem::ELEM_OVERHEAD;
    use crate::flags::{PGSIZE_256K, PGSIZE_2M};
    use crate::provider::testing::{TestMemory, TestProvider};

    struct Fixture {
        ctx: HeapContext,
        provider: Arc<TestProvider>,
        _mems: Vec<TestMemory>,
    }

    /// Build a context over one buffer-backed memseg list per
    /// `(page_sz, n_segs, socket)` spec
    fn build_with(
        specs: &[(usize, usize, u32)],
        prepopulate: bool,
        tweak: impl FnOnce(&mut MemoryConfig),
    ) -> Fixture {
        let mut mems = Vec::new();
        let mut msls = Vec::new();
        for (i, &(page_sz, n_segs, socket)) in specs.iter().enumerate() {
            let mem = TestMemory::new(page_sz, n_segs);
            msls.push(MemsegList::new(i, mem.base_va(), page_sz, n_segs, socket));
            mems.push(mem);
        }
        let mut sockets: Vec<u32> = specs.iter().map(|s| s.2).collect();
        sockets.sort_unstable();
        sockets.dedup();
        let max_sockets = sockets.iter().copied().max().unwrap_or(0) as usize + 1;

        let provider = Arc::new(TestProvider::new(&msls));
        let initial_runs = if prepopulate {
            specs
                .iter()
                .enumerate()
                .map(|(i, &(_, n_segs, _))| {
                    provider.mark_populated(i, 0, n_segs);
                    SegRun { msl_index: i, seg_idx: 0, n_segs }
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut cfg = MemoryConfig {
            memseg_lists: msls,
            initial_runs,
            sockets,
            max_sockets,
            ..MemoryConfig::default()
        };
        tweak(&mut cfg);

        let ctx = HeapContext::new(cfg, provider.clone()).unwrap();
        Fixture { ctx, provider, _mems: mems }
    }

    fn build(specs: &[(usize, usize, u32)], legacy: bool, prepopulate: bool) -> Fixture {
        build_with(specs, prepopulate, |cfg| cfg.legacy_mode = legacy)
    }

    #[test]
    fn test_rejects_invalid_requests() {
        let f = build(&[(PGSIZE_256K, 64, 0)], true, true);

        assert!(f.ctx.alloc(None, 0, None, AllocFlags::empty(), 0, 0, false).is_none());
        assert!(f.ctx.alloc(None, 64, None, AllocFlags::empty(), 3, 0, false).is_none());
        assert!(f.ctx.alloc(None, 64, None, AllocFlags::empty(), 0, 3, false).is_none());
        assert!(f.ctx.alloc(None, 64, Some(99), AllocFlags::empty(), 0, 0, false).is_none());
        assert!(f.ctx.get_stats(99).is_err());
    }

    #[test]
    fn test_exact_fit_split_and_coalesce() {
        let f = build(&[(PGSIZE_256K, 64, 0)], true, true);
        let total = 64 * PGSIZE_256K;

        let p = f
            .ctx
            .alloc(Some("test"), 4096, Some(0), AllocFlags::empty(), 64, 0, false)
            .unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);

        let stats = f.ctx.get_stats(0).unwrap();
        assert_eq!(stats.total_bytes, total, "split must not change totals");
        assert_eq!(stats.alloc_count, 1);
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.alloc_bytes, 4096 + ELEM_OVERHEAD);
        f.ctx.heaps[0].lock().check_invariants();

        f.ctx.free(p.as_ptr()).unwrap();
        let stats = f.ctx.get_stats(0).unwrap();
        assert_eq!(stats.alloc_count, 0);
        assert_eq!(stats.free_count, 1, "free must coalesce back to one element");
        assert_eq!(stats.free_bytes, total);
        assert_eq!(stats.greatest_free_size, total);
        // legacy heaps never return pages
        assert!(f.provider.freed_segs().is_empty());
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_growth_on_demand() {
        let f = build(&[(PGSIZE_2M, 16, 0)], false, false);
        let size = 3 * 1024 * 1024;

        let p = f
            .ctx
            .alloc(None, size, Some(0), AllocFlags::empty(), 0, 0, true)
            .unwrap();
        let msl = &f.ctx.memory_config().memseg_lists[0];
        assert!(msl.contains(p.as_ptr() as usize));
        assert_eq!(f.provider.populated_count(), 2, "3M on 2M pages needs two pages");

        let stats = f.ctx.get_stats(0).unwrap();
        assert_eq!(stats.total_bytes, 2 * PGSIZE_2M);
        assert_eq!(stats.alloc_count, 1);
        assert_eq!(stats.free_count, 1, "the unused head of the mapped area stays free");
        assert_eq!(stats.free_bytes, 2 * PGSIZE_2M - size - ELEM_OVERHEAD);
        f.ctx.heaps[0].lock().check_invariants();

        // provider exhaustion surfaces as a plain allocation failure
        f.provider.set_fail_alloc(true);
        let none = f
            .ctx
            .alloc(None, 32 * 1024 * 1024, Some(0), AllocFlags::empty(), 0, 0, false);
        assert!(none.is_none());
    }

    #[test]
    fn test_contig_failure_unwinds() {
        let f = build(&[(PGSIZE_2M, 16, 0)], false, false);
        let before = f.ctx.get_stats(0).unwrap();

        f.provider.set_force_non_contig(true);
        let ret = f
            .ctx
            .alloc(None, 3 * 1024 * 1024, Some(0), AllocFlags::empty(), 0, 0, true);
        assert!(ret.is_none());

        // the obtained pages were handed straight back
        assert_eq!(f.provider.populated_count(), 0);
        assert_eq!(f.provider.freed_segs().len(), 2);
        assert_eq!(f.ctx.get_stats(0).unwrap(), before);
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_cross_socket_fallback() {
        let f = build(&[(PGSIZE_256K, 2, 0), (PGSIZE_256K, 32, 1)], false, false);
        let size = 1024 * 1024;

        // ANY resolves to socket 0 (thread default), which cannot
        // hold the request, and falls back to socket 1
        let p = f
            .ctx
            .alloc(None, size, None, AllocFlags::empty(), 0, 0, false)
            .unwrap();
        let msl1 = &f.ctx.memory_config().memseg_lists[1];
        assert!(msl1.contains(p.as_ptr() as usize));
        assert_eq!(f.ctx.get_stats(1).unwrap().alloc_count, 1);
        assert_eq!(f.ctx.get_stats(0).unwrap().total_bytes, 0);

        // a pinned socket never falls back
        assert!(f.ctx.alloc(None, size, Some(0), AllocFlags::empty(), 0, 0, false).is_none());
    }

    #[test]
    fn test_hugepages_disabled_forces_any_socket() {
        let f = build_with(&[(PGSIZE_256K, 2, 0), (PGSIZE_256K, 32, 1)], false, |cfg| {
            cfg.hugepages_enabled = false;
        });

        // explicitly pinned to the full socket, but without huge
        // pages the pin is meaningless and fallback still happens
        let p = f
            .ctx
            .alloc(None, 1024 * 1024, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();
        let msl1 = &f.ctx.memory_config().memseg_lists[1];
        assert!(msl1.contains(p.as_ptr() as usize));
    }

    #[test]
    fn test_shrink_on_free() {
        let f = build(&[(PGSIZE_256K, 16, 0)], false, false);
        let size = 600 * 1024;

        let p = f
            .ctx
            .alloc(None, size, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();
        assert_eq!(f.provider.populated_count(), 3);

        f.ctx.free(p.as_ptr()).unwrap();
        assert_eq!(f.provider.freed_segs().len(), 3, "every whole page goes back");
        assert_eq!(f.provider.populated_count(), 0);

        let stats = f.ctx.get_stats(0).unwrap();
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.free_count, 0);
        assert_eq!(stats.alloc_count, 0);
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_shrink_keeps_subpage_boundaries() {
        let f = build(&[(PGSIZE_256K, 16, 0)], false, false);

        let a = f
            .ctx
            .alloc(None, 4096, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();
        let b = f
            .ctx
            .alloc(None, 600 * 1024, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();
        assert_eq!(f.provider.populated_count(), 4);

        // b's pages go back whole; the sub-page remainder sharing a
        // page with a stays behind as a free element
        f.ctx.free(b.as_ptr()).unwrap();
        assert_eq!(f.provider.freed_segs(), vec![(0, 1), (0, 2), (0, 3)]);
        let stats = f.ctx.get_stats(0).unwrap();
        assert_eq!(stats.total_bytes, PGSIZE_256K);
        assert_eq!(stats.alloc_count, 1);
        assert_eq!(stats.free_count, 1);
        f.ctx.heaps[0].lock().check_invariants();

        // freeing a releases the last page
        f.ctx.free(a.as_ptr()).unwrap();
        assert_eq!(f.provider.freed_segs().len(), 4);
        assert_eq!(f.ctx.get_stats(0).unwrap().total_bytes, 0);
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_shrink_with_unaligned_lower_boundary() {
        let f = build(&[(PGSIZE_256K, 16, 0)], false, false);

        // size chosen so x's lower edge lands 16 bytes before a page
        // boundary, with the busy y ending right at that edge; 16
        // bytes cannot carry a header, so the shrink must keep the
        // first page back instead of leaving a stray sliver
        let big = 3 * PGSIZE_256K - 128;
        let x = f
            .ctx
            .alloc(None, big, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();
        let y = f
            .ctx
            .alloc(None, 4096, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();
        assert_eq!(f.provider.populated_count(), 4);

        f.ctx.free(x.as_ptr()).unwrap();
        assert_eq!(f.provider.freed_segs(), vec![(0, 2), (0, 3)]);
        let stats = f.ctx.get_stats(0).unwrap();
        assert_eq!(stats.total_bytes, 2 * PGSIZE_256K);
        assert_eq!(stats.alloc_count, 1);
        assert_eq!(stats.free_count, 2, "the kept page stands as its own free element");
        f.ctx.heaps[0].lock().check_invariants();

        // freeing y merges everything below the released range and
        // lets the kept page go too
        f.ctx.free(y.as_ptr()).unwrap();
        assert_eq!(f.provider.freed_segs().len(), 4);
        assert_eq!(f.provider.populated_count(), 0);
        assert_eq!(f.ctx.get_stats(0).unwrap().total_bytes, 0);
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_shrink_leaves_zero_payload_boundary_element() {
        let f = build(&[(PGSIZE_256K, 16, 0)], false, false);

        // size chosen so x's lower edge sits exactly one header plus
        // trailer before a page boundary
        let big = 2 * PGSIZE_256K;
        let x = f
            .ctx
            .alloc(None, big, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();
        let y = f
            .ctx
            .alloc(None, 4096, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();
        assert_eq!(f.provider.populated_count(), 3);

        // the remainder carries a header but no payload; it must
        // still become an independent free element at the boundary
        f.ctx.free(x.as_ptr()).unwrap();
        assert_eq!(f.provider.freed_segs(), vec![(0, 1), (0, 2)]);
        let stats = f.ctx.get_stats(0).unwrap();
        assert_eq!(stats.total_bytes, PGSIZE_256K);
        assert_eq!(stats.alloc_count, 1);
        assert_eq!(stats.free_count, 2);
        // the boundary element is exactly one header plus trailer
        assert_eq!(stats.greatest_free_size, stats.free_bytes - ELEM_OVERHEAD);
        f.ctx.heaps[0].lock().check_invariants();

        // freeing y merges both boundary elements and releases the
        // last page
        f.ctx.free(y.as_ptr()).unwrap();
        assert_eq!(f.provider.populated_count(), 0);
        assert_eq!(f.ctx.get_stats(0).unwrap().total_bytes, 0);
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_page_size_preference_and_hint() {
        let f = build(&[(PGSIZE_256K, 32, 0), (PGSIZE_2M, 4, 0)], false, false);
        let size = 64 * 1024;

        let p = f
            .ctx
            .alloc(None, size, Some(0), AllocFlags::PAGE_2M, 0, 0, false)
            .unwrap();
        assert!(f.ctx.memory_config().memseg_lists[1].contains(p.as_ptr() as usize));

        let q = f
            .ctx
            .alloc(None, size, Some(0), AllocFlags::PAGE_256K, 0, 0, false)
            .unwrap();
        assert!(f.ctx.memory_config().memseg_lists[0].contains(q.as_ptr() as usize));

        // no 1G class exists on this socket
        assert!(f.ctx.alloc(None, size, Some(0), AllocFlags::PAGE_1G, 0, 0, false).is_none());

        // as a hint, the request falls back to whatever is there
        let r = f
            .ctx
            .alloc(
                None,
                size,
                Some(0),
                AllocFlags::PAGE_1G | AllocFlags::SIZE_HINT_ONLY,
                0,
                0,
                false,
            )
            .unwrap();
        assert!(!r.as_ptr().is_null());
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_free_and_resize_error_paths() {
        let f = build(&[(PGSIZE_256K, 64, 0)], true, true);

        assert_eq!(f.ctx.free(core::ptr::null_mut()), Err(HeapError::InvalidArgs));

        // a pointer into plain zeroed memory has no valid cookies
        let mut bogus = vec![0u8; 4096];
        let bogus_ptr = unsafe { bogus.as_mut_ptr().add(2048) };
        assert_eq!(f.ctx.free(bogus_ptr), Err(HeapError::Corrupted));
        assert_eq!(f.ctx.resize(bogus_ptr, 64), Err(HeapError::Corrupted));

        let p = f
            .ctx
            .alloc(None, 4096, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();
        // shrinking in place is always fine
        assert!(f.ctx.resize(p.as_ptr(), 1024).is_ok());
        // the topmost element has nothing to grow into
        assert_eq!(f.ctx.resize(p.as_ptr(), 32 * 1024 * 1024), Err(HeapError::NotResizable));

        f.ctx.free(p.as_ptr()).unwrap();
        // double free: the element is no longer busy
        assert_eq!(f.ctx.free(p.as_ptr()), Err(HeapError::Corrupted));
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_dump_lists_elements() {
        let f = build(&[(PGSIZE_256K, 16, 0)], true, true);
        let p = f
            .ctx
            .alloc(None, 4096, Some(0), AllocFlags::empty(), 0, 0, false)
            .unwrap();

        let mut out = String::new();
        f.ctx.dump(0, &mut out).unwrap();
        assert!(out.contains("Heap size:"));
        assert!(out.contains("Heap alloc count: 1"));
        assert!(out.contains("BUSY"));
        assert!(out.contains("FREE"));

        f.ctx.free(p.as_ptr()).unwrap();
    }

    #[test]
    fn test_concurrent_alloc_free_linearizes() {
        let f = build(&[(PGSIZE_256K, 64, 0)], true, true);
        let total = 64 * PGSIZE_256K;

        std::thread::scope(|scope| {
            for t in 0..4usize {
                let ctx = &f.ctx;
                scope.spawn(move || {
                    for i in 0..100usize {
                        let size = 1024 + ((t * 100 + i) % 7) * 512;
                        let p = ctx
                            .alloc(None, size, Some(0), AllocFlags::empty(), 64, 0, false)
                            .unwrap();
                        unsafe { core::ptr::write_bytes(p.as_ptr(), 0xab, size) };
                        ctx.free(p.as_ptr()).unwrap();
                    }
                });
            }
        });

        let stats = f.ctx.get_stats(0).unwrap();
        assert_eq!(stats.alloc_count, 0);
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.free_bytes, total);
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_concurrent_growth_and_shrink() {
        let f = build(&[(PGSIZE_256K, 64, 0)], false, false);

        // every allocation grows the heap and every free shrinks it,
        // all racing on one heap lock
        std::thread::scope(|scope| {
            for t in 0..4usize {
                let ctx = &f.ctx;
                scope.spawn(move || {
                    for i in 0..50usize {
                        let size = (1 + (t + i) % 3) * PGSIZE_256K - 4096;
                        let p = ctx
                            .alloc(None, size, Some(0), AllocFlags::empty(), 64, 0, false)
                            .unwrap();
                        unsafe { core::ptr::write_bytes(p.as_ptr(), 0x5a, size) };
                        ctx.free(p.as_ptr()).unwrap();
                    }
                });
            }
        });

        let stats = f.ctx.get_stats(0).unwrap();
        assert_eq!(stats.alloc_count, 0);
        assert_eq!(stats.total_bytes, 0, "all grown pages must have been returned");
        assert_eq!(f.provider.populated_count(), 0);
        f.ctx.heaps[0].lock().check_invariants();
    }

    #[test]
    fn test_default_context_wrappers() {
        // nothing installed yet
        assert!(default_context().is_none());
        assert!(super::alloc(None, 64, None, AllocFlags::empty(), 0, 0, false).is_none());
        assert_eq!(super::free(core::ptr::null_mut()), Err(HeapError::BadState));
        assert_eq!(super::get_stats(0), Err(HeapError::BadState));

        let mem = TestMemory::new(PGSIZE_256K, 16);
        let msl = MemsegList::new(0, mem.base_va(), PGSIZE_256K, 16, 0);
        let provider = Arc::new(TestProvider::new(core::slice::from_ref(&msl)));
        provider.mark_populated(0, 0, 16);
        let cfg = MemoryConfig {
            memseg_lists: vec![msl],
            initial_runs: vec![SegRun { msl_index: 0, seg_idx: 0, n_segs: 16 }],
            legacy_mode: true,
            ..MemoryConfig::default()
        };

        super::init(cfg, provider.clone()).unwrap();
        assert!(default_context().is_some());

        let p = super::alloc(Some("default"), 4096, None, AllocFlags::empty(), 64, 0, false)
            .unwrap();
        assert_eq!(super::get_stats(0).unwrap().alloc_count, 1);
        assert!(super::resize(p.as_ptr(), 1024).is_ok());
        super::free(p.as_ptr()).unwrap();

        let mut out = String::new();
        super::dump(0, &mut out).unwrap();
        assert!(out.contains("Heap size:"));

        // a second install is rejected, whatever it brings along
        let mem2 = TestMemory::new(PGSIZE_256K, 4);
        let msl2 = MemsegList::new(0, mem2.base_va(), PGSIZE_256K, 4, 0);
        let cfg2 = MemoryConfig {
            memseg_lists: vec![msl2],
            ..MemoryConfig::default()
        };
        assert!(matches!(super::init(cfg2, provider), Err(HeapError::BadState)));

        // the default context lives for the process; its backing
        // memory must too
        core::mem::forget(mem);
    }
}
