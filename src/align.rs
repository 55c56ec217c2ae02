// Copyright 2026 The Numaheap Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Alignment arithmetic
//!
//! Helpers shared by every module. All `align` arguments must be
//! powers of two; callers validate that at the API boundary.

/// Cache line size assumed by the allocator. Requests and alignments
/// are rounded up to this before any element is carved.
pub const CACHE_LINE_SIZE: usize = 64;

/// Align a value down to the given power-of-two boundary
#[inline]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Align a value up to the given power-of-two boundary
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Check whether a value sits on the given power-of-two boundary
#[inline]
pub const fn is_aligned(val: usize, align: usize) -> bool {
    (val & (align - 1)) == 0
}

/// Round a size up to a whole number of cache lines
#[inline]
pub const fn cache_line_roundup(val: usize) -> usize {
    align_up(val, CACHE_LINE_SIZE)
}
