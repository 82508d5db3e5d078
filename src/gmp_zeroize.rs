// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Erasure of big-integer secrets.
//!
//! Server shares, commitment nonces, and responses are `BigNumber`s backed
//! by GMP limb arrays on the C heap. GMP reallocates and copies those arrays
//! behind Rust's back, so `Zeroize` on the wrapper type alone is not enough.
//! GMP supports custom memory management; we wrap its release paths so that
//! every buffer is erased before the allocator gets it back.

use gmp_mpfr_sys::gmp;
use std::{ffi::c_void, ptr::addr_of_mut, slice, sync::Once};
use zeroize::Zeroize;

static HOOKS: Once = Once::new();

// The stock GMP allocator, captured before the wrappers replace it. The
// realloc entry is captured alongside the others but never called; growth
// goes through alloc-copy-erase instead.
static mut STOCK_ALLOC: gmp::allocate_function = None;
static mut STOCK_REALLOC: gmp::reallocate_function = None;
static mut STOCK_FREE: gmp::free_function = None;

/// Install the erasing wrappers into GMP.
///
/// [`crate::KeyshareCore::new`] calls this; it must run before the first
/// big-integer allocation and is idempotent.
pub(crate) fn enable_zeroize() {
    HOOKS.call_once(|| unsafe {
        // SAFETY: C API use per https://gmplib.org/manual/Custom-Allocation
        gmp::get_memory_functions(
            addr_of_mut!(STOCK_ALLOC),
            addr_of_mut!(STOCK_REALLOC),
            addr_of_mut!(STOCK_FREE),
        );
        if STOCK_ALLOC.is_none() || STOCK_FREE.is_none() {
            // No documented failure mode; still, running without erasure
            // must not happen silently.
            panic!("GMP did not report its memory functions");
        }
        // Plain allocation needs no wrapper: a fresh buffer holds nothing.
        gmp::set_memory_functions(None, Some(realloc_hook), Some(free_hook));
    });
}

/// Erase a GMP buffer and hand it back to the stock free.
///
/// SAFETY: `ptr` must be a live GMP allocation of exactly `size` bytes,
/// and the hooks must already be installed.
unsafe fn erase_and_release(ptr: *mut c_void, size: usize) {
    slice::from_raw_parts_mut(ptr as *mut u8, size).zeroize();
    STOCK_FREE.expect("captured before hooks were installed")(ptr, size);
}

extern "C" fn free_hook(ptr: *mut c_void, size: usize) {
    // SAFETY: GMP documents ptr as a live allocation of `size` bytes.
    unsafe { erase_and_release(ptr, size) }
}

extern "C" fn realloc_hook(ptr: *mut c_void, old_size: usize, new_size: usize) -> *mut c_void {
    // Resizing in place would hand the old limbs back to the allocator
    // before anything could erase them. Move instead: fresh buffer, copy,
    // then erase and release the original.
    unsafe {
        let fresh = STOCK_ALLOC.expect("captured before hooks were installed")(new_size);

        // SAFETY: GMP documents ptr as a live allocation of `old_size`
        // bytes, and `fresh` was just allocated with room for `new_size`.
        let carried = old_size.min(new_size);
        slice::from_raw_parts_mut(fresh as *mut u8, carried)
            .copy_from_slice(slice::from_raw_parts(ptr as *const u8, carried));

        erase_and_release(ptr, old_size);
        fresh
    }
}
