// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Append/index-only array made of linked fixed-size blocks.
//!
//! Indexing past the last allocated block installs exactly one new block with
//! a CAS on the `next` pointer. Threads losing the race free their candidate
//! and follow the winner's block. Blocks are never removed before drop.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

pub struct LfArray<T, const N: usize> {
    data: [T; N],
    next: AtomicPtr<LfArray<T, N>>,
}

impl<T: Default, const N: usize> LfArray<T, N> {
    pub fn new() -> Self {
        assert!(N > 0, "LfArray block size must be non-zero");
        Self {
            data: std::array::from_fn(|_| T::default()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Reference to the slot at `index`, allocating blocks on the way.
    pub fn get(&self, index: usize) -> &T {
        let mut block = self;
        let mut index = index;
        while index >= N {
            index -= N;
            block = block.next_or_grow();
        }
        &block.data[index]
    }

    fn next_or_grow(&self) -> &Self {
        let next = self.next.load(Ordering::Acquire);
        if !next.is_null() {
            // SAFETY: installed blocks live until `self` is dropped.
            return unsafe { &*next };
        }

        let fresh = Box::into_raw(Box::new(Self::new()));
        match self
            .next
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                log::trace!("LfArray: grew by one block of {} slots", N);
                // SAFETY: we just published `fresh`; it is owned by the chain now.
                unsafe { &*fresh }
            }
            Err(installed) => {
                // SAFETY: `fresh` was never published, we still own it.
                let lost = unsafe { Box::from_raw(fresh) };
                assert!(
                    lost.next.load(Ordering::Relaxed).is_null(),
                    "LfArray: candidate block already linked"
                );
                drop(lost);
                // SAFETY: see above.
                unsafe { &*installed }
            }
        }
    }
}

impl<T, const N: usize> LfArray<T, N> {
    /// Number of allocated blocks, including the inline first one.
    pub fn block_count(&self) -> usize {
        let mut count = 1;
        let mut next = self.next.load(Ordering::Acquire);
        while !next.is_null() {
            count += 1;
            // SAFETY: installed blocks live until `self` is dropped.
            next = unsafe { (*next).next.load(Ordering::Acquire) };
        }
        count
    }

    /// Visit every allocated slot in index order without growing the array.
    pub fn for_each(&self, mut f: impl FnMut(usize, &T)) {
        let mut base = 0;
        let mut block: *const Self = self;
        while !block.is_null() {
            // SAFETY: `block` is `self` or an installed block.
            let current = unsafe { &*block };
            for (i, slot) in current.data.iter().enumerate() {
                f(base + i, slot);
            }
            base += N;
            block = current.next.load(Ordering::Acquire);
        }
    }
}

impl<T: Default, const N: usize> Default for LfArray<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for LfArray<T, N> {
    fn drop(&mut self) {
        // Unlink blocks one at a time so long chains never recurse.
        let mut next = std::mem::replace(self.next.get_mut(), ptr::null_mut());
        while !next.is_null() {
            // SAFETY: every installed block came from `Box::into_raw`.
            let mut block = unsafe { Box::from_raw(next) };
            next = std::mem::replace(block.next.get_mut(), ptr::null_mut());
        }
    }
}
