// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Grow-only lock-free bag.
//!
//! Items are never removed before the bag is dropped, so `push` can hand out
//! references that stay valid for the bag's lifetime.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct BunchItem<T> {
    link: *mut BunchItem<T>,
    value: T,
}

pub struct LfBunch<T> {
    head: AtomicPtr<BunchItem<T>>,
}

// SAFETY: values are shared by reference across threads and dropped by the
// last owner of the bag.
unsafe impl<T: Send> Send for LfBunch<T> {}
unsafe impl<T: Send + Sync> Sync for LfBunch<T> {}

impl<T> LfBunch<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Add an item unconditionally.
    pub fn push(&self, value: T) -> &T {
        let item = Box::into_raw(Box::new(BunchItem {
            link: ptr::null_mut(),
            value,
        }));

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `item` is not yet published.
            unsafe { (*item).link = head };
            match self
                .head
                .compare_exchange_weak(head, item, Ordering::AcqRel, Ordering::Acquire)
            {
                // SAFETY: published items live as long as the bag.
                Ok(_) => return unsafe { &(*item).value },
                Err(current) => head = current,
            }
        }
    }

    /// Add an item only if `pred(new, existing)` holds for every item already
    /// in the bag. On rejection the value is handed back.
    pub fn push_if(&self, value: T, pred: impl Fn(&T, &T) -> bool) -> Result<&T, T> {
        let item = Box::into_raw(Box::new(BunchItem {
            link: ptr::null_mut(),
            value,
        }));

        let mut head = self.head.load(Ordering::Acquire);
        // Items below `checked` were validated on a previous attempt.
        let mut checked: *mut BunchItem<T> = ptr::null_mut();
        loop {
            let mut cursor = head;
            while cursor != checked {
                // SAFETY: `item` is still private; `cursor` is published.
                let accept = unsafe { pred(&(*item).value, &(*cursor).value) };
                if !accept {
                    // SAFETY: `item` was never published.
                    let rejected = unsafe { Box::from_raw(item) };
                    return Err(rejected.value);
                }
                // SAFETY: published items live as long as the bag.
                cursor = unsafe { (*cursor).link };
            }
            checked = head;

            // SAFETY: `item` is not yet published.
            unsafe { (*item).link = head };
            match self
                .head
                .compare_exchange(head, item, Ordering::AcqRel, Ordering::Acquire)
            {
                // SAFETY: published items live as long as the bag.
                Ok(_) => return Ok(unsafe { &(*item).value }),
                Err(current) => head = current,
            }
        }
    }

    /// Iterate over every item, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.head.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            if cursor.is_null() {
                return None;
            }
            // SAFETY: published items live as long as the bag.
            let item = unsafe { &*cursor };
            cursor = item.link;
            Some(&item.value)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for LfBunch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LfBunch<T> {
    fn drop(&mut self) {
        let mut cursor = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        while !cursor.is_null() {
            // SAFETY: every item came from `Box::into_raw`.
            let item = unsafe { Box::from_raw(cursor) };
            cursor = item.link;
        }
    }
}
