// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Multi-producer, single-drainer lock-free queue.
//!
//! Producers splice items onto an atomic head with a CAS loop. The consumer
//! detaches the whole chain with one exchange to null, which yields items in
//! LIFO order; [`LfQueue::pop_all`] reverses it back to producer order.
//!
//! The head pointer doubles as the wait word: a consumer blocked in
//! [`LfQueue::wait`] sleeps while the head is null and is woken by the push
//! that makes it non-null.

use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

struct LfQueueItem<T> {
    link: *mut LfQueueItem<T>,
    value: T,
}

/// Reverse a detached chain in place, returning the new head.
fn reverse_chain<T>(mut head: *mut LfQueueItem<T>) -> *mut LfQueueItem<T> {
    let mut prev = ptr::null_mut();
    while !head.is_null() {
        // SAFETY: the chain was detached from the queue and is exclusively ours.
        unsafe {
            let next = (*head).link;
            (*head).link = prev;
            prev = head;
            head = next;
        }
    }
    prev
}

pub struct LfQueue<T> {
    head: AtomicPtr<LfQueueItem<T>>,
    /// Consumers currently parked (or about to park) in `wait`.
    sleepers: AtomicU32,
    park: Mutex<()>,
    wakeup: Condvar,
}

// SAFETY: items are moved between threads by value only.
unsafe impl<T: Send> Send for LfQueue<T> {}
unsafe impl<T: Send> Sync for LfQueue<T> {}

impl<T> LfQueue<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            sleepers: AtomicU32::new(0),
            park: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    /// Append an item. Returns `true` if the queue was empty before, in which
    /// case one waiting consumer is woken.
    pub fn push(&self, value: T) -> bool {
        let item = Box::into_raw(Box::new(LfQueueItem {
            link: ptr::null_mut(),
            value,
        }));

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `item` is not yet published, we are its only writer.
            unsafe { (*item).link = head };
            match self
                .head
                .compare_exchange_weak(head, item, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        if head.is_null() {
            self.notify();
            return true;
        }
        false
    }

    /// True if nothing is queued right now.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }

    /// Detach everything queued so far, in push order.
    pub fn pop_all(&self) -> LfQueueSlice<T> {
        let head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        LfQueueSlice::from_raw(reverse_chain(head))
    }

    /// Detach everything queued so far, newest first.
    pub fn pop_all_reversed(&self) -> LfQueueSlice<T> {
        let head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        LfQueueSlice::from_raw(head)
    }

    /// Block until the queue is non-empty.
    pub fn wait(&self) {
        self.wait_with(|| false);
    }

    /// Block until the queue is non-empty or `cancel` returns true.
    ///
    /// Whoever flips the state observed by `cancel` must call
    /// [`LfQueue::notify`] afterwards.
    pub fn wait_with(&self, cancel: impl Fn() -> bool) {
        if !self.is_empty() || cancel() {
            return;
        }

        let mut guard = self.park.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        while self.is_empty() && !cancel() {
            self.wakeup.wait(&mut guard);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake one consumer blocked in `wait`.
    pub fn notify(&self) {
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.park.lock();
        self.wakeup.notify_one();
    }
}

impl<T> Default for LfQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LfQueue<T> {
    fn drop(&mut self) {
        let head = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        drop(LfQueueSlice::from_raw(head));
    }
}

// ── Detached chain ─────────────────────────────────────────────────────────

/// An owned, detached run of queue items.
pub struct LfQueueSlice<T> {
    head: *mut LfQueueItem<T>,
}

// SAFETY: the slice exclusively owns its chain.
unsafe impl<T: Send> Send for LfQueueSlice<T> {}

impl<T> LfQueueSlice<T> {
    fn from_raw(head: *mut LfQueueItem<T>) -> Self {
        Self { head }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Remove and return the first item.
    pub fn pop_front(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: every item in the chain came from `Box::into_raw` in `push`.
        let item = unsafe { Box::from_raw(self.head) };
        self.head = item.link;
        Some(item.value)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head,
            _slice: PhantomData,
        }
    }
}

impl<T> Drop for LfQueueSlice<T> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

pub struct Iter<'a, T> {
    next: *const LfQueueItem<T>,
    _slice: PhantomData<&'a LfQueueSlice<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: the borrowed slice keeps the chain alive.
        let item = unsafe { &*self.next };
        self.next = item.link;
        Some(&item.value)
    }
}

impl<T> FusedIterator for Iter<'_, T> {}

pub struct IntoIter<T>(LfQueueSlice<T>);

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.0.pop_front()
    }
}

impl<T> FusedIterator for IntoIter<T> {}

impl<T> IntoIterator for LfQueueSlice<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter(self)
    }
}

impl<'a, T> IntoIterator for &'a LfQueueSlice<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
