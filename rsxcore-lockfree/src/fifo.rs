// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Multi-producer ring positions over an [`LfArray`].
//!
//! Producers reserve slots with [`LfFifo::push_begin`] and fill them in
//! place. The single consumer reads from [`LfFifo::peek`] and acknowledges
//! with [`LfFifo::pop_end`]; once it catches up with every reservation both
//! positions reset to zero, so storage stays bounded by the peak backlog.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::array::LfArray;

pub struct LfFifo<T, const N: usize> {
    slots: LfArray<T, N>,
    /// Low 32 bits: push position. High 32 bits: pop position.
    ctrl: AtomicU64,
}

impl<T: Default, const N: usize> LfFifo<T, N> {
    pub fn new() -> Self {
        Self {
            slots: LfArray::new(),
            ctrl: AtomicU64::new(0),
        }
    }

    /// Slot storage for position `index`.
    pub fn get(&self, index: u32) -> &T {
        self.slots.get(index as usize)
    }
}

impl<T, const N: usize> LfFifo<T, N> {
    /// Number of reserved but not yet acknowledged slots.
    pub fn size(&self) -> u32 {
        let ctrl = self.ctrl.load(Ordering::Acquire);
        (ctrl as u32).wrapping_sub((ctrl >> 32) as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Reserve `count` slots and return the first reserved position.
    pub fn push_begin(&self, count: u32) -> u32 {
        self.ctrl.fetch_add(u64::from(count), Ordering::AcqRel) as u32
    }

    /// Current pop position.
    pub fn peek(&self) -> u32 {
        (self.ctrl.load(Ordering::Acquire) >> 32) as u32
    }

    /// Acknowledge `count` consumed slots and return the next pop position.
    /// Returns zero when the ring was fully drained and reset.
    pub fn pop_end(&self, count: u32) -> u32 {
        let mut current = self.ctrl.load(Ordering::Acquire);
        loop {
            let mut next = current.wrapping_add(u64::from(count) << 32);
            if (next >> 32) as u32 == next as u32 {
                next = 0;
            }
            match self
                .ctrl
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return (next >> 32) as u32,
                Err(actual) => current = actual,
            }
        }
    }
}

impl<T: Default, const N: usize> Default for LfFifo<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_positions() {
        let fifo: LfFifo<AtomicU64, 4> = LfFifo::new();
        assert_eq!(fifo.push_begin(1), 0);
        assert_eq!(fifo.push_begin(2), 1);
        assert_eq!(fifo.size(), 3);
        assert_eq!(fifo.peek(), 0);

        assert_eq!(fifo.pop_end(1), 1);
        assert_eq!(fifo.size(), 2);
        assert_eq!(fifo.peek(), 1);
    }

    #[test]
    fn test_drain_resets_positions() {
        let fifo: LfFifo<AtomicU64, 4> = LfFifo::new();
        fifo.push_begin(3);
        assert_eq!(fifo.pop_end(3), 0);
        assert!(fifo.is_empty());
        assert_eq!(fifo.push_begin(1), 0);
    }

    #[test]
    fn test_multi_producer_slots_are_unique() {
        let fifo: Arc<LfFifo<AtomicU64, 16>> = Arc::new(LfFifo::new());
        let handles: Vec<_> = (1..=4u64)
            .map(|t| {
                let fifo = fifo.clone();
                thread::spawn(move || {
                    for i in 0..100u64 {
                        let pos = fifo.push_begin(1);
                        fifo.get(pos).store(t * 1000 + i, Ordering::Release);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(fifo.size(), 400);
        let mut seen = Vec::new();
        while !fifo.is_empty() {
            let pos = fifo.peek();
            seen.push(fifo.get(pos).swap(0, Ordering::Acquire));
            fifo.pop_end(1);
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 400);
        assert!(seen.iter().all(|&v| v != 0));
    }
}
