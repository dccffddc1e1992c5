// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Scoped reservation over one or two guest ranges.
//!
//! Only main memory is shared with the CPU side, so ranges in local memory are
//! never locked. When the table is disabled every constructor yields an empty
//! guard.

use rsxcore_common::{AddressRange, GuestAddr, MemoryLocation};
use rsxcore_memory::reservation::{stripe_of, RESERVATION_STRIDE_SHIFT};
use rsxcore_memory::{LockOwner, ReservationTable, RESERVATION_STRIDE};

#[must_use = "the reservation is released as soon as the guard is dropped"]
pub struct ReservationLock<'a, const EXCLUSIVE: bool> {
    table: &'a ReservationTable,
    /// Held ranges in acquisition order; empty slots are unused.
    held: [AddressRange; 2],
}

pub type SharedReservation<'a> = ReservationLock<'a, false>;
pub type ExclusiveReservation<'a> = ReservationLock<'a, true>;

fn lockable(range: &AddressRange) -> bool {
    !range.is_empty() && range.location() == MemoryLocation::Main
}

fn stripes_touch(a: &AddressRange, b: &AddressRange) -> bool {
    stripe_of(a.start) <= stripe_of(b.last()) && stripe_of(b.start) <= stripe_of(a.last())
}

impl<'a, const EXCLUSIVE: bool> ReservationLock<'a, EXCLUSIVE> {
    fn empty(table: &'a ReservationTable) -> Self {
        Self {
            table,
            held: [AddressRange::default(); 2],
        }
    }

    /// Lock `[addr, addr + length)`.
    pub fn new(table: &'a ReservationTable, addr: GuestAddr, length: u32) -> Self {
        let mut lock = Self::empty(table);
        lock.lock_range(addr, length);
        lock
    }

    /// Lock a source and a destination range together.
    ///
    /// Overlapping ranges are merged into one. Disjoint ranges are acquired in
    /// ascending address order so that two dual lockers cannot deadlock.
    pub fn new_dual(
        table: &'a ReservationTable,
        dst: GuestAddr,
        dst_length: u32,
        src: GuestAddr,
        src_length: u32,
    ) -> Self {
        let mut lock = Self::empty(table);
        if !table.is_enabled() {
            return lock;
        }

        let a = AddressRange::start_length(dst, dst_length);
        let b = AddressRange::start_length(src, src_length);
        match (lockable(&a), lockable(&b)) {
            (false, false) => {}
            (true, false) => lock.acquire(a, 0, None),
            (false, true) => lock.acquire(b, 0, None),
            (true, true) => {
                if a.overlaps(&b) || stripes_touch(&a, &b) {
                    lock.acquire(a.union(&b), 0, None);
                } else {
                    let (low, high) = if a.start < b.start { (a, b) } else { (b, a) };
                    lock.acquire(low, 0, None);
                    lock.acquire(high, 1, None);
                }
            }
        }
        lock
    }

    /// Lock on behalf of `owner`. If the owner abandons under contention the
    /// guard comes back empty; check [`ReservationLock::is_locked`].
    pub fn with_owner(
        table: &'a ReservationTable,
        addr: GuestAddr,
        length: u32,
        owner: &dyn LockOwner,
    ) -> Self {
        let mut lock = Self::empty(table);
        let range = AddressRange::start_length(addr, length);
        if table.is_enabled() && lockable(&range) {
            lock.acquire(range, 0, Some(owner));
        }
        lock
    }

    fn acquire(&mut self, range: AddressRange, slot: usize, owner: Option<&dyn LockOwner>) {
        if self.table.lock(range, EXCLUSIVE, owner) {
            self.held[slot] = range;
        } else {
            log::debug!("ReservationLock: owner abandoned {}", range);
        }
    }

    fn lock_range(&mut self, addr: GuestAddr, length: u32) {
        let range = AddressRange::start_length(addr, length);
        if self.table.is_enabled() && lockable(&range) {
            self.acquire(range, 0, None);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.held.iter().any(|r| !r.is_empty())
    }

    /// The primary held range, empty if nothing is held.
    pub fn range(&self) -> AddressRange {
        self.held[0]
    }

    /// Release everything held so far.
    pub fn unlock(&mut self) {
        // Reverse of acquisition order.
        for slot in self.held.iter_mut().rev() {
            if !slot.is_empty() {
                self.table.unlock(*slot, EXCLUSIVE);
                *slot = AddressRange::default();
            }
        }
    }

    /// Move a held lock to cover `[addr, addr + length)`.
    ///
    /// Nothing happens unless a lock is held and the new range leaves the
    /// held range's first stripe. `on_release` runs just before the old lock
    /// is dropped so callers can flush work done under it.
    pub fn update_if_enabled(
        &mut self,
        addr: GuestAddr,
        length: u32,
        on_release: Option<&mut dyn FnMut()>,
    ) {
        let current = self.held[0];
        if current.is_empty() {
            return;
        }
        let stride_offset = (addr & ((1 << RESERVATION_STRIDE_SHIFT) - 1)) as u64;
        let moved = stripe_of(current.start) != stripe_of(addr)
            || stride_offset + length as u64 > RESERVATION_STRIDE as u64;
        if !moved {
            return;
        }
        if let Some(callback) = on_release {
            callback();
        }
        self.unlock();
        self.lock_range(addr, length);
    }
}

impl<const EXCLUSIVE: bool> Drop for ReservationLock<'_, EXCLUSIVE> {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsxcore_common::LOCAL_MEM_BASE;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_disabled_table_locks_nothing() {
        let table = ReservationTable::new(false);
        let lock = ExclusiveReservation::new(&table, 0x1000, 0x100);
        assert!(!lock.is_locked());
        assert!(!table.is_locked(AddressRange::start_length(0x1000, 0x100)));
    }

    #[test]
    fn test_local_memory_is_never_locked() {
        let table = ReservationTable::new(true);
        let lock = ExclusiveReservation::new(&table, LOCAL_MEM_BASE, 0x100);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_release_on_drop() {
        let table = ReservationTable::new(true);
        let range = AddressRange::start_length(0x2000, 0x10);
        {
            let lock = ExclusiveReservation::new(&table, range.start, range.length);
            assert!(lock.is_locked());
            assert!(table.is_locked(range));
        }
        assert!(!table.is_locked(range));
    }

    #[test]
    fn test_dual_overlapping_ranges_merge() {
        let table = ReservationTable::new(true);
        let lock = ExclusiveReservation::new_dual(&table, 0x1000, 0x100, 0x1080, 0x100);
        assert_eq!(lock.range(), AddressRange::start_end(0x1000, 0x117F));
        assert!(lock.held[1].is_empty());
    }

    #[test]
    fn test_dual_same_stripe_does_not_self_deadlock() {
        let table = ReservationTable::new(true);
        let lock = ExclusiveReservation::new_dual(&table, 0x1000, 0x10, 0x8000, 0x10);
        assert!(lock.is_locked());
        assert!(lock.held[1].is_empty());
    }

    #[test]
    fn test_dual_disjoint_ranges_lock_ascending() {
        let table = ReservationTable::new(true);
        let high = RESERVATION_STRIDE * 8;
        let lock = ExclusiveReservation::new_dual(&table, high, 0x10, 0x100, 0x10);
        assert_eq!(lock.held[0].start, 0x100);
        assert_eq!(lock.held[1].start, high);
        // The gap between them stays free.
        assert!(!table.is_locked(AddressRange::start_length(RESERVATION_STRIDE * 4, 1)));
    }

    #[test]
    fn test_dual_with_local_side_locks_main_only() {
        let table = ReservationTable::new(true);
        let lock = ExclusiveReservation::new_dual(&table, LOCAL_MEM_BASE, 0x100, 0x3000, 0x100);
        assert_eq!(lock.range(), AddressRange::start_length(0x3000, 0x100));
    }

    #[test]
    fn test_shared_readers_coexist() {
        let table = Arc::new(ReservationTable::new(true));
        let _reader = SharedReservation::new(&table, 0x4000, 0x100);
        let other = {
            let table = table.clone();
            thread::spawn(move || SharedReservation::new(&table, 0x4000, 0x100).is_locked())
        };
        assert!(other.join().unwrap());
    }

    #[test]
    fn test_update_if_enabled_relocks_on_stripe_change() {
        let table = ReservationTable::new(true);
        let mut lock = ExclusiveReservation::new(&table, 0x100, 0x10);
        let released = Cell::new(0);
        let mut hook = || released.set(released.get() + 1);

        lock.update_if_enabled(0x200, 0x10, Some(&mut hook));
        assert_eq!(released.get(), 0);
        assert_eq!(lock.range().start, 0x100);

        lock.update_if_enabled(RESERVATION_STRIDE + 0x10, 0x10, Some(&mut hook));
        assert_eq!(released.get(), 1);
        assert_eq!(lock.range().start, RESERVATION_STRIDE + 0x10);
        assert!(!table.is_locked(AddressRange::start_length(0x100, 0x10)));

        // Spilling past the stripe end also relocks.
        lock.update_if_enabled(RESERVATION_STRIDE * 2 - 8, 0x10, None);
        assert_eq!(lock.range().start, RESERVATION_STRIDE * 2 - 8);
    }

    #[test]
    fn test_update_if_enabled_without_lock_is_noop() {
        let table = ReservationTable::new(true);
        let mut lock = ExclusiveReservation::new(&table, LOCAL_MEM_BASE, 0x10);
        lock.update_if_enabled(0x100, 0x10, None);
        assert!(!lock.is_locked());
    }

    struct Quitter;

    impl LockOwner for Quitter {
        fn on_contention(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_owner_abandon_yields_empty_guard() {
        let table = ReservationTable::new(true);
        let _holder = ExclusiveReservation::new(&table, 0x5000, 0x10);
        let lock = ExclusiveReservation::with_owner(&table, 0x5000, 0x10, &Quitter);
        assert!(!lock.is_locked());
    }
}
