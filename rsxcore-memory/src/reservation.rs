// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Striped reservation table over the 32-bit guest address space.
//!
//! The address space is split into 1 MiB stripes, each guarded by its own
//! reader/writer lock. Ranges are always acquired in ascending stripe order,
//! so two lockers can only ever wait on each other through the stripes they
//! actually share.

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;

use rsxcore_common::AddressRange;

/// log2 of the stripe size.
pub const RESERVATION_STRIDE_SHIFT: u32 = 20;

/// Bytes covered by one stripe.
pub const RESERVATION_STRIDE: u32 = 1 << RESERVATION_STRIDE_SHIFT;

const STRIPE_COUNT: usize = 1 << (32 - RESERVATION_STRIDE_SHIFT);

/// Stripe index of a guest address.
#[inline]
pub const fn stripe_of(addr: u32) -> usize {
    (addr >> RESERVATION_STRIDE_SHIFT) as usize
}

/// Thread on whose behalf a contended acquisition is made.
///
/// Instead of blocking, an owned acquisition backs out of every stripe it
/// holds and asks the owner how to proceed.
pub trait LockOwner {
    /// Service pending work while backed off. Return `false` if the owner is
    /// aborting and the acquisition should be abandoned.
    fn on_contention(&self) -> bool;
}

pub struct ReservationTable {
    stripes: Box<[RawRwLock]>,
    enabled: bool,
}

impl ReservationTable {
    /// `enabled` mirrors `rsx_accurate_res_access`; when false, reservation
    /// locks built on this table never acquire anything.
    pub fn new(enabled: bool) -> Self {
        let stripes = (0..STRIPE_COUNT).map(|_| RawRwLock::INIT).collect();
        Self { stripes, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn span(range: &AddressRange) -> std::ops::RangeInclusive<usize> {
        stripe_of(range.start)..=stripe_of(range.last())
    }

    fn try_acquire(&self, stripe: usize, exclusive: bool) -> bool {
        if exclusive {
            self.stripes[stripe].try_lock_exclusive()
        } else {
            self.stripes[stripe].try_lock_shared()
        }
    }

    fn release(&self, stripe: usize, exclusive: bool) {
        // SAFETY: only called for stripes this table handed out.
        unsafe {
            if exclusive {
                self.stripes[stripe].unlock_exclusive();
            } else {
                self.stripes[stripe].unlock_shared();
            }
        }
    }

    /// Acquire every stripe touched by `range`.
    ///
    /// Without an owner this blocks until all stripes are held. With an owner
    /// a contended stripe makes the call release what it holds and consult
    /// [`LockOwner::on_contention`]; `false` is returned only when the owner
    /// asks to abandon, in which case nothing is held.
    pub fn lock(&self, range: AddressRange, exclusive: bool, owner: Option<&dyn LockOwner>) -> bool {
        if range.is_empty() {
            return true;
        }
        let span = Self::span(&range);

        let Some(owner) = owner else {
            for stripe in span {
                if exclusive {
                    self.stripes[stripe].lock_exclusive();
                } else {
                    self.stripes[stripe].lock_shared();
                }
            }
            return true;
        };

        loop {
            let mut held = *span.start();
            while held <= *span.end() && self.try_acquire(held, exclusive) {
                held += 1;
            }
            if held > *span.end() {
                return true;
            }

            for stripe in *span.start()..held {
                self.release(stripe, exclusive);
            }
            log::trace!("ReservationTable: contention on {} at stripe {}", range, held);
            if !owner.on_contention() {
                return false;
            }
            std::thread::yield_now();
        }
    }

    /// Release every stripe touched by `range`. Must mirror a successful
    /// `lock` with the same range and mode.
    pub fn unlock(&self, range: AddressRange, exclusive: bool) {
        if range.is_empty() {
            return;
        }
        for stripe in Self::span(&range) {
            self.release(stripe, exclusive);
        }
    }

    /// True if any stripe of `range` is currently held in any mode.
    pub fn is_locked(&self, range: AddressRange) -> bool {
        !range.is_empty() && Self::span(&range).any(|s| self.stripes[s].is_locked())
    }
}

impl std::fmt::Debug for ReservationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationTable")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
