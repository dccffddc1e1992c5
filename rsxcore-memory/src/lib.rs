// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest memory and the striped reservation table shared by the CPU threads,
//! the RSX thread and the offload worker.

pub mod guest_memory;
pub mod reservation;

pub use guest_memory::{
    AccessViolationHandler, GuestMemory, MemoryError, MemoryPermission, MemoryResult,
};
pub use reservation::{LockOwner, ReservationTable, RESERVATION_STRIDE};
