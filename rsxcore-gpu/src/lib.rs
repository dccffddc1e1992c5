// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! RSX command processing core.
//!
//! The pieces that keep the GPU thread, the DMA offload worker and the guest
//! CPU threads consistent with each other: reservation and engine locks, the
//! offload manager, the ZCULL report pipeline with conditional rendering, and
//! the engines and command processor that drive them.

pub mod backend;
pub mod clock;
pub mod command_processor;
pub mod context;
pub mod engine_lock;
pub mod engines;
pub mod fifo;
pub mod index_utils;
pub mod offload;
pub mod reservation_lock;
pub mod thread;
pub mod zcull;

pub use context::{ContextError, ContextStats, RsxContext};
pub use engine_lock::EngineLock;
pub use offload::DmaManager;
pub use reservation_lock::{ExclusiveReservation, SharedReservation};
pub use thread::{GpuThread, RsxThread, SyncHint};
pub use zcull::ZcullControl;
