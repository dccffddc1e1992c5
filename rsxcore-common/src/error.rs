// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

/// Rejected configuration values, reported by [`crate::Settings::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} must be non-zero")]
    ZeroValue(&'static str),

    #[error("max_safe_queue_depth ({depth}) must be below occlusion_query_count ({pool})")]
    QueueDepthExceedsPool { depth: u32, pool: u32 },

    #[error("{name} (0x{value:X}) is not a multiple of the page size")]
    MisalignedSize { name: &'static str, value: u32 },

    #[error("main memory size 0x{0:X} overlaps the local memory window")]
    MainMemoryTooLarge(u32),

    #[error("max_zcull_delay_us ({delay}) is shorter than min_zcull_tick_us ({tick})")]
    DelayBelowTick { delay: u64, tick: u64 },
}
