// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::SettingsError;
use crate::types::{is_page_aligned, LOCAL_MEM_BASE};

/// Renderer settings, populated from the config INI.
///
/// One instance is handed to every per-renderer component at construction;
/// nothing reads configuration from global state.
#[derive(Debug, Clone)]
pub struct Settings {
    // Core
    pub thread_scheduler: ThreadScheduler,
    pub rsx_affinity_mask: u64,

    // Video
    pub multithreaded_rsx: bool,
    pub rsx_accurate_res_access: bool,
    pub precise_zpass_count: bool,
    pub relaxed_zcull_sync: bool,

    // Tuning
    /// Copies strictly below this many bytes run inline on the caller.
    pub max_immediate_transfer_size: u32,
    /// Minimum interval between opportunistic ZCULL queue scans.
    pub min_zcull_tick_us: u64,
    /// Age after which a pending query forces a backend flush.
    pub max_zcull_delay_us: u64,
    /// Pending async task count that triggers preparing the whole queue.
    pub max_safe_queue_depth: u32,
    pub occlusion_query_count: u32,
    pub max_stat_registers: u32,
    /// Busy-wait iterations in `sync()` before falling back to yielding.
    pub sync_spin_count: u32,

    // Memory
    pub main_memory_size: u32,
    pub local_memory_size: u32,

    // Debug
    pub use_debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            thread_scheduler: ThreadScheduler::OsManaged,
            rsx_affinity_mask: 0,
            multithreaded_rsx: true,
            rsx_accurate_res_access: true,
            precise_zpass_count: false,
            relaxed_zcull_sync: false,
            max_immediate_transfer_size: 3584,
            min_zcull_tick_us: 100,
            max_zcull_delay_us: 300,
            max_safe_queue_depth: 1792,
            occlusion_query_count: 2048,
            max_stat_registers: 8192,
            sync_spin_count: 64,
            main_memory_size: 256 * 1024 * 1024,
            local_memory_size: 256 * 1024 * 1024,
            use_debug_logging: false,
        }
    }
}

impl Settings {
    /// Reject combinations the renderer cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.occlusion_query_count == 0 {
            return Err(SettingsError::ZeroValue("occlusion_query_count"));
        }
        if self.max_stat_registers == 0 {
            return Err(SettingsError::ZeroValue("max_stat_registers"));
        }
        if self.main_memory_size == 0 {
            return Err(SettingsError::ZeroValue("main_memory_size"));
        }
        if self.local_memory_size == 0 {
            return Err(SettingsError::ZeroValue("local_memory_size"));
        }
        if self.max_safe_queue_depth >= self.occlusion_query_count {
            return Err(SettingsError::QueueDepthExceedsPool {
                depth: self.max_safe_queue_depth,
                pool: self.occlusion_query_count,
            });
        }
        if self.max_zcull_delay_us < self.min_zcull_tick_us {
            return Err(SettingsError::DelayBelowTick {
                delay: self.max_zcull_delay_us,
                tick: self.min_zcull_tick_us,
            });
        }
        for (name, value) in [
            ("main_memory_size", self.main_memory_size),
            ("local_memory_size", self.local_memory_size),
        ] {
            if !is_page_aligned(value) {
                return Err(SettingsError::MisalignedSize { name, value });
            }
        }
        if self.main_memory_size > LOCAL_MEM_BASE {
            return Err(SettingsError::MainMemoryTooLarge(self.main_memory_size));
        }
        Ok(())
    }

    /// Whether the offload thread should pin itself to `rsx_affinity_mask`.
    pub fn pin_offload_thread(&self) -> bool {
        self.thread_scheduler == ThreadScheduler::Affinity && self.rsx_affinity_mask != 0
    }
}

/// How worker threads are placed on host cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadScheduler {
    /// Leave placement to the host OS.
    OsManaged,
    /// Pin renderer threads using `rsx_affinity_mask`.
    Affinity,
}

impl ThreadScheduler {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "1" | "affinity" | "rpcs3" => Self::Affinity,
            "0" | "os" | "os_managed" => Self::OsManaged,
            _ => Self::OsManaged,
        }
    }
}
