// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Conditional render predicate state.

use rsxcore_common::GuestAddr;
use rsxcore_memory::GuestMemory;

use crate::backend::{QueryId, RenderBackend};
use crate::zcull::report::REPORT_VALUE_OFFSET;

#[derive(Debug, Default)]
pub struct ConditionalRenderEval {
    pub enabled: bool,
    pub eval_failed: bool,
    /// Host predication is bound to `eval_sources`.
    pub hw_cond_active: bool,
    pub eval_sources: Vec<QueryId>,
    /// Sync tag of the query whose retirement settles the predicate; 0 if none.
    pub eval_sync_tag: u64,
    pub eval_address: Option<GuestAddr>,
}

impl ConditionalRenderEval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.eval_address = None;
        self.eval_sync_tag = 0;
        self.eval_sources.clear();
        self.eval_failed = false;
    }

    /// True if draws must be skipped.
    pub fn disable_rendering(&self) -> bool {
        self.enabled && self.eval_failed
    }

    /// True if enabled but not evaluated yet.
    pub fn eval_pending(&self) -> bool {
        self.enabled && self.eval_address.is_some()
    }

    fn end_host_predicate(&mut self, backend: &mut dyn RenderBackend) {
        if self.hw_cond_active {
            assert!(self.enabled, "host predicate bound while conditional render is off");
            backend.end_conditional_rendering();
            self.hw_cond_active = false;
        }
    }

    pub fn enable_conditional_render(&mut self, backend: &mut dyn RenderBackend, address: GuestAddr) {
        self.end_host_predicate(backend);
        self.reset();
        self.enabled = true;
        self.eval_address = Some(address);
    }

    pub fn disable_conditional_render(&mut self, backend: &mut dyn RenderBackend) {
        self.end_host_predicate(backend);
        self.reset();
        self.enabled = false;
    }

    /// Record the queries the predicate depends on. `sync_tag` belongs to the
    /// first of them.
    pub fn set_eval_sources(&mut self, sources: Vec<QueryId>, sync_tag: u64) {
        self.eval_sources = sources;
        self.eval_sync_tag = sync_tag;
    }

    /// Settle the predicate; `failed` means the tested samples were zero.
    pub fn set_eval_result(&mut self, backend: &mut dyn RenderBackend, failed: bool) {
        self.end_host_predicate(backend);
        self.reset();
        self.eval_failed = failed;
    }

    /// Settle the predicate from the report already in guest memory.
    pub fn eval_result(&mut self, backend: &mut dyn RenderBackend, memory: &GuestMemory) {
        let Some(address) = self.eval_address else {
            return;
        };
        let failed = match memory.super_read_u32(address + REPORT_VALUE_OFFSET) {
            Ok(value) => value == 0,
            Err(e) => {
                log::error!("ConditionalRender: bad report address 0x{:08X}: {}", address, e);
                false
            }
        };
        self.set_eval_result(backend, failed);
    }
}
