// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Null rendering backend.
//!
//! Draws produce a configurable number of samples for the active occlusion
//! query and nothing else. The state lives behind a [`NullBackendHandle`] so
//! that drivers and tests can steer query readiness from outside the GPU
//! thread.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{BackendRequest, QueryId, RenderBackend, RenderControl};

#[derive(Debug, Default, Clone, Copy)]
struct NullQuery {
    samples: u32,
    ended: bool,
    ready: bool,
}

#[derive(Debug)]
struct NullState {
    samples_per_draw: u32,
    /// Ended queries become ready immediately.
    auto_ready: bool,
    hw_conditional_render: bool,
    active: Option<QueryId>,
    queries: HashMap<QueryId, NullQuery>,
    predicate: Option<Vec<QueryId>>,
    requests: Vec<BackendRequest>,
    draws: u64,
    discarded: u64,
}

/// Shared view of the null backend's state.
#[derive(Clone)]
pub struct NullBackendHandle {
    state: Arc<Mutex<NullState>>,
}

impl NullBackendHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NullState {
                samples_per_draw: 1,
                auto_ready: true,
                hw_conditional_render: false,
                active: None,
                queries: HashMap::new(),
                predicate: None,
                requests: Vec::new(),
                draws: 0,
                discarded: 0,
            })),
        }
    }

    pub fn set_samples_per_draw(&self, samples: u32) {
        self.state.lock().samples_per_draw = samples;
    }

    pub fn set_auto_ready(&self, auto_ready: bool) {
        self.state.lock().auto_ready = auto_ready;
    }

    pub fn set_hw_conditional_render(&self, supported: bool) {
        self.state.lock().hw_conditional_render = supported;
    }

    /// Make an ended query's result available.
    pub fn set_ready(&self, query: QueryId) {
        if let Some(q) = self.state.lock().queries.get_mut(&query) {
            q.ready = q.ended;
        }
    }

    /// Make every ended query's result available.
    pub fn set_all_ready(&self) {
        for q in self.state.lock().queries.values_mut() {
            q.ready = q.ended;
        }
    }

    pub fn set_query_samples(&self, query: QueryId, samples: u32) {
        self.state.lock().queries.entry(query).or_default().samples = samples;
    }

    /// Requests received through [`RenderControl`], oldest first.
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.state.lock().requests.clone()
    }

    /// Queries bound for host predication, if any.
    pub fn predicate(&self) -> Option<Vec<QueryId>> {
        self.state.lock().predicate.clone()
    }

    pub fn draw_count(&self) -> u64 {
        self.state.lock().draws
    }

    pub fn discarded_count(&self) -> u64 {
        self.state.lock().discarded
    }
}

impl Default for NullBackendHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderControl for NullBackendHandle {
    fn renderctl(&self, request: BackendRequest) {
        log::trace!("NullBackend: renderctl {:?}", request);
        self.state.lock().requests.push(request);
    }
}

pub struct NullBackend {
    handle: NullBackendHandle,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::with_handle(NullBackendHandle::new())
    }

    pub fn with_handle(handle: NullBackendHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> NullBackendHandle {
        self.handle.clone()
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn draw(&mut self, vertex_count: u32) {
        let mut state = self.handle.state.lock();
        state.draws += 1;
        if vertex_count == 0 {
            return;
        }
        let samples = state.samples_per_draw;
        if let Some(active) = state.active {
            let query = state.queries.entry(active).or_default();
            query.samples = query.samples.saturating_add(samples);
        }
    }

    fn begin_occlusion_query(&mut self, query: QueryId) {
        let mut state = self.handle.state.lock();
        state.active = Some(query);
        state.queries.insert(query, NullQuery::default());
    }

    fn end_occlusion_query(&mut self, query: QueryId) {
        let mut state = self.handle.state.lock();
        if state.active == Some(query) {
            state.active = None;
        }
        let auto_ready = state.auto_ready;
        let q = state.queries.entry(query).or_default();
        q.ended = true;
        q.ready = auto_ready;
    }

    fn check_occlusion_query_status(&mut self, query: QueryId) -> bool {
        self.handle
            .state
            .lock()
            .queries
            .get(&query)
            .is_some_and(|q| q.ready)
    }

    fn get_occlusion_query_result(&mut self, query: QueryId) -> u32 {
        // A blocking read on real hardware; here the result is simply forced.
        let mut state = self.handle.state.lock();
        match state.queries.get_mut(&query) {
            Some(q) => {
                q.ready = true;
                q.samples
            }
            None => {
                log::warn!("NullBackend: result requested for unknown query {}", query);
                0
            }
        }
    }

    fn discard_occlusion_query(&mut self, query: QueryId) {
        let mut state = self.handle.state.lock();
        if state.active == Some(query) {
            state.active = None;
        }
        state.queries.remove(&query);
        state.discarded += 1;
    }

    fn supports_hw_conditional_render(&self) -> bool {
        self.handle.state.lock().hw_conditional_render
    }

    fn begin_conditional_rendering(&mut self, sources: &[QueryId]) {
        self.handle.state.lock().predicate = Some(sources.to_vec());
    }

    fn end_conditional_rendering(&mut self) {
        self.handle.state.lock().predicate = None;
    }
}
