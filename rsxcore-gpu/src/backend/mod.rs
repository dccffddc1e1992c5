// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rendering backend abstraction.
//!
//! The core never talks to a graphics API directly. Host occlusion queries and
//! predication go through [`RenderBackend`], which lives on the GPU thread;
//! out-of-band requests issued from the offload worker go through
//! [`RenderControl`].

pub mod null_backend;

/// Host occlusion query slot, index into the ZCULL query pool.
pub type QueryId = u32;

/// Requests delivered to the backend from the offload worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRequest {
    /// Submit recorded host work.
    QueueSubmit,
    /// Reclaim retired host resources.
    RunGc,
    /// Backend-specific request.
    Custom { code: u32, arg: u64 },
}

/// Host query and predication hooks used by ZCULL.
///
/// Only the GPU thread calls into this trait.
pub trait RenderBackend: Send {
    fn name(&self) -> &str;

    /// Record a draw of `vertex_count` vertices.
    fn draw(&mut self, _vertex_count: u32) {}

    fn begin_occlusion_query(&mut self, query: QueryId);
    fn end_occlusion_query(&mut self, query: QueryId);

    /// True once the result of an ended query can be read without waiting.
    fn check_occlusion_query_status(&mut self, query: QueryId) -> bool;

    /// Number of samples that passed. May block until the result is ready.
    fn get_occlusion_query_result(&mut self, query: QueryId) -> u32;

    /// Drop a query whose result will never be read.
    fn discard_occlusion_query(&mut self, query: QueryId);

    /// True if the host can predicate draws on query results directly.
    fn supports_hw_conditional_render(&self) -> bool {
        false
    }

    fn begin_conditional_rendering(&mut self, _sources: &[QueryId]) {}

    fn end_conditional_rendering(&mut self) {}
}

/// Thread-safe entry point for requests issued off the GPU thread.
pub trait RenderControl: Send + Sync {
    fn renderctl(&self, request: BackendRequest);
}
