// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Central renderer context.
//!
//! Owns guest memory, the reservation table, the GPU thread state, the DMA
//! offload manager, ZCULL, the engines and the command ring. Producers push
//! register writes with [`RsxContext::submit`]; the GPU loop started by
//! [`RsxContext::spawn`] drains the ring, dispatches it and keeps the ZCULL
//! queue moving.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use rsxcore_common::{GuestAddr, Settings, SettingsError};
use rsxcore_memory::{GuestMemory, MemoryError, MemoryResult, ReservationTable};

use crate::backend::{BackendRequest, RenderBackend, RenderControl};
use crate::clock::{Clock, SystemClock};
use crate::command_processor::CommandProcessor;
use crate::engines::nv0039::Nv0039;
use crate::engines::nv3062::{Nv3062, Surface2d};
use crate::engines::nv3089::Nv3089;
use crate::engines::nv308a::Nv308a;
use crate::engines::nv4097::Nv4097;
use crate::engines::{Engine, EngineContext};
use crate::fifo::CommandRing;
use crate::offload::DmaManager;
use crate::thread::RsxThread;
use crate::zcull::report::ReportData;
use crate::zcull::ZcullControl;

/// Ring entries dispatched per loop iteration before pauses are serviced.
const DRAIN_BATCH: usize = 1024;
const IDLE_TIMEOUT: Duration = Duration::from_micros(500);

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("guest memory setup failed: {0}")]
    Memory(#[from] MemoryError),
}

/// State only the GPU thread mutates.
struct GpuState {
    processor: CommandProcessor,
    zcull: ZcullControl,
    surface: Surface2d,
}

/// Snapshot of renderer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub method_writes: u64,
    pub host_submits: u64,
    pub dma_enqueued: u64,
    pub dma_processed: u64,
    pub flush_requests: u64,
    pub early_flushes: u64,
    pub pending_reports: usize,
    pub critical_reports: u32,
}

pub struct RsxContext {
    settings: Settings,
    memory: Arc<GuestMemory>,
    iomap: Arc<ReservationTable>,
    thread: Arc<RsxThread>,
    /// Dropped before `state`: joining the worker drains jobs that point
    /// into engine heaps.
    dma: DmaManager,
    state: Mutex<GpuState>,
    ring: CommandRing,
    submit_requested: Arc<AtomicBool>,
    host_submits: AtomicU64,
    gpu_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RsxContext {
    /// Create a context over fresh guest memory sized by `settings`.
    pub fn new(
        settings: Settings,
        backend: Box<dyn RenderBackend>,
        control: Arc<dyn RenderControl>,
    ) -> Result<Arc<Self>, ContextError> {
        Self::with_clock(settings, backend, control, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        settings: Settings,
        backend: Box<dyn RenderBackend>,
        control: Arc<dyn RenderControl>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ContextError> {
        settings.validate()?;
        let memory = Arc::new(GuestMemory::from_settings(&settings)?);
        let iomap = Arc::new(ReservationTable::new(settings.rsx_accurate_res_access));
        let thread = Arc::new(RsxThread::new());

        let submit_requested = Arc::new(AtomicBool::new(false));
        let flag = submit_requested.clone();
        let hint_thread = Arc::downgrade(&thread);
        thread.set_hint_handler(move |hint| {
            log::trace!("RsxContext: sync hint {:?}", hint);
            flag.store(true, Ordering::Release);
            if let Some(thread) = hint_thread.upgrade() {
                thread.wake();
            }
        });

        let dma = DmaManager::new(&settings, memory.clone(), iomap.clone(), thread.clone(), control);
        let zcull = ZcullControl::new(
            &settings,
            memory.clone(),
            iomap.clone(),
            thread.clone(),
            backend,
            clock,
        );

        let engines: Vec<Option<Box<dyn Engine>>> = vec![
            Some(Box::new(Nv4097::new())), // subchannel 0
            Some(Box::new(Nv0039::new())), // subchannel 1
            Some(Box::new(Nv3062::new())), // subchannel 2
            Some(Box::new(Nv308a::new())), // subchannel 3
            Some(Box::new(Nv3089::new())), // subchannel 4
        ];

        log::debug!(
            "RsxContext: main {} MiB, local {} MiB, multithreaded={}",
            settings.main_memory_size >> 20,
            settings.local_memory_size >> 20,
            dma.is_multithreaded()
        );

        Ok(Arc::new(Self {
            settings,
            memory,
            iomap,
            thread,
            dma,
            state: Mutex::new(GpuState {
                processor: CommandProcessor::new(engines),
                zcull,
                surface: Surface2d::default(),
            }),
            ring: CommandRing::new(),
            submit_requested,
            host_submits: AtomicU64::new(0),
            gpu_thread: Mutex::new(None),
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn memory(&self) -> &Arc<GuestMemory> {
        &self.memory
    }

    pub fn thread(&self) -> &Arc<RsxThread> {
        &self.thread
    }

    pub fn dma(&self) -> &DmaManager {
        &self.dma
    }

    // ── Submission ───────────────────────────────────────────────────────

    /// Queue one register write for the GPU thread.
    pub fn submit(&self, subchannel: u32, method: u32, value: u32) {
        self.ring.push(subchannel, method, value);
        self.thread.wake();
    }

    /// Queue a run of incrementing register writes.
    pub fn submit_burst(&self, subchannel: u32, method: u32, values: &[u32]) {
        self.ring.push_burst(subchannel, method, values);
        self.thread.wake();
    }

    pub fn pending_commands(&self) -> u32 {
        self.ring.len()
    }

    /// Guest read of a report; faults on a locked report page escalate
    /// through the ZCULL page guard.
    pub fn read_report(&self, addr: GuestAddr) -> MemoryResult<ReportData> {
        let mut bytes = [0u8; 16];
        self.memory.read(addr, &mut bytes)?;
        Ok(ReportData::from_bytes(&bytes))
    }

    // ── GPU side ─────────────────────────────────────────────────────────

    /// Run `f` with the command processor and an engine context.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut CommandProcessor, &mut EngineContext<'_>) -> R) -> R {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut ctx = EngineContext {
            memory: &self.memory,
            iomap: &self.iomap,
            dma: &self.dma,
            thread: self.thread.as_ref(),
            zcull: &mut state.zcull,
            surface: &mut state.surface,
        };
        f(&mut state.processor, &mut ctx)
    }

    /// Dispatch one batch from the ring. Returns the number of writes.
    pub fn process_pending(&self) -> usize {
        let entries = self.ring.drain(DRAIN_BATCH);
        if entries.is_empty() {
            return 0;
        }
        self.with_state(|processor, ctx| processor.process_ring(&entries, ctx));
        entries.len()
    }

    /// Submit recorded host work so pending queries can resolve.
    fn submit_host_work(&self) {
        self.submit_requested.store(false, Ordering::Release);
        self.dma.backend_ctrl(BackendRequest::QueueSubmit);
        self.state.lock().zcull.on_work_submitted();
        self.host_submits.fetch_add(1, Ordering::Relaxed);
    }

    fn run(&self) {
        self.thread.bind_current();
        log::debug!("RsxContext: GPU loop started");

        while self.thread.check_state() {
            let processed = self.process_pending();

            let pending_reports = {
                let mut state = self.state.lock();
                state.zcull.update(self.thread.as_ref(), None, false);
                state.zcull.has_pending()
            };

            let idle = processed == 0 && self.ring.is_empty();
            if self.submit_requested.load(Ordering::Acquire) || (idle && pending_reports) {
                self.submit_host_work();
            }
            if idle {
                self.thread.idle_wait(IDLE_TIMEOUT);
            }
        }

        // Leave nothing half-done for the offload worker or the guest.
        while self.process_pending() > 0 {}
        self.state.lock().zcull.drain(self.thread.as_ref());
        self.dma.sync();
        self.thread.unbind();
        log::debug!("RsxContext: GPU loop stopped");
    }

    /// Start the GPU loop on a dedicated thread.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<()> {
        let mut slot = self.gpu_thread.lock();
        if slot.is_some() {
            log::warn!("RsxContext: GPU thread already running");
            return Ok(());
        }
        let ctx = self.clone();
        let handle = std::thread::Builder::new()
            .name("RSX GPU".into())
            .spawn(move || ctx.run())?;
        *slot = Some(handle);
        Ok(())
    }

    /// Wait until every queued write has been dispatched.
    pub fn wait_idle(&self) {
        while !self.ring.is_empty() {
            self.thread.wake();
            std::thread::yield_now();
        }
    }

    /// Stop the GPU loop, then the offload worker.
    pub fn shutdown(&self) {
        self.thread.request_exit();
        if let Some(handle) = self.gpu_thread.lock().take() {
            if handle.join().is_err() {
                log::error!("RsxContext: GPU thread panicked");
            }
        }
        self.dma.join();
        log::debug!("RsxContext: shut down");
    }

    pub fn stats(&self) -> ContextStats {
        let state = self.state.lock();
        ContextStats {
            method_writes: state.processor.stats().writes,
            host_submits: self.host_submits.load(Ordering::Relaxed),
            dma_enqueued: self.dma.enqueued_count(),
            dma_processed: self.dma.processed_count(),
            flush_requests: self.thread.flush_requests(),
            early_flushes: self.thread.early_flushes(),
            pending_reports: state.zcull.pending_write_count(),
            critical_reports: state.zcull.critical_reports_in_flight(),
        }
    }
}

impl std::fmt::Debug for RsxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsxContext")
            .field("thread", &self.thread)
            .field("dma", &self.dma)
            .field("pending_commands", &self.ring.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::null_backend::{NullBackend, NullBackendHandle};
    use crate::engines::{CONTEXT_DMA_MEMORY_HOST_BUFFER, CONTEXT_DMA_REPORT_LOCATION_MAIN};
    use crate::zcull::report::ZPASS_PIXEL_CNT;

    // 3D methods used below.
    const SET_CONTEXT_DMA_REPORT: u32 = 0x1A8;
    const SET_ZCULL_EN: u32 = 0x1D78;
    const SET_ZPASS_PIXEL_COUNT_ENABLE: u32 = 0x1D7C;
    const SET_BEGIN_END: u32 = 0x1808;
    const DRAW_ARRAYS: u32 = 0x1814;
    const GET_REPORT: u32 = 0x1800;
    const WAIT_FOR_IDLE: u32 = 0x110;

    fn context(multithreaded: bool) -> (Arc<RsxContext>, NullBackendHandle) {
        let mut settings = Settings::default();
        settings.multithreaded_rsx = multithreaded;
        settings.main_memory_size = 0x40_0000;
        settings.local_memory_size = 0x40_0000;
        settings.occlusion_query_count = 16;
        settings.max_stat_registers = 16;
        settings.max_safe_queue_depth = 8;

        let backend = NullBackend::new();
        let handle = backend.handle();
        let ctx = RsxContext::new(settings, Box::new(backend), Arc::new(handle.clone())).unwrap();
        (ctx, handle)
    }

    fn queue_draw_and_report(ctx: &RsxContext, sink: u32) {
        ctx.submit(0, SET_CONTEXT_DMA_REPORT, CONTEXT_DMA_REPORT_LOCATION_MAIN);
        ctx.submit(0, SET_ZCULL_EN, 1);
        ctx.submit(0, SET_ZPASS_PIXEL_COUNT_ENABLE, 1);
        ctx.submit(0, SET_BEGIN_END, 5);
        ctx.submit(0, DRAW_ARRAYS, 2 << 24);
        ctx.submit(0, SET_BEGIN_END, 0);
        ctx.submit(0, GET_REPORT, (ZPASS_PIXEL_CNT << 24) | sink);
    }

    #[test]
    fn test_inline_processing_without_gpu_thread() {
        let (ctx, handle) = context(false);
        queue_draw_and_report(&ctx, 0x1000);
        assert_eq!(ctx.process_pending(), 7);
        assert_eq!(handle.draw_count(), 1);
        assert_eq!(ctx.stats().pending_reports, 1);

        ctx.submit(0, WAIT_FOR_IDLE, 0);
        ctx.process_pending();
        // Nothing read the report yet, so WAIT_FOR_IDLE leaves it queued.
        assert_eq!(ctx.stats().pending_reports, 1);
    }

    #[test]
    fn test_gpu_loop_retires_reports() {
        let (ctx, _handle) = context(true);
        ctx.spawn().unwrap();
        queue_draw_and_report(&ctx, 0x2000);
        ctx.wait_idle();

        // A guest read of the sink blocks the page until the report lands.
        let mut value = 0;
        for _ in 0..10_000 {
            value = ctx.read_report(0x2000).unwrap().value;
            if value != 0 {
                break;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        assert_eq!(value, 0xFFFF);

        ctx.shutdown();
        let stats = ctx.stats();
        assert_eq!(stats.pending_reports, 0);
        assert!(stats.host_submits > 0);
    }

    #[test]
    fn test_transfer_through_ring() {
        let (ctx, _handle) = context(true);
        let data: Vec<u8> = (0..0x2000u32).map(|i| i as u8).collect();
        ctx.memory().super_write(0x10_0000, &data).unwrap();
        ctx.spawn().unwrap();

        ctx.submit(1, 0x184, CONTEXT_DMA_MEMORY_HOST_BUFFER);
        ctx.submit(1, 0x188, CONTEXT_DMA_MEMORY_HOST_BUFFER);
        ctx.submit_burst(1, 0x30C, &[0x10_0000, 0x20_0000, 0x2000, 0x2000, 0x2000, 1, 0]);
        ctx.submit(1, 0x328, 0);
        ctx.wait_idle();
        ctx.shutdown();

        let mut out = vec![0u8; data.len()];
        ctx.memory().super_read(0x20_0000, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings::default();
        settings.occlusion_query_count = 0;
        let backend = NullBackend::new();
        let handle = backend.handle();
        let result = RsxContext::new(settings, Box::new(backend), Arc::new(handle));
        assert!(matches!(result, Err(ContextError::Settings(_))));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (ctx, _handle) = context(true);
        ctx.shutdown();
        ctx.shutdown();
        assert_eq!(ctx.dma().enqueued_count(), 0);
        assert_eq!(ctx.pending_commands(), 0);
    }
}
