// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! ZCULL occlusion-report pipeline.
//!
//! Host occlusion queries are recorded while the unit is active. Each
//! GET_REPORT closes the running query and queues a report write; writes are
//! retired strictly in queue order once their query results are available,
//! or forcibly when something needs the value now (a read barrier, a sync, a
//! conditional render evaluation or an exhausted query pool).
//!
//! Only the GPU thread touches [`ZcullControl`]. Guest threads interact with
//! it indirectly through the page guard installed on guest memory.

pub mod cond_render;
pub mod page_lock;
pub mod report;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rsxcore_common::{AddressRange, GuestAddr, MemoryLocation, Settings};
use rsxcore_memory::{GuestMemory, ReservationTable};

use crate::backend::{QueryId, RenderBackend};
use crate::clock::Clock;
use crate::reservation_lock::ExclusiveReservation;
use crate::thread::{GpuThread, SyncHint};

use cond_render::ConditionalRenderEval;
use page_lock::ReportPageGuard;
use report::{
    is_query_backed, map_report_value, OcclusionQueryInfo, QueryDataType, QuerySearchResult,
    QueryStatCounter, QueuedReportWrite, ReadBarrierFlags, ReportData, ReportResult,
    ReportValueContext, REPORT_SIZE, REPORT_VALUE_OFFSET, ZPASS_PIXEL_CNT,
};

#[derive(Debug, Clone, Copy)]
struct ZcullTuning {
    precise_zpass_count: bool,
    relaxed_sync: bool,
    min_tick_us: u64,
    max_delay_us: u64,
    max_safe_queue_depth: u32,
}

impl ZcullTuning {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            precise_zpass_count: settings.precise_zpass_count,
            relaxed_sync: settings.relaxed_zcull_sync,
            min_tick_us: settings.min_zcull_tick_us,
            max_delay_us: settings.max_zcull_delay_us,
            max_safe_queue_depth: settings.max_safe_queue_depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetireMode {
    /// Stop at the first query that is unsubmitted or not ready.
    Opportunistic,
    /// Block on results up to and including the writer that owns this sink.
    UntilSink(GuestAddr),
    /// Block on every claimed write.
    All,
}

pub struct ZcullControl {
    memory: Arc<GuestMemory>,
    iomap: Arc<ReservationTable>,
    backend: Box<dyn RenderBackend>,
    clock: Arc<dyn Clock>,
    pages: Arc<ReportPageGuard>,
    cond: ConditionalRenderEval,
    tuning: ZcullTuning,

    unit_enabled: bool,
    write_enabled: bool,
    zpass_count_enabled: bool,
    stats_enabled: bool,
    host_queries_active: bool,

    queries: Vec<OcclusionQueryInfo>,
    free_pool: Vec<QueryId>,
    current: Option<QueryId>,

    pending_writes: VecDeque<QueuedReportWrite>,
    next_write_id: u64,

    statistics: Vec<QueryStatCounter>,
    statistics_tag_id: u32,

    /// Source of sync tags; tags start at 1.
    timer: u64,
    /// Highest sync tag known to be submitted to the host.
    sync_tag: u64,
    next_tick: u64,
}

impl ZcullControl {
    pub fn new(
        settings: &Settings,
        memory: Arc<GuestMemory>,
        iomap: Arc<ReservationTable>,
        thread: Arc<dyn GpuThread>,
        backend: Box<dyn RenderBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pages = Arc::new(ReportPageGuard::new(&memory, thread));
        memory.add_violation_handler(pages.clone());

        let query_count = settings.occlusion_query_count.max(1);
        log::debug!(
            "ZCULL: {} host queries, {} statistics slots, backend {}",
            query_count,
            settings.max_stat_registers,
            backend.name()
        );

        Self {
            memory,
            iomap,
            backend,
            clock,
            pages,
            cond: ConditionalRenderEval::new(),
            tuning: ZcullTuning::from_settings(settings),
            unit_enabled: false,
            write_enabled: false,
            zpass_count_enabled: false,
            stats_enabled: false,
            host_queries_active: false,
            queries: vec![OcclusionQueryInfo::default(); query_count as usize],
            free_pool: (0..query_count).rev().collect(),
            current: None,
            pending_writes: VecDeque::new(),
            next_write_id: 0,
            statistics: vec![QueryStatCounter::default(); settings.max_stat_registers.max(1) as usize],
            statistics_tag_id: 0,
            timer: 0,
            sync_tag: 0,
            next_tick: 0,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn backend_mut(&mut self) -> &mut dyn RenderBackend {
        self.backend.as_mut()
    }

    pub fn page_guard(&self) -> &Arc<ReportPageGuard> {
        &self.pages
    }

    pub fn host_queries_active(&self) -> bool {
        self.host_queries_active
    }

    pub fn current_query(&self) -> Option<QueryId> {
        self.current
    }

    pub fn query(&self, id: QueryId) -> &OcclusionQueryInfo {
        &self.queries[id as usize]
    }

    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_writes.is_empty()
    }

    pub fn statistics_tag(&self) -> u32 {
        self.statistics_tag_id
    }

    pub fn critical_reports_in_flight(&self) -> u32 {
        self.pages.critical_reports_in_flight()
    }

    pub fn conditional_render(&self) -> &ConditionalRenderEval {
        &self.cond
    }

    fn value_context(&self) -> ReportValueContext {
        ReportValueContext {
            precise_zpass_count: self.tuning.precise_zpass_count,
            write_enabled: self.write_enabled,
            stats_enabled: self.stats_enabled,
        }
    }

    fn next_sync_tag(&mut self) -> u64 {
        self.timer += 1;
        self.timer
    }

    /// Ask the GPU thread to submit host work up to `tag`.
    fn flush_hint(&mut self, thread: &dyn GpuThread, hint: SyncHint, tag: u64) {
        thread.sync_hint(hint);
        self.sync_tag = self.sync_tag.max(tag);
    }

    /// All recorded host work has been submitted.
    pub fn on_work_submitted(&mut self) {
        self.sync_tag = self.timer;
    }

    // ── Unit state ───────────────────────────────────────────────────────

    pub fn set_enabled(&mut self, thread: &dyn GpuThread, state: bool, flush_queue: bool) {
        if state != self.unit_enabled {
            self.unit_enabled = state;
            self.check_state(thread, flush_queue);
        }
    }

    pub fn set_status(
        &mut self,
        thread: &dyn GpuThread,
        surface_active: bool,
        zpass_active: bool,
        zcull_stats_active: bool,
        flush_queue: bool,
    ) {
        self.write_enabled = surface_active;
        self.zpass_count_enabled = zpass_active;
        self.stats_enabled = zcull_stats_active;
        self.check_state(thread, flush_queue);
    }

    fn check_state(&mut self, thread: &dyn GpuThread, flush_queue: bool) {
        let wanted = self.unit_enabled
            && self.write_enabled
            && (self.zpass_count_enabled || self.stats_enabled);
        if wanted != self.host_queries_active {
            self.set_active(thread, wanted, flush_queue);
        }
    }

    fn set_active(&mut self, thread: &dyn GpuThread, state: bool, flush_queue: bool) {
        if state == self.host_queries_active {
            return;
        }
        self.host_queries_active = state;

        if state {
            assert!(self.current.is_none(), "ZCULL activated with a query in flight");
            let query = self.allocate_new_query(thread);
            self.backend.begin_occlusion_query(query);
            return;
        }

        let Some(query) = self.current.take() else {
            return;
        };
        if self.queries[query as usize].num_draws > 0 {
            self.end_query(query);
            self.push_write(Some(query));
            thread.async_tasks_pending().fetch_add(1, Ordering::AcqRel);
        } else {
            self.backend.discard_occlusion_query(query);
            self.queries[query as usize].active = false;
            self.free_query(query);
        }

        self.update(thread, None, flush_queue);
    }

    // ── Query pool ───────────────────────────────────────────────────────

    fn allocate_new_query(&mut self, thread: &dyn GpuThread) -> QueryId {
        for attempt in 0..2 {
            if let Some(id) = self.free_pool.pop() {
                let mut data_type = QueryDataType::empty();
                if self.zpass_count_enabled {
                    data_type |= QueryDataType::ZPASS;
                }
                if self.stats_enabled {
                    data_type |= QueryDataType::STATS;
                }
                self.statistics[self.statistics_tag_id as usize].flags |= data_type;

                self.queries[id as usize] = OcclusionQueryInfo {
                    data_type,
                    active: true,
                    ..OcclusionQueryInfo::default()
                };
                self.current = Some(id);
                return id;
            }

            if attempt > 0 {
                break;
            }

            // Pool exhausted: force the oldest query-backed write out.
            match self.pending_writes.iter().find(|w| w.query.is_some()) {
                Some(QueuedReportWrite { sink: Some(sink), .. }) => {
                    let sink = *sink;
                    log::debug!("ZCULL: query pool exhausted, retiring up to 0x{:08X}", sink);
                    self.retire_pending(thread, RetireMode::UntilSink(sink));
                }
                _ => log::error!("ZCULL: query pool exhausted with no claimed query to retire"),
            }
        }
        panic!("ZCULL: occlusion query pool exhausted");
    }

    fn free_query(&mut self, id: QueryId) {
        self.queries[id as usize].pending = false;
        self.free_pool.push(id);
    }

    fn end_query(&mut self, id: QueryId) {
        self.backend.end_occlusion_query(id);
        let tag = self.next_sync_tag();
        let now = self.clock.now_us();
        let query = &mut self.queries[id as usize];
        query.active = false;
        query.pending = true;
        query.sync_tag = tag;
        query.timestamp = now;
    }

    fn push_write(&mut self, query: Option<QueryId>) {
        let id = self.next_write_id;
        self.next_write_id += 1;
        self.pending_writes.push_back(QueuedReportWrite {
            id,
            ty: ZPASS_PIXEL_CNT,
            query,
            ..QueuedReportWrite::default()
        });
    }

    // ── Command entry points ─────────────────────────────────────────────

    /// GET_REPORT: queue a report of `ty` to `sink`.
    pub fn read_report(&mut self, thread: &dyn GpuThread, sink: GuestAddr, ty: u32) {
        let running = self.current.filter(|_| ty == ZPASS_PIXEL_CNT);
        if let Some(query) = running {
            self.queries[query as usize].owned = true;
            self.end_query(query);
            self.current = None;
            self.push_write(Some(query));
        } else {
            if self.pending_writes.is_empty() {
                // Nothing in flight; the counter is already final.
                let value = self.statistics[self.statistics_tag_id as usize].result;
                self.write_report(thread, sink, ty, value);
                return;
            }
            self.push_write(None);
        }

        let forwarder = self.pending_writes.back().map(|w| w.id);
        let tag = self.statistics_tag_id;
        for writer in self.pending_writes.iter_mut().rev() {
            if writer.is_claimed() {
                break;
            }
            writer.counter_tag = tag;
            writer.sink = Some(sink);
            writer.ty = ty;

            if Some(writer.id) != forwarder {
                // Truncated query left behind by a deactivation; the newest
                // write carries the value for the whole chain.
                writer.forwarder = forwarder;
                match writer.query {
                    Some(query) => self.queries[query as usize].owned = true,
                    None => log::error!("ZCULL: forwarded report write without a query"),
                }
            }
        }

        self.pages.on_report_enqueued(sink);
        thread.async_tasks_pending().fetch_add(1, Ordering::AcqRel);
        self.statistics[tag as usize].flags |= QueryDataType::REPORT_QUEUED;

        if running.is_some() {
            let query = self.allocate_new_query(thread);
            self.backend.begin_occlusion_query(query);
        }
    }

    /// CLEAR_REPORT_VALUE: start a new statistics epoch.
    pub fn clear(&mut self, thread: &dyn GpuThread, ty: u32) {
        if ty != ZPASS_PIXEL_CNT {
            log::debug!("ZCULL: clear of report type {} ignored", ty);
            return;
        }

        // Unclaimed results can no longer be observed.
        while self.pending_writes.back().is_some_and(|w| !w.is_claimed()) {
            let Some(writer) = self.pending_writes.pop_back() else {
                break;
            };
            if let Some(query) = writer.query {
                self.backend.discard_occlusion_query(query);
                self.free_query(query);
            }
            thread.async_tasks_pending().fetch_sub(1, Ordering::AcqRel);
        }

        self.statistics_tag_id = (self.statistics_tag_id + 1) % self.statistics.len() as u32;
        let slot = &mut self.statistics[self.statistics_tag_id as usize];
        if !slot.flags.is_empty() {
            log::error!(
                "ZCULL: statistics slot {} reused while still referenced",
                self.statistics_tag_id
            );
        }
        *slot = QueryStatCounter::default();
    }

    pub fn on_draw(&mut self) {
        if let Some(query) = self.current {
            let tag = self.next_sync_tag();
            let query = &mut self.queries[query as usize];
            query.num_draws += 1;
            query.sync_tag = tag;
        }
    }

    // ── Report writes ────────────────────────────────────────────────────

    fn write_report(&self, thread: &dyn GpuThread, sink: GuestAddr, ty: u32, value: u32) {
        let report = ReportData {
            timer: thread.timestamp(),
            value: map_report_value(ty, value, self.value_context()),
            padding: 0,
        };
        let _lock = ExclusiveReservation::new(&self.iomap, sink, REPORT_SIZE);
        if let Err(e) = self.memory.super_write(sink, &report.to_bytes()) {
            log::error!("ZCULL: report write to 0x{:08X} failed: {}", sink, e);
        }
    }

    fn retire(
        &mut self,
        thread: &dyn GpuThread,
        writer: &QueuedReportWrite,
        query_sync_tag: Option<u64>,
        result: u32,
    ) {
        let Some(sink) = writer.sink else {
            return;
        };

        if writer.forwarder.is_none() {
            self.write_report(thread, sink, writer.ty, result);
            self.pages.on_report_completed(sink);
            for &alias in &writer.sink_alias {
                self.write_report(thread, alias, writer.ty, result);
            }
        }

        let tag = query_sync_tag.unwrap_or(0);
        if tag != 0 && tag == self.cond.eval_sync_tag {
            let failed = if writer.forwarder.is_none() {
                result == 0
            } else {
                // The chain has not written yet; use what the guest can see.
                self.memory
                    .super_read_u32(sink + REPORT_VALUE_OFFSET)
                    .map_or(false, |value| value == 0)
            };
            self.cond.set_eval_result(self.backend.as_mut(), failed);
        }
    }

    /// Retire writes from the front of the queue. Returns how many were
    /// retired.
    fn retire_pending(&mut self, thread: &dyn GpuThread, mode: RetireMode) -> u32 {
        let current_tag = self.statistics_tag_id;
        let mut stat_tag_to_remove = current_tag;
        let mut forcing = mode != RetireMode::Opportunistic;
        let mut processed = 0u32;

        while let Some(front) = self.pending_writes.front() {
            let Some(sink) = front.sink else {
                break;
            };
            let counter_tag = front.counter_tag;
            let ty = front.ty;
            let is_forwarder = front.forwarder.is_some();
            let query = front.query;

            if counter_tag != stat_tag_to_remove && stat_tag_to_remove != current_tag {
                // The queue is ordered, nothing else refers to the older slot.
                self.statistics[stat_tag_to_remove as usize].flags = QueryDataType::empty();
                stat_tag_to_remove = current_tag;
            }

            let mut query_sync_tag = None;
            if let Some(id) = query {
                let info = &self.queries[id as usize];
                assert!(info.pending, "retiring query {} that is not pending", id);
                let (num_draws, tag) = (info.num_draws, info.sync_tag);

                let counter = self.statistics[counter_tag as usize];
                let have_result = counter.result != 0 && !self.tuning.precise_zpass_count;
                let needs_read = is_query_backed(ty) && !have_result && num_draws > 0;

                if !needs_read {
                    self.backend.discard_occlusion_query(id);
                } else {
                    if forcing {
                        if tag > self.sync_tag {
                            self.flush_hint(thread, SyncHint::FlushEarly, tag);
                        }
                    } else if tag > self.sync_tag || !self.backend.check_occlusion_query_status(id) {
                        break;
                    }
                    let samples = self.backend.get_occlusion_query_result(id);
                    self.queries[id as usize].result = samples;
                    let counter = &mut self.statistics[counter_tag as usize];
                    counter.result = counter.result.saturating_add(samples);
                }

                query_sync_tag = Some(tag);
                self.free_query(id);
            }

            stat_tag_to_remove = counter_tag;
            let result = self.statistics[counter_tag as usize].result;
            let Some(writer) = self.pending_writes.pop_front() else {
                break;
            };
            self.retire(thread, &writer, query_sync_tag, result);
            processed += 1;

            if let RetireMode::UntilSink(addr) = mode {
                if forcing && !is_forwarder && sink == addr {
                    forcing = false;
                }
            }
        }

        if stat_tag_to_remove != current_tag {
            self.statistics[stat_tag_to_remove as usize].flags = QueryDataType::empty();
        }

        if processed > 0 {
            thread
                .async_tasks_pending()
                .fetch_sub(processed, Ordering::AcqRel);
            self.pages.cleanup_unreferenced();
            log::trace!("ZCULL: retired {} report writes", processed);
        }
        processed
    }

    /// Periodic retirement. With `sync_address` set, results up to the write
    /// targeting that address are waited on. Returns the number of writes
    /// retired.
    pub fn update(&mut self, thread: &dyn GpuThread, sync_address: Option<GuestAddr>, hint: bool) -> u32 {
        match self.pending_writes.front() {
            Some(front) if front.is_claimed() => {}
            _ => return 0,
        }

        if let Some(addr) = sync_address {
            return self.retire_pending(thread, RetireMode::UntilSink(addr));
        }

        let depth = thread.async_tasks_pending().load(Ordering::Acquire);
        if hint || depth >= self.tuning.max_safe_queue_depth {
            // Get the whole queue moving on the host.
            let newest = self.pending_writes.iter().rev().find_map(|w| w.query);
            if let Some(id) = newest {
                let info = &self.queries[id as usize];
                if info.num_draws > 0 && info.sync_tag > self.sync_tag {
                    let tag = info.sync_tag;
                    self.flush_hint(thread, SyncHint::FlushRequest, tag);
                }
            }
        }

        let now = self.clock.now_us();
        if now < self.next_tick {
            return 0;
        }
        self.next_tick = now + self.tuning.min_tick_us;

        if !self.tuning.relaxed_sync {
            let front = self.pending_writes.front().and_then(|w| w.query);
            if let Some(id) = front {
                let info = &self.queries[id as usize];
                if info.num_draws > 0 && info.sync_tag > self.sync_tag {
                    if now.saturating_sub(info.timestamp) > self.tuning.max_delay_us {
                        let tag = info.sync_tag;
                        self.flush_hint(thread, SyncHint::FlushRequest, tag);
                    }
                    return 0;
                }
            }
        }

        self.retire_pending(thread, RetireMode::Opportunistic)
    }

    /// Drain every claimed write, but only if the guest has already looked at
    /// a report that is still in flight.
    pub fn sync(&mut self, thread: &dyn GpuThread) {
        if self.pending_writes.is_empty() || self.pages.critical_reports_in_flight() == 0 {
            return;
        }

        if self.tuning.relaxed_sync {
            self.update(thread, None, true);
            return;
        }

        let newest = self
            .pending_writes
            .iter()
            .rev()
            .filter(|w| w.is_claimed())
            .find_map(|w| w.query);
        if let Some(id) = newest {
            let info = &self.queries[id as usize];
            if info.num_draws > 0 && info.sync_tag > self.sync_tag {
                let tag = info.sync_tag;
                self.flush_hint(thread, SyncHint::FlushEarly, tag);
            }
        }

        self.retire_pending(thread, RetireMode::All);

        // Older statistics slots are no longer referenced.
        let len = self.statistics.len() as u32;
        let current = self.statistics_tag_id;
        let mut index = (current + len - 1) % len;
        while index != current && !self.statistics[index as usize].flags.is_empty() {
            self.statistics[index as usize].flags = QueryDataType::empty();
            index = (index + len - 1) % len;
        }
    }

    /// Retire every claimed write regardless of guest visibility. Used at
    /// teardown.
    pub fn drain(&mut self, thread: &dyn GpuThread) -> u32 {
        if self.pending_writes.is_empty() {
            return 0;
        }
        self.sync_tag = self.timer;
        self.retire_pending(thread, RetireMode::All)
    }

    // ── Barriers ─────────────────────────────────────────────────────────

    /// Wait until `query` has been retired.
    pub fn read_barrier_for_query(&mut self, thread: &dyn GpuThread, address: GuestAddr, query: QueryId) {
        while self.queries[query as usize].pending {
            if self.update(thread, Some(address), false) == 0 {
                log::error!(
                    "ZCULL: query {} for 0x{:08X} cannot be retired",
                    query,
                    address
                );
                break;
            }
        }
    }

    /// Make pending reports in `[address, address + range)` visible before the
    /// caller reads that memory.
    pub fn read_barrier(
        &mut self,
        thread: &dyn GpuThread,
        address: GuestAddr,
        range: u32,
        flags: ReadBarrierFlags,
    ) -> ReportResult {
        if self.pending_writes.is_empty() || range == 0 {
            return ReportResult::None;
        }

        let area = AddressRange::start_length(address, range);
        let mut sync_address = None;
        let mut query = None;
        for writer in self.pending_writes.iter().rev() {
            if sync_address.is_some() {
                if writer.query.is_some() {
                    sync_address = writer.sink;
                    query = writer.query;
                    break;
                }
                continue;
            }
            if let Some(sink) = writer.sink.filter(|&s| area.contains(s)) {
                sync_address = Some(sink);
                if writer.query.is_some() {
                    query = writer.query;
                    break;
                }
            }
        }

        let (Some(sync_address), Some(query)) = (sync_address, query) else {
            return ReportResult::None;
        };

        for location in [
            MemoryLocation::classify(area.start),
            MemoryLocation::classify(area.last()),
        ] {
            if !self.pages.optimizations_disabled(location) {
                self.pages.disable_optimizations(location);
            }
        }

        if flags.contains(ReadBarrierFlags::SYNC_DEFER_COPY) {
            return ReportResult::ZcullInterrupted;
        }

        if !flags.contains(ReadBarrierFlags::SYNC_NO_NOTIFY) {
            let tag = self.queries[query as usize].sync_tag;
            if tag > self.sync_tag {
                self.flush_hint(thread, SyncHint::FlushEarly, tag);
            }
        }
        self.read_barrier_for_query(thread, sync_address, query);
        ReportResult::None
    }

    /// Queries that will produce the value written to `sink`.
    pub fn find_query(&self, sink: GuestAddr, all: bool) -> QuerySearchResult {
        let mut result = QuerySearchResult::default();
        let mut stat_id = None;

        for writer in self.pending_writes.iter().rev() {
            match stat_id {
                Some(id) => {
                    if writer.counter_tag != id {
                        if result.found {
                            break;
                        }
                        // Statistics were cleared in between; the value is zero.
                        return QuerySearchResult {
                            found: true,
                            ..QuerySearchResult::default()
                        };
                    }
                }
                None => {
                    if !writer.writes_to(sink) {
                        continue;
                    }
                    stat_id = Some(writer.counter_tag);
                }
            }

            if let Some(id) = writer.query {
                if self.queries[id as usize].num_draws > 0 {
                    result.found = true;
                    result.queries.push(id);
                    if !all {
                        break;
                    }
                }
            }
        }

        if let (Some(id), false) = (stat_id, result.found) {
            result.found = true;
            result.raw_zpass_result = self.statistics[id as usize].result;
        }
        result
    }

    /// Redirect copies of pending reports in `[start, start + range)` to
    /// `dest`. Returns the number of source bytes the aliases will cover.
    pub fn copy_reports_to(&mut self, start: GuestAddr, range: u32, dest: GuestAddr) -> u32 {
        let area = AddressRange::start_length(start, range);
        let mut covered: Vec<GuestAddr> = Vec::new();

        for writer in self.pending_writes.iter_mut() {
            let Some(sink) = writer.sink else {
                break;
            };
            if writer.forwarder.is_some() || !area.contains(sink) {
                continue;
            }
            writer.sink_alias.push(dest.wrapping_add(sink - start));
            if !covered.contains(&sink) {
                covered.push(sink);
            }
        }

        covered
            .iter()
            .map(|&sink| REPORT_SIZE.min((area.end() - sink as u64) as u32))
            .sum()
    }

    // ── Conditional render ───────────────────────────────────────────────

    pub fn enable_conditional_render(&mut self, address: GuestAddr) {
        self.cond.enable_conditional_render(self.backend.as_mut(), address);
    }

    pub fn disable_conditional_render(&mut self) {
        self.cond.disable_conditional_render(self.backend.as_mut());
    }

    /// True if the next draw must be skipped.
    pub fn disable_rendering(&self) -> bool {
        self.cond.disable_rendering()
    }

    /// Resolve a pending predicate before a draw.
    pub fn evaluate_conditional_render(&mut self, thread: &dyn GpuThread) {
        if !self.cond.eval_pending() {
            return;
        }
        let Some(address) = self.cond.eval_address else {
            return;
        };

        let search = self.find_query(address, true);
        if !search.found {
            self.cond.eval_result(self.backend.as_mut(), &self.memory);
            return;
        }
        let Some(&first) = search.queries.first() else {
            self.cond
                .set_eval_result(self.backend.as_mut(), search.raw_zpass_result == 0);
            return;
        };

        let tag = self.queries[first as usize].sync_tag;
        self.cond.set_eval_sources(search.queries, tag);
        if tag > self.sync_tag {
            self.flush_hint(thread, SyncHint::FlushEarly, tag);
        }

        if self.backend.supports_hw_conditional_render() {
            self.backend.begin_conditional_rendering(&self.cond.eval_sources);
            self.cond.hw_cond_active = true;
            return;
        }

        self.read_barrier_for_query(thread, address, first);
        if self.cond.eval_pending() {
            self.cond.eval_result(self.backend.as_mut(), &self.memory);
        }
    }
}

impl std::fmt::Debug for ZcullControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZcullControl")
            .field("backend", &self.backend.name())
            .field("active", &self.host_queries_active)
            .field("pending_writes", &self.pending_writes.len())
            .field("statistics_tag", &self.statistics_tag_id)
            .finish_non_exhaustive()
    }
}
