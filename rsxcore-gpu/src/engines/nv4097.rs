// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Curie 3D engine (NV class 4097).
//!
//! Only the state that feeds the concurrency core is decoded: ZCULL unit and
//! report methods, conditional rendering, and enough of the draw path to
//! upload vertex ranges and expand non-native primitives through the offload
//! manager.

use rsxcore_common::{GuestAddr, MemoryLocation};

use super::{dma_location, resolve_address, ClassId, Engine, EngineContext, RegisterFile};
use crate::index_utils::{get_index_count, is_primitive_native, PrimitiveType};
use crate::offload::DmaManager;
use crate::zcull::report::is_known_report_type;

// ── Method constants (byte offsets) ────────────────────────────────────────

const WAIT_FOR_IDLE: u32 = 0x110;
const SET_CONTEXT_DMA_REPORT: u32 = 0x1A8;
const SET_SURFACE_COLOR_TARGET: u32 = 0x220;
const SET_VERTEX_DATA_ARRAY_OFFSET: u32 = 0x1680;
const SET_VERTEX_DATA_ARRAY_FORMAT: u32 = 0x1740;
const CLEAR_REPORT_VALUE: u32 = 0x17C8;
const GET_REPORT: u32 = 0x1800;
const SET_BEGIN_END: u32 = 0x1808;
const DRAW_ARRAYS: u32 = 0x1814;
const SET_ZCULL_EN: u32 = 0x1D78;
const SET_ZPASS_PIXEL_COUNT_ENABLE: u32 = 0x1D7C;
const SET_ZCULL_STATS_ENABLE: u32 = 0x1D84;
const SET_RENDER_ENABLE: u32 = 0x1D88;

pub const VERTEX_ARRAY_COUNT: usize = 16;

// SET_RENDER_ENABLE modes.
const RENDER_ENABLE_ALWAYS: u32 = 1;
const RENDER_ENABLE_CONDITIONAL: u32 = 2;

/// Bit 31 of an array offset selects main memory.
const ARRAY_LOCATION_MAIN: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct VertexArray {
    address: GuestAddr,
    size: u32,
    stride: u32,
}

impl VertexArray {
    fn enabled(&self) -> bool {
        self.size != 0 && self.stride != 0
    }
}

/// `(first, count)` vertex range recorded by DRAW_ARRAYS.
type DrawRange = (u32, u32);

pub struct Nv4097 {
    regs: RegisterFile,
    report_location: MemoryLocation,
    surface_active: bool,
    zpass_count_enabled: bool,
    stats_enabled: bool,

    arrays: [VertexArray; VERTEX_ARRAY_COUNT],
    primitive: Option<PrimitiveType>,
    ranges: Vec<DrawRange>,

    vertex_heap: Vec<u8>,
    index_heap: Vec<u16>,
    draws: u64,
    skipped_draws: u64,
}

impl Nv4097 {
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::new(),
            report_location: MemoryLocation::Local,
            surface_active: true,
            zpass_count_enabled: false,
            stats_enabled: false,
            arrays: [VertexArray::default(); VERTEX_ARRAY_COUNT],
            primitive: None,
            ranges: Vec::new(),
            vertex_heap: Vec::new(),
            index_heap: Vec::new(),
            draws: 0,
            skipped_draws: 0,
        }
    }

    /// Vertex data staged by the last draw. Drains `dma` first; `None` if a
    /// fault keeps jobs that write the heap in flight.
    pub fn vertex_heap(&self, dma: &DmaManager) -> Option<&[u8]> {
        dma.sync().then_some(self.vertex_heap.as_slice())
    }

    /// Indices generated for the last non-native draw. Same rules as
    /// [`Nv4097::vertex_heap`].
    pub fn index_heap(&self, dma: &DmaManager) -> Option<&[u16]> {
        dma.sync().then_some(self.index_heap.as_slice())
    }

    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    /// Draws dropped by conditional rendering or a stalled offload queue.
    pub fn skipped_draw_count(&self) -> u64 {
        self.skipped_draws
    }

    fn update_zcull_status(&self, ctx: &mut EngineContext<'_>) {
        ctx.zcull.set_status(
            ctx.thread,
            self.surface_active,
            self.zpass_count_enabled,
            self.stats_enabled,
            false,
        );
    }

    fn get_report(&self, value: u32, ctx: &mut EngineContext<'_>) {
        let ty = value >> 24;
        let offset = value & 0x00FF_FFFF;
        if !is_known_report_type(ty) {
            log::error!("Nv4097: GET_REPORT with unknown type {}", ty);
            return;
        }
        if offset & 0xF != 0 {
            log::error!("Nv4097: GET_REPORT to misaligned offset 0x{:X}", offset);
            return;
        }
        let sink = resolve_address(self.report_location, offset);
        log::trace!("Nv4097: GET_REPORT type {} -> 0x{:08X}", ty, sink);
        ctx.zcull.read_report(ctx.thread, sink, ty);
    }

    fn set_render_enable(&self, value: u32, ctx: &mut EngineContext<'_>) {
        let mode = value >> 24;
        match mode {
            RENDER_ENABLE_ALWAYS => ctx.zcull.disable_conditional_render(),
            RENDER_ENABLE_CONDITIONAL => {
                let address = resolve_address(self.report_location, value & 0x00FF_FFFF);
                ctx.zcull.enable_conditional_render(address);
            }
            _ => {
                log::error!("Nv4097: unknown render enable mode {}", mode);
                ctx.zcull.disable_conditional_render();
            }
        }
    }

    fn begin_end(&mut self, value: u32, ctx: &mut EngineContext<'_>) {
        if value == 0 {
            self.end_draw(ctx);
            return;
        }
        match PrimitiveType::from_raw(value) {
            Some(primitive) => {
                if self.primitive.is_some() {
                    log::warn!("Nv4097: nested SET_BEGIN_END, previous draw dropped");
                }
                self.primitive = Some(primitive);
                self.ranges.clear();
            }
            None => log::error!("Nv4097: invalid primitive {}", value),
        }
    }

    fn end_draw(&mut self, ctx: &mut EngineContext<'_>) {
        let Some(primitive) = self.primitive.take() else {
            log::warn!("Nv4097: SET_BEGIN_END(0) outside of a draw");
            return;
        };
        let ranges = std::mem::take(&mut self.ranges);
        let vertex_count: u32 = ranges.iter().map(|&(_, count)| count).sum();
        if vertex_count == 0 {
            return;
        }

        ctx.zcull.evaluate_conditional_render(ctx.thread);
        if ctx.zcull.disable_rendering() {
            self.skipped_draws += 1;
            log::trace!("Nv4097: draw skipped by conditional render");
            return;
        }

        // Queued jobs may still point into the heaps.
        if !ctx.dma.sync() {
            self.skipped_draws += 1;
            log::warn!("Nv4097: draw skipped, offload queue stalled by a fault");
            return;
        }
        self.upload_vertices(&ranges, ctx);

        if !is_primitive_native(primitive) {
            let count = get_index_count(primitive, vertex_count) as usize;
            self.index_heap.clear();
            self.index_heap.resize(count, 0);
            if count > 0 {
                // SAFETY: the heap is only resized after a successful dma
                // sync, so the buffer stays valid while the job may run.
                unsafe {
                    ctx.dma
                        .emulate_as_indexed(self.index_heap.as_mut_ptr(), primitive, vertex_count)
                };
            }
        }

        ctx.zcull.backend_mut().draw(vertex_count);
        ctx.zcull.on_draw();
        self.draws += 1;
        log::trace!("Nv4097: draw {:?} x{}", primitive, vertex_count);
    }

    fn upload_vertices(&mut self, ranges: &[DrawRange], ctx: &mut EngineContext<'_>) {
        let total: u64 = self
            .arrays
            .iter()
            .filter(|a| a.enabled())
            .map(|a| ranges.iter().map(|&(_, count)| count as u64 * a.stride as u64).sum::<u64>())
            .sum();
        self.vertex_heap.clear();
        self.vertex_heap.resize(total as usize, 0);

        let mut cursor = 0usize;
        for array in self.arrays.iter().filter(|a| a.enabled()) {
            for &(first, count) in ranges {
                let length = count * array.stride;
                let source = array.address.wrapping_add(first * array.stride);
                match ctx.memory.super_ptr(source, length) {
                    Ok(src) => {
                        // SAFETY: the destination lies inside the heap, which
                        // is not touched again before the next dma sync.
                        unsafe {
                            ctx.dma
                                .copy(self.vertex_heap.as_mut_ptr().add(cursor), src, length)
                        };
                    }
                    Err(e) => log::error!("Nv4097: vertex fetch at 0x{:08X} failed: {}", source, e),
                }
                cursor += length as usize;
            }
        }
    }
}

impl Default for Nv4097 {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Nv4097 {
    fn class_id(&self) -> ClassId {
        ClassId::Nv4097
    }

    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut EngineContext<'_>) {
        self.regs.set(method, value);
        log::trace!("Nv4097: reg[0x{:X}] = 0x{:X}", method, value);

        match method {
            WAIT_FOR_IDLE => {
                ctx.zcull.sync(ctx.thread);
                ctx.dma.sync();
            }
            SET_CONTEXT_DMA_REPORT => match dma_location(value) {
                Some(location) => self.report_location = location,
                None => log::error!("Nv4097: invalid report context DMA 0x{:08X}", value),
            },
            SET_SURFACE_COLOR_TARGET => {
                self.surface_active = value != 0;
                self.update_zcull_status(ctx);
            }
            m if (SET_VERTEX_DATA_ARRAY_OFFSET..SET_VERTEX_DATA_ARRAY_OFFSET + 4 * VERTEX_ARRAY_COUNT as u32)
                .contains(&m) =>
            {
                let index = ((m - SET_VERTEX_DATA_ARRAY_OFFSET) / 4) as usize;
                let location = if value & ARRAY_LOCATION_MAIN != 0 {
                    MemoryLocation::Main
                } else {
                    MemoryLocation::Local
                };
                self.arrays[index].address = resolve_address(location, value & !ARRAY_LOCATION_MAIN);
            }
            m if (SET_VERTEX_DATA_ARRAY_FORMAT..SET_VERTEX_DATA_ARRAY_FORMAT + 4 * VERTEX_ARRAY_COUNT as u32)
                .contains(&m) =>
            {
                let index = ((m - SET_VERTEX_DATA_ARRAY_FORMAT) / 4) as usize;
                self.arrays[index].size = (value >> 4) & 0xF;
                self.arrays[index].stride = (value >> 8) & 0xFF;
            }
            CLEAR_REPORT_VALUE => ctx.zcull.clear(ctx.thread, value),
            GET_REPORT => self.get_report(value, ctx),
            SET_BEGIN_END => self.begin_end(value, ctx),
            DRAW_ARRAYS => {
                if self.primitive.is_none() {
                    log::error!("Nv4097: DRAW_ARRAYS outside of SET_BEGIN_END");
                    return;
                }
                self.ranges.push((value & 0x00FF_FFFF, (value >> 24) + 1));
            }
            SET_ZCULL_EN => ctx.zcull.set_enabled(ctx.thread, value != 0, false),
            SET_ZPASS_PIXEL_COUNT_ENABLE => {
                self.zpass_count_enabled = value != 0;
                self.update_zcull_status(ctx);
            }
            SET_ZCULL_STATS_ENABLE => {
                self.stats_enabled = value != 0;
                self.update_zcull_status(ctx);
            }
            SET_RENDER_ENABLE => self.set_render_enable(value, ctx),
            _ => {}
        }
    }
}
