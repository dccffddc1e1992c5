// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Memory-to-memory buffer transfer (NV class 0039).
//!
//! A write to `BUFFER_NOTIFY` copies `line_count` lines of `line_length`
//! bytes between two pitched buffers. Pending ZCULL reports inside the
//! source are either flushed first or, for pitched copies, redirected to the
//! destination so the copy itself can be skipped.

use rsxcore_common::GuestAddr;

use super::{dma_location, resolve_address, ClassId, Engine, EngineContext, RegisterFile};
use crate::reservation_lock::ExclusiveReservation;
use crate::zcull::report::{ReadBarrierFlags, ReportResult};

// ── Register constants (byte offsets) ──────────────────────────────────────

const SET_CONTEXT_DMA_BUFFER_IN: u32 = 0x184;
const SET_CONTEXT_DMA_BUFFER_OUT: u32 = 0x188;
const OFFSET_IN: u32 = 0x30C;
const OFFSET_OUT: u32 = 0x310;
const PITCH_IN: u32 = 0x314;
const PITCH_OUT: u32 = 0x318;
const LINE_LENGTH_IN: u32 = 0x31C;
const LINE_COUNT: u32 = 0x320;
const FORMAT: u32 = 0x324;
const BUFFER_NOTIFY: u32 = 0x328;

/// Decoded transfer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transfer {
    src: GuestAddr,
    dst: GuestAddr,
    in_pitch: u32,
    out_pitch: u32,
    line_length: u32,
    line_count: u32,
    read_length: u32,
    write_length: u32,
}

impl Transfer {
    fn is_block(&self) -> bool {
        self.in_pitch == self.out_pitch && self.out_pitch == self.line_length
    }

    fn overlaps(&self) -> bool {
        let read_end = self.src as u64 + self.read_length as u64;
        let write_end = self.dst as u64 + self.write_length as u64;
        (self.dst as u64) < read_end && (self.src as u64) < write_end
    }
}

/// Bytes spanned by `count` lines of `length` bytes at `pitch`, if that
/// fits the 32-bit address space.
fn pitched_span(pitch: u32, count: u32, length: u32) -> Option<u32> {
    let span = pitch as u64 * (count as u64 - 1) + length as u64;
    u32::try_from(span).ok()
}

pub struct Nv0039 {
    regs: RegisterFile,
    transfers: u64,
}

impl Nv0039 {
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::new(),
            transfers: 0,
        }
    }

    /// Transfers actually performed.
    pub fn transfer_count(&self) -> u64 {
        self.transfers
    }

    fn decode(&self) -> Option<Transfer> {
        let in_pitch = self.regs.get(PITCH_IN) as i32;
        let out_pitch = self.regs.get(PITCH_OUT) as i32;
        let line_length = self.regs.get(LINE_LENGTH_IN);
        let line_count = self.regs.get(LINE_COUNT);
        let format = self.regs.get(FORMAT);

        if line_count == 0 || line_length == 0 {
            log::warn!(
                "Nv0039: BUFFER_NOTIFY NOPed out: pitch(in=0x{:X}, out=0x{:X}), line(len=0x{:X}, cnt=0x{:X}), fmt=0x{:X}",
                in_pitch,
                out_pitch,
                line_length,
                line_count,
                format
            );
            return None;
        }
        if in_pitch < 0 || out_pitch < 0 {
            log::error!(
                "Nv0039: negative pitch unsupported (in={}, out={})",
                in_pitch,
                out_pitch
            );
            return None;
        }

        let src_dma = self.regs.get(SET_CONTEXT_DMA_BUFFER_IN);
        let dst_dma = self.regs.get(SET_CONTEXT_DMA_BUFFER_OUT);
        let (Some(src_location), Some(dst_location)) = (dma_location(src_dma), dma_location(dst_dma))
        else {
            log::error!(
                "Nv0039: invalid context DMA (in=0x{:08X}, out=0x{:08X})",
                src_dma,
                dst_dma
            );
            return None;
        };

        let (in_pitch, out_pitch) = (in_pitch as u32, out_pitch as u32);
        let (Some(read_length), Some(write_length)) = (
            pitched_span(in_pitch, line_count, line_length),
            pitched_span(out_pitch, line_count, line_length),
        ) else {
            log::error!(
                "Nv0039: transfer size overflows: pitch(in=0x{:X}, out=0x{:X}), line(len=0x{:X}, cnt=0x{:X})",
                in_pitch,
                out_pitch,
                line_length,
                line_count
            );
            return None;
        };

        Some(Transfer {
            src: resolve_address(src_location, self.regs.get(OFFSET_IN)),
            dst: resolve_address(dst_location, self.regs.get(OFFSET_OUT)),
            in_pitch,
            out_pitch,
            line_length,
            line_count,
            read_length,
            write_length,
        })
    }

    fn buffer_notify(&mut self, ctx: &mut EngineContext<'_>) {
        let Some(xfer) = self.decode() else {
            return;
        };
        let (read_length, write_length) = (xfer.read_length, xfer.write_length);

        let mut flags = ReadBarrierFlags::empty();
        if !xfer.is_block() {
            flags |= ReadBarrierFlags::SYNC_DEFER_COPY;
        }
        // Must run before the reservation is taken; retiring reports locks
        // their sinks.
        let barrier = ctx.zcull.read_barrier(ctx.thread, xfer.src, read_length, flags);
        if barrier == ReportResult::ZcullInterrupted
            && ctx.zcull.copy_reports_to(xfer.src, read_length, xfer.dst) == write_length
        {
            log::trace!("Nv0039: transfer fully deferred to pending reports");
            return;
        }

        if !ctx.memory.is_mapped(xfer.src, read_length) || !ctx.memory.is_mapped(xfer.dst, write_length) {
            log::error!(
                "Nv0039: transfer out of range src=0x{:08X}+0x{:X} dst=0x{:08X}+0x{:X}",
                xfer.src,
                read_length,
                xfer.dst,
                write_length
            );
            return;
        }

        let staged = !xfer.is_block() && xfer.overlaps();
        // Staging reads the source directly; earlier queued writes must land
        // first. Never sync while holding the reservation.
        if staged && !ctx.dma.sync() {
            log::warn!("Nv0039: overlapping transfer dropped, offload queue stalled");
            return;
        }

        let _lock = ExclusiveReservation::new_dual(ctx.iomap, xfer.dst, write_length, xfer.src, read_length);
        let result = if xfer.is_block() {
            ctx.dma.copy_guest_reserved(xfer.dst, xfer.src, read_length)
        } else {
            Self::copy_lines(&xfer, staged, ctx)
        };
        match result {
            Ok(()) => self.transfers += 1,
            Err(e) => log::error!("Nv0039: transfer failed: {}", e),
        }
    }

    /// Caller holds the reservation over both ranges.
    fn copy_lines(xfer: &Transfer, staged: bool, ctx: &mut EngineContext<'_>) -> rsxcore_memory::MemoryResult<()> {
        if staged {
            // Stage the whole source so every line sees the original bytes.
            let mut staging = vec![0u8; xfer.read_length as usize];
            ctx.memory.super_read(xfer.src, &mut staging)?;
            for line in 0..xfer.line_count {
                let from = (line * xfer.in_pitch) as usize;
                let data = staging[from..from + xfer.line_length as usize].to_vec();
                ctx.dma.write_guest(xfer.dst + line * xfer.out_pitch, data)?;
            }
        } else {
            for line in 0..xfer.line_count {
                ctx.dma.copy_guest_reserved(
                    xfer.dst + line * xfer.out_pitch,
                    xfer.src + line * xfer.in_pitch,
                    xfer.line_length,
                )?;
            }
        }
        Ok(())
    }
}

impl Default for Nv0039 {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Nv0039 {
    fn class_id(&self) -> ClassId {
        ClassId::Nv0039
    }

    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut EngineContext<'_>) {
        self.regs.set(method, value);
        log::trace!("Nv0039: reg[0x{:X}] = 0x{:X}", method, value);

        if method == BUFFER_NOTIFY {
            self.buffer_notify(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::TestEnv;
    use super::super::CONTEXT_DMA_MEMORY_HOST_BUFFER;
    use super::*;
    use crate::zcull::report::{REPORT_VALUE_OFFSET, ZPASS_PIXEL_CNT};

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    fn program(
        engine: &mut Nv0039,
        ctx: &mut EngineContext<'_>,
        src: u32,
        dst: u32,
        pitches: (u32, u32),
        line_length: u32,
        line_count: u32,
    ) {
        engine.write_reg(SET_CONTEXT_DMA_BUFFER_IN, CONTEXT_DMA_MEMORY_HOST_BUFFER, ctx);
        engine.write_reg(SET_CONTEXT_DMA_BUFFER_OUT, CONTEXT_DMA_MEMORY_HOST_BUFFER, ctx);
        engine.write_reg(OFFSET_IN, src, ctx);
        engine.write_reg(OFFSET_OUT, dst, ctx);
        engine.write_reg(PITCH_IN, pitches.0, ctx);
        engine.write_reg(PITCH_OUT, pitches.1, ctx);
        engine.write_reg(LINE_LENGTH_IN, line_length, ctx);
        engine.write_reg(LINE_COUNT, line_count, ctx);
        engine.write_reg(BUFFER_NOTIFY, 0, ctx);
    }

    #[test]
    fn test_block_transfer() {
        let mut env = TestEnv::new(false);
        let data = pattern(256, 3);
        env.memory.super_write(0x1000, &data).unwrap();

        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x1000, 0x2000, (64, 64), 64, 4);

        let mut out = vec![0u8; 256];
        env.memory.super_read(0x2000, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(engine.transfer_count(), 1);
    }

    #[test]
    fn test_large_transfer_visible_after_sync() {
        let mut env = TestEnv::new(true);
        let data = pattern(0x4000, 9);
        env.memory.super_write(0x10_0000, &data).unwrap();

        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x10_0000, 0x20_0000, (0x1000, 0x1000), 0x1000, 4);
        assert!(env.dma.sync());

        let mut out = vec![0u8; data.len()];
        env.memory.super_read(0x20_0000, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_pitched_transfer() {
        let mut env = TestEnv::new(false);
        let data = pattern(128, 1);
        env.memory.super_write(0x1000, &data).unwrap();

        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x1000, 0x3000, (32, 16), 16, 4);

        let mut out = vec![0u8; 64];
        env.memory.super_read(0x3000, &mut out).unwrap();
        for line in 0..4 {
            assert_eq!(&out[line * 16..line * 16 + 16], &data[line * 32..line * 32 + 16]);
        }
    }

    #[test]
    fn test_overlapping_lines_read_original_source() {
        let mut env = TestEnv::new(false);
        let data = pattern(64, 5);
        env.memory.super_write(0x1000, &data).unwrap();

        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x1000, 0x1004, (16, 16), 8, 4);

        let mut out = vec![0u8; 64];
        env.memory.super_read(0x1000, &mut out).unwrap();
        for line in 0..4 {
            let dst = line * 16 + 4;
            assert_eq!(&out[dst..dst + 8], &data[line * 16..line * 16 + 8]);
        }
    }

    #[test]
    fn test_empty_transfer_is_nop() {
        let mut env = TestEnv::new(false);
        env.memory.super_write(0x1000, &[0xAA; 16]).unwrap();

        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x1000, 0x2000, (16, 16), 16, 0);

        let mut out = [0u8; 16];
        env.memory.super_read(0x2000, &mut out).unwrap();
        assert_eq!(out, [0u8; 16]);
        assert_eq!(engine.transfer_count(), 0);
    }

    #[test]
    fn test_pitched_copy_of_pending_report_is_deferred() {
        let mut env = TestEnv::new(false);
        let thread = env.thread.clone();
        env.zcull.set_enabled(thread.as_ref(), true, false);
        env.zcull.set_status(thread.as_ref(), true, true, false, false);
        env.zcull.backend_mut().draw(3);
        env.zcull.on_draw();
        env.zcull.read_report(thread.as_ref(), 0x3000, ZPASS_PIXEL_CNT);

        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x3000, 0x5000, (32, 16), 16, 1);
        assert_eq!(engine.transfer_count(), 0);
        assert_eq!(env.zcull.pending_write_count(), 1);

        env.zcull.on_work_submitted();
        env.clock.advance(1_000);
        assert_eq!(env.zcull.update(thread.as_ref(), None, false), 1);
        assert_eq!(env.memory.super_read_u32(0x3000 + REPORT_VALUE_OFFSET).unwrap(), 0xFFFF);
        assert_eq!(env.memory.super_read_u32(0x5000 + REPORT_VALUE_OFFSET).unwrap(), 0xFFFF);
    }

    #[test]
    fn test_block_copy_of_pending_report_flushes_first() {
        let mut env = TestEnv::new(false);
        let thread = env.thread.clone();
        env.handle.set_auto_ready(false);
        env.zcull.set_enabled(thread.as_ref(), true, false);
        env.zcull.set_status(thread.as_ref(), true, true, false, false);
        env.zcull.backend_mut().draw(3);
        env.zcull.on_draw();
        env.zcull.read_report(thread.as_ref(), 0x3000, ZPASS_PIXEL_CNT);

        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x3000, 0x6000, (16, 16), 16, 1);
        assert_eq!(engine.transfer_count(), 1);
        assert_eq!(env.zcull.pending_write_count(), 0);
        assert_eq!(env.memory.super_read_u32(0x6000 + REPORT_VALUE_OFFSET).unwrap(), 0xFFFF);
    }

    #[test]
    fn test_oversized_transfer_is_nop() {
        let mut env = TestEnv::new(false);
        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x1000, 0x2000, (0x7FFF_FFFF, 16), 1, 4);
        program(&mut engine, &mut env.ctx(), 0x1000, 0x2000, (16, 16), 0xFFFF_FFFF, 2);
        program(&mut engine, &mut env.ctx(), 0x1000, 0x2000, (0x7FFF_FFFF, 0x7FFF_FFFF), 16, 0xFFFF_FFFF);
        assert_eq!(engine.transfer_count(), 0);
        assert_eq!(env.zcull.pending_write_count(), 0);
    }

    #[test]
    fn test_line_copies_reuse_held_reservation() {
        let mut env = TestEnv::new(true);
        env.memory.super_write(0x1000, &pattern(256, 2)).unwrap();

        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x1000, 0x8000, (32, 16), 16, 8);
        program(&mut engine, &mut env.ctx(), 0x1000, 0x9000, (64, 64), 64, 4);
        assert_eq!(engine.transfer_count(), 2);
        assert_eq!(env.dma.enqueued_count(), 0);
        assert_eq!(env.dma.unreserved_copy_count(), 0);
    }

    #[test]
    fn test_overlapping_transfer_waits_for_queued_write() {
        let mut env = TestEnv::new(true);
        let data = pattern(0x4000, 11);
        env.dma.write_guest(0x10_0000, data.clone()).unwrap();
        assert_eq!(env.dma.enqueued_count(), 1);

        let mut engine = Nv0039::new();
        program(&mut engine, &mut env.ctx(), 0x10_0000, 0x10_0004, (0x1000, 0x1000), 0x800, 4);
        assert_eq!(engine.transfer_count(), 1);
        assert!(env.dma.sync());

        let mut out = vec![0u8; 0x4000];
        env.memory.super_read(0x10_0000, &mut out).unwrap();
        for line in 0..4 {
            let src = line * 0x1000;
            assert_eq!(&out[src + 4..src + 4 + 0x800], &data[src..src + 0x800]);
        }
    }
}
