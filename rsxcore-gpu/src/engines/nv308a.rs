// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Image from CPU (NV class 308A).
//!
//! Pixels pushed inline through the command stream are written straight into
//! the 2D surface. Each COLOR word carries one pixel.

use rsxcore_common::GuestAddr;

use super::nv3062::Surface2d;
use super::{ClassId, Engine, EngineContext, RegisterFile};
use crate::reservation_lock::ExclusiveReservation;

// ── Register constants (byte offsets) ──────────────────────────────────────

const POINT: u32 = 0x304;
const SIZE_OUT: u32 = 0x308;
const SIZE_IN: u32 = 0x30C;
const COLOR: u32 = 0x400;
const COLOR_END: u32 = 0x2000;

/// Placement of one pushed pixel.
#[derive(Debug, Clone, Copy)]
struct PixelTarget {
    address: GuestAddr,
    bpp: u32,
}

pub struct Nv308a {
    regs: RegisterFile,
    pixels: u64,
}

impl Nv308a {
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::new(),
            pixels: 0,
        }
    }

    /// Pixels written to the surface.
    pub fn pixel_count(&self) -> u64 {
        self.pixels
    }

    fn target(&self, surface: &Surface2d, method: u32) -> Option<PixelTarget> {
        let Some(bpp) = surface.bytes_per_pixel() else {
            log::error!("Nv308a: unsupported surface format 0x{:X}", surface.color_format);
            return None;
        };
        let size_in = self.regs.get(SIZE_IN);
        let size_out = self.regs.get(SIZE_OUT);
        let width = size_in & 0xFFFF;
        if width == 0 {
            log::warn!("Nv308a: pixel pushed with zero input width");
            return None;
        }

        let index = (method - COLOR) / 4;
        let (row, col) = (index / width, index % width);
        if col >= (size_out & 0xFFFF) || row >= (size_out >> 16) {
            return None;
        }

        let point = self.regs.get(POINT);
        let x = (point & 0xFFFF) + col;
        let y = (point >> 16) + row;
        let offset = y as u64 * surface.dst_pitch as u64 + x as u64 * bpp as u64;
        let address = surface.dst_address() as u64 + offset;
        if address + bpp as u64 > 1 << 32 {
            log::error!(
                "Nv308a: pixel ({}, {}) pitch 0x{:X} lies outside the address space",
                x,
                y,
                surface.dst_pitch
            );
            return None;
        }
        Some(PixelTarget {
            address: address as GuestAddr,
            bpp,
        })
    }

    fn store(ctx: &EngineContext<'_>, target: PixelTarget, value: u32) -> bool {
        let result = match target.bpp {
            2 => ctx.memory.super_write(target.address, &(value as u16).to_be_bytes()),
            _ => ctx.memory.super_write_u32(target.address, value),
        };
        if let Err(e) = result {
            log::error!("Nv308a: pixel write to 0x{:08X} failed: {}", target.address, e);
            return false;
        }
        true
    }

    fn is_color(method: u32) -> bool {
        (COLOR..COLOR_END).contains(&method)
    }
}

impl Default for Nv308a {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Nv308a {
    fn class_id(&self) -> ClassId {
        ClassId::Nv308a
    }

    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut EngineContext<'_>) {
        self.regs.set(method, value);
        if !Self::is_color(method) {
            log::trace!("Nv308a: reg[0x{:X}] = 0x{:X}", method, value);
            return;
        }

        let Some(target) = self.target(ctx.surface, method) else {
            return;
        };
        let _lock = ExclusiveReservation::new(ctx.iomap, target.address, target.bpp);
        if Self::store(ctx, target, value) {
            self.pixels += 1;
        }
    }

    fn write_burst(&mut self, method: u32, values: &[u32], increment: bool, ctx: &mut EngineContext<'_>) {
        if !increment || !Self::is_color(method) {
            for (i, &value) in values.iter().enumerate() {
                let target = if increment { method + 4 * i as u32 } else { method };
                self.write_reg(target, value, ctx);
            }
            return;
        }

        // One reservation follows the write cursor across the whole run.
        let mut lock: Option<ExclusiveReservation<'_>> = None;
        for (i, &value) in values.iter().enumerate() {
            let reg = method + 4 * i as u32;
            if !Self::is_color(reg) {
                break;
            }
            self.regs.set(reg, value);
            let Some(target) = self.target(ctx.surface, reg) else {
                continue;
            };
            match lock.as_mut() {
                Some(held) => held.update_if_enabled(target.address, target.bpp, None),
                None => lock = Some(ExclusiveReservation::new(ctx.iomap, target.address, target.bpp)),
            }
            if Self::store(ctx, target, value) {
                self.pixels += 1;
            }
        }
        log::trace!("Nv308a: pushed {} words at 0x{:X}", values.len(), method);
    }
}

#[cfg(test)]
mod tests {
    use super::super::nv3062::{COLOR_FORMAT_A8R8G8B8, COLOR_FORMAT_R5G6B5};
    use super::super::test_support::TestEnv;
    use super::*;
    use rsxcore_common::MemoryLocation;

    fn setup(env: &mut TestEnv, format: u32, pitch: u32) {
        env.surface.dst_location = MemoryLocation::Main;
        env.surface.color_format = format;
        env.surface.dst_pitch = pitch;
        env.surface.dst_offset = 0x2000;
    }

    fn configure(engine: &mut Nv308a, ctx: &mut EngineContext<'_>, point: (u32, u32), size: (u32, u32)) {
        engine.write_reg(POINT, (point.1 << 16) | point.0, ctx);
        engine.write_reg(SIZE_OUT, (size.1 << 16) | size.0, ctx);
        engine.write_reg(SIZE_IN, (size.1 << 16) | size.0, ctx);
    }

    #[test]
    fn test_single_pixel_write() {
        let mut env = TestEnv::new(false);
        setup(&mut env, COLOR_FORMAT_A8R8G8B8, 64);
        let mut engine = Nv308a::new();
        let mut ctx = env.ctx();
        configure(&mut engine, &mut ctx, (1, 2), (4, 4));

        engine.write_reg(COLOR, 0xDEAD_BEEF, &mut ctx);
        assert_eq!(engine.pixel_count(), 1);
        assert_eq!(env.memory.super_read_u32(0x2000 + 2 * 64 + 4).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_burst_wraps_rows() {
        let mut env = TestEnv::new(false);
        setup(&mut env, COLOR_FORMAT_A8R8G8B8, 32);
        let mut engine = Nv308a::new();
        let mut ctx = env.ctx();
        configure(&mut engine, &mut ctx, (0, 0), (2, 2));

        engine.write_burst(COLOR, &[1, 2, 3, 4], true, &mut ctx);
        assert_eq!(engine.pixel_count(), 4);
        assert_eq!(env.memory.super_read_u32(0x2000).unwrap(), 1);
        assert_eq!(env.memory.super_read_u32(0x2004).unwrap(), 2);
        assert_eq!(env.memory.super_read_u32(0x2020).unwrap(), 3);
        assert_eq!(env.memory.super_read_u32(0x2024).unwrap(), 4);
    }

    #[test]
    fn test_burst_crossing_pages_under_reservation() {
        let mut env = TestEnv::new(false);
        setup(&mut env, COLOR_FORMAT_A8R8G8B8, 0x1000);
        let mut engine = Nv308a::new();
        let mut ctx = env.ctx();
        configure(&mut engine, &mut ctx, (0, 0), (1, 8));

        let values: Vec<u32> = (10..18).collect();
        engine.write_burst(COLOR, &values, true, &mut ctx);
        for (row, &v) in values.iter().enumerate() {
            assert_eq!(env.memory.super_read_u32(0x2000 + row as u32 * 0x1000).unwrap(), v);
        }
        assert!(!env.iomap.is_locked(rsxcore_common::AddressRange::start_length(0x2000, 0x8000)));
    }

    #[test]
    fn test_16bpp_surface_and_clipping() {
        let mut env = TestEnv::new(false);
        setup(&mut env, COLOR_FORMAT_R5G6B5, 8);
        let mut engine = Nv308a::new();
        let mut ctx = env.ctx();
        engine.write_reg(POINT, 0, &mut ctx);
        engine.write_reg(SIZE_IN, (1 << 16) | 4, &mut ctx);
        engine.write_reg(SIZE_OUT, (1 << 16) | 2, &mut ctx);

        engine.write_burst(COLOR, &[0x1_F800, 0x07E0, 0x001F, 0xFFFF], true, &mut ctx);
        assert_eq!(engine.pixel_count(), 2);

        let mut out = [0u8; 8];
        env.memory.super_read(0x2000, &mut out).unwrap();
        assert_eq!(out, [0xF8, 0x00, 0x07, 0xE0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_out_of_range_pixels_are_dropped() {
        let mut env = TestEnv::new(false);
        setup(&mut env, COLOR_FORMAT_A8R8G8B8, 0xFFFF_FFFF);
        let mut engine = Nv308a::new();
        let mut ctx = env.ctx();
        configure(&mut engine, &mut ctx, (0xFFFF, 0xFFFF), (2, 2));

        engine.write_reg(COLOR, 0x1234_5678, &mut ctx);
        engine.write_burst(COLOR, &[1, 2, 3, 4], true, &mut ctx);
        assert_eq!(engine.pixel_count(), 0);
        assert_eq!(env.memory.super_read_u32(0x2000).unwrap(), 0);
    }
}
