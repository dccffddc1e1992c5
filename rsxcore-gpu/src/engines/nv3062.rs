// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! 2D surface object (NV class 3062).
//!
//! Holds the destination the image classes blit into. The state lives in
//! [`Surface2d`], outside the engine, so the other 2D engines can read it.

use rsxcore_common::{GuestAddr, MemoryLocation};

use super::{dma_location, resolve_address, ClassId, Engine, EngineContext, RegisterFile};

// ── Register constants (byte offsets) ──────────────────────────────────────

const SET_CONTEXT_DMA_IMAGE_SOURCE: u32 = 0x184;
const SET_CONTEXT_DMA_IMAGE_DESTIN: u32 = 0x188;
const SET_COLOR_FORMAT: u32 = 0x300;
const SET_PITCH: u32 = 0x304;
const SET_OFFSET_SOURCE: u32 = 0x308;
const SET_OFFSET_DESTIN: u32 = 0x30C;

// Surface color formats.
pub const COLOR_FORMAT_R5G6B5: u32 = 4;
pub const COLOR_FORMAT_A8R8G8B8: u32 = 0xA;
pub const COLOR_FORMAT_Y32: u32 = 0xB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface2d {
    pub src_location: MemoryLocation,
    pub dst_location: MemoryLocation,
    pub color_format: u32,
    pub src_pitch: u32,
    pub dst_pitch: u32,
    pub src_offset: u32,
    pub dst_offset: u32,
}

impl Default for Surface2d {
    fn default() -> Self {
        Self {
            src_location: MemoryLocation::Local,
            dst_location: MemoryLocation::Local,
            color_format: COLOR_FORMAT_A8R8G8B8,
            src_pitch: 0,
            dst_pitch: 0,
            src_offset: 0,
            dst_offset: 0,
        }
    }
}

impl Surface2d {
    pub fn dst_address(&self) -> GuestAddr {
        resolve_address(self.dst_location, self.dst_offset)
    }

    /// Bytes per destination pixel, `None` for formats the blitter rejects.
    pub fn bytes_per_pixel(&self) -> Option<u32> {
        match self.color_format {
            COLOR_FORMAT_R5G6B5 => Some(2),
            COLOR_FORMAT_A8R8G8B8 | COLOR_FORMAT_Y32 => Some(4),
            _ => None,
        }
    }
}

pub struct Nv3062 {
    regs: RegisterFile,
}

impl Nv3062 {
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::new(),
        }
    }
}

impl Default for Nv3062 {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Nv3062 {
    fn class_id(&self) -> ClassId {
        ClassId::Nv3062
    }

    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut EngineContext<'_>) {
        self.regs.set(method, value);
        log::trace!("Nv3062: reg[0x{:X}] = 0x{:X}", method, value);

        let surface = &mut *ctx.surface;
        match method {
            SET_CONTEXT_DMA_IMAGE_SOURCE | SET_CONTEXT_DMA_IMAGE_DESTIN => {
                let Some(location) = dma_location(value) else {
                    log::error!("Nv3062: invalid context DMA 0x{:08X}", value);
                    return;
                };
                if method == SET_CONTEXT_DMA_IMAGE_SOURCE {
                    surface.src_location = location;
                } else {
                    surface.dst_location = location;
                }
            }
            SET_COLOR_FORMAT => {
                surface.color_format = value;
                if surface.bytes_per_pixel().is_none() {
                    log::warn!("Nv3062: unsupported color format 0x{:X}", value);
                }
            }
            SET_PITCH => {
                surface.src_pitch = value & 0xFFFF;
                surface.dst_pitch = value >> 16;
            }
            SET_OFFSET_SOURCE => surface.src_offset = value,
            SET_OFFSET_DESTIN => surface.dst_offset = value,
            _ => {}
        }
    }
}
