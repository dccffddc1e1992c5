// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Scaled image blit (NV class 3089).
//!
//! Samples a source image with nearest filtering and writes the clipped
//! output rectangle into the 2D surface programmed through NV3062.

use rsxcore_common::{GuestAddr, MemoryLocation};

use super::nv3062::Surface2d;
use super::{dma_location, resolve_address, ClassId, Engine, EngineContext, RegisterFile};
use crate::reservation_lock::ExclusiveReservation;
use crate::zcull::report::ReadBarrierFlags;

// ── Register constants (byte offsets) ──────────────────────────────────────

const SET_CONTEXT_DMA_IMAGE: u32 = 0x184;
const SET_CONTEXT_SURFACE: u32 = 0x198;
const SET_COLOR_CONVERSION: u32 = 0x2FC;
const SET_COLOR_FORMAT: u32 = 0x300;
const SET_OPERATION: u32 = 0x304;
const CLIP_POINT: u32 = 0x308;
const CLIP_SIZE: u32 = 0x30C;
const IMAGE_OUT_POINT: u32 = 0x310;
const IMAGE_OUT_SIZE: u32 = 0x314;
const DS_DX: u32 = 0x318;
const DT_DY: u32 = 0x31C;
const IMAGE_IN_SIZE: u32 = 0x400;
const IMAGE_IN_FORMAT: u32 = 0x404;
const IMAGE_IN_OFFSET: u32 = 0x408;
const IMAGE_IN: u32 = 0x40C;

// Context surface object handles.
const CONTEXT_SURFACE2D: u32 = 0x3133_71C3;
const CONTEXT_SWIZZLE2D: u32 = 0x3133_7A73;

// Source color formats.
pub const SOURCE_A1R5G5B5: u32 = 1;
pub const SOURCE_X1R5G5B5: u32 = 2;
pub const SOURCE_A8R8G8B8: u32 = 3;
pub const SOURCE_X8R8G8B8: u32 = 4;
pub const SOURCE_R5G6B5: u32 = 7;
pub const SOURCE_A8B8G8R8: u32 = 0xC;
pub const SOURCE_X8B8G8R8: u32 = 0xD;

/// Scale factors are 12.20 fixed point.
const SCALE_SHIFT: u32 = 20;

fn lo16(v: u32) -> u32 {
    v & 0xFFFF
}

fn hi16(v: u32) -> u32 {
    v >> 16
}

fn source_bytes_per_pixel(format: u32) -> Option<u32> {
    match format {
        SOURCE_A1R5G5B5 | SOURCE_X1R5G5B5 | SOURCE_R5G6B5 => Some(2),
        SOURCE_A8R8G8B8 | SOURCE_X8R8G8B8 | SOURCE_A8B8G8R8 | SOURCE_X8B8G8R8 => Some(4),
        _ => None,
    }
}

fn expand5(v: u32) -> u32 {
    (v << 3) | (v >> 2)
}

fn expand6(v: u32) -> u32 {
    (v << 2) | (v >> 4)
}

/// Convert a source pixel to A8R8G8B8.
fn to_argb8888(format: u32, pixel: u32) -> u32 {
    match format {
        SOURCE_R5G6B5 => {
            let r = expand5((pixel >> 11) & 0x1F);
            let g = expand6((pixel >> 5) & 0x3F);
            let b = expand5(pixel & 0x1F);
            0xFF00_0000 | (r << 16) | (g << 8) | b
        }
        SOURCE_A1R5G5B5 | SOURCE_X1R5G5B5 => {
            let a = if format == SOURCE_X1R5G5B5 || pixel & 0x8000 != 0 { 0xFF } else { 0 };
            let r = expand5((pixel >> 10) & 0x1F);
            let g = expand5((pixel >> 5) & 0x1F);
            let b = expand5(pixel & 0x1F);
            (a << 24) | (r << 16) | (g << 8) | b
        }
        SOURCE_X8R8G8B8 => pixel | 0xFF00_0000,
        SOURCE_A8B8G8R8 | SOURCE_X8B8G8R8 => {
            let swapped = (pixel & 0xFF00_FF00) | ((pixel >> 16) & 0xFF) | ((pixel & 0xFF) << 16);
            if format == SOURCE_X8B8G8R8 {
                swapped | 0xFF00_0000
            } else {
                swapped
            }
        }
        _ => pixel,
    }
}

fn from_argb8888(bytes_per_pixel: u32, argb: u32) -> u32 {
    if bytes_per_pixel == 2 {
        let r = (argb >> 19) & 0x1F;
        let g = (argb >> 10) & 0x3F;
        let b = (argb >> 3) & 0x1F;
        (r << 11) | (g << 5) | b
    } else {
        argb
    }
}

fn read_pixel(buf: &[u8], offset: usize, bpp: u32) -> u32 {
    match bpp {
        2 => u16::from_be_bytes([buf[offset], buf[offset + 1]]) as u32,
        _ => u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]),
    }
}

fn push_pixel(out: &mut Vec<u8>, value: u32, bpp: u32) {
    match bpp {
        2 => out.extend_from_slice(&(value as u16).to_be_bytes()),
        _ => out.extend_from_slice(&value.to_be_bytes()),
    }
}

/// Output rectangle after clipping, in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl Region {
    fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    fn height(&self) -> u32 {
        self.y1 - self.y0
    }
}

#[derive(Debug, Clone, Copy)]
struct SourceImage {
    address: GuestAddr,
    format: u32,
    bpp: u32,
    width: u32,
    height: u32,
    pitch: u32,
    u: u32,
    v: u32,
}

impl SourceImage {
    /// Bytes spanned in guest memory, `None` past the 32-bit address space.
    fn length(&self) -> Option<u32> {
        let span = self.pitch as u64 * (self.height as u64 - 1) + self.width as u64 * self.bpp as u64;
        u32::try_from(span).ok()
    }
}

pub struct Nv3089 {
    regs: RegisterFile,
    src_location: MemoryLocation,
    swizzled: bool,
    blits: u64,
}

impl Nv3089 {
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::new(),
            src_location: MemoryLocation::Local,
            swizzled: false,
            blits: 0,
        }
    }

    pub fn blit_count(&self) -> u64 {
        self.blits
    }

    fn clip_region(&self) -> Option<Region> {
        let clip = (self.regs.get(CLIP_POINT), self.regs.get(CLIP_SIZE));
        let out = (self.regs.get(IMAGE_OUT_POINT), self.regs.get(IMAGE_OUT_SIZE));

        let x0 = lo16(clip.0).max(lo16(out.0));
        let y0 = hi16(clip.0).max(hi16(out.0));
        let x1 = (lo16(clip.0) + lo16(clip.1)).min(lo16(out.0) + lo16(out.1));
        let y1 = (hi16(clip.0) + hi16(clip.1)).min(hi16(out.0) + hi16(out.1));
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(Region { x0, y0, x1, y1 })
    }

    fn source_image(&self) -> Option<SourceImage> {
        let format = self.regs.get(SET_COLOR_FORMAT);
        let Some(bpp) = source_bytes_per_pixel(format) else {
            log::error!("Nv3089: unsupported source format 0x{:X}", format);
            return None;
        };
        let size = self.regs.get(IMAGE_IN_SIZE);
        let (width, height) = (lo16(size), hi16(size));
        if width == 0 || height == 0 {
            log::warn!("Nv3089: empty source image {}x{}", width, height);
            return None;
        }
        let mut pitch = lo16(self.regs.get(IMAGE_IN_FORMAT));
        if pitch == 0 {
            pitch = width * bpp;
        }
        let point = self.regs.get(IMAGE_IN);
        Some(SourceImage {
            address: resolve_address(self.src_location, self.regs.get(IMAGE_IN_OFFSET)),
            format,
            bpp,
            width,
            height,
            pitch,
            u: lo16(point) >> 4,
            v: hi16(point) >> 4,
        })
    }

    fn blit(&mut self, ctx: &mut EngineContext<'_>) {
        if self.swizzled {
            log::error!("Nv3089: swizzled destination unsupported, blit skipped");
            return;
        }
        let Some(source) = self.source_image() else {
            return;
        };
        let surface: Surface2d = *ctx.surface;
        let Some(dst_bpp) = surface.bytes_per_pixel() else {
            log::error!("Nv3089: unsupported destination format 0x{:X}", surface.color_format);
            return;
        };
        let Some(region) = self.clip_region() else {
            log::warn!("Nv3089: blit clipped to nothing");
            return;
        };
        let ds_dx = self.regs.get(DS_DX);
        let dt_dy = self.regs.get(DT_DY);
        if ds_dx == 0 || dt_dy == 0 {
            log::warn!("Nv3089: zero scale factor (ds_dx=0x{:X}, dt_dy=0x{:X})", ds_dx, dt_dy);
            return;
        }
        let dst_pitch = match surface.dst_pitch {
            0 if region.height() > 1 => {
                log::error!("Nv3089: zero destination pitch for a multi-row blit");
                return;
            }
            0 => region.x1 * dst_bpp,
            pitch => pitch,
        };

        let row_bytes = region.width() * dst_bpp;
        let dst_offset = region.y0 as u64 * dst_pitch as u64 + region.x0 as u64 * dst_bpp as u64;
        let dst_span = dst_pitch as u64 * (region.height() as u64 - 1) + row_bytes as u64;
        let dst_first = u32::try_from(surface.dst_address() as u64 + dst_offset).ok();
        let (Some(dst_first), Ok(dst_length), Some(src_length)) =
            (dst_first, u32::try_from(dst_span), source.length())
        else {
            log::error!(
                "Nv3089: blit size overflows: src {}x{} pitch 0x{:X}, dst {:?} pitch 0x{:X}",
                source.width,
                source.height,
                source.pitch,
                region,
                dst_pitch
            );
            return;
        };

        if !ctx.memory.is_mapped(source.address, src_length) || !ctx.memory.is_mapped(dst_first, dst_length) {
            log::error!(
                "Nv3089: blit out of range src=0x{:08X}+0x{:X} dst=0x{:08X}+0x{:X}",
                source.address,
                src_length,
                dst_first,
                dst_length
            );
            return;
        }

        log::trace!(
            "Nv3089: {}x{} fmt {} -> {:?} bpp {}",
            source.width,
            source.height,
            source.format,
            region,
            dst_bpp
        );

        // Pending reports in the source must land before it is sampled.
        ctx.zcull
            .read_barrier(ctx.thread, source.address, src_length, ReadBarrierFlags::empty());
        // Queued writes to the source must land before it is staged. Never
        // sync while holding the reservation.
        if !ctx.dma.sync() {
            log::warn!("Nv3089: blit dropped, offload queue stalled");
            return;
        }

        let _lock = ExclusiveReservation::new_dual(ctx.iomap, dst_first, dst_length, source.address, src_length);
        let mut staging = vec![0u8; src_length as usize];
        if let Err(e) = ctx.memory.super_read(source.address, &mut staging) {
            log::error!("Nv3089: failed to read source image: {}", e);
            return;
        }

        let out_point = self.regs.get(IMAGE_OUT_POINT);
        let (out_x, out_y) = (lo16(out_point), hi16(out_point));
        for y in region.y0..region.y1 {
            let dy = (y - out_y) as u64;
            let sy = (source.v as u64 + ((dy * dt_dy as u64) >> SCALE_SHIFT)).min(source.height as u64 - 1);
            let mut row = Vec::with_capacity(row_bytes as usize);
            for x in region.x0..region.x1 {
                let dx = (x - out_x) as u64;
                let sx = (source.u as u64 + ((dx * ds_dx as u64) >> SCALE_SHIFT)).min(source.width as u64 - 1);
                let offset = sy as usize * source.pitch as usize + sx as usize * source.bpp as usize;
                let argb = to_argb8888(source.format, read_pixel(&staging, offset, source.bpp));
                push_pixel(&mut row, from_argb8888(dst_bpp, argb), dst_bpp);
            }
            let row_address = dst_first.wrapping_add((y - region.y0) * dst_pitch);
            if let Err(e) = ctx.dma.write_guest(row_address, row) {
                log::error!("Nv3089: row write to 0x{:08X} failed: {}", row_address, e);
                return;
            }
        }
        self.blits += 1;
    }
}

impl Default for Nv3089 {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Nv3089 {
    fn class_id(&self) -> ClassId {
        ClassId::Nv3089
    }

    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut EngineContext<'_>) {
        self.regs.set(method, value);
        log::trace!("Nv3089: reg[0x{:X}] = 0x{:X}", method, value);

        match method {
            SET_CONTEXT_DMA_IMAGE => match dma_location(value) {
                Some(location) => self.src_location = location,
                None => log::error!("Nv3089: invalid context DMA 0x{:08X}", value),
            },
            SET_CONTEXT_SURFACE => match value {
                CONTEXT_SURFACE2D => self.swizzled = false,
                CONTEXT_SWIZZLE2D => {
                    log::warn!("Nv3089: swizzled surface target unsupported");
                    self.swizzled = true;
                }
                _ => log::error!("Nv3089: unknown context surface 0x{:08X}", value),
            },
            SET_COLOR_CONVERSION | SET_OPERATION => {
                log::debug!("Nv3089: reg 0x{:X} = {} (ignored)", method, value)
            }
            IMAGE_IN => self.blit(ctx),
            _ => {}
        }
    }
}
