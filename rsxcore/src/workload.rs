// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Synthetic frames pushed through the command ring.
//!
//! Each frame issues a few draws with occlusion reports, a buffer transfer,
//! an inline image upload and a scaled blit. Guest CPU threads meanwhile read
//! the report sinks through the checked memory path, which is what makes the
//! ZCULL queue flush early.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rsxcore_common::GuestAddr;
use rsxcore_gpu::engines::nv3062::COLOR_FORMAT_A8R8G8B8;
use rsxcore_gpu::engines::nv3089::SOURCE_A8R8G8B8;
use rsxcore_gpu::engines::{SubChannel, CONTEXT_DMA_MEMORY_HOST_BUFFER, CONTEXT_DMA_REPORT_LOCATION_MAIN};
use rsxcore_gpu::zcull::report::{REPORT_SIZE, ZPASS_PIXEL_CNT};
use rsxcore_gpu::RsxContext;

// 3D methods.
const NV4097_WAIT_FOR_IDLE: u32 = 0x110;
const NV4097_SET_CONTEXT_DMA_REPORT: u32 = 0x1A8;
const NV4097_GET_REPORT: u32 = 0x1800;
const NV4097_SET_BEGIN_END: u32 = 0x1808;
const NV4097_DRAW_ARRAYS: u32 = 0x1814;
const NV4097_SET_ZCULL_EN: u32 = 0x1D78;
const NV4097_SET_ZPASS_PIXEL_COUNT_ENABLE: u32 = 0x1D7C;
const NV4097_SET_RENDER_ENABLE: u32 = 0x1D88;

// Buffer transfer.
const NV0039_SET_CONTEXT_DMA_BUFFER_IN: u32 = 0x184;
const NV0039_SET_CONTEXT_DMA_BUFFER_OUT: u32 = 0x188;
const NV0039_OFFSET_IN: u32 = 0x30C;
const NV0039_BUFFER_NOTIFY: u32 = 0x328;

// 2D surface.
const NV3062_SET_CONTEXT_DMA_IMAGE_DESTIN: u32 = 0x188;
const NV3062_SET_COLOR_FORMAT: u32 = 0x300;

// Image from CPU.
const NV308A_POINT: u32 = 0x304;
const NV308A_COLOR: u32 = 0x400;

// Scaled image.
const NV3089_SET_CONTEXT_DMA_IMAGE: u32 = 0x184;
const NV3089_SET_CONTEXT_SURFACE: u32 = 0x198;
const NV3089_SET_COLOR_FORMAT: u32 = 0x300;
const NV3089_IMAGE_IN_SIZE: u32 = 0x400;
const NV3089_CONTEXT_SURFACE2D: u32 = 0x3133_71C3;

const PRIMITIVE_TRIANGLES: u32 = 5;

// Main memory layout.
const REPORT_BASE: GuestAddr = 0x0001_0000;
const TRANSFER_SRC: GuestAddr = 0x0010_0000;
const TRANSFER_DST: GuestAddr = 0x0020_0000;
const TRANSFER_SIZE: u32 = 0x4000;
const IMAGE_SRC: GuestAddr = 0x0030_0000;
const SURFACE: GuestAddr = 0x0040_0000;
const SURFACE_PITCH: u32 = 256;
const IMAGE_SIZE: u32 = 32;

/// Draws issued per frame; each one is followed by a report.
const DRAWS_PER_FRAME: u32 = 4;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct WorkloadConfig {
    pub frames: u32,
    pub cpu_threads: u32,
}

/// Results of one run.
#[derive(Debug, Default)]
pub struct WorkloadReport {
    pub reports_read: u64,
    pub report_timeouts: u64,
    pub elapsed: Duration,
}

fn xy(x: u32, y: u32) -> u32 {
    (y << 16) | x
}

fn sc(subchannel: SubChannel) -> u32 {
    subchannel as u32
}

fn report_address(frame: u32, draw: u32) -> GuestAddr {
    REPORT_BASE + (frame * DRAWS_PER_FRAME + draw) * REPORT_SIZE
}

/// Fill the source buffers and clear the report sinks.
fn prepare_memory(ctx: &RsxContext, config: &WorkloadConfig) -> Result<()> {
    let memory = ctx.memory();

    let transfer: Vec<u8> = (0..TRANSFER_SIZE).map(|i| (i ^ (i >> 8)) as u8).collect();
    memory
        .super_write(TRANSFER_SRC, &transfer)
        .context("Failed to fill transfer source")?;

    let image: Vec<u8> = (0..IMAGE_SIZE * IMAGE_SIZE)
        .flat_map(|i| (0xFF00_0000 | i * 0x0001_0203).to_be_bytes())
        .collect();
    memory
        .super_write(IMAGE_SRC, &image)
        .context("Failed to fill blit source")?;

    let sinks = vec![0u8; (config.frames * DRAWS_PER_FRAME * REPORT_SIZE) as usize];
    memory
        .super_write(REPORT_BASE, &sinks)
        .context("Failed to clear report sinks")?;
    Ok(())
}

fn setup_state(ctx: &RsxContext) {
    let nv4097 = sc(SubChannel::Nv4097);
    ctx.submit(nv4097, NV4097_SET_CONTEXT_DMA_REPORT, CONTEXT_DMA_REPORT_LOCATION_MAIN);
    ctx.submit(nv4097, NV4097_SET_ZCULL_EN, 1);
    ctx.submit(nv4097, NV4097_SET_ZPASS_PIXEL_COUNT_ENABLE, 1);
    ctx.submit(nv4097, NV4097_SET_RENDER_ENABLE, 1);

    let nv0039 = sc(SubChannel::Nv0039);
    ctx.submit(nv0039, NV0039_SET_CONTEXT_DMA_BUFFER_IN, CONTEXT_DMA_MEMORY_HOST_BUFFER);
    ctx.submit(nv0039, NV0039_SET_CONTEXT_DMA_BUFFER_OUT, CONTEXT_DMA_MEMORY_HOST_BUFFER);

    // Surface: pitch register packs source in the low half, destination in the high half.
    let nv3062 = sc(SubChannel::Nv3062);
    ctx.submit(nv3062, NV3062_SET_CONTEXT_DMA_IMAGE_DESTIN, CONTEXT_DMA_MEMORY_HOST_BUFFER);
    ctx.submit_burst(
        nv3062,
        NV3062_SET_COLOR_FORMAT,
        &[COLOR_FORMAT_A8R8G8B8, (SURFACE_PITCH << 16) | SURFACE_PITCH, 0, SURFACE],
    );

    let nv3089 = sc(SubChannel::Nv3089);
    ctx.submit(nv3089, NV3089_SET_CONTEXT_DMA_IMAGE, CONTEXT_DMA_MEMORY_HOST_BUFFER);
    ctx.submit(nv3089, NV3089_SET_CONTEXT_SURFACE, NV3089_CONTEXT_SURFACE2D);
}

fn submit_frame(ctx: &RsxContext, frame: u32) {
    let nv4097 = sc(SubChannel::Nv4097);
    for draw in 0..DRAWS_PER_FRAME {
        ctx.submit(nv4097, NV4097_SET_BEGIN_END, PRIMITIVE_TRIANGLES);
        ctx.submit(nv4097, NV4097_DRAW_ARRAYS, (2 << 24) | (draw * 3));
        ctx.submit(nv4097, NV4097_SET_BEGIN_END, 0);
        ctx.submit(nv4097, NV4097_GET_REPORT, (ZPASS_PIXEL_CNT << 24) | report_address(frame, draw));
    }

    // Alternate between two destination buffers.
    let dst = TRANSFER_DST + (frame % 2) * TRANSFER_SIZE;
    ctx.submit_burst(
        sc(SubChannel::Nv0039),
        NV0039_OFFSET_IN,
        &[TRANSFER_SRC, dst, TRANSFER_SIZE, TRANSFER_SIZE, TRANSFER_SIZE, 1, 0],
    );
    ctx.submit(sc(SubChannel::Nv0039), NV0039_BUFFER_NOTIFY, 0);

    // Eight pixels uploaded inline below the blit area.
    let nv308a = sc(SubChannel::Nv308a);
    ctx.submit_burst(nv308a, NV308A_POINT, &[xy(0, IMAGE_SIZE + frame % 8), xy(8, 1), xy(8, 1)]);
    let pixels: Vec<u32> = (0..8).map(|i| 0xFF00_0000 | (frame << 8) | i).collect();
    ctx.submit_burst(nv308a, NV308A_COLOR, &pixels);

    // Unscaled 32x32 blit to the top-left of the surface. The second burst
    // ends on IMAGE_IN, which triggers the blit.
    let one = 1 << 20;
    let nv3089 = sc(SubChannel::Nv3089);
    ctx.submit_burst(
        nv3089,
        NV3089_SET_COLOR_FORMAT,
        // format, operation, clip point/size, out point/size, ds/dx, dt/dy
        &[
            SOURCE_A8R8G8B8,
            0,
            xy(0, 0),
            xy(IMAGE_SIZE, IMAGE_SIZE),
            xy(0, 0),
            xy(IMAGE_SIZE, IMAGE_SIZE),
            one,
            one,
        ],
    );
    ctx.submit_burst(
        nv3089,
        NV3089_IMAGE_IN_SIZE,
        &[xy(IMAGE_SIZE, IMAGE_SIZE), IMAGE_SIZE * 4, IMAGE_SRC, 0],
    );
}

/// Poll the sinks of every frame until each report lands.
fn read_reports(ctx: &RsxContext, frames: u32, produced: &AtomicU64, read: &AtomicU64, timeouts: &AtomicU64) {
    for frame in 0..frames {
        // Wait for the producer to queue the frame before reading its sinks.
        while produced.load(Ordering::Acquire) <= u64::from(frame) {
            thread::yield_now();
        }
        for draw in 0..DRAWS_PER_FRAME {
            let addr = report_address(frame, draw);
            let start = Instant::now();
            loop {
                match ctx.read_report(addr) {
                    Ok(report) if report.value != 0 => {
                        read.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Report read at 0x{:08X} failed: {}", addr, e);
                        timeouts.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
                if start.elapsed() > READ_TIMEOUT {
                    log::warn!("Report at 0x{:08X} did not land", addr);
                    timeouts.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                thread::sleep(Duration::from_micros(50));
            }
        }
    }
}

/// Run the workload on a context whose GPU loop is already running.
pub fn run(ctx: &Arc<RsxContext>, config: WorkloadConfig) -> Result<WorkloadReport> {
    prepare_memory(ctx, &config)?;

    let start = Instant::now();
    let produced = Arc::new(AtomicU64::new(0));
    let read = Arc::new(AtomicU64::new(0));
    let timeouts = Arc::new(AtomicU64::new(0));

    let readers = (0..config.cpu_threads)
        .map(|i| {
            let ctx = ctx.clone();
            let produced = produced.clone();
            let read = read.clone();
            let timeouts = timeouts.clone();
            let frames = config.frames;
            thread::Builder::new()
                .name(format!("Guest CPU {}", i))
                .spawn(move || read_reports(&ctx, frames, &produced, &read, &timeouts))
                .context("Failed to spawn guest CPU thread")
        })
        .collect::<Result<Vec<_>>>()?;

    setup_state(ctx);
    for frame in 0..config.frames {
        submit_frame(ctx, frame);
        produced.store(u64::from(frame) + 1, Ordering::Release);
        log::debug!("Frame {} queued ({} commands pending)", frame, ctx.pending_commands());
    }
    ctx.submit(sc(SubChannel::Nv4097), NV4097_WAIT_FOR_IDLE, 0);
    ctx.wait_idle();

    for reader in readers {
        if reader.join().is_err() {
            log::error!("Guest CPU thread panicked");
        }
    }

    Ok(WorkloadReport {
        reports_read: read.load(Ordering::Relaxed),
        report_timeouts: timeouts.load(Ordering::Relaxed),
        elapsed: start.elapsed(),
    })
}
