// SPDX-FileCopyrightText: 2025 rsxcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;
mod workload;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use rsxcore_gpu::backend::null_backend::NullBackend;
use rsxcore_gpu::RsxContext;

use workload::WorkloadConfig;

/// rsxcore - RSX command processing core
#[derive(Parser, Debug)]
#[command(name = "rsxcore", version, about = "Drive a synthetic workload through the RSX core")]
struct Args {
    /// Path to config file (default: auto-detect rsxcore.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Number of frames to submit
    #[arg(short, long, default_value_t = 64, value_parser = clap::value_parser!(u32).range(1..=4096))]
    frames: u32,

    /// Guest CPU threads reading report sinks
    #[arg(long, default_value_t = 2)]
    cpu_threads: u32,

    /// Run DMA copies inline on the GPU thread
    #[arg(long)]
    single_threaded: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("rsxcore - RSX command processing core");
    info!("=====================================");

    let mut settings = config::load_config(args.config.as_deref());
    if args.single_threaded {
        settings.multithreaded_rsx = false;
    }
    info!(
        "Multithreaded RSX: {}, strict resource access: {}",
        settings.multithreaded_rsx, settings.rsx_accurate_res_access
    );

    let backend = NullBackend::new();
    let handle = backend.handle();
    let ctx = RsxContext::new(settings, Box::new(backend), Arc::new(handle.clone()))
        .context("Failed to create RSX context")?;
    ctx.spawn().context("Failed to start GPU thread")?;

    let result = workload::run(
        &ctx,
        WorkloadConfig {
            frames: args.frames,
            cpu_threads: args.cpu_threads,
        },
    );
    // Offload counters saturate once the worker is joined.
    let stats = ctx.stats();
    ctx.shutdown();
    let report = result?;
    let pending_reports = ctx.stats().pending_reports;

    info!("Frames:            {}", args.frames);
    info!("Elapsed:           {:.2?}", report.elapsed);
    info!("Draws:             {}", handle.draw_count());
    info!("Method writes:     {}", stats.method_writes);
    info!("Host submits:      {}", stats.host_submits);
    info!("DMA jobs:          {} queued, {} done", stats.dma_enqueued, stats.dma_processed);
    info!("Flush requests:    {} ({} early)", stats.flush_requests, stats.early_flushes);
    info!("Reports read:      {}", report.reports_read);

    if report.report_timeouts > 0 {
        anyhow::bail!("{} report reads timed out", report.report_timeouts);
    }
    if pending_reports > 0 {
        anyhow::bail!("{} reports still pending after shutdown", pending_reports);
    }
    Ok(())
}
