// SPDX-FileCopyrightText: 2025 nvrm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use nvrm_common::{GpuArch, MemoryLocation, SubChannel};
use nvrm_gpu::{open_first, Device, Engines, ExecContext, GpuBuffer, PushEntry, SyncPoint, TimelineSync};
use nvrm_sim::{SimConfig, SoftRm};

/// nvrm - GPU command submission over the NVIDIA resource manager
#[derive(Parser, Debug)]
#[command(name = "nvrm", version, about = "Drive GPU command submission against the simulated resource manager")]
struct Args {
    /// Path to config file (default: auto-detect nvrm.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// GPU generation to simulate (pascal, volta, turing, ampere, ada, hopper)
    #[arg(long)]
    arch: Option<String>,

    /// Number of submissions to flush
    #[arg(short = 'n', long, default_value_t = 16)]
    submissions: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    let mut settings = config::load_config(args.config.as_ref());
    if let Some(name) = &args.arch {
        settings.sim_arch =
            GpuArch::from_name(name).with_context(|| format!("Unknown architecture: {name}"))?;
    }
    info!(
        "Simulating {:?}, {} ring entries",
        settings.sim_arch, settings.ring_entries
    );

    let sim = SoftRm::new(SimConfig::from_settings(&settings));
    let device = open_first(sim.clone(), &settings).context("Failed to open a GPU")?;

    run(&device, args.submissions)?;
    drop(device);

    let stats = sim.stats();
    info!(
        "Submitted {} ring entries with {} doorbells, {} semaphore releases",
        stats.gp_entries, stats.doorbells, stats.semaphore_releases
    );
    info!(
        "{} engine methods, {} waiters signalled",
        stats.engine_methods, stats.waiters_signalled
    );
    if stats.live_objects != 0 || stats.teardown_violations != 0 || stats.double_frees != 0 {
        bail!(
            "Unclean teardown: {} live objects, {} violations, {} double frees",
            stats.live_objects,
            stats.teardown_violations,
            stats.double_frees
        );
    }
    info!("Teardown clean");
    Ok(())
}

/// Flush `submissions` batches, each running a caller-built segment and
/// advancing a timeline that the CPU waits on.
fn run(device: &Arc<Device>, submissions: u32) -> Result<()> {
    let mut ctx = ExecContext::create(device, Engines::COPY | Engines::COMPUTE)
        .context("Failed to create an execution context")?;
    let timeline = TimelineSync::new(device, 0).context("Failed to create a timeline")?;

    ctx.set_object(SubChannel::Copy)?;
    ctx.set_object(SubChannel::Compute)?;
    ctx.flush().context("Initial flush failed")?;

    // A caller-owned segment: a single wait-for-idle.
    let mut segment = ctx.stream();
    segment.wait_for_idle()?;
    let words = segment.words();
    let commands = GpuBuffer::alloc(device, (words.len() * 4) as u64, MemoryLocation::System)?;
    commands.cpu().write_words(0, words);
    let entry = PushEntry {
        address: commands.gpu_va(),
        length: (words.len() * 4) as u64,
        no_prefetch: false,
    };

    for n in 1..=submissions as u64 {
        ctx.exec(&[entry])?;
        let seq = ctx.signal(&[SyncPoint {
            timeline: &timeline,
            value: n,
        }])?;
        if !timeline.wait(n, device.settings().wait_timeout())? {
            bail!("Timeline did not reach {n}");
        }
        log::debug!("Submission {n} completed as sequence {seq}");
    }
    info!(
        "{} submissions complete, ring put {}, sequence {}",
        submissions,
        ctx.ring_put(),
        ctx.sequence()
    );
    Ok(())
}
