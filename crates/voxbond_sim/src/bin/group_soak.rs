//! # Group Soak
//!
//! Seeded random link churn over a solid block, with an invariant audit
//! after every step.
//!
//! ```text
//! group_soak [--steps N] [--side N] [--seed N] [--churn N] [--config FILE]
//! ```
//!
//! Each step a random set of links breaks and a random set of face-adjacent
//! voxel pairs tries to (re)attach. Exits non-zero on a fatal group error or
//! an audit violation.

use std::collections::HashMap;
use std::process::ExitCode;
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use voxbond_core::{LatticeBuilder, LinkDirection, VoxelId};
use voxbond_sim::{LinkEvent, SimConfig, StepDriver, StepReport};

/// Command-line options.
struct SoakOptions {
    steps: u64,
    side: u32,
    seed: u64,
    /// Break and attach events per step.
    churn: usize,
    config: Option<String>,
}

impl Default for SoakOptions {
    fn default() -> Self {
        Self {
            steps: 200,
            side: 12,
            seed: 0x5EED,
            churn: 64,
            config: None,
        }
    }
}

fn parse_args() -> Result<SoakOptions, String> {
    let mut options = SoakOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let value = args.next().ok_or_else(|| format!("{flag} needs a value"))?;
        let bad = |_| format!("bad value for {flag}: {value}");
        match flag.as_str() {
            "--steps" => options.steps = value.parse().map_err(bad)?,
            "--side" => options.side = value.parse().map_err(bad)?,
            "--seed" => options.seed = value.parse().map_err(bad)?,
            "--churn" => options.churn = value.parse().map_err(bad)?,
            "--config" => options.config = Some(value.clone()),
            _ => return Err(format!("unknown flag {flag}")),
        }
    }
    if options.side == 0 {
        return Err("--side must be at least 1".into());
    }
    Ok(options)
}

fn main() -> ExitCode {
    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };
    let config = match options.config.as_deref().map(SimConfig::load) {
        Some(Ok(config)) => config,
        Some(Err(err)) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
        None => SimConfig::default(),
    };

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         VOXBOND GROUP SOAK                                       ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("Block:          {0}x{0}x{0} voxels", options.side);
    println!("Steps:          {}", options.steps);
    println!("Churn/step:     {} breaks + {} attaches", options.churn, options.churn);
    println!("Seed:           {:#x}", options.seed);
    println!("Worker threads: {}", config.worker_threads);
    println!();

    let builder = LatticeBuilder::block([options.side; 3], config.groups.clone());
    let positions: Vec<[i32; 3]> = (0..builder.voxel_count())
        .filter_map(|i| builder.position(VoxelId::new(i as u32)))
        .collect();
    let cells: HashMap<[i32; 3], VoxelId> = positions
        .iter()
        .enumerate()
        .map(|(i, &cell)| (cell, VoxelId::new(i as u32)))
        .collect();

    let lattice = match builder.build() {
        Ok(lattice) => lattice,
        Err(err) => {
            eprintln!("failed to build lattice: {err}");
            return ExitCode::FAILURE;
        }
    };
    let mut driver = StepDriver::new(lattice, config);
    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    let mut total = StepReport::default();
    let started = Instant::now();

    for step in 0..options.steps {
        for _ in 0..options.churn {
            let voxel = VoxelId::new(rng.gen_range(0..positions.len()) as u32);
            let direction = LinkDirection::ALL[rng.gen_range(0..6)];
            driver.submit(LinkEvent::Break { voxel, direction });
        }
        for _ in 0..options.churn {
            let host = rng.gen_range(0..positions.len());
            let [x, y, z] = positions[host];
            let [dx, dy, dz] = LinkDirection::ALL[rng.gen_range(0..6)].offset();
            let Some(&remote) = cells.get(&[x + dx, y + dy, z + dz]) else {
                continue;
            };
            // Direction from world positions, the way a physics side would
            let Some(direction) = LinkDirection::dominant([dx as f32, dy as f32, dz as f32]) else {
                continue;
            };
            driver.submit(LinkEvent::Attach {
                host: VoxelId::new(host as u32),
                remote,
                direction,
            });
        }

        match driver.step() {
            Ok(report) => total.absorb(&report),
            Err(err) => {
                eprintln!("step {step} failed: {err}");
                return ExitCode::FAILURE;
            }
        }

        let audit = driver.lattice().audit();
        if !audit.is_consistent() {
            eprintln!("step {step}: audit found {} violations", audit.violations.len());
            for violation in audit.violations.iter().take(10) {
                eprintln!("  {violation}");
            }
            return ExitCode::FAILURE;
        }
    }

    let lattice = driver.lattice();
    let live = lattice.live_groups().count();
    let peak = lattice
        .groups()
        .map(|g| g.rebuild_stats().peak_concurrent)
        .max()
        .unwrap_or(0);

    println!("┌─ RESULTS ───────────────────────────────────────────────────────┐");
    println!("│ Steps:              {}", total.steps);
    println!("│ Rebuilds:           {} ({} contended)", total.rebuilds, total.contended);
    println!("│ Breaks:             {}", total.breaks);
    println!("│ Attaches:           {} ({} merges)", total.attaches, total.merges);
    println!("│ Deferrals:          {}", total.deferrals);
    println!("│ Rejections:         {} ({} abandoned)", total.rejections, total.abandoned);
    println!("│ Splits:             {}", total.splits);
    println!("│ Reclaimed slots:    {}", total.reclaimed);
    println!("│ Live groups:        {live}");
    println!("│ Peak rebuilds/group {peak}");
    println!("│ Step time (avg):    {:?}", total.duration / options.steps.max(1) as u32);
    println!("│ Wall time:          {:?}", started.elapsed());
    println!("└──────────────────────────────────────────────────────────────────┘");

    if peak > 1 {
        eprintln!("two rebuilds of one group overlapped");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
