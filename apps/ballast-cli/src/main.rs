use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ballast_common::{ItemStack, ManualClock, NoTiming, ObjectKind, RegionId};
use ballast_runtime::{Controller, ControllerConfig};
use ballast_sim::SimWorld;
use ballast_telemetry::{lerp_int, multiplier_from_scale, scale_from_mspt};
use clap::{Parser, Subcommand};
use glam::DVec3;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ballast-cli", about = "Operator harness for the ballast load-shedding controller")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Drive the reference host under a load ramp
    Simulate {
        /// Number of host cycles to run
        #[arg(short, long, default_value = "400")]
        cycles: u64,
        /// Simulated time per cycle in milliseconds
        #[arg(long, default_value = "50")]
        cycle_ms: u64,
        /// Cycle cost at the start of the ramp
        #[arg(long, default_value = "20")]
        start_mspt: f64,
        /// Cycle cost at the end of the ramp
        #[arg(long, default_value = "80")]
        end_mspt: f64,
        /// Mobs packed into one cell
        #[arg(long, default_value = "30")]
        mobs: usize,
        /// Loose single items scattered near the origin
        #[arg(long, default_value = "40")]
        items: usize,
        /// YAML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print final statistics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the load scale and derived operating points over a cost range
    Curve {
        #[arg(long, default_value = "0")]
        from: f64,
        #[arg(long, default_value = "100")]
        to: f64,
        #[arg(long, default_value = "10")]
        step: f64,
    },
    /// Print the effective configuration as YAML
    Config {
        /// Validate and print this file instead of the defaults
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("ballast-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", ballast_common::crate_info());
            println!("telemetry: {}", ballast_telemetry::crate_info());
            println!("shed: {}", ballast_shed::crate_info());
            println!("safety: {}", ballast_safety::crate_info());
            println!("runtime: {}", ballast_runtime::crate_info());
        }
        Commands::Simulate {
            cycles,
            cycle_ms,
            start_mspt,
            end_mspt,
            mobs,
            items,
            config,
            json,
        } => {
            let config = match config {
                Some(path) => ControllerConfig::load(&path)?,
                None => ControllerConfig::default(),
            };
            simulate(config, cycles, cycle_ms, start_mspt, end_mspt, mobs, items, json)?;
        }
        Commands::Curve { from, to, step } => {
            anyhow::ensure!(step > 0.0, "step must be positive");
            let config = ControllerConfig::default();
            println!("{:>8} {:>8} {:>10} {:>8} {:>6}", "mspt", "scale", "threshold", "hopper", "view");
            let mut mspt = from;
            while mspt <= to {
                let scale = scale_from_mspt(mspt);
                let threshold = lerp_int(config.device.min_threshold, config.device.max_threshold, scale);
                let multiplier = multiplier_from_scale(
                    scale,
                    config.throughput.min_multiplier,
                    config.throughput.max_multiplier,
                );
                let hopper = (config.throughput.base_limit as f64 * multiplier).round().max(1.0);
                let view = lerp_int(config.horizon.min_view as i32, config.horizon.max_view as i32, scale);
                println!("{mspt:>8.1} {scale:>8.3} {threshold:>10} {hopper:>8} {view:>6}");
                mspt += step;
            }
        }
        Commands::Config { path } => {
            let config = match path {
                Some(path) => ControllerConfig::load(&path)?,
                None => ControllerConfig::default(),
            };
            print!("{}", config.to_yaml_string()?);
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn simulate(
    config: ControllerConfig,
    cycles: u64,
    cycle_ms: u64,
    start_mspt: f64,
    end_mspt: f64,
    mobs: usize,
    items: usize,
    json: bool,
) -> anyhow::Result<()> {
    println!("Simulating {cycles} cycles of {cycle_ms}ms, cost {start_mspt} -> {end_mspt} ms");

    let clock = Arc::new(ManualClock::new(0));
    let controller = Controller::new(config, clock.clone(), Arc::new(NoTiming))?;

    let region = RegionId::default();
    let mut world = SimWorld::new();
    world.add_player("operator", region.clone(), DVec3::new(0.0, 64.0, 0.0));
    for i in 0..mobs {
        let offset = (i % 4) as f64 * 0.2;
        world.spawn(ObjectKind::Mob, region.clone(), DVec3::new(200.0 + offset, 64.0, 200.0 + offset));
    }
    for i in 0..items {
        let position = DVec3::new(100.0 + (i % 5) as f64 * 0.5, 64.0, 100.0 + (i / 5) as f64 * 0.5);
        world.spawn_item(region.clone(), position, ItemStack::new("cobblestone", 1, 64));
    }

    controller.start()?;
    tracing::info!(mobs, items, "reference host populated");
    for cycle in 0..cycles {
        let progress = if cycles > 1 {
            cycle as f64 / (cycles - 1) as f64
        } else {
            1.0
        };
        let cost = start_mspt + (end_mspt - start_mspt) * progress;
        controller
            .telemetry()
            .record_active(Duration::from_secs_f64(cost.max(0.0) / 1000.0));
        clock.advance(cycle_ms);
        world.step();
        controller.scheduler().poll_async();
        controller.on_cycle(&mut world);
        if world.is_shut_down() {
            println!("Host shut down by the safety controller at cycle {cycle}");
            break;
        }
        // Let background compute catch up with simulated time.
        std::thread::sleep(Duration::from_millis(1));
    }

    let stats = controller.statistics();
    let scale = controller.scale();
    let phase = controller.safety_phase();
    let horizons = controller.horizons();
    let report = controller.stop(&mut world);

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Scale: {scale:.3}  safety: {phase:?}  horizons: {horizons:?}");
        for (key, value) in &stats {
            println!("  {key:<22} {value}");
        }
    }
    println!(
        "Host: objects={}, mobs={}, items={}, broadcasts={}",
        world.object_count(),
        world.count_kind(ObjectKind::Mob),
        world.count_kind(ObjectKind::Item),
        world.broadcasts().len()
    );
    println!("Stop: restored={}, failed={}", report.applied, report.failed);
    Ok(())
}
