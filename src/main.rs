use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mover_core::events::{AccessMode, StructureEvent, ToggleEndEvent};
use mover_core::geometry::{BlockPos, Cuboid, Vec3};
use mover_core::ids::StructureId;
use mover_core::structure::{Structure, StructureState};
use mover_engine::sim::{SimBlockManagerFactory, SlideStrategy, SpinStrategy};
use mover_engine::{AnimationConfig, AnimationEngine, AnimationRequest, ToggleOutcome};
use mover_settings::MoverSettings;
use mover_telemetry::{init_telemetry, TelemetryConfig};
use tokio::sync::broadcast;

/// Drive simulated block structures through the animation engine.
#[derive(Parser)]
#[command(name = "mover", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Slide a number of simulated structures open and wait for them to finish.
    Run {
        #[arg(long, default_value_t = 3)]
        count: u64,
        /// Animate all runs as shared previews of a single structure.
        #[arg(long)]
        preview: bool,
        /// Skip the animation and commit immediately.
        #[arg(long)]
        skip: bool,
        #[arg(long)]
        duration_ticks: Option<u32>,
    },
    /// Spin one structure until the given number of seconds has passed.
    Spin {
        #[arg(long, default_value_t = 2)]
        seconds: u64,
    },
    /// Print the effective settings as JSON.
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = mover_settings::load_settings().context("failed to load settings")?;

    if let Command::Settings = cli.command {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    let _telemetry = init_telemetry(TelemetryConfig::from_settings(&settings.logging)?)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting mover");

    let engine = build_engine(&settings)?;
    let result = match cli.command {
        Command::Run {
            count,
            preview,
            skip,
            duration_ticks,
        } => run(&engine, count, preview, skip, duration_ticks).await,
        Command::Spin { seconds } => spin(&engine, seconds).await,
        Command::Settings => Ok(()),
    };

    engine.shutdown();
    engine.control().shutdown();
    result
}

fn build_engine(settings: &MoverSettings) -> Result<AnimationEngine> {
    let config = AnimationConfig::from(&settings.animation);
    let engine = AnimationEngine::builder(config, Arc::new(SimBlockManagerFactory::new())).build()?;
    Ok(engine)
}

fn door(id: u64) -> Arc<Structure> {
    let x = i32::try_from(id).unwrap_or(i32::MAX).saturating_mul(4);
    Arc::new(Structure::new(
        StructureId(id),
        StructureState {
            name: format!("door-{id}"),
            kind: "sliding_door".into(),
            is_open: false,
            cuboid: Cuboid::new(BlockPos::new(x, 64, 0), BlockPos::new(x + 1, 66, 0)),
            rotation_point: BlockPos::new(x, 64, 0),
            power_block: Some(BlockPos::new(x, 63, 0)),
        },
    ))
}

async fn run(
    engine: &AnimationEngine,
    count: u64,
    preview: bool,
    skip: bool,
    duration_ticks: Option<u32>,
) -> Result<()> {
    let mut events = engine.subscribe();
    let shared = door(0);
    let mut structures = Vec::new();
    let mut expected = 0usize;

    for i in 0..count {
        let structure = if preview { Arc::clone(&shared) } else { door(i) };
        let mut builder = AnimationRequest::builder(Arc::clone(&structure), Arc::new(SlideStrategy::new(0, 3, 0)))
            .skip_animation(skip)
            .mode(if preview { AccessMode::Shared } else { AccessMode::Exclusive });
        if let Some(ticks) = duration_ticks {
            builder = builder.duration_ticks(ticks);
        }

        match engine.toggle(builder.build()?).await? {
            ToggleOutcome::Busy => {
                tracing::warn!(structure_id = %structure.id(), "structure busy, not animated");
                continue;
            }
            outcome => tracing::info!(structure_id = %structure.id(), ?outcome, "toggled"),
        }
        expected += 1;
        if !preview {
            structures.push(structure);
        }
    }
    if preview {
        structures.push(shared);
    }

    let longest = duration_ticks.unwrap_or(engine.config().default_duration_ticks);
    let finished = collect_ends(&mut events, expected, longest, engine.config()).await?;
    for end in &finished {
        println!("{}", serde_json::to_string(end)?);
    }
    for structure in structures {
        let snapshot = structure.snapshot()?;
        tracing::info!(
            structure_id = %snapshot.id,
            is_open = snapshot.is_open,
            min = ?snapshot.cuboid.min(),
            max = ?snapshot.cuboid.max(),
            "final structure state"
        );
    }
    Ok(())
}

async fn spin(engine: &AnimationEngine, seconds: u64) -> Result<()> {
    let mut events = engine.subscribe();
    let structure = door(1);
    let axis = Vec3::from(structure.snapshot()?.rotation_point);
    let request = AnimationRequest::builder(Arc::clone(&structure), Arc::new(SpinStrategy::new(axis, 40))).build()?;

    let ToggleOutcome::Started(run) = engine.toggle(request).await? else {
        bail!("spin did not start");
    };
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    if !engine.stop(structure.id()) {
        bail!("spin was no longer running");
    }

    let finished = collect_ends(&mut events, 1, 1, engine.config()).await?;
    println!("{}", serde_json::to_string_pretty(&run.status())?);
    for end in &finished {
        println!("{}", serde_json::to_string(end)?);
    }
    Ok(())
}

async fn collect_ends(
    events: &mut broadcast::Receiver<StructureEvent>,
    expected: usize,
    duration_ticks: u32,
    config: &AnimationConfig,
) -> Result<Vec<ToggleEndEvent>> {
    let ticks = duration_ticks.saturating_add(config.finish_buffer()).saturating_mul(2);
    let budget = config.tick_period.saturating_mul(ticks) + Duration::from_secs(5);
    let mut ends = Vec::with_capacity(expected);
    tokio::time::timeout(budget, async {
        while ends.len() < expected {
            match events.recv().await {
                Ok(StructureEvent::ToggleEnd(end)) => ends.push(end),
                Ok(StructureEvent::ToggleStart(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .context("timed out waiting for animations to finish")?;
    Ok(ends)
}
