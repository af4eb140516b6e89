//! DAQ Sync command line
//!
//! One binary for both sides of a run plus a couple of diagnostics.
//!
//! # Usage
//!
//! ```bash
//! # Imaging process with the simulated camera
//! daq-sync serve
//!
//! # Print everything the imaging process broadcasts
//! daq-sync view
//!
//! # Act as the hardware sequencer for three runs of five shots
//! daq-sync simulate --runs 3 --shots 5
//!
//! # Query or reset the imaging process
//! daq-sync status
//! daq-sync reset
//! ```
//!
//! Every subcommand reads `config/daq_sync.toml` unless `--config` points
//! elsewhere; `DAQ_SYNC_` environment variables override both.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use daq_sync::config::SyncConfig;
use daq_sync::hardware::mock::MockCameraConnector;
use daq_sync::logging;
use daq_sync::mailbox::FsRecordStore;
use daq_sync::network::command::CommandClient;
use daq_sync::network::protocol::{Event, VarValue, Vars};
use daq_sync::network::viewer::ViewerClient;
use daq_sync::sequencer::{RunPlan, RunProducer};
use daq_sync::service::ImagingService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "daq-sync")]
#[command(about = "Run synchronisation between a hardware sequencer and an imaging process", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = daq_sync::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the imaging process against the simulated camera
    Serve {
        /// Milliseconds between simulated frames
        #[arg(long, default_value = "20")]
        frame_interval_ms: u64,
    },

    /// Connect to the broadcast channel and print events
    View,

    /// Act as the hardware sequencer for a number of runs
    Simulate {
        /// Number of runs
        #[arg(long, default_value = "1")]
        runs: u64,

        /// Shots per run
        #[arg(long, default_value = "5")]
        shots: usize,

        /// Frames per shot
        #[arg(long, default_value = "1")]
        subframes: usize,

        /// First run id (defaults to the current time in milliseconds)
        #[arg(long)]
        first_run: Option<u64>,
    },

    /// Print the imaging process status
    Status,

    /// Abort the current run and return to idle
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SyncConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Serve { frame_interval_ms } => serve(config, frame_interval_ms).await,
        Commands::View => view(config).await,
        Commands::Simulate {
            runs,
            shots,
            subframes,
            first_run,
        } => simulate(config, runs, shots, subframes, first_run).await,
        Commands::Status => {
            let mut client = CommandClient::connect(config.network.command_addr()?, REQUEST_TIMEOUT)
                .await?;
            let report = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Reset => {
            let mut client = CommandClient::connect(config.network.command_addr()?, REQUEST_TIMEOUT)
                .await?;
            client.reset().await?;
            println!("Imaging process reset");
            Ok(())
        }
    }
}

async fn serve(config: SyncConfig, frame_interval_ms: u64) -> Result<()> {
    let store = FsRecordStore::open(config.mailbox.root.clone())
        .await?
        .with_stale_guard_after(config.mailbox.stale_guard_after);
    let connector = MockCameraConnector::new(Duration::from_millis(frame_interval_ms));
    let service = ImagingService::new(config, Arc::new(store), Arc::new(connector));
    let handle = service.start().await?;

    println!("Command channel: {}", handle.command_addr());
    println!("Broadcast channel: {}", handle.viewer_addr());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}

async fn view(config: SyncConfig) -> Result<()> {
    let viewer = ViewerClient::new(config.network.viewer_addr()?, config.viewer.reconnect_interval)
        .on_event(print_event)
        .on_connection_status(|connected| {
            if connected {
                println!("-- connected");
            } else {
                println!("-- disconnected, retrying");
            }
        })
        .spawn();

    tokio::signal::ctrl_c().await?;
    viewer.stop().await;
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::RunStart {
            run_id,
            filepath,
            expected_frame_count,
            ..
        } => println!("run {run_id} started: {expected_frame_count} frames -> {filepath}"),
        Event::Frame(frame) => println!(
            "run {} frame {} (shot {}, subframe {}) {}x{} {} bytes",
            frame.run_id,
            frame.index,
            frame.shot,
            frame.subframe,
            frame.width,
            frame.height,
            frame.data.len()
        ),
        Event::Xvars { vars } => println!("xvars: {} variables", vars.len()),
        Event::RunComplete { run_id, frames } => println!("run {run_id} complete ({frames} frames)"),
        Event::RunIncomplete {
            run_id,
            frames,
            reason,
        } => println!("run {run_id} incomplete after {frames} frames: {reason}"),
        Event::Reset => println!("reset"),
    }
}

async fn simulate(
    config: SyncConfig,
    runs: u64,
    shots: usize,
    subframes: usize,
    first_run: Option<u64>,
) -> Result<()> {
    let store = FsRecordStore::open(config.mailbox.root.clone())
        .await?
        .with_stale_guard_after(config.mailbox.stale_guard_after);
    let client = CommandClient::new(config.network.command_addr()?, REQUEST_TIMEOUT);
    let mut producer = RunProducer::new(
        Arc::new(store),
        client,
        config.mailbox.poll_policy(),
        config.acquisition.camera_ready_timeout,
    )
    .with_completion_timeout(config.acquisition.completion_grace * 2 + REQUEST_TIMEOUT);

    let first = first_run
        .unwrap_or_else(|| u64::try_from(Utc::now().timestamp_millis()).unwrap_or(1));

    for run_id in first..first + runs {
        let plan = RunPlan::new(run_id, config.camera.clone(), shots).with_subframes(subframes);
        let record = producer
            .start_run(&plan)
            .await
            .with_context(|| format!("starting run {run_id}"))?;
        info!(run_id, location = %record.location, "Run armed");

        let mut vars = Vars::new();
        vars.insert("run_id".to_string(), VarValue::Int(i64::try_from(run_id)?));
        vars.insert("shots".to_string(), VarValue::Int(i64::try_from(shots)?));
        vars.insert("simulated".to_string(), VarValue::Bool(true));
        producer.send_xvars(vars).await?;

        producer.finish_run().await?;
        if producer.verify_complete(run_id).await? {
            println!("run {run_id}: all {} frames stored", plan.expected_frame_count);
        } else {
            warn!(run_id, "Run finished without a complete frame table");
            println!("run {run_id}: incomplete");
        }
    }
    Ok(())
}
