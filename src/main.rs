//! CLI Entry Point for plate_reader
//!
//! # Usage
//!
//! Read three wells on the simulated reader and export the series:
//! ```bash
//! plate_reader read A1 A2 B1 --mock --output data/run.csv
//! ```
//!
//! Show the visiting order without touching hardware:
//! ```bash
//! plate_reader plan C3 B3 C2 C4 D3
//! ```
//!
//! Convert a saved session to CSV:
//! ```bash
//! plate_reader export-session data/session.json --output data/session.csv
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plate_reader::config::{LinkKind, Settings};
use plate_reader::display::LogDisplay;
use plate_reader::link;
use plate_reader::scheduler::Scheduler;
use plate_reader::store::{self, ReadingsStore};
use plate_reader::tour;
use plate_reader::well::{PlateGrid, Well};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plate_reader")]
#[command(about = "Acquisition scheduler for a multi-well plate reader", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults to ./plate_reader.toml if present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and read the given wells, then export the readings
    Read {
        /// Wells to read, e.g. A1 B12
        #[arg(required = true)]
        wells: Vec<String>,

        /// Use the simulated plate reader regardless of configuration
        #[arg(long)]
        mock: bool,

        /// CSV output path (default: timestamped file in storage.output_dir)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also save the readings as a session file
        #[arg(long)]
        session: Option<PathBuf>,
    },

    /// Print the visiting order for the given wells
    Plan {
        /// Wells to plan, e.g. A1 B12
        #[arg(required = true)]
        wells: Vec<String>,
    },

    /// Convert a saved session file to CSV
    ExportSession {
        /// Session file written by `read --session`
        session: PathBuf,

        /// CSV output path (default: timestamped file in storage.output_dir)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Read {
            wells,
            mock,
            output,
            session,
        } => read_wells(settings, &wells, mock, output, session).await,
        Commands::Plan { wells } => plan_wells(&settings, &wells),
        Commands::ExportSession { session, output } => export_session(&settings, &session, output),
    }
}

fn parse_wells(grid: &PlateGrid, names: &[String]) -> Result<BTreeSet<Well>> {
    names
        .iter()
        .map(|name| grid.well(name).with_context(|| format!("Bad well '{}'", name)))
        .collect()
}

async fn read_wells(
    mut settings: Settings,
    names: &[String],
    mock: bool,
    output: Option<PathBuf>,
    session: Option<PathBuf>,
) -> Result<()> {
    let selected = parse_wells(&settings.grid(), names)?;
    if mock {
        settings.link.kind = LinkKind::Mock;
    }

    let device = link::open(&settings.link).context("Failed to open device link")?;
    let output = output.unwrap_or_else(|| store::default_export_path(&settings.storage.output_dir));
    let handle = Scheduler::new(settings, device, Box::new(LogDisplay::new())).spawn();

    let run = handle.read_selected(selected.into_iter().collect());
    tokio::pin!(run);
    let summary = tokio::select! {
        summary = &mut run => summary,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, stopping acquisition");
            handle.stop().await?;
            run.await
        }
    }
    .context("Acquisition failed")?;

    info!(
        "Read {}/{} wells{}",
        summary.completed.len(),
        summary.tour.len(),
        if summary.stopped { " (stopped early)" } else { "" }
    );

    handle
        .save_csv(output.clone())
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    if let Some(path) = session {
        handle
            .save_session(path.clone())
            .await
            .with_context(|| format!("Failed to save session {}", path.display()))?;
    }

    handle.shutdown().await?;
    println!("{}", output.display());
    Ok(())
}

fn plan_wells(settings: &Settings, names: &[String]) -> Result<()> {
    let grid = settings.grid();
    let selected = parse_wells(&grid, names)?;
    let tour = tour::plan(&grid, &selected);
    let order: Vec<String> = tour.iter().map(Well::to_string).collect();
    println!("{}", order.join(" "));
    Ok(())
}

fn export_session(settings: &Settings, session: &Path, output: Option<PathBuf>) -> Result<()> {
    let readings = ReadingsStore::load_json(session)
        .with_context(|| format!("Failed to load session {}", session.display()))?;
    let output = output.unwrap_or_else(|| store::default_export_path(&settings.storage.output_dir));
    readings
        .write_csv(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("{}", output.display());
    Ok(())
}
