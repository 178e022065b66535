//! `patrol` – Pi-Patrol command line interface.
//!
//! - `patrol run --simulate` starts the detection pipeline on simulated
//!   hardware until Ctrl-C.
//! - `patrol events` prints the event log, newest first.
//! - `patrol enroll <name> <images…>` adds face samples for an identity.
//! - `patrol config` prints (or with `--save`, writes) the effective
//!   configuration.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use patrol_hal::sim::SimRegistry;
use patrol_hal::{CameraFrame, FsCaptureController, HardwareRegistry, LivePreview};
use patrol_memory::{EventFilter, EventLog, SqliteEventLog};
use patrol_perception::{Enrollment, LbphMatcher};
use patrol_runtime::{Pipeline, PipelineError, telemetry};
use patrol_types::{EventRecord, IncidentKind};

use config::{Config, GasInput};

#[derive(Parser)]
#[command(name = "patrol", version, about = "Pi-Patrol event detection and capture")]
struct Cli {
    /// Configuration file (default `~/.patrol/config.toml`).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the detection pipeline until Ctrl-C.
    Run {
        /// Drive the pipeline from simulated PIR, gas and camera drivers.
        #[arg(long)]
        simulate: bool,
    },
    /// Print recorded events, newest first.
    Events {
        /// Only this kind (motion, unknown_visitor, known_visitor, gas, system_fault).
        #[arg(long)]
        kind: Option<IncidentKind>,
        /// Only events closed at or after this RFC 3339 time.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Add face samples (JPEG, PNG or PNM) for an identity.
    Enroll {
        name: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Print the effective configuration.
    Config {
        /// Also write it to the configuration file.
        #[arg(long)]
        save: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = telemetry::init_tracing("pi-patrol");

    let config_path = cli.config.unwrap_or_else(config::config_path);
    let cfg = match config::load_effective(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Run { simulate } => run(&cfg, simulate),
        Command::Events { kind, since, limit } => events(&cfg, kind, since, limit),
        Command::Enroll { name, images } => enroll(&cfg, &name, &images),
        Command::Config { save } => show_config(&cfg, &config_path, save),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

fn run(cfg: &Config, simulate: bool) -> Result<(), String> {
    if !simulate {
        return Err("no physical sensor drivers in this build; pass --simulate".to_string());
    }
    let pipeline_config = cfg.pipeline_config()?;

    let mut registry = sim_registry(cfg);
    let camera = registry.take_camera("cam0").map_err(|e| e.to_string())?;

    let events_dir = cfg.events_dir();
    let preview = Arc::new(LivePreview::new(events_dir.join("live.jpg")));
    let capture = FsCaptureController::new(camera, &events_dir, cfg.recordings_dir(), preview)
        .with_clip_fps(cfg.clip_fps);
    let matcher = LbphMatcher::new(load_enrollment(cfg)?);
    let log = SqliteEventLog::open(&cfg.db_path()).map_err(|e| e.to_string())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "Ctrl-C received, closing open incidents …".yellow().bold());
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    println!(
        "  {} writing events to {}",
        "Pi-Patrol".bold().cyan(),
        cfg.db_path().display().to_string().bold()
    );

    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    let (report, workers) = runtime
        .block_on(async {
            let mut pipeline =
                Pipeline::new(pipeline_config, Arc::new(capture), Arc::new(matcher), Box::new(log))?;
            let workers = pipeline.spawn_sensors(registry.take_sensors(), &shutdown)?;
            let report = pipeline.run(Arc::clone(&shutdown)).await;
            Ok::<_, PipelineError>((report, workers))
        })
        .map_err(|e| e.to_string())?;

    for worker in workers {
        if worker.join().is_err() {
            warn!("sensor worker panicked");
        }
    }
    println!(
        "  {} {} events persisted, {} lost",
        "✓".green().bold(),
        report.persisted,
        report.lost
    );
    Ok(())
}

fn sim_registry(cfg: &Config) -> HardwareRegistry {
    let registry = SimRegistry::new().with_pir("pir_front");
    let registry = match cfg.gas_input {
        GasInput::Analog => registry.with_gas("mq2"),
        GasInput::Digital => registry.with_digital_gas("mq2", cfg.gas_alarm_threshold),
    };
    registry.with_camera("cam0").build()
}

/// Stored descriptors when present, otherwise train from the faces tree.
fn load_enrollment(cfg: &Config) -> Result<Enrollment, String> {
    let region = cfg.face_region()?;
    let path = cfg.enrollment_path();
    let enrollment = if path.exists() {
        Enrollment::load(&path)
    } else {
        Enrollment::from_faces_dir(&cfg.faces_dir(), region)
    }
    .map_err(|e| e.to_string())?;
    if enrollment.region() != region {
        warn!(
            stored = enrollment.region().fraction(),
            configured = region.fraction(),
            "enrollment was built with a different face_crop; re-enroll to apply the new one"
        );
    }
    info!(identities = enrollment.identities().count(), "enrollment loaded");
    Ok(enrollment)
}

// ─────────────────────────────────────────────────────────────────────────────
// events
// ─────────────────────────────────────────────────────────────────────────────

fn events(
    cfg: &Config,
    kind: Option<IncidentKind>,
    since: Option<DateTime<Utc>>,
    limit: usize,
) -> Result<(), String> {
    let db = cfg.db_path();
    if !db.exists() {
        println!("  No events recorded yet ({}).", db.display().to_string().dimmed());
        return Ok(());
    }
    let log = SqliteEventLog::open_read_only(&db).map_err(|e| e.to_string())?;

    let mut filter = EventFilter::default().limit(limit).newest_first();
    if let Some(kind) = kind {
        filter = filter.kind(kind);
    }
    if let Some(since) = since {
        filter = filter.since(since);
    }

    let mut shown = 0usize;
    for record in log.query(&filter).map_err(|e| e.to_string())? {
        match record {
            Ok(record) => {
                println!("{}", format_record(&record));
                shown += 1;
            }
            Err(e) => println!("  {} {}", "unreadable record:".red(), e),
        }
    }
    if shown == 0 {
        println!("  No matching events.");
    }
    Ok(())
}

fn format_record(record: &EventRecord) -> String {
    let when = record
        .closed_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S");
    let kind = match record.kind {
        IncidentKind::KnownVisitor => record.kind.as_str().green(),
        IncidentKind::UnknownVisitor => record.kind.as_str().yellow(),
        IncidentKind::Gas | IncidentKind::SystemFault => record.kind.as_str().red().bold(),
        IncidentKind::Motion => record.kind.as_str().normal(),
    };
    let mut line = format!("  {when}  {kind:<16}");
    if let Some(identity) = &record.identity {
        let confidence = record.confidence.unwrap_or_default();
        line.push_str(&format!(" {} ({confidence:.2})", identity.bold()));
    }
    if let Some(peak) = record.peak_gas_level {
        line.push_str(&format!(" peak {peak:.2}"));
    }
    if let Some(first) = record.artifact_refs.first() {
        line.push_str(&format!(" {}", first.display().to_string().dimmed()));
    }
    if record.is_partial() {
        line.push_str(&format!(" {}", "[partial]".yellow()));
    }
    if let Some(detail) = &record.detail {
        line.push_str(&format!(" {detail}"));
    }
    line
}

// ─────────────────────────────────────────────────────────────────────────────
// enroll
// ─────────────────────────────────────────────────────────────────────────────

fn enroll(cfg: &Config, name: &str, images: &[PathBuf]) -> Result<(), String> {
    let path = cfg.enrollment_path();
    let mut enrollment = load_enrollment(cfg)?;
    for image in images {
        let frame = CameraFrame::open(image).map_err(|e| format!("{}: {}", image.display(), e))?;
        enrollment
            .enroll(name, &frame)
            .map_err(|e| format!("{}: {}", image.display(), e))?;
    }
    enrollment.save(&path).map_err(|e| e.to_string())?;
    println!(
        "  {} {} now has {} sample(s) in {}",
        "✓".green().bold(),
        name.bold(),
        enrollment.samples(name),
        path.display()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────────────────

fn show_config(cfg: &Config, path: &Path, save: bool) -> Result<(), String> {
    let raw = toml::to_string_pretty(cfg).map_err(|e| e.to_string())?;
    println!("# {}", path.display());
    println!("{raw}");
    if let Err(e) = cfg.pipeline_config() {
        println!("{}: {}", "Invalid".red().bold(), e);
    }
    if save {
        config::save_to(cfg, path)?;
        println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
    }
    Ok(())
}
