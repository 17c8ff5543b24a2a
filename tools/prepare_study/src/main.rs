//! Study-wide preparation: patch and condition the surface model, derive the
//! stream network, delineate basins and extract one vector per configured
//! basin. Those vectors are the masks `basin_analysis` works under.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use basin_core::orchestrator::install_extensions;
use basin_core::stage::external_inputs;
use basin_core::stages::build_all;
use basin_core::{
    logging, prepare_study, Engine, EngineSettings, GrassEngine, RecordingEngine, Session, Stage,
    StageKind, StageOutcome, StageReport, StudyConfig, Unit,
};
use clap::Parser;
use serde::Serialize;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "prepare_study", about = "Condition the study surface and delineate basin vectors")]
struct Args {
    /// Study configuration file.
    #[arg(short, long, default_value = "study.toml")]
    config: PathBuf,

    /// Run only these stages (comma-separated) instead of `[preparation].stages`.
    #[arg(short, long, value_delimiter = ',')]
    stages: Vec<String>,

    /// Install the engine add-ons before running.
    #[arg(long)]
    install_extensions: bool,

    /// Print the engine commands instead of running them.
    #[arg(long)]
    dry_run: bool,

    /// Write the stage outcomes as JSON.
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct PreparationReport<'a> {
    stages: &'a [StageReport],
    missing_extensions: &'a [&'static str],
}

// ── Run ───────────────────────────────────────────────────────────────────────

fn run<E: Engine>(
    session: &mut Session<E>,
    args: &Args,
    config: &StudyConfig,
    stages: &[Box<dyn Stage>],
) -> Result<(Vec<StageReport>, Vec<&'static str>)> {
    let missing = if args.install_extensions {
        install_extensions(session)
    } else {
        Vec::new()
    };
    let reports = prepare_study(session, &config.region, stages).context("study preparation aborted")?;
    session.finish().context("session cleanup failed")?;
    Ok((reports, missing))
}

fn print_summary(reports: &[StageReport]) {
    eprintln!("\n{:<24} {:<8} {}", "Stage", "Status", "Detail");
    eprintln!("{}", "-".repeat(72));
    for r in reports {
        let detail = match &r.outcome {
            StageOutcome::Success { outputs } => outputs.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", "),
            StageOutcome::Failed { reason } => reason.clone(),
            StageOutcome::Skipped { missing } => {
                format!("missing {}", missing.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", "))
            }
        };
        eprintln!("{:<24} {:<8} {}", r.stage, r.outcome.label(), detail);
    }
}

/// Ctrl-C and SIGTERM set the returned flag; the session stops at the next
/// stage or month and cleans up before the process exits.
fn cancel_on_interrupt() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing the interrupt handler")?;
    Ok(cancel)
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    logging::init(args.verbose);
    let cancel = cancel_on_interrupt()?;

    let config = StudyConfig::load(&args.config)
        .with_context(|| format!("loading study file {}", args.config.display()))?;
    let basins = config.basins()?;
    let kinds: Vec<StageKind> = if args.stages.is_empty() {
        config.preparation_stages()?
    } else {
        args.stages.iter().map(|s| s.parse::<StageKind>()).collect::<Result<Vec<_>, _>>()?
    };
    let stages = build_all(&kinds, &config, &basins);
    eprintln!("Preparing study: {} stages, {} basins", stages.len(), basins.len());

    let (reports, missing) = if args.dry_run {
        let mut engine = RecordingEngine::new();
        for (element, name) in external_inputs(&stages, Unit::Study) {
            engine = engine.with_map(element, name.as_str());
        }
        let mut session = Session::start(engine)?.with_cancel_flag(Arc::clone(&cancel));
        let result = run(&mut session, &args, &config, &stages)?;
        for line in session.engine().rendered() {
            println!("{line}");
        }
        result
    } else {
        let settings = EngineSettings::resolve(&config.engine, |key| std::env::var(key).ok())?;
        tracing::info!(mapset = %settings.mapset_path().display(), "engine resolved");
        let mut session = Session::start(GrassEngine::new(settings))?.with_cancel_flag(Arc::clone(&cancel));
        run(&mut session, &args, &config, &stages)?
    };

    print_summary(&reports);
    if !missing.is_empty() {
        eprintln!("Extensions not installed: {}", missing.join(", "));
    }

    if let Some(path) = &args.report {
        let report = PreparationReport { stages: &reports, missing_extensions: &missing };
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report)?;
        eprintln!("Report written to {}", path.display());
    }
    Ok(())
}
