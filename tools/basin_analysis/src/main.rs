//! Per-basin analysis batch: clip the study rasters to each basin, derive
//! terrain and stream products, and write one statistics row per basin.
//!
//! Exits 0 once the batch completes, whatever individual stages reported.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use basin_core::{
    logging, Basin, BasinBatch, BatchReport, Engine, EngineSettings, GrassEngine, RecordingEngine,
    Session, StudyConfig,
};
use clap::Parser;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "basin_analysis", about = "Run the per-basin stages and export basin statistics")]
struct Args {
    /// Study configuration file.
    #[arg(short, long, default_value = "study.toml")]
    config: PathBuf,

    /// Analyse only these basins (map identifiers, repeatable).
    #[arg(short, long)]
    basin: Vec<String>,

    /// Statistics CSV; defaults to `[analysis].statistics_csv`.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Batch report JSON; defaults to `[analysis].report`.
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Print the engine commands instead of running them. No CSV is written.
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,
}

// ── Run ───────────────────────────────────────────────────────────────────────

fn run<E: Engine>(session: &mut Session<E>, batch: &BasinBatch, basins: &[Basin]) -> Result<BatchReport> {
    let report = batch.run(session, basins).context("basin batch aborted")?;
    session.finish().context("session cleanup failed")?;
    Ok(report)
}

fn select_basins(all: Vec<Basin>, wanted: &[String]) -> Result<Vec<Basin>> {
    if wanted.is_empty() {
        return Ok(all);
    }
    for id in wanted {
        if !all.iter().any(|b| b.map_id() == id) {
            bail!("basin '{id}' is not in the study file");
        }
    }
    Ok(all.into_iter().filter(|b| wanted.iter().any(|w| w == b.map_id())).collect())
}

fn print_summary(report: &BatchReport) {
    eprintln!("\n{:<20} {:>7} {:>7} {:>7}  {}", "Basin", "Success", "Failed", "Skipped", "Record");
    eprintln!("{}", "-".repeat(64));
    for run in &report.runs {
        let count = |label: &str| run.outcome_labels().iter().filter(|&&l| l == label).count();
        let record = if report.statistics.get(run.basin.map_id()).is_some() { "yes" } else { "no" };
        eprintln!(
            "{:<20} {:>7} {:>7} {:>7}  {}",
            run.basin.map_id(),
            count("success"),
            count("failed"),
            count("skipped"),
            record
        );
        if let Some(err) = &run.scope_error {
            eprintln!("  scope: {err}");
        }
    }
}

fn write_report(path: &Path, report: &BatchReport) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)?;
    eprintln!("Report written to {}", path.display());
    Ok(())
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
    let basins = select_basins(config.basins()?, &args.basin)?;
    let batch = BasinBatch::from_config(&config, &basins)?;
    eprintln!("Analysing {} basins with {} stages ...", basins.len(), batch.stages().len());

    let report = if args.dry_run {
        let mut engine = RecordingEngine::new();
        for (element, name) in batch.required_maps(&basins) {
            engine = engine.with_map(element, name.as_str());
        }
        let mut session = Session::start(engine)?.with_cancel_flag(Arc::clone(&cancel));
        let report = run(&mut session, &batch, &basins)?;
        for line in session.engine().rendered() {
            println!("{line}");
        }
        report
    } else {
        let settings = EngineSettings::resolve(&config.engine, |key| std::env::var(key).ok())?;
        tracing::info!(mapset = %settings.mapset_path().display(), "engine resolved");
        let mut session = Session::start(GrassEngine::new(settings))?.with_cancel_flag(Arc::clone(&cancel));
        run(&mut session, &batch, &basins)?
    };

    print_summary(&report);
    if args.dry_run {
        if let Some(path) = &args.report {
            write_report(path, &report)?;
        }
        return Ok(());
    }

    let csv_path = args.output.unwrap_or_else(|| config.analysis.statistics_csv.clone());
    report
        .statistics
        .write_csv_file(&csv_path)
        .with_context(|| format!("writing {}", csv_path.display()))?;
    eprintln!("{} statistics rows written to {}", report.statistics.len(), csv_path.display());

    if let Some(path) = args.report.or_else(|| config.analysis.report.clone()) {
        write_report(&path, &report)?;
    }

    if report.failures() > 0 {
        eprintln!("{} stages failed; see the log for details.", report.failures());
    }
    Ok(())
}
