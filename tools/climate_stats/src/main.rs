//! Monthly climate summaries: for every `[[climate]]` series in the study
//! file, copy each month into the working mapset, take its regional mean and
//! write a `Time,<label>` CSV.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use basin_core::climate::{summarize_series, ClimateSummary};
use basin_core::config::ClimateSeriesConfig;
use basin_core::{logging, Engine, EngineSettings, GrassEngine, RecordingEngine, Session, StudyConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "climate_stats", about = "Summarize monthly climate rasters to CSV")]
struct Args {
    /// Study configuration file.
    #[arg(short, long, default_value = "study.toml")]
    config: PathBuf,

    /// Summarize only these series (repeatable).
    #[arg(short, long)]
    series: Vec<String>,

    /// Write all summaries, including skipped months, as JSON.
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Print the engine commands instead of running them. No CSV is written.
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,
}

fn run<E: Engine>(
    session: &mut Session<E>,
    series: &[&ClimateSeriesConfig],
    write_csv: bool,
) -> Result<Vec<ClimateSummary>> {
    let mut summaries = Vec::with_capacity(series.len());
    for s in series {
        eprintln!("Summarizing {} ({} to {}) ...", s.name, s.start, s.end);
        let summary = summarize_series(session, s)
            .with_context(|| format!("climate series '{}'", s.name))?;
        if write_csv {
            summary
                .write_csv_file(&s.output)
                .with_context(|| format!("writing {}", s.output.display()))?;
        }
        eprintln!(
            "  {} months summarized, {} skipped",
            summary.records.len(),
            summary.failed.len()
        );
        summaries.push(summary);
    }
    session.finish().context("session cleanup failed")?;
    Ok(summaries)
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
    for name in &args.series {
        if !config.climate.iter().any(|s| &s.name == name) {
            bail!("climate series '{name}' is not in the study file");
        }
    }
    let series: Vec<&ClimateSeriesConfig> = config
        .climate
        .iter()
        .filter(|s| args.series.is_empty() || args.series.contains(&s.name))
        .collect();
    if series.is_empty() {
        bail!("no [[climate]] series configured");
    }

    let summaries = if args.dry_run {
        let mut session = Session::start(RecordingEngine::new())?.with_cancel_flag(Arc::clone(&cancel));
        let summaries = run(&mut session, &series, false)?;
        for line in session.engine().rendered() {
            println!("{line}");
        }
        summaries
    } else {
        let settings = EngineSettings::resolve(&config.engine, |key| std::env::var(key).ok())?;
        tracing::info!(mapset = %settings.mapset_path().display(), "engine resolved");
        let mut session = Session::start(GrassEngine::new(settings))?.with_cancel_flag(Arc::clone(&cancel));
        run(&mut session, &series, true)?
    };

    if let Some(path) = &args.report {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, &summaries)?;
        eprintln!("Report written to {}", path.display());
    }
    Ok(())
}
