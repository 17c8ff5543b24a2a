//! Study preparation and the per-basin batch.
//!
//! The batch visits basins in input order. Each basin gets its own scope
//! (region of the basin vector, masked by it), its stages run through a fresh
//! executor, and the scope is released before the next basin starts, whatever
//! happened in between. Engine failures never stop the batch; they show up in
//! the report.

use serde::Serialize;

use crate::basin::Basin;
use crate::config::{RegionConfig, StudyConfig};
use crate::engine::{Engine, EngineCommand, MapElement};
use crate::error::{ConfigError, PipelineError};
use crate::naming::{ProductId, Unit};
use crate::scope::{ScopeSpec, ScopeStats};
use crate::session::Session;
use crate::stage::{external_inputs, Product, Stage, StageExecutor, StageReport};
use crate::stages::build_all;
use crate::stats::{StatisticsRecord, StatisticsTable};

/// Engine add-ons the study modules depend on.
pub const EXTENSIONS: [&str; 7] = [
    "r.skyview",
    "r.hydrodem",
    "r.stream.snap",
    "r.stream.basins",
    "r.stream.distance",
    "r.stream.order",
    "r.stream.stats",
];

/// Install the engine add-ons. Failures are logged and returned; a missing
/// add-on only fails the stages that need it.
pub fn install_extensions<E: Engine>(session: &mut Session<E>) -> Vec<&'static str> {
    let mut failed = Vec::new();
    for extension in EXTENSIONS {
        let cmd = EngineCommand::new("g.extension")
            .param("extension", extension)
            .param("operation", "add");
        if let Err(e) = session.engine().run(&cmd) {
            tracing::warn!(extension, error = %e, "extension not installed");
            failed.push(extension);
        }
    }
    failed
}

// ── Study preparation ─────────────────────────────────────────────────────────

/// Run `stages` over the whole study area under an unmasked study scope.
///
/// Failing to establish the study scope or an interrupt is an error; stage
/// failures are reported.
pub fn prepare_study<E: Engine>(
    session: &mut Session<E>,
    region: &RegionConfig,
    stages: &[Box<dyn Stage>],
) -> Result<Vec<StageReport>, PipelineError> {
    let mut guard = session.scoped(&ScopeSpec::study(region))?;
    let mut exec = StageExecutor::new(Unit::Study);
    let mut reports = Vec::with_capacity(stages.len());
    for stage in stages {
        guard.check_cancelled()?;
        reports.push(exec.run(guard.engine(), stage.as_ref())?);
    }
    guard.release()?;
    Ok(reports)
}

// ── Basin batch ───────────────────────────────────────────────────────────────

/// Everything that happened to one basin.
#[derive(Debug, Clone, Serialize)]
pub struct BasinRun {
    pub basin: Basin,
    pub stages: Vec<StageReport>,
    /// Set when the basin's scope could not be established.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_error: Option<String>,
}

impl BasinRun {
    pub fn outcome_labels(&self) -> Vec<&'static str> {
        self.stages.iter().map(|r| r.outcome.label()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub runs: Vec<BasinRun>,
    pub statistics: StatisticsTable,
    pub scopes: ScopeStats,
}

impl BatchReport {
    /// Stage results of the last run for `map_id`.
    pub fn results_for(&self, map_id: &str) -> Option<&BasinRun> {
        self.runs.iter().rev().find(|r| r.basin.map_id() == map_id)
    }

    /// Number of stages that failed across all basins.
    pub fn failures(&self) -> usize {
        self.runs
            .iter()
            .flat_map(|r| &r.stages)
            .filter(|s| s.outcome.is_failed())
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.runs
            .iter()
            .flat_map(|r| &r.stages)
            .filter(|s| s.outcome.is_skipped())
            .count()
    }
}

pub struct BasinBatch {
    stages: Vec<Box<dyn Stage>>,
    resolution: f64,
    discard: Vec<String>,
}

impl BasinBatch {
    pub fn new(stages: Vec<Box<dyn Stage>>, resolution: f64) -> Self {
        Self { stages, resolution, discard: Vec::new() }
    }

    /// The batch described by the `[analysis]` section.
    pub fn from_config(config: &StudyConfig, basins: &[Basin]) -> Result<Self, ConfigError> {
        let stages = build_all(&config.analysis_stages()?, config, basins);
        Ok(Self::new(stages, config.analysis_resolution()).discard(config.analysis.discard.clone()))
    }

    /// Remove the products with these suffixes when the session finishes.
    pub fn discard(mut self, suffixes: Vec<String>) -> Self {
        self.discard = suffixes;
        self
    }

    pub fn stages(&self) -> &[Box<dyn Stage>] {
        &self.stages
    }

    /// Maps that must exist before the batch runs: each basin's vector plus
    /// the stage inputs no stage in the batch produces.
    pub fn required_maps(&self, basins: &[Basin]) -> Vec<(MapElement, ProductId)> {
        let mut required: Vec<(MapElement, ProductId)> = Vec::new();
        for basin in basins {
            let own = (MapElement::Vector, ProductId::new(basin.map_id()));
            for entry in std::iter::once(own).chain(external_inputs(&self.stages, Unit::Basin(basin))) {
                if !required.contains(&entry) {
                    required.push(entry);
                }
            }
        }
        required
    }

    /// Run every stage for every basin, in order.
    ///
    /// Only errors that break the scope discipline propagate: a scope
    /// conflict, or a mask that could not be removed after a basin. An
    /// interrupt stops the batch with `Cancelled` once the running stage
    /// returns; the basin's scope is released on the way out.
    pub fn run<E: Engine>(
        &self,
        session: &mut Session<E>,
        basins: &[Basin],
    ) -> Result<BatchReport, PipelineError> {
        let mut runs = Vec::with_capacity(basins.len());
        let mut statistics = StatisticsTable::new();

        for (index, basin) in basins.iter().enumerate() {
            session.check_cancelled()?;
            tracing::info!(basin = basin.map_id(), index = index + 1, total = basins.len(), "basin started");
            let (run, record) = self.run_basin(session, basin)?;
            runs.push(run);
            if let Some(record) = record {
                statistics.upsert(record);
            }
        }

        self.schedule_discards(session, basins);

        let report = BatchReport {
            runs,
            statistics,
            scopes: session.scope_stats(),
        };
        tracing::info!(
            basins = report.runs.len(),
            records = report.statistics.len(),
            failed = report.failures(),
            skipped = report.skipped(),
            "batch finished"
        );
        Ok(report)
    }

    fn run_basin<E: Engine>(
        &self,
        session: &mut Session<E>,
        basin: &Basin,
    ) -> Result<(BasinRun, Option<StatisticsRecord>), PipelineError> {
        let mut exec = StageExecutor::new(Unit::Basin(basin));
        let mut reports = Vec::with_capacity(self.stages.len());
        let mut scope_error = None;

        match session.scoped(&ScopeSpec::basin(basin, self.resolution)) {
            Ok(mut guard) => {
                for stage in &self.stages {
                    guard.check_cancelled()?;
                    reports.push(exec.run(guard.engine(), stage.as_ref())?);
                }
                guard.release()?;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(basin = basin.map_id(), error = %e, "basin scope unavailable; skipping its stages");
                scope_error = Some(e.to_string());
                for stage in &self.stages {
                    reports.push(exec.skip(stage.as_ref()));
                }
            }
            Err(e) => return Err(e),
        }

        let statistics = &exec.state().statistics;
        let record = statistics.complete(basin);
        if record.is_none() && !statistics.is_empty() {
            tracing::warn!(basin = basin.map_id(), missing = ?statistics.missing(), "incomplete statistics; no record");
        }

        Ok((
            BasinRun { basin: basin.clone(), stages: reports, scope_error },
            record,
        ))
    }

    fn schedule_discards<E: Engine>(&self, session: &mut Session<E>, basins: &[Basin]) {
        for suffix in &self.discard {
            let element = self
                .stages
                .iter()
                .flat_map(|s| s.outputs())
                .find_map(|p| match p {
                    Product::Local { suffix: s, element } if s == *suffix => Some(element),
                    _ => None,
                });
            let Some(element) = element else {
                tracing::warn!(suffix = %suffix, "no stage in the batch produces this suffix; nothing to discard");
                continue;
            };
            for basin in basins {
                session.register_temporary(element, Unit::Basin(basin).product(suffix));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RecordingEngine;
    use crate::stages::StageKind;

    fn config() -> StudyConfig {
        StudyConfig::from_toml_str(
            r#"
            [region]
            north = 1072000
            south = 952000
            east = 694000
            west = 574000
            resolution = 30

            [[basins]]
            name = "Rio Trinidad"

            [analysis]
            stages = ["clip_elevation", "compute_relief", "compute_stats"]
            discard = ["relief", "hillshade"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn required_maps_cover_basin_vectors_and_study_rasters() {
        let config = config();
        let basins = config.basins().unwrap();
        let batch = BasinBatch::from_config(&config, &basins).unwrap();
        assert_eq!(
            batch.required_maps(&basins),
            vec![
                (MapElement::Vector, ProductId::new("rio_trinidad")),
                (MapElement::Raster, ProductId::new("elevation")),
                (MapElement::Raster, ProductId::new("rio_trinidad_slope")),
            ]
        );
    }

    #[test]
    fn discarded_products_are_removed_at_session_end() {
        let config = config();
        let basins = config.basins().unwrap();
        let batch = BasinBatch::from_config(&config, &basins).unwrap();
        let engine = RecordingEngine::new().with_map(MapElement::Raster, "rio_trinidad_relief");
        let mut session = Session::start(engine).unwrap();
        batch.run(&mut session, &basins).unwrap();
        assert_eq!(
            session.temporaries().map(ProductId::as_str).collect::<Vec<_>>(),
            vec!["rio_trinidad_relief"]
        );
        session.finish().unwrap();
        assert!(session
            .engine()
            .rendered()
            .contains(&"g.remove type=raster name=rio_trinidad_relief -f".to_string()));
    }

    #[test]
    fn study_preparation_runs_unmasked_and_releases() {
        let config = config();
        let stages = build_all(&[StageKind::PatchElevation, StageKind::ConditionElevation], &config, &[]);
        let engine = RecordingEngine::new()
            .with_map(MapElement::Raster, "panama_30m_dem@PERMANENT")
            .with_map(MapElement::Raster, "panama_90m_dem@PERMANENT");
        let mut session = Session::start(engine).unwrap();

        let reports = prepare_study(&mut session, &config.region, &stages).unwrap();
        assert!(reports.iter().all(|r| r.outcome.is_success()));
        assert_eq!(session.engine().count("r.mask"), 0);
        assert!(!session.scope_active());
        assert_eq!(
            session.engine().rendered()[0],
            "g.region n=1072000 s=952000 e=694000 w=574000 res=30"
        );
    }

    #[test]
    fn failed_extensions_are_reported() {
        let engine = RecordingEngine::new().fail_on("g.extension", "r.skyview");
        let mut session = Session::start(engine).unwrap();
        assert_eq!(install_extensions(&mut session), vec!["r.skyview"]);
        assert_eq!(session.engine().count("g.extension"), EXTENSIONS.len());
    }
}
