//! Batch scenarios against the recording engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use basin_core::engine::{EngineOutput, MapElement};
use basin_core::error::EngineError;
use basin_core::naming::ProductId;
use basin_core::stage::{Product, StageContext};
use basin_core::stages::build_all;
use basin_core::{
    Basin, BasinBatch, Engine, EngineCommand, PipelineError, RecordingEngine, Session, Stage,
    StageKind, StudyConfig,
};

const STUDY: &str = r#"
    [region]
    north = 1072000
    south = 952000
    east = 694000
    west = 574000
    resolution = 30

    [[basins]]
    name = "Rio Trinidad"
    map = "rio_trinidad"

    [[basins]]
    name = "Rio Gatun"
    map = "rio_gatun"
"#;

const STAGES: [StageKind; 3] = [StageKind::ClipElevation, StageKind::ComputeSlope, StageKind::ComputeStats];

fn config() -> StudyConfig {
    StudyConfig::from_toml_str(STUDY).unwrap()
}

fn basins() -> Vec<Basin> {
    config().basins().unwrap()
}

fn batch() -> BasinBatch {
    let config = config();
    BasinBatch::new(build_all(&STAGES, &config, &basins()), 30.0)
}

/// Engine with the study elevation, both basin vectors and univar answers.
fn engine() -> RecordingEngine {
    RecordingEngine::new()
        .with_map(MapElement::Raster, "elevation")
        .with_map(MapElement::Vector, "rio_trinidad")
        .with_map(MapElement::Vector, "rio_gatun")
        .respond("r.univar", "rio_trinidad_elevation", &[("min", "12"), ("max", "640"), ("mean", "187.5")])
        .respond("r.univar", "rio_trinidad_slope", &[("min", "0"), ("max", "48.5"), ("mean", "9.25")])
        .respond("r.univar", "rio_gatun_elevation", &[("min", "26"), ("max", "1002"), ("mean", "301")])
        .respond("r.univar", "rio_gatun_slope", &[("min", "0.5"), ("max", "57"), ("mean", "12")])
}

// ── Scope auditing ────────────────────────────────────────────────────────────

/// Fails the test if a mask is set while another is active.
struct AuditEngine {
    inner: RecordingEngine,
    masked: bool,
    masks_set: usize,
}

impl Engine for AuditEngine {
    fn run(&mut self, command: &EngineCommand) -> Result<EngineOutput, EngineError> {
        let out = self.inner.run(command)?;
        if command.module == "r.mask" {
            if command.has_flag('r') {
                self.masked = false;
            } else {
                assert!(!self.masked, "mask set while another scope is active: {command}");
                self.masked = true;
                self.masks_set += 1;
            }
        }
        Ok(out)
    }

    fn exists(&mut self, element: MapElement, name: &str) -> Result<bool, EngineError> {
        self.inner.exists(element, name)
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn two_basins_give_two_complete_records_in_input_order() {
    let mut session = Session::start(engine()).unwrap();
    let report = batch().run(&mut session, &basins()).unwrap();

    assert_eq!(report.statistics.len(), 2);
    let names: Vec<&str> = report.statistics.records().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["Rio Trinidad", "Rio Gatun"]);
    let trinidad = &report.statistics.records()[0];
    assert_eq!(trinidad.values(), [187.5, 12.0, 640.0, 9.25, 48.5, 0.0]);
    assert_eq!(report.failures(), 0);
}

#[test]
fn clip_failure_in_one_basin_skips_only_its_dependents() {
    let engine = engine().fail_on("r.mapcalc", "rio_gatun_elevation =");
    let mut session = Session::start(engine).unwrap();
    let report = batch().run(&mut session, &basins()).unwrap();

    assert_eq!(
        report.results_for("rio_trinidad").unwrap().outcome_labels(),
        vec!["success", "success", "success"]
    );
    assert_eq!(
        report.results_for("rio_gatun").unwrap().outcome_labels(),
        vec!["failed", "skipped", "skipped"]
    );
    assert_eq!(report.statistics.len(), 1);
    assert_eq!(report.statistics.records()[0].map_id, "rio_trinidad");

    // The skipped stages never reached the engine.
    assert_eq!(session.engine().count("r.slope.aspect"), 1);
    assert!(!session.engine().mask_active());
    assert_eq!(report.scopes.acquired, 2);
    assert_eq!(report.scopes.released, 2);
}

#[test]
fn at_most_one_scope_is_ever_active() {
    let engine = AuditEngine { inner: engine(), masked: false, masks_set: 0 };
    let mut session = Session::start(engine).unwrap();
    let report = batch().run(&mut session, &basins()).unwrap();
    assert!(!session.scope_active());
    assert_eq!(session.engine().masks_set, 2);
    assert_eq!(report.scopes.acquired, report.scopes.released);
}

#[test]
fn mid_stage_engine_error_releases_the_scope_once_before_the_next_basin() {
    let basins = vec![
        Basin::new("Rio Gatun", "rio_gatun", None).unwrap(),
        Basin::new("Rio Trinidad", "rio_trinidad", None).unwrap(),
    ];
    let engine = engine().fail_on("r.slope.aspect", "rio_gatun");
    let mut session = Session::start(engine).unwrap();
    batch().run(&mut session, &basins).unwrap();

    let rendered = session.engine().rendered();
    let failed_at = rendered.iter().position(|c| c.starts_with("r.slope.aspect elevation=rio_gatun")).unwrap();
    let next_basin = rendered.iter().position(|c| c == "g.region vector=rio_trinidad res=30").unwrap();
    let between = &rendered[failed_at..next_basin];
    assert_eq!(between.iter().filter(|c| c.as_str() == "r.mask -r").count(), 1);
    assert_eq!(between.iter().filter(|c| c.as_str() == "g.region -d").count(), 1);
}

#[test]
fn unavailable_basin_scope_skips_the_basin_and_continues() {
    let engine = engine().fail_on("r.mask", "vector=rio_trinidad");
    let mut session = Session::start(engine).unwrap();
    let report = batch().run(&mut session, &basins()).unwrap();

    let trinidad = report.results_for("rio_trinidad").unwrap();
    assert!(trinidad.scope_error.is_some());
    assert_eq!(trinidad.outcome_labels(), vec!["skipped", "skipped", "skipped"]);
    assert_eq!(
        report.results_for("rio_gatun").unwrap().outcome_labels(),
        vec!["success", "success", "success"]
    );
    assert_eq!(report.statistics.len(), 1);
    assert!(!session.engine().mask_active());
}

#[test]
fn rerunning_the_batch_issues_identical_commands() {
    let mut session = Session::start(engine()).unwrap();
    let batch = batch();
    batch.run(&mut session, &basins()).unwrap();
    let first = session.engine().rendered();
    batch.run(&mut session, &basins()).unwrap();
    let all = session.engine().rendered();

    assert_eq!(all.len(), first.len() * 2);
    assert_eq!(&all[first.len()..], first.as_slice());
    let writes = first
        .iter()
        .filter(|c| c.starts_with("r.mapcalc") || c.starts_with("r.slope.aspect"));
    assert!(writes.clone().count() > 0);
    assert!(writes.into_iter().all(|c| c.ends_with("--overwrite")));
}

#[test]
fn duplicate_basin_keeps_one_record() {
    let trinidad = Basin::new("Rio Trinidad", "rio_trinidad", None).unwrap();
    let mut session = Session::start(engine()).unwrap();
    let report = batch().run(&mut session, &[trinidad.clone(), trinidad]).unwrap();
    assert_eq!(report.runs.len(), 2);
    assert_eq!(report.statistics.len(), 1);
}

struct Panics;

impl Stage for Panics {
    fn name(&self) -> &str {
        "panics"
    }

    fn inputs(&self) -> Vec<Product> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Product> {
        Vec::new()
    }

    fn run(&self, _ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        panic!("engine binding crashed");
    }
}

#[test]
fn panic_inside_a_stage_still_releases_the_scope() {
    let batch = BasinBatch::new(vec![Box::new(Panics) as Box<dyn Stage>], 30.0);
    let mut session = Session::start(engine()).unwrap();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        batch.run(&mut session, &basins())
    }));
    assert!(result.is_err());
    assert!(!session.scope_active());
    assert!(!session.engine().mask_active());
    assert_eq!(session.scope_stats().acquired, session.scope_stats().released);
}

/// Sets the cancel flag while it runs, as Ctrl-C during a long module would.
struct RaisesInterrupt {
    flag: Arc<AtomicBool>,
}

impl Stage for RaisesInterrupt {
    fn name(&self) -> &str {
        "raises_interrupt"
    }

    fn inputs(&self) -> Vec<Product> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Product> {
        Vec::new()
    }

    fn run(&self, _ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        self.flag.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn interrupt_mid_basin_releases_the_mask_and_removes_temporaries() {
    let config = config();
    let basins = basins();
    let flag = Arc::new(AtomicBool::new(false));
    let mut stages = build_all(&[StageKind::ClipElevation], &config, &basins);
    stages.push(Box::new(RaisesInterrupt { flag: Arc::clone(&flag) }));
    stages.extend(build_all(&[StageKind::ComputeSlope], &config, &basins));
    let batch = BasinBatch::new(stages, 30.0);

    let mut recorder = engine().with_map(MapElement::Raster, "rio_trinidad_relief");
    let mut session = Session::start(&mut recorder).unwrap().with_cancel_flag(flag);
    session.register_temporary(MapElement::Raster, ProductId::new("rio_trinidad_relief"));
    let result = batch.run(&mut session, &basins);
    drop(session);

    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert!(!recorder.mask_active());
    assert!(!recorder.has_map(MapElement::Raster, "rio_trinidad_relief"));
    assert_eq!(recorder.count("r.slope.aspect"), 0);
    let rendered = recorder.rendered();
    assert!(!rendered.iter().any(|c| c.contains("rio_gatun")), "the next basin must not start");
    assert_eq!(rendered.iter().filter(|c| c.as_str() == "r.mask -r").count(), 1);
}

#[test]
fn statistics_csv_and_report_are_written() {
    let engine = engine().fail_on("r.mapcalc", "rio_gatun_elevation =");
    let mut session = Session::start(engine).unwrap();
    let report = batch().run(&mut session, &basins()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basin_stats.csv");
    report.statistics.write_csv_file(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "Name,MeanElevation,MinElevation,MaxElevation,MeanSlope,MaxSlope,MinSlope");
    assert_eq!(lines[1], "Rio Trinidad,187.5,12.0,640.0,9.25,48.5,0.0");
    assert_eq!(lines.len(), 2);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["runs"][1]["basin"]["map_id"], "rio_gatun");
    assert_eq!(json["runs"][1]["stages"][0]["status"], "failed");
    assert_eq!(json["runs"][1]["stages"][1]["missing"][0], "rio_gatun_elevation");
}
