//! Typed stages and the executor that runs them for one unit of work.
//!
//! A stage declares the products it reads and writes. Before running a stage
//! the executor checks every input: a product whose producer failed or was
//! skipped in this run is missing, anything else must either have been
//! produced in this run or already exist in the engine database. A stage with
//! missing inputs is skipped without touching the engine.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::engine::{Engine, EngineCommand, EngineOutput, MapElement};
use crate::error::PipelineError;
use crate::naming::{ProductId, Unit};
use crate::stats::{PartialStatistics, StatField};

// ── Products ──────────────────────────────────────────────────────────────────

/// A map a stage reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Product {
    /// Named per unit: `<map id>_<suffix>` in a basin, the bare suffix study-wide.
    Local { suffix: String, element: MapElement },
    /// The same name for every unit, e.g. a study-wide raster or a configured input.
    Shared { name: ProductId, element: MapElement },
}

impl Product {
    pub fn local_raster(suffix: &str) -> Self {
        Product::Local { suffix: suffix.to_string(), element: MapElement::Raster }
    }

    pub fn local_vector(suffix: &str) -> Self {
        Product::Local { suffix: suffix.to_string(), element: MapElement::Vector }
    }

    pub fn shared_raster(name: impl Into<String>) -> Self {
        Product::Shared { name: ProductId::new(name), element: MapElement::Raster }
    }

    pub fn shared_vector(name: impl Into<String>) -> Self {
        Product::Shared { name: ProductId::new(name), element: MapElement::Vector }
    }

    pub fn resolve(&self, unit: Unit<'_>) -> ProductId {
        match self {
            Product::Local { suffix, .. } => unit.product(suffix),
            Product::Shared { name, .. } => name.clone(),
        }
    }

    pub fn element(&self) -> MapElement {
        match self {
            Product::Local { element, .. } | Product::Shared { element, .. } => *element,
        }
    }
}

// ── Stage trait ───────────────────────────────────────────────────────────────

pub trait Stage {
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<Product>;

    fn outputs(&self) -> Vec<Product>;

    /// Issue the stage's engine commands. Called only when every input is present.
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError>;
}

/// What a running stage can see: the engine, its unit and the unit's statistics.
pub struct StageContext<'a> {
    engine: &'a mut dyn Engine,
    unit: Unit<'a>,
    stage: &'a str,
    statistics: &'a mut PartialStatistics,
}

impl<'a> StageContext<'a> {
    pub fn new(
        engine: &'a mut dyn Engine,
        unit: Unit<'a>,
        stage: &'a str,
        statistics: &'a mut PartialStatistics,
    ) -> Self {
        Self { engine, unit, stage, statistics }
    }

    pub fn run(&mut self, command: EngineCommand) -> Result<EngineOutput, PipelineError> {
        tracing::debug!(unit = self.unit.label(), stage = self.stage, command = %command, "run");
        Ok(self.engine.run(&command)?)
    }

    pub fn exists(&mut self, element: MapElement, name: &str) -> Result<bool, PipelineError> {
        Ok(self.engine.exists(element, name)?)
    }

    /// This unit's product for `suffix`.
    pub fn product(&self, suffix: &str) -> ProductId {
        self.unit.product(suffix)
    }

    pub fn unit(&self) -> Unit<'a> {
        self.unit
    }

    pub fn record(&mut self, field: StatField, value: f64) {
        self.statistics.record(field, value);
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Success { outputs: Vec<ProductId> },
    Failed { reason: String },
    Skipped { missing: Vec<ProductId> },
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutcome::Skipped { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Success { .. } => "success",
            StageOutcome::Failed { .. } => "failed",
            StageOutcome::Skipped { .. } => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: String,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

// ── Executor ──────────────────────────────────────────────────────────────────

/// Products and statistics accumulated for one unit.
#[derive(Debug, Clone, Default)]
pub struct UnitState {
    /// Written by a successful stage in this run.
    pub produced: BTreeSet<ProductId>,
    /// Declared by a stage that failed or was skipped in this run.
    pub lost: BTreeSet<ProductId>,
    pub statistics: PartialStatistics,
}

/// Runs stages in order for one unit, carrying their products forward.
pub struct StageExecutor<'u> {
    unit: Unit<'u>,
    state: UnitState,
}

impl<'u> StageExecutor<'u> {
    pub fn new(unit: Unit<'u>) -> Self {
        Self { unit, state: UnitState::default() }
    }

    pub fn state(&self) -> &UnitState {
        &self.state
    }

    pub fn into_state(self) -> UnitState {
        self.state
    }

    /// Run `stage` unless an input is missing.
    ///
    /// Engine failures and missing dependencies are recorded in the report;
    /// any other error is returned.
    pub fn run(
        &mut self,
        engine: &mut dyn Engine,
        stage: &dyn Stage,
    ) -> Result<StageReport, PipelineError> {
        let outcome = match self.check_inputs(engine, stage) {
            Ok(()) => self.attempt(engine, stage)?,
            Err(PipelineError::MissingDependency { missing, .. }) => {
                tracing::info!(unit = self.unit.label(), stage = stage.name(), missing = ?missing, "stage skipped");
                StageOutcome::Skipped { missing }
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(unit = self.unit.label(), stage = stage.name(), error = %e, "input check failed");
                StageOutcome::Failed { reason: e.to_string() }
            }
            Err(e) => return Err(e),
        };

        let outputs = stage.outputs().iter().map(|p| p.resolve(self.unit)).collect::<Vec<_>>();
        if outcome.is_success() {
            for product in outputs {
                self.state.lost.remove(&product);
                self.state.produced.insert(product);
            }
        } else {
            for product in outputs {
                self.state.produced.remove(&product);
                self.state.lost.insert(product);
            }
        }

        Ok(StageReport { stage: stage.name().to_string(), outcome })
    }

    /// Record `stage` as skipped without looking at the engine, e.g. when the
    /// unit's scope could not be established.
    pub fn skip(&mut self, stage: &dyn Stage) -> StageReport {
        let missing: Vec<ProductId> = stage.inputs().iter().map(|p| p.resolve(self.unit)).collect();
        for product in stage.outputs() {
            self.state.lost.insert(product.resolve(self.unit));
        }
        StageReport {
            stage: stage.name().to_string(),
            outcome: StageOutcome::Skipped { missing },
        }
    }

    /// `MissingDependency` with every absent input, or `Ok` when the stage
    /// can run.
    fn check_inputs(&self, engine: &mut dyn Engine, stage: &dyn Stage) -> Result<(), PipelineError> {
        let mut missing = Vec::new();
        for input in stage.inputs() {
            let id = input.resolve(self.unit);
            let present = if self.state.lost.contains(&id) {
                false
            } else if self.state.produced.contains(&id) {
                true
            } else {
                engine.exists(input.element(), id.as_str())?
            };
            if !present {
                missing.push(id);
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::MissingDependency { stage: stage.name().to_string(), missing })
        }
    }

    fn attempt(
        &mut self,
        engine: &mut dyn Engine,
        stage: &dyn Stage,
    ) -> Result<StageOutcome, PipelineError> {
        let mut ctx = StageContext::new(engine, self.unit, stage.name(), &mut self.state.statistics);
        match stage.run(&mut ctx) {
            Ok(()) => {
                let outputs = stage.outputs().iter().map(|p| p.resolve(self.unit)).collect();
                tracing::info!(unit = self.unit.label(), stage = stage.name(), "stage done");
                Ok(StageOutcome::Success { outputs })
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(unit = self.unit.label(), stage = stage.name(), error = %e, "stage failed");
                Ok(StageOutcome::Failed { reason: e.to_string() })
            }
            Err(e) => Err(e),
        }
    }
}

/// Inputs of `stages` that no earlier stage in the list produces, i.e. the
/// maps that must already exist before the list runs for `unit`.
pub fn external_inputs(stages: &[Box<dyn Stage>], unit: Unit<'_>) -> Vec<(MapElement, ProductId)> {
    let mut produced = BTreeSet::new();
    let mut external = Vec::new();
    for stage in stages {
        for input in stage.inputs() {
            let id = input.resolve(unit);
            if !produced.contains(&id) && !external.iter().any(|(_, e)| *e == id) {
                external.push((input.element(), id));
            }
        }
        for output in stage.outputs() {
            produced.insert(output.resolve(unit));
        }
    }
    external
}
