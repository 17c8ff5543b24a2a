//! Per-basin watershed study pipeline.
//!
//! The crate drives an external GIS engine through typed stages: study-wide
//! preparation of the conditioned surface and basin vectors, then a batch
//! that clips and analyses every basin under its own region and mask, and
//! monthly climate summaries. Geoprocessing itself happens in the engine.
pub mod basin;
pub mod climate;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod naming;
pub mod orchestrator;
pub mod scope;
pub mod session;
pub mod stage;
pub mod stages;
pub mod stats;

pub use basin::Basin;
pub use config::{EngineSettings, StudyConfig};
pub use engine::{Engine, EngineCommand, GrassEngine, MapElement, RecordingEngine};
pub use error::{ConfigError, EngineError, PipelineError};
pub use naming::{product_name, ProductId, Unit};
pub use orchestrator::{prepare_study, BasinBatch, BasinRun, BatchReport};
pub use scope::{ScopeManager, ScopeSpec};
pub use session::{ScopeGuard, Session};
pub use stage::{Stage, StageExecutor, StageOutcome, StageReport};
pub use stages::StageKind;
pub use stats::{StatisticsRecord, StatisticsTable};
