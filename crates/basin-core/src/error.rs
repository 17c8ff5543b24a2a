//! Error taxonomy for the basin pipeline.
//!
//! Engine failures and missing inputs are recoverable: the stage executor
//! downgrades them to recorded outcomes. `ScopeConflict` means the scope
//! teardown discipline itself is broken and always propagates, as does
//! `Cancelled`.

use thiserror::Error;

use crate::naming::ProductId;

/// Failure reported by the external geoprocessing engine for one command.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The command ran and exited unsuccessfully.
    #[error("{module} exited with status {status}: {stderr}")]
    CommandFailed {
        module: String,
        status: i32,
        stderr: String,
    },

    /// The engine process could not be started at all.
    #[error("could not launch {module}: {reason}")]
    Launch { module: String, reason: String },

    /// The command succeeded but its output lacked an expected value.
    #[error("{module} returned unusable output: {detail}")]
    UnexpectedOutput { module: String, detail: String },
}

impl EngineError {
    /// Name of the engine module that failed.
    pub fn module(&self) -> &str {
        match self {
            EngineError::CommandFailed { module, .. }
            | EngineError::Launch { module, .. }
            | EngineError::UnexpectedOutput { module, .. } => module,
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("scope conflict: scope #{active} is still active")]
    ScopeConflict { active: u64 },

    #[error("external command failed: {0}")]
    ExternalCommandFailed(#[from] EngineError),

    #[error("stage {stage} is missing input products: {}", join_ids(.missing))]
    MissingDependency { stage: String, missing: Vec<ProductId> },

    #[error("interrupted")]
    Cancelled,

    #[error("invalid basin: {0}")]
    InvalidBasin(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    /// Errors the stage executor records instead of propagating.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::ExternalCommandFailed(_) | PipelineError::MissingDependency { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse study file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate basin map identifier '{0}'")]
    DuplicateBasin(String),

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("basin map identifier '{basin}' {detail}")]
    NameClash { basin: String, detail: String },

    #[error("{0}")]
    Invalid(String),
}

fn join_ids(ids: &[ProductId]) -> String {
    ids.iter().map(ProductId::as_str).collect::<Vec<_>>().join(", ")
}
