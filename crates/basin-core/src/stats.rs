//! Per-basin summary statistics and the process-wide result table.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::basin::Basin;
use crate::engine::{EngineCommand, EngineOutput};
use crate::error::{EngineError, PipelineError};

// ── Univariate summaries ──────────────────────────────────────────────────────

/// `r.univar -g` restricted to the values the study reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnivarSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl UnivarSummary {
    pub fn command(map: &str) -> EngineCommand {
        EngineCommand::new("r.univar")
            .param("map", map)
            .param("separator", "newline")
            .flags("g")
    }

    pub fn from_output(output: &EngineOutput) -> Result<Self, EngineError> {
        let field = |key: &str| -> Result<f64, EngineError> {
            let raw = output.get(key).ok_or_else(|| EngineError::UnexpectedOutput {
                module: "r.univar".into(),
                detail: format!("missing '{key}'"),
            })?;
            raw.parse::<f64>().map_err(|_| EngineError::UnexpectedOutput {
                module: "r.univar".into(),
                detail: format!("'{key}' is not a number: '{raw}'"),
            })
        };
        Ok(Self {
            min: field("min")?,
            max: field("max")?,
            mean: field("mean")?,
        })
    }
}

// ── Statistics record ─────────────────────────────────────────────────────────

/// One measurement in a basin's summary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatField {
    MeanElevation,
    MinElevation,
    MaxElevation,
    MeanSlope,
    MaxSlope,
    MinSlope,
}

impl StatField {
    /// Column order of the statistics CSV.
    pub const ALL: [StatField; 6] = [
        StatField::MeanElevation,
        StatField::MinElevation,
        StatField::MaxElevation,
        StatField::MeanSlope,
        StatField::MaxSlope,
        StatField::MinSlope,
    ];
}

/// Statistics gathered by the stages of one basin so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialStatistics {
    values: BTreeMap<StatField, f64>,
}

impl PartialStatistics {
    pub fn record(&mut self, field: StatField, value: f64) {
        self.values.insert(field, value);
    }

    pub fn get(&self, field: StatField) -> Option<f64> {
        self.values.get(&field).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn missing(&self) -> Vec<StatField> {
        StatField::ALL
            .into_iter()
            .filter(|f| !self.values.contains_key(f))
            .collect()
    }

    /// The finished row, or `None` while any field is missing.
    pub fn complete(&self, basin: &Basin) -> Option<StatisticsRecord> {
        let v = |f: StatField| self.get(f);
        Some(StatisticsRecord {
            map_id: basin.map_id().to_string(),
            name: basin.name().to_string(),
            mean_elevation: v(StatField::MeanElevation)?,
            min_elevation: v(StatField::MinElevation)?,
            max_elevation: v(StatField::MaxElevation)?,
            mean_slope: v(StatField::MeanSlope)?,
            max_slope: v(StatField::MaxSlope)?,
            min_slope: v(StatField::MinSlope)?,
        })
    }
}

/// Summary row for one basin. Field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsRecord {
    #[serde(skip)]
    pub map_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "MeanElevation")]
    pub mean_elevation: f64,
    #[serde(rename = "MinElevation")]
    pub min_elevation: f64,
    #[serde(rename = "MaxElevation")]
    pub max_elevation: f64,
    #[serde(rename = "MeanSlope")]
    pub mean_slope: f64,
    #[serde(rename = "MaxSlope")]
    pub max_slope: f64,
    #[serde(rename = "MinSlope")]
    pub min_slope: f64,
}

impl StatisticsRecord {
    /// The six numeric fields in column order.
    pub fn values(&self) -> [f64; 6] {
        [
            self.mean_elevation,
            self.min_elevation,
            self.max_elevation,
            self.mean_slope,
            self.max_slope,
            self.min_slope,
        ]
    }
}

// ── Result table ──────────────────────────────────────────────────────────────

/// Process-wide statistics, one row per basin in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StatisticsTable {
    records: Vec<StatisticsRecord>,
}

impl StatisticsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `record`; a later record for the same basin replaces the earlier one.
    pub fn upsert(&mut self, record: StatisticsRecord) {
        match self.records.iter_mut().find(|r| r.map_id == record.map_id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn records(&self) -> &[StatisticsRecord] {
        &self.records
    }

    pub fn get(&self, map_id: &str) -> Option<&StatisticsRecord> {
        self.records.iter().find(|r| r.map_id == map_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the table as CSV with header
    /// `Name,MeanElevation,MinElevation,MaxElevation,MeanSlope,MaxSlope,MinSlope`.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), PipelineError> {
        let mut csv = csv::Writer::from_writer(writer);
        if self.records.is_empty() {
            csv.write_record(CSV_HEADER)?;
        }
        for record in &self.records {
            csv.serialize(record)?;
        }
        csv.flush()?;
        Ok(())
    }

    pub fn write_csv_file(&self, path: &Path) -> Result<(), PipelineError> {
        self.write_csv(File::create(path)?)
    }
}

const CSV_HEADER: [&str; 7] = [
    "Name",
    "MeanElevation",
    "MinElevation",
    "MaxElevation",
    "MeanSlope",
    "MaxSlope",
    "MinSlope",
];
