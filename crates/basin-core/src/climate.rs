//! Monthly climate series summaries.
//!
//! Each month's source raster is copied into the working mapset (scaled on the
//! way in), summarized with `r.univar`, and the mean recorded against the first
//! day of the month. A month that fails is logged and skipped; the cursor
//! always moves on to the next month.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};
use serde::Serialize;

use crate::config::ClimateSeriesConfig;
use crate::engine::{Engine, EngineCommand, MapElement};
use crate::error::{ConfigError, PipelineError};
use crate::naming::ProductId;
use crate::scope::ScopeSpec;
use crate::session::Session;
use crate::stats::UnivarSummary;

// ── Months ────────────────────────────────────────────────────────────────────

/// A calendar month, stored as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct YearMonth(NaiveDate);

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(YearMonth)
    }

    pub fn first_day(self) -> NaiveDate {
        self.0
    }

    pub fn year(self) -> i32 {
        self.0.year()
    }

    pub fn month(self) -> u32 {
        self.0.month()
    }

    /// The month `count` months later.
    pub fn plus(self, count: u32) -> Option<Self> {
        self.0.checked_add_months(Months::new(count)).map(YearMonth)
    }

    /// Number of months from `self` to `end`; zero when `end` is earlier.
    pub fn months_until(self, end: YearMonth) -> u32 {
        let diff = (end.year() - self.year()) * 12 + end.month() as i32 - self.month() as i32;
        diff.max(0) as u32
    }

    /// Every month from `self` to `end`, both included.
    pub fn through(self, end: YearMonth) -> impl Iterator<Item = YearMonth> {
        (0..=self.months_until(end)).filter_map(move |i| self.plus(i))
    }

    /// Map name fragment, e.g. `1998_01`.
    pub fn tag(self) -> String {
        format!("{:04}_{:02}", self.year(), self.month())
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for YearMonth {
    type Err = ConfigError;

    /// Parse `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("'{s}' is not a YYYY-MM month"));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        YearMonth::new(year, month).ok_or_else(invalid)
    }
}

// ── Summaries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateRecord {
    pub time: NaiveDate,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateSummary {
    pub series: String,
    pub column: String,
    pub records: Vec<ClimateRecord>,
    /// Months that could not be summarized.
    pub failed: Vec<YearMonth>,
}

impl ClimateSummary {
    /// Two columns: `Time` and the series' label.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), PipelineError> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(["Time", self.column.as_str()])?;
        for record in &self.records {
            csv.write_record([
                record.time.format("%Y-%m-%d").to_string(),
                record.mean.to_string(),
            ])?;
        }
        csv.flush()?;
        Ok(())
    }

    pub fn write_csv_file(&self, path: &Path) -> Result<(), PipelineError> {
        self.write_csv(File::create(path)?)
    }
}

/// `r.mapcalc` copying one month of `series` into the working mapset.
pub fn copy_command(series: &ClimateSeriesConfig, month: YearMonth) -> EngineCommand {
    let tag = month.tag();
    let source = format!("{}_{tag}@{}", series.source_prefix, series.source_mapset);
    let expression = if series.scale == 1.0 {
        format!("{}_{tag} = {source}", series.name)
    } else {
        format!("{}_{tag} = {source} * {}", series.name, series.scale)
    };
    EngineCommand::new("r.mapcalc")
        .param("expression", expression)
        .overwrite()
}

/// Summarize every month of `series` under its own unmasked region.
///
/// Only setup failures and interrupts are returned as errors: an invalid
/// month range, a scope that cannot be acquired, a non-engine error while
/// summarizing, or `Cancelled` between months.
pub fn summarize_series<E: Engine>(
    session: &mut Session<E>,
    series: &ClimateSeriesConfig,
) -> Result<ClimateSummary, PipelineError> {
    let (start, end) = series.months()?;
    let mut summary = ClimateSummary {
        series: series.name.clone(),
        column: series.column.clone(),
        records: Vec::new(),
        failed: Vec::new(),
    };

    let mut guard = session.scoped(&ScopeSpec::study(&series.region))?;
    for month in start.through(end) {
        guard.check_cancelled()?;
        let copy = ProductId::new(format!("{}_{}", series.name, month.tag()));
        if !series.keep_copies {
            guard.register_temporary(MapElement::Raster, copy.clone());
        }

        let result = guard
            .engine()
            .run(&copy_command(series, month))
            .and_then(|_| guard.engine().run(&UnivarSummary::command(copy.as_str())))
            .and_then(|out| UnivarSummary::from_output(&out));

        match result {
            Ok(stats) => summary.records.push(ClimateRecord {
                time: month.first_day(),
                mean: stats.mean,
            }),
            Err(e) => {
                tracing::warn!(series = %series.name, month = %month, error = %e, "month skipped");
                summary.failed.push(month);
            }
        }
    }
    guard.release()?;

    tracing::info!(
        series = %series.name,
        months = summary.records.len(),
        failed = summary.failed.len(),
        "climate series summarized"
    );
    Ok(summary)
}
