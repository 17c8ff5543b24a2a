//! Study configuration.
//!
//! A study is described by one TOML file. Engine location settings can be
//! overridden from the environment (`GISDBASE`, `LOCATION_NAME`, `MAPSET`,
//! `GRASS_EXECUTABLE`); the rest of the crate only ever sees the resolved
//! structs below.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::basin::Basin;
use crate::climate::YearMonth;
use crate::error::ConfigError;
use crate::stages::{ProductNames, StageKind};

// ── Engine ────────────────────────────────────────────────────────────────────

/// `[engine]` section as written in the study file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineSection {
    pub executable: Option<String>,
    pub gisdbase: Option<PathBuf>,
    pub location: Option<String>,
    pub mapset: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

/// Resolved engine location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSettings {
    pub executable: String,
    pub gisdbase: PathBuf,
    pub location: String,
    pub mapset: String,
    pub verbose: bool,
}

impl EngineSettings {
    /// Merge `section` with environment overrides looked up through `env`.
    pub fn resolve(
        section: &EngineSection,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let executable = env("GRASS_EXECUTABLE")
            .or_else(|| section.executable.clone())
            .unwrap_or_else(|| "grass".to_string());
        let gisdbase = env("GISDBASE")
            .map(PathBuf::from)
            .or_else(|| section.gisdbase.clone())
            .ok_or_else(|| ConfigError::Invalid("GISDBASE is not set".into()))?;
        let location = env("LOCATION_NAME")
            .or_else(|| section.location.clone())
            .ok_or_else(|| ConfigError::Invalid("LOCATION_NAME is not set".into()))?;
        let mapset = env("MAPSET")
            .or_else(|| section.mapset.clone())
            .ok_or_else(|| ConfigError::Invalid("MAPSET is not set".into()))?;

        Ok(Self {
            executable,
            gisdbase,
            location,
            mapset,
            verbose: section.verbose,
        })
    }

    /// `<gisdbase>/<location>/<mapset>`, the path `grass --exec` expects.
    pub fn mapset_path(&self) -> PathBuf {
        self.gisdbase.join(&self.location).join(&self.mapset)
    }
}

// ── Region & parameters ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
    pub resolution: f64,
}

impl RegionConfig {
    fn validate(&self, what: &str) -> Result<(), ConfigError> {
        if !(self.south < self.north && self.west < self.east) {
            return Err(ConfigError::Invalid(format!(
                "{what}: bounds must satisfy south < north and west < east"
            )));
        }
        if !(self.resolution > 0.0) {
            return Err(ConfigError::Invalid(format!("{what}: resolution must be positive")));
        }
        Ok(())
    }
}

/// Pre-existing maps the study starts from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputsConfig {
    /// High-resolution surface model with holes.
    pub fine_dem: String,
    /// Coarse model used to patch the holes.
    pub coarse_dem: String,
    pub reference_stations: String,
    /// Station attribute holding the river name matched against basin names.
    pub station_label_column: String,
}

impl Default for InputsConfig {
    fn default() -> Self {
        Self {
            fine_dem: "panama_30m_dem@PERMANENT".into(),
            coarse_dem: "panama_90m_dem@PERMANENT".into(),
            reference_stations: "stations@PERMANENT".into(),
            station_label_column: "str_1".into(),
        }
    }
}

/// Tuning passed through to engine modules.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Minimum flow accumulation for a stream cell.
    pub threshold: u32,
    /// Memory budget (MB) for modules that accept one.
    pub memory: u32,
    pub contour_step: u32,
    pub zscale: f64,
    pub brighten: i64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            threshold: 1000,
            memory: 12000,
            contour_step: 50,
            zscale: 3.0,
            brighten: 20,
        }
    }
}

// ── Basins & stages ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BasinConfig {
    pub name: String,
    /// Map identifier; derived from `name` when omitted.
    pub map: Option<String>,
    pub outlet: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreparationConfig {
    pub stages: Vec<String>,
}

impl Default for PreparationConfig {
    fn default() -> Self {
        Self {
            stages: StageKind::PREPARATION.iter().map(|k| k.as_str().to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Per-basin resolution; the study resolution when omitted.
    pub resolution: Option<f64>,
    pub stages: Vec<String>,
    /// Product suffixes removed once the batch has finished.
    pub discard: Vec<String>,
    pub statistics_csv: PathBuf,
    pub report: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            resolution: None,
            stages: StageKind::BASIN.iter().map(|k| k.as_str().to_string()).collect(),
            discard: Vec::new(),
            statistics_csv: PathBuf::from("basin_stats.csv"),
            report: None,
        }
    }
}

/// One monthly climate series summarized by `climate_stats`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClimateSeriesConfig {
    /// Series name, also the prefix of the working copies.
    pub name: String,
    /// Raster name prefix in the source mapset, e.g. "temperature".
    pub source_prefix: String,
    pub source_mapset: String,
    /// Multiplier applied when copying, e.g. 0.1 for tenths of a degree.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// CSV column label for the mean value.
    pub column: String,
    /// First month, "YYYY-MM".
    pub start: String,
    /// Last month (inclusive), "YYYY-MM".
    pub end: String,
    pub region: RegionConfig,
    pub output: PathBuf,
    /// Keep the per-month working copies instead of removing them at exit.
    #[serde(default)]
    pub keep_copies: bool,
}

fn default_scale() -> f64 {
    1.0
}

impl ClimateSeriesConfig {
    pub fn months(&self) -> Result<(YearMonth, YearMonth), ConfigError> {
        let start: YearMonth = self.start.parse()?;
        let end: YearMonth = self.end.parse()?;
        if end < start {
            return Err(ConfigError::Invalid(format!(
                "climate series '{}': end {} precedes start {}",
                self.name, self.end, self.start
            )));
        }
        Ok((start, end))
    }
}

// ── Study ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StudyConfig {
    #[serde(default)]
    pub engine: EngineSection,
    pub region: RegionConfig,
    #[serde(default)]
    pub inputs: InputsConfig,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub basins: Vec<BasinConfig>,
    #[serde(default)]
    pub preparation: PreparationConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub climate: Vec<ClimateSeriesConfig>,
}

impl StudyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StudyConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.region.validate("region")?;
        if let Some(res) = self.analysis.resolution {
            if !(res > 0.0) {
                return Err(ConfigError::Invalid("analysis.resolution must be positive".into()));
            }
        }
        self.basins()?;
        self.preparation_stages()?;
        self.analysis_stages()?;
        for series in &self.climate {
            series.region.validate(&format!("climate series '{}'", series.name))?;
            series.months()?;
        }
        Ok(())
    }

    /// Basins in configuration order.
    ///
    /// Map identifiers must be unique and must keep every derived product name
    /// unique: an id may not name a study map, and may not extend another id
    /// far enough to reach into its products (`rio` and `rio_shaded` would
    /// both write `rio_shaded_relief`).
    pub fn basins(&self) -> Result<Vec<Basin>, ConfigError> {
        let mut seen = HashSet::new();
        let mut basins = Vec::with_capacity(self.basins.len());
        for entry in &self.basins {
            let basin = match &entry.map {
                Some(map) => Basin::new(&entry.name, map, entry.outlet.clone()),
                None => Basin::from_name(&entry.name, entry.outlet.clone()),
            }
            .map_err(|e| ConfigError::Invalid(format!("basin '{}': {e}", entry.name)))?;
            if !seen.insert(basin.map_id().to_string()) {
                return Err(ConfigError::DuplicateBasin(basin.map_id().to_string()));
            }
            basins.push(basin);
        }
        check_product_namespaces(&basins, &ProductNames::collect(self))?;
        Ok(basins)
    }

    pub fn preparation_stages(&self) -> Result<Vec<StageKind>, ConfigError> {
        self.preparation.stages.iter().map(|s| s.parse()).collect()
    }

    pub fn analysis_stages(&self) -> Result<Vec<StageKind>, ConfigError> {
        self.analysis.stages.iter().map(|s| s.parse()).collect()
    }

    pub fn analysis_resolution(&self) -> f64 {
        self.analysis.resolution.unwrap_or(self.region.resolution)
    }
}

fn check_product_namespaces(basins: &[Basin], names: &ProductNames) -> Result<(), ConfigError> {
    for basin in basins {
        let id = basin.map_id();
        if names.study.contains(id) {
            return Err(ConfigError::NameClash {
                basin: id.to_string(),
                detail: "is also the name of a study map".into(),
            });
        }
        for other in basins {
            let Some(rest) = id.strip_prefix(other.map_id()).and_then(|r| r.strip_prefix('_')) else {
                continue;
            };
            if let Some(suffix) = names.overlapping_suffix(rest) {
                return Err(ConfigError::NameClash {
                    basin: id.to_string(),
                    detail: format!(
                        "overlaps basin '{}': both would name '{}_{suffix}'",
                        other.map_id(),
                        other.map_id()
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUDY: &str = r#"
        [engine]
        gisdbase = "/data/grassdata"
        location = "panama"
        mapset = "study"

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
        name = "Upper Rio Chagres"
        map = "rio_chagres"

        [[basins]]
        name = "Rio Gatun"

        [analysis]
        stages = ["clip_elevation", "compute_slope", "compute_stats"]
        discard = ["relief"]
    "#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn parses_a_study_file_with_defaults() {
        let config = StudyConfig::from_toml_str(STUDY).unwrap();
        assert_eq!(config.parameters, Parameters::default());
        assert_eq!(config.inputs.fine_dem, "panama_30m_dem@PERMANENT");
        assert_eq!(config.analysis_resolution(), 30.0);
        assert_eq!(config.analysis.statistics_csv, PathBuf::from("basin_stats.csv"));
        assert_eq!(
            config.analysis_stages().unwrap(),
            vec![StageKind::ClipElevation, StageKind::ComputeSlope, StageKind::ComputeStats]
        );
        assert_eq!(config.preparation_stages().unwrap().len(), StageKind::PREPARATION.len());
    }

    #[test]
    fn basins_keep_order_and_derive_missing_ids() {
        let config = StudyConfig::from_toml_str(STUDY).unwrap();
        let ids: Vec<String> = config
            .basins()
            .unwrap()
            .iter()
            .map(|b| b.map_id().to_string())
            .collect();
        assert_eq!(ids, vec!["rio_trinidad", "rio_chagres", "rio_gatun"]);
    }

    #[test]
    fn duplicate_map_ids_are_rejected() {
        let text = STUDY.replace("name = \"Rio Gatun\"", "name = \"Rio Gatun\"\nmap = \"rio_trinidad\"");
        assert!(matches!(
            StudyConfig::from_toml_str(&text),
            Err(ConfigError::DuplicateBasin(id)) if id == "rio_trinidad"
        ));
    }

    #[test]
    fn basin_ids_reaching_into_another_basins_products_are_rejected() {
        let text = STUDY.replace("map = \"rio_chagres\"", "map = \"rio_trinidad_shaded\"");
        match StudyConfig::from_toml_str(&text) {
            Err(ConfigError::NameClash { basin, detail }) => {
                assert_eq!(basin, "rio_trinidad_shaded");
                assert!(detail.contains("rio_trinidad_shaded_relief"), "{detail}");
            }
            other => panic!("expected a name clash, got {other:?}"),
        }
    }

    #[test]
    fn basin_ids_sharing_a_plain_prefix_are_accepted() {
        let text = STUDY.replace("map = \"rio_chagres\"", "map = \"rio_trinidad_upper\"");
        let ids: Vec<String> = StudyConfig::from_toml_str(&text)
            .unwrap()
            .basins()
            .unwrap()
            .iter()
            .map(|b| b.map_id().to_string())
            .collect();
        assert!(ids.contains(&"rio_trinidad_upper".to_string()));
    }

    #[test]
    fn basin_ids_naming_study_maps_are_rejected() {
        for reserved in ["stations", "basins", "streams", "panama_30m_dem"] {
            let text = STUDY.replace("map = \"rio_chagres\"", &format!("map = \"{reserved}\""));
            assert!(
                matches!(
                    StudyConfig::from_toml_str(&text),
                    Err(ConfigError::NameClash { basin, .. }) if basin == reserved
                ),
                "{reserved}"
            );
        }
    }

    #[test]
    fn unknown_stage_names_are_rejected() {
        let text = STUDY.replace("\"compute_stats\"", "\"render_3d\"");
        assert!(matches!(
            StudyConfig::from_toml_str(&text),
            Err(ConfigError::UnknownStage(name)) if name == "render_3d"
        ));
    }

    #[test]
    fn inverted_region_is_rejected() {
        let text = STUDY.replace("south = 952000", "south = 1172000");
        assert!(matches!(StudyConfig::from_toml_str(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn environment_overrides_the_study_file() {
        let config = StudyConfig::from_toml_str(STUDY).unwrap();
        let settings = EngineSettings::resolve(&config.engine, |key| match key {
            "MAPSET" => Some("scratch".to_string()),
            "GRASS_EXECUTABLE" => Some("grass84".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(settings.mapset, "scratch");
        assert_eq!(settings.executable, "grass84");
        assert_eq!(settings.mapset_path(), PathBuf::from("/data/grassdata/panama/scratch"));
    }

    #[test]
    fn missing_engine_location_is_an_error() {
        let section = EngineSection::default();
        assert!(EngineSettings::resolve(&section, no_env).is_err());
        let settings = EngineSettings::resolve(&section, |key| match key {
            "GISDBASE" => Some("/g".into()),
            "LOCATION_NAME" => Some("loc".into()),
            "MAPSET" => Some("ms".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(settings.executable, "grass");
    }

    #[test]
    fn bundled_study_file_is_valid() {
        let config = StudyConfig::from_toml_str(include_str!("../../../study.toml")).unwrap();
        assert_eq!(config.basins().unwrap().len(), 7);
        assert_eq!(config.climate.len(), 2);
        assert_eq!(config.climate[1].scale, 1.0);
        assert_eq!(config.analysis_stages().unwrap(), StageKind::BASIN.to_vec());
    }

    #[test]
    fn climate_series_months_are_validated() {
        let text = format!(
            "{STUDY}\n{}",
            r#"
            [[climate]]
            name = "temperature"
            source_prefix = "temperature"
            source_mapset = "temperature"
            scale = 0.1
            column = "Temperature(degC)"
            start = "1998-01"
            end = "2015-12"
            output = "temperature_stats.csv"
            [climate.region]
            north = 10
            south = 8
            east = -78
            west = -80
            resolution = 0.3
            "#
        );
        let config = StudyConfig::from_toml_str(&text).unwrap();
        let (start, end) = config.climate[0].months().unwrap();
        assert_eq!(start.months_until(end), 215);

        let bad = text.replace("end = \"2015-12\"", "end = \"1997-12\"");
        assert!(StudyConfig::from_toml_str(&bad).is_err());
    }
}
