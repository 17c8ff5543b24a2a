//! Concrete study stages: terrain, hydrology and statistics.
//!
//! Stages are selected by name in the study file and built here from the
//! study configuration. The same stage type runs study-wide and per basin; only
//! the unit its products are named for differs.
pub mod hydrology;
pub mod statistics;
pub mod terrain;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::basin::Basin;
use crate::config::StudyConfig;
use crate::error::ConfigError;
use crate::stage::{Product, Stage};

use hydrology::{CopyStations, DelineateBasins, ExtractBasinVectors, ExtractStreams, FlowAccumulation, SnapStations};
use statistics::ComputeStats;
use terrain::{Clip, ComputeContours, ComputeRelief, ComputeSkyview, ComputeSlope, ConditionElevation, PatchElevation, ShadeRelief};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    PatchElevation,
    ConditionElevation,
    ComputeRelief,
    ShadeRelief,
    CopyStations,
    FlowAccumulation,
    ExtractStreams,
    SnapStations,
    DelineateBasins,
    ExtractBasinVectors,
    ClipElevation,
    ClipAccumulation,
    ComputeSlope,
    ComputeContours,
    ComputeSkyview,
    ComputeStats,
}

impl StageKind {
    /// Study-wide preparation, in dependency order.
    pub const PREPARATION: [StageKind; 10] = [
        StageKind::PatchElevation,
        StageKind::ConditionElevation,
        StageKind::ComputeRelief,
        StageKind::ShadeRelief,
        StageKind::CopyStations,
        StageKind::FlowAccumulation,
        StageKind::ExtractStreams,
        StageKind::SnapStations,
        StageKind::DelineateBasins,
        StageKind::ExtractBasinVectors,
    ];

    /// Per-basin analysis, in dependency order.
    pub const BASIN: [StageKind; 9] = [
        StageKind::ClipElevation,
        StageKind::ClipAccumulation,
        StageKind::ComputeSlope,
        StageKind::ComputeContours,
        StageKind::ComputeRelief,
        StageKind::ShadeRelief,
        StageKind::ComputeSkyview,
        StageKind::ExtractStreams,
        StageKind::ComputeStats,
    ];

    const ALL: [StageKind; 16] = [
        StageKind::PatchElevation,
        StageKind::ConditionElevation,
        StageKind::ComputeRelief,
        StageKind::ShadeRelief,
        StageKind::CopyStations,
        StageKind::FlowAccumulation,
        StageKind::ExtractStreams,
        StageKind::SnapStations,
        StageKind::DelineateBasins,
        StageKind::ExtractBasinVectors,
        StageKind::ClipElevation,
        StageKind::ClipAccumulation,
        StageKind::ComputeSlope,
        StageKind::ComputeContours,
        StageKind::ComputeSkyview,
        StageKind::ComputeStats,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::PatchElevation => "patch_elevation",
            StageKind::ConditionElevation => "condition_elevation",
            StageKind::ComputeRelief => "compute_relief",
            StageKind::ShadeRelief => "shade_relief",
            StageKind::CopyStations => "copy_stations",
            StageKind::FlowAccumulation => "flow_accumulation",
            StageKind::ExtractStreams => "extract_streams",
            StageKind::SnapStations => "snap_stations",
            StageKind::DelineateBasins => "delineate_basins",
            StageKind::ExtractBasinVectors => "extract_basin_vectors",
            StageKind::ClipElevation => "clip_elevation",
            StageKind::ClipAccumulation => "clip_accumulation",
            StageKind::ComputeSlope => "compute_slope",
            StageKind::ComputeContours => "compute_contours",
            StageKind::ComputeSkyview => "compute_skyview",
            StageKind::ComputeStats => "compute_stats",
        }
    }

    /// Construct the stage with its parameters taken from `config`.
    ///
    /// `basins` is only read by `extract_basin_vectors`, which writes one
    /// vector per basin.
    pub fn build(self, config: &StudyConfig, basins: &[Basin]) -> Box<dyn Stage> {
        let p = &config.parameters;
        match self {
            StageKind::PatchElevation => Box::new(PatchElevation {
                fine: config.inputs.fine_dem.clone(),
                coarse: config.inputs.coarse_dem.clone(),
            }),
            StageKind::ConditionElevation => Box::new(ConditionElevation { memory: p.memory }),
            StageKind::ComputeRelief => Box::new(ComputeRelief { zscale: p.zscale }),
            StageKind::ShadeRelief => Box::new(ShadeRelief { brighten: p.brighten }),
            StageKind::CopyStations => Box::new(CopyStations {
                source: config.inputs.reference_stations.clone(),
            }),
            StageKind::FlowAccumulation => Box::new(FlowAccumulation),
            StageKind::ExtractStreams => Box::new(ExtractStreams {
                threshold: p.threshold,
                memory: p.memory,
            }),
            StageKind::SnapStations => Box::new(SnapStations { memory: p.memory }),
            StageKind::DelineateBasins => Box::new(DelineateBasins { memory: p.memory }),
            StageKind::ExtractBasinVectors => Box::new(ExtractBasinVectors {
                label_column: config.inputs.station_label_column.clone(),
                basins: basins.to_vec(),
            }),
            StageKind::ClipElevation => Box::new(Clip::new("clip_elevation", "elevation")),
            StageKind::ClipAccumulation => Box::new(Clip::new("clip_accumulation", "accumulation")),
            StageKind::ComputeSlope => Box::new(ComputeSlope),
            StageKind::ComputeContours => Box::new(ComputeContours { step: p.contour_step }),
            StageKind::ComputeSkyview => Box::new(ComputeSkyview),
            StageKind::ComputeStats => Box::new(ComputeStats),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownStage(s.to_string()))
    }
}

/// Every name the stages can read or write under `config`.
#[derive(Debug, Default)]
pub struct ProductNames {
    /// Suffixes of per-unit products, e.g. `shaded_relief`.
    pub suffixes: BTreeSet<String>,
    /// Map names outside any basin namespace: study-wide products and
    /// configured inputs, without their mapset qualifier.
    pub study: BTreeSet<String>,
}

impl ProductNames {
    pub fn collect(config: &StudyConfig) -> Self {
        let mut names = Self::default();
        for kind in StageKind::ALL {
            let stage = kind.build(config, &[]);
            for product in stage.inputs().into_iter().chain(stage.outputs()) {
                match product {
                    Product::Local { suffix, .. } => {
                        names.study.insert(suffix.clone());
                        names.suffixes.insert(suffix);
                    }
                    Product::Shared { name, .. } => {
                        let base = name.as_str().split('@').next().unwrap_or_default();
                        names.study.insert(base.to_string());
                    }
                }
            }
        }
        names
    }

    /// A suffix that makes `<prefix>_<suffix>` ambiguous when another basin's
    /// map id is `<prefix>_<rest>`, i.e. the suffix equals `rest` or starts
    /// with `rest_`.
    pub fn overlapping_suffix(&self, rest: &str) -> Option<&str> {
        let nested = format!("{rest}_");
        self.suffixes
            .iter()
            .find(|s| s.as_str() == rest || s.starts_with(&nested))
            .map(String::as_str)
    }
}

/// Build `kinds` in order.
pub fn build_all(kinds: &[StageKind], config: &StudyConfig, basins: &[Basin]) -> Vec<Box<dyn Stage>> {
    kinds.iter().map(|k| k.build(config, basins)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for kind in StageKind::ALL {
            assert_eq!(kind.as_str().parse::<StageKind>().unwrap(), kind);
        }
        assert!(matches!(
            "render_3d".parse::<StageKind>(),
            Err(ConfigError::UnknownStage(_))
        ));
    }

    #[test]
    fn product_names_cover_suffixes_and_study_maps() {
        let config = StudyConfig::from_toml_str(
            "[region]\nnorth = 10\nsouth = 0\neast = 10\nwest = 0\nresolution = 1\n",
        )
        .unwrap();
        let names = ProductNames::collect(&config);
        assert!(names.suffixes.contains("shaded_relief"));
        assert!(names.suffixes.contains("snapped_stations"));
        for study_map in ["stations", "basins", "streams", "elevation", "panama_30m_dem"] {
            assert!(names.study.contains(study_map), "{study_map}");
        }
        assert_eq!(names.overlapping_suffix("shaded"), Some("shaded_relief"));
        assert_eq!(names.overlapping_suffix("slope"), Some("slope"));
        assert_eq!(names.overlapping_suffix("gatun"), None);
    }

    #[test]
    fn built_stage_reports_its_configured_name() {
        let config = StudyConfig::from_toml_str(
            "[region]\nnorth = 10\nsouth = 0\neast = 10\nwest = 0\nresolution = 1\n",
        )
        .unwrap();
        for kind in StageKind::PREPARATION.into_iter().chain(StageKind::BASIN) {
            assert_eq!(kind.build(&config, &[]).name(), kind.as_str());
        }
    }
}
