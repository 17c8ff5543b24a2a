//! Derived product naming.
//!
//! Every artifact a stage writes is named `<basin map id>_<suffix>`.
//! Study-wide products use the bare suffix. `StudyConfig::basins` rejects map
//! ids that would make two (basin, suffix) pairs share a name, so each basin's
//! map id is a disjoint namespace.

use std::fmt;

use serde::Serialize;

use crate::basin::Basin;

/// Name of a raster or vector map produced by a stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Wrap an existing map name (e.g. a configured input like `stations@PERMANENT`).
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProductId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// `basin.map_id + "_" + suffix`. Pure and deterministic.
pub fn product_name(basin: &Basin, suffix: &str) -> ProductId {
    ProductId(format!("{}_{}", basin.map_id(), suffix))
}

/// The unit of work a stage runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit<'a> {
    /// The whole study area, before basins exist.
    Study,
    Basin(&'a Basin),
}

impl<'a> Unit<'a> {
    /// Product written by this unit for `suffix`.
    pub fn product(&self, suffix: &str) -> ProductId {
        match self {
            Unit::Study => ProductId(suffix.to_string()),
            Unit::Basin(basin) => product_name(basin, suffix),
        }
    }

    /// Short label used in logs and reports.
    pub fn label(&self) -> &'a str {
        match self {
            Unit::Study => "study",
            Unit::Basin(basin) => basin.map_id(),
        }
    }

    pub fn basin(&self) -> Option<&'a Basin> {
        match self {
            Unit::Study => None,
            Unit::Basin(basin) => Some(basin),
        }
    }
}
