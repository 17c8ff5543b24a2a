//! Watershed units processed by the batch pipeline.
//!
//! A basin is delineated around one stream-gage outlet. Basins are created
//! once from the study configuration and never change afterwards.

use serde::Serialize;

use crate::error::PipelineError;

/// One watershed unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Basin {
    /// Human label, e.g. "Rio Trinidad".
    name: String,
    /// Engine map name and product namespace, e.g. "rio_trinidad".
    map_id: String,
    /// Outlet station reference used to delineate the basin.
    outlet: Option<String>,
}

impl Basin {
    /// Create a basin, validating `map_id` as an engine map name.
    pub fn new(
        name: impl Into<String>,
        map_id: impl Into<String>,
        outlet: Option<String>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let map_id = map_id.into();
        validate_map_id(&map_id)?;
        Ok(Self { name, map_id, outlet })
    }

    /// Create a basin whose map identifier is derived from its display name.
    pub fn from_name(name: impl Into<String>, outlet: Option<String>) -> Result<Self, PipelineError> {
        let name = name.into();
        let map_id = normalize_map_id(&name);
        Self::new(name, map_id, outlet)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    pub fn outlet(&self) -> Option<&str> {
        self.outlet.as_deref()
    }
}

/// Lowercase `name` and collapse every run of non-alphanumerics into `_`.
///
/// "Rio Cano Quebrado" → "rio_cano_quebrado", "Upper Rio Chagres" →
/// "upper_rio_chagres".
pub fn normalize_map_id(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn validate_map_id(map_id: &str) -> Result<(), PipelineError> {
    let mut chars = map_id.chars();
    match chars.next() {
        None => return Err(PipelineError::InvalidBasin("empty map identifier".into())),
        Some(c) if !c.is_ascii_lowercase() => {
            return Err(PipelineError::InvalidBasin(format!(
                "map identifier '{map_id}' must start with a lowercase letter"
            )))
        }
        _ => {}
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')) {
        return Err(PipelineError::InvalidBasin(format!(
            "map identifier '{map_id}' contains '{bad}'"
        )));
    }
    Ok(())
}
