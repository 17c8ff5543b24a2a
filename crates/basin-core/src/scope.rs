//! Region/mask scoping.
//!
//! The engine's computational region and raster mask are process-wide state.
//! `ScopeManager` models them as a single slot: at most one scope is active,
//! and every acquisition is paired with exactly one effective release.

use serde::Serialize;

use crate::basin::Basin;
use crate::config::RegionConfig;
use crate::engine::{Engine, EngineCommand};
use crate::error::PipelineError;

// ── Scope description ─────────────────────────────────────────────────────────

/// Geographic extent applied through `g.region`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Extent {
    Bounds {
        north: f64,
        south: f64,
        east: f64,
        west: f64,
        resolution: f64,
    },
    /// Align to the bounding box of a vector map.
    Vector { map: String, resolution: f64 },
    /// Align to a raster map's extent.
    Raster { map: String, resolution: f64 },
}

/// Source of the raster mask applied through `r.mask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "map", rename_all = "snake_case")]
pub enum MaskSource {
    Vector(String),
    Raster(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSpec {
    pub extent: Extent,
    pub mask: Option<MaskSource>,
}

impl ScopeSpec {
    /// Study-wide scope: configured bounding box, no mask.
    pub fn study(region: &RegionConfig) -> Self {
        Self {
            extent: Extent::Bounds {
                north: region.north,
                south: region.south,
                east: region.east,
                west: region.west,
                resolution: region.resolution,
            },
            mask: None,
        }
    }

    /// Basin scope: extent of the basin vector, masked by the same vector.
    pub fn basin(basin: &Basin, resolution: f64) -> Self {
        Self {
            extent: Extent::Vector {
                map: basin.map_id().to_string(),
                resolution,
            },
            mask: Some(MaskSource::Vector(basin.map_id().to_string())),
        }
    }
}

pub(crate) fn region_command(extent: &Extent) -> EngineCommand {
    match extent {
        Extent::Bounds { north, south, east, west, resolution } => EngineCommand::new("g.region")
            .param("n", *north)
            .param("s", *south)
            .param("e", *east)
            .param("w", *west)
            .param("res", *resolution),
        Extent::Vector { map, resolution } => EngineCommand::new("g.region")
            .param("vector", map)
            .param("res", *resolution),
        Extent::Raster { map, resolution } => EngineCommand::new("g.region")
            .param("raster", map)
            .param("res", *resolution),
    }
}

pub(crate) fn mask_command(mask: &MaskSource) -> EngineCommand {
    let cmd = match mask {
        MaskSource::Vector(map) => EngineCommand::new("r.mask").param("vector", map),
        MaskSource::Raster(map) => EngineCommand::new("r.mask").param("raster", map),
    };
    cmd.overwrite()
}

pub(crate) fn unmask_command() -> EngineCommand {
    EngineCommand::new("r.mask").flags("r")
}

pub(crate) fn default_region_command() -> EngineCommand {
    EngineCommand::new("g.region").flags("d")
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Token for one acquisition. Copyable so release can be attempted from any
/// exit path; only the first release of the active handle has an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeHandle {
    id: u64,
}

impl ScopeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveScope {
    id: u64,
    masked: bool,
}

/// Acquisition bookkeeping, exposed for auditing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScopeStats {
    pub acquired: u64,
    pub released: u64,
    /// Releases that found nothing to release.
    pub noop_releases: u64,
}

#[derive(Debug, Default)]
pub struct ScopeManager {
    active: Option<ActiveScope>,
    next_id: u64,
    stats: ScopeStats,
}

impl ScopeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_handle(&self) -> Option<ScopeHandle> {
        self.active.map(|a| ScopeHandle { id: a.id })
    }

    pub fn stats(&self) -> ScopeStats {
        self.stats
    }

    /// Apply `spec` to the engine.
    ///
    /// Fails with `ScopeConflict` while another scope is active. If the mask
    /// cannot be set, the region is reset and no scope becomes active.
    pub fn acquire<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        spec: &ScopeSpec,
    ) -> Result<ScopeHandle, PipelineError> {
        if let Some(active) = self.active {
            return Err(PipelineError::ScopeConflict { active: active.id });
        }

        engine.run(&region_command(&spec.extent))?;

        if let Some(mask) = &spec.mask {
            if let Err(e) = engine.run(&mask_command(mask)) {
                if let Err(reset) = engine.run(&default_region_command()) {
                    tracing::warn!(error = %reset, "could not reset region after failed mask");
                }
                return Err(e.into());
            }
        }

        self.next_id += 1;
        self.stats.acquired += 1;
        self.active = Some(ActiveScope { id: self.next_id, masked: spec.mask.is_some() });
        tracing::debug!(scope = self.next_id, mask = ?spec.mask, "scope acquired");
        Ok(ScopeHandle { id: self.next_id })
    }

    /// Tear down the scope identified by `handle`.
    ///
    /// Idempotent: a handle that is not the active one is a no-op. The slot is
    /// freed even when the engine reports an error, which is returned so the
    /// caller can verify the mask is gone.
    pub fn release<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        handle: ScopeHandle,
    ) -> Result<(), PipelineError> {
        let active = match self.active {
            Some(active) if active.id == handle.id => active,
            _ => {
                self.stats.noop_releases += 1;
                return Ok(());
            }
        };
        self.active = None;
        self.stats.released += 1;

        let mut first_err = None;
        if active.masked {
            if let Err(e) = engine.run(&unmask_command()) {
                first_err = Some(e);
            }
        }
        if let Err(e) = engine.run(&default_region_command()) {
            first_err.get_or_insert(e);
        }
        tracing::debug!(scope = active.id, "scope released");

        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RecordingEngine;

    fn basin_spec(id: &str) -> ScopeSpec {
        ScopeSpec::basin(&Basin::new(id, id, None).unwrap(), 30.0)
    }

    #[test]
    fn acquire_sets_region_then_mask() {
        let mut engine = RecordingEngine::new();
        let mut scopes = ScopeManager::new();
        scopes.acquire(&mut engine, &basin_spec("rio_gatun")).unwrap();
        assert_eq!(
            engine.rendered(),
            vec![
                "g.region vector=rio_gatun res=30",
                "r.mask vector=rio_gatun --overwrite",
            ]
        );
        assert!(engine.mask_active());
    }

    #[test]
    fn second_acquire_is_a_conflict() {
        let mut engine = RecordingEngine::new();
        let mut scopes = ScopeManager::new();
        let first = scopes.acquire(&mut engine, &basin_spec("rio_gatun")).unwrap();
        let err = scopes.acquire(&mut engine, &basin_spec("rio_pequini")).unwrap_err();
        assert!(matches!(err, PipelineError::ScopeConflict { active } if active == first.id()));
        // The conflicting acquire must not touch the engine.
        assert_eq!(engine.count("g.region"), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let mut engine = RecordingEngine::new();
        let mut scopes = ScopeManager::new();
        let handle = scopes.acquire(&mut engine, &basin_spec("rio_gatun")).unwrap();
        scopes.release(&mut engine, handle).unwrap();
        scopes.release(&mut engine, handle).unwrap();

        assert!(!engine.mask_active());
        assert_eq!(engine.count("r.mask"), 2, "one set, one removal");
        assert_eq!(
            scopes.stats(),
            ScopeStats { acquired: 1, released: 1, noop_releases: 1 }
        );
    }

    #[test]
    fn release_without_acquire_is_a_noop() {
        let mut engine = RecordingEngine::new();
        let mut scopes = ScopeManager::new();
        let stale = ScopeHandle { id: 7 };
        scopes.release(&mut engine, stale).unwrap();
        assert!(engine.commands().is_empty());
    }

    #[test]
    fn unmasked_scope_release_only_resets_region() {
        let mut engine = RecordingEngine::new();
        let mut scopes = ScopeManager::new();
        let region = RegionConfig {
            north: 1_072_000.0,
            south: 952_000.0,
            east: 694_000.0,
            west: 574_000.0,
            resolution: 30.0,
        };
        let handle = scopes.acquire(&mut engine, &ScopeSpec::study(&region)).unwrap();
        scopes.release(&mut engine, handle).unwrap();
        assert_eq!(engine.count("r.mask"), 0);
        assert_eq!(engine.rendered().last().map(String::as_str), Some("g.region -d"));
    }

    #[test]
    fn failed_mask_leaves_no_active_scope() {
        let mut engine = RecordingEngine::new().fail_on("r.mask", "rio_gatun");
        let mut scopes = ScopeManager::new();
        assert!(scopes.acquire(&mut engine, &basin_spec("rio_gatun")).is_err());
        assert!(!scopes.is_active());
        assert_eq!(engine.rendered().last().map(String::as_str), Some("g.region -d"));

        // The slot is free for the next basin.
        scopes.acquire(&mut engine, &basin_spec("rio_pequini")).unwrap();
    }

    #[test]
    fn failed_release_still_frees_the_slot() {
        let mut engine = RecordingEngine::new().fail_times("r.mask", "-r", 1);
        let mut scopes = ScopeManager::new();
        let handle = scopes.acquire(&mut engine, &basin_spec("rio_gatun")).unwrap();
        assert!(scopes.release(&mut engine, handle).is_err());
        assert!(!scopes.is_active());
        assert_eq!(scopes.stats().released, 1);
    }
}
