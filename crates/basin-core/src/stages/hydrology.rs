//! Flow routing, stream network extraction and basin delineation.

use crate::basin::Basin;
use crate::engine::{EngineCommand, MapElement};
use crate::error::PipelineError;
use crate::stage::{Product, Stage, StageContext};

/// Copy the reference stations into the working mapset unless already there.
pub struct CopyStations {
    pub source: String,
}

impl Stage for CopyStations {
    fn name(&self) -> &str {
        "copy_stations"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::shared_vector(&self.source)]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_vector("stations")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let stations = ctx.product("stations");
        if ctx.exists(MapElement::Vector, stations.as_str())? {
            tracing::debug!(map = %stations, "stations already present");
            return Ok(());
        }
        ctx.run(
            EngineCommand::new("g.copy")
                .param("vector", vec![self.source.as_str(), stations.as_str()]),
        )?;
        Ok(())
    }
}

/// Single-flow-direction accumulation over the conditioned surface.
pub struct FlowAccumulation;

impl Stage for FlowAccumulation {
    fn name(&self) -> &str {
        "flow_accumulation"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("conditioned_elevation")]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_raster("accumulation")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let cmd = EngineCommand::new("r.watershed")
            .param("elevation", ctx.product("conditioned_elevation").as_str())
            .param("accumulation", ctx.product("accumulation").as_str())
            .flags("b")
            .overwrite();
        ctx.run(cmd)?;
        Ok(())
    }
}

/// Stream raster, stream vector and flow direction from the unit's own
/// elevation and accumulation.
pub struct ExtractStreams {
    pub threshold: u32,
    pub memory: u32,
}

impl Stage for ExtractStreams {
    fn name(&self) -> &str {
        "extract_streams"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("elevation"), Product::local_raster("accumulation")]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![
            Product::local_raster("streams"),
            Product::local_vector("streams"),
            Product::local_raster("direction"),
        ]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let streams = ctx.product("streams");
        let cmd = EngineCommand::new("r.stream.extract")
            .param("elevation", ctx.product("elevation").as_str())
            .param("accumulation", ctx.product("accumulation").as_str())
            .param("threshold", self.threshold)
            .param("memory", self.memory)
            .param("stream_raster", streams.as_str())
            .param("stream_vector", streams.as_str())
            .param("direction", ctx.product("direction").as_str())
            .overwrite();
        ctx.run(cmd)?;
        Ok(())
    }
}

/// Move gauge stations onto the extracted stream network.
pub struct SnapStations {
    pub memory: u32,
}

impl Stage for SnapStations {
    fn name(&self) -> &str {
        "snap_stations"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![
            Product::local_vector("stations"),
            Product::local_raster("streams"),
            Product::local_raster("accumulation"),
        ]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_vector("snapped_stations")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let cmd = EngineCommand::new("r.stream.snap")
            .param("input", ctx.product("stations").as_str())
            .param("output", ctx.product("snapped_stations").as_str())
            .param("stream_rast", ctx.product("streams").as_str())
            .param("accumulation", ctx.product("accumulation").as_str())
            .param("memory", self.memory)
            .overwrite();
        ctx.run(cmd)?;
        Ok(())
    }
}

/// Basins draining to each snapped station, as raster and as areas.
pub struct DelineateBasins {
    pub memory: u32,
}

impl Stage for DelineateBasins {
    fn name(&self) -> &str {
        "delineate_basins"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("direction"), Product::local_vector("snapped_stations")]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_raster("basins"), Product::local_vector("basins")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let basins = ctx.product("basins");
        let cmd = EngineCommand::new("r.stream.basins")
            .param("direction", ctx.product("direction").as_str())
            .param("points", ctx.product("snapped_stations").as_str())
            .param("basins", basins.as_str())
            .param("memory", self.memory)
            .flags("l")
            .overwrite();
        ctx.run(cmd)?;
        ctx.run(
            EngineCommand::new("r.to.vect")
                .param("input", basins.as_str())
                .param("output", basins.as_str())
                .param("type", "area")
                .flags("s")
                .overwrite(),
        )?;
        Ok(())
    }
}

/// Join station labels onto the basin areas and extract one vector per basin,
/// named by the basin's map identifier.
pub struct ExtractBasinVectors {
    pub label_column: String,
    pub basins: Vec<Basin>,
}

impl ExtractBasinVectors {
    /// Station label matched for `basin`: its outlet reference, else its name.
    fn label<'b>(basin: &'b Basin) -> &'b str {
        basin.outlet().unwrap_or(basin.name())
    }
}

impl Stage for ExtractBasinVectors {
    fn name(&self) -> &str {
        "extract_basin_vectors"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_vector("basins"), Product::local_vector("stations")]
    }

    fn outputs(&self) -> Vec<Product> {
        self.basins
            .iter()
            .map(|b| Product::shared_vector(b.map_id()))
            .collect()
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let basins = ctx.product("basins");
        ctx.run(
            EngineCommand::new("v.db.join")
                .param("map", basins.as_str())
                .param("column", "value")
                .param("other_table", ctx.product("stations").as_str())
                .param("other_column", "cat")
                .param("subset_columns", self.label_column.as_str()),
        )?;
        for basin in &self.basins {
            ctx.run(
                EngineCommand::new("v.extract")
                    .param("input", basins.as_str())
                    .param("type", "area")
                    .param("where", format!("{} = \"{}\"", self.label_column, Self::label(basin)))
                    .param("output", basin.map_id())
                    .overwrite(),
            )?;
        }
        Ok(())
    }
}
