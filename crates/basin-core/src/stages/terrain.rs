//! Surface model stages: patching, conditioning, clipping and terrain
//! derivatives (slope, contours, relief, sky-view factor).

use crate::engine::EngineCommand;
use crate::error::PipelineError;
use crate::stage::{Product, Stage, StageContext};

/// Fill holes in the fine surface model from the coarse one.
pub struct PatchElevation {
    pub fine: String,
    pub coarse: String,
}

impl Stage for PatchElevation {
    fn name(&self) -> &str {
        "patch_elevation"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::shared_raster(&self.fine), Product::shared_raster(&self.coarse)]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_raster("elevation")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let elevation = ctx.product("elevation");
        ctx.run(
            EngineCommand::new("r.mapcalc")
                .param(
                    "expression",
                    format!(
                        "{elevation} = if(isnull({fine}), {coarse}, {fine})",
                        fine = self.fine,
                        coarse = self.coarse
                    ),
                )
                .overwrite(),
        )?;
        Ok(())
    }
}

/// Hydrologic conditioning (sink removal) of the elevation.
pub struct ConditionElevation {
    pub memory: u32,
}

impl Stage for ConditionElevation {
    fn name(&self) -> &str {
        "condition_elevation"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("elevation")]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_raster("conditioned_elevation")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let cmd = EngineCommand::new("r.hydrodem")
            .param("input", ctx.product("elevation").as_str())
            .param("output", ctx.product("conditioned_elevation").as_str())
            .param("memory", self.memory)
            .overwrite();
        ctx.run(cmd)?;
        Ok(())
    }
}

/// Copy a study-wide raster into the current unit. Under a basin scope the
/// mask restricts the copy to the basin.
pub struct Clip {
    name: &'static str,
    suffix: &'static str,
}

impl Clip {
    pub fn new(name: &'static str, suffix: &'static str) -> Self {
        Self { name, suffix }
    }
}

impl Stage for Clip {
    fn name(&self) -> &str {
        self.name
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::shared_raster(self.suffix)]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_raster(self.suffix)]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let local = ctx.product(self.suffix);
        ctx.run(
            EngineCommand::new("r.mapcalc")
                .param("expression", format!("{local} = {}", self.suffix))
                .overwrite(),
        )?;
        Ok(())
    }
}

pub struct ComputeSlope;

impl Stage for ComputeSlope {
    fn name(&self) -> &str {
        "compute_slope"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("elevation")]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_raster("slope"), Product::local_raster("aspect")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let cmd = EngineCommand::new("r.slope.aspect")
            .param("elevation", ctx.product("elevation").as_str())
            .param("slope", ctx.product("slope").as_str())
            .param("aspect", ctx.product("aspect").as_str())
            .overwrite();
        ctx.run(cmd)?;
        Ok(())
    }
}

/// Contour lines every `step` elevation units.
pub struct ComputeContours {
    pub step: u32,
}

impl Stage for ComputeContours {
    fn name(&self) -> &str {
        "compute_contours"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("elevation")]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_vector("contours")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let cmd = EngineCommand::new("r.contour")
            .param("input", ctx.product("elevation").as_str())
            .param("output", ctx.product("contours").as_str())
            .param("step", self.step)
            .overwrite();
        ctx.run(cmd)?;
        Ok(())
    }
}

pub struct ComputeRelief {
    pub zscale: f64,
}

impl Stage for ComputeRelief {
    fn name(&self) -> &str {
        "compute_relief"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("elevation")]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_raster("relief")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let cmd = EngineCommand::new("r.relief")
            .param("input", ctx.product("elevation").as_str())
            .param("output", ctx.product("relief").as_str())
            .param("zscale", self.zscale)
            .overwrite();
        ctx.run(cmd)?;
        Ok(())
    }
}

/// Drape the elevation colors over the relief.
pub struct ShadeRelief {
    pub brighten: i64,
}

impl Stage for ShadeRelief {
    fn name(&self) -> &str {
        "shade_relief"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("relief"), Product::local_raster("elevation")]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_raster("shaded_relief")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let cmd = EngineCommand::new("r.shade")
            .param("shade", ctx.product("relief").as_str())
            .param("color", ctx.product("elevation").as_str())
            .param("output", ctx.product("shaded_relief").as_str())
            .param("brighten", self.brighten)
            .overwrite();
        ctx.run(cmd)?;
        Ok(())
    }
}

pub struct ComputeSkyview;

impl Stage for ComputeSkyview {
    fn name(&self) -> &str {
        "compute_skyview"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("elevation")]
    }

    fn outputs(&self) -> Vec<Product> {
        vec![Product::local_raster("skyview"), Product::local_raster("colorized_skyview")]
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let cmd = EngineCommand::new("r.skyview")
            .param("input", ctx.product("elevation").as_str())
            .param("output", ctx.product("skyview").as_str())
            .param("colorized_output", ctx.product("colorized_skyview").as_str())
            .overwrite();
        ctx.run(cmd)?;
        Ok(())
    }
}
