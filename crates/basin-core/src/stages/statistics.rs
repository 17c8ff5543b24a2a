use crate::error::PipelineError;
use crate::stage::{Product, Stage, StageContext};
use crate::stats::{StatField, UnivarSummary};

/// Elevation and slope summaries for the unit. Contributes all six fields of
/// the statistics record.
pub struct ComputeStats;

impl Stage for ComputeStats {
    fn name(&self) -> &str {
        "compute_stats"
    }

    fn inputs(&self) -> Vec<Product> {
        vec![Product::local_raster("elevation"), Product::local_raster("slope")]
    }

    fn outputs(&self) -> Vec<Product> {
        Vec::new()
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<(), PipelineError> {
        let elevation = ctx.product("elevation");
        let slope = ctx.product("slope");
        let elev = UnivarSummary::from_output(&ctx.run(UnivarSummary::command(elevation.as_str()))?)?;
        let slope = UnivarSummary::from_output(&ctx.run(UnivarSummary::command(slope.as_str()))?)?;

        ctx.record(StatField::MeanElevation, elev.mean);
        ctx.record(StatField::MinElevation, elev.min);
        ctx.record(StatField::MaxElevation, elev.max);
        ctx.record(StatField::MeanSlope, slope.mean);
        ctx.record(StatField::MaxSlope, slope.max);
        ctx.record(StatField::MinSlope, slope.min);
        Ok(())
    }
}
