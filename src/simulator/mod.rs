pub mod regional;
pub mod tape;

use eyre::Result;
use ndarray::Array1;

use crate::error::TmaxError;
use crate::routines::settings::SimulationSettings;
use crate::structs::control::ControlSet;
use crate::structs::geometry::Geometry;
use crate::structs::targets::TargetSeries;
use crate::structs::trace::SimulationTrace;

use tape::DiffContext;

/// Everything a forward solve needs besides the controls
#[derive(Debug, Clone)]
pub struct ForwardProblem {
    pub targets: TargetSeries,
    pub geometry: Geometry,
    pub simulation: SimulationSettings,
}

impl ForwardProblem {
    pub fn new(targets: TargetSeries, geometry: Geometry, simulation: SimulationSettings) -> Self {
        ForwardProblem {
            targets,
            geometry,
            simulation,
        }
    }

    pub fn ndatapts(&self) -> usize {
        self.targets.ndatapts()
    }

    pub fn nregions(&self) -> usize {
        self.geometry.regions().len()
    }

    /// Check the measured data against the mesh, independent of any model
    pub fn check(&self) -> Result<()> {
        if let Some(strain) = self.targets.strain() {
            if strain.nregions() != self.nregions() {
                return Err(TmaxError::Configuration(format!(
                    "strain targets have {} rows but the mesh has {} regions",
                    strain.nregions(),
                    self.nregions()
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Check that `trace` has one column per timepoint and one row per region
    pub fn check_trace(&self, trace: &SimulationTrace) -> Result<()> {
        let expected = (self.nregions(), self.ndatapts());
        let series = [trace.lvp.len(), trace.lvv.len()];
        let strains = [trace.ecc.dim(), trace.ell.dim(), trace.err.dim()];
        if series.iter().any(|&n| n != expected.1) || strains.iter().any(|&d| d != expected) {
            return Err(TmaxError::Configuration(format!(
                "forward model returned a trace with {} timepoints and {:?} strain entries, \
                 expected {} timepoints and {} regions",
                trace.lvp.len(),
                trace.ecc.dim(),
                expected.1,
                expected.0
            ))
            .into());
        }
        Ok(())
    }
}

/// Result of one forward solve
#[derive(Debug, Clone)]
pub struct ForwardSolution {
    /// Final state of the model, model-specific layout
    pub state: Array1<f64>,
    /// Value of the loss at the given controls
    pub objective: f64,
    pub trace: SimulationTrace,
}

/// A forward simulation of the left ventricle driven by the Tmax control fields
///
/// Implementations record one or more [tape::Block]s on `ctx` when it is annotating. The sum
/// of the recorded contributions must equal the returned objective, so that the tape's adjoint
/// is the gradient of that objective.
pub trait ForwardModel {
    /// Check that the problem is consistent with this model
    ///
    /// Called once before the first solve of a run.
    fn check(&self, _controls: &ControlSet, _problem: &ForwardProblem) -> Result<()> {
        Ok(())
    }

    /// Solve the forward problem at `controls`
    ///
    /// The returned trace holds `problem.ndatapts()` entries in `lvp` and `lvv`, and `ecc`,
    /// `ell` and `err` have one row per mesh region and one column per timepoint. Runs that
    /// receive any other shape stop with a configuration error.
    fn solve(
        &self,
        controls: &ControlSet,
        problem: &ForwardProblem,
        ctx: &mut DiffContext,
    ) -> Result<ForwardSolution>;
}
