use std::time::Instant;

use eyre::Result;

use crate::algorithms::Status;
use crate::error::TmaxError;
use crate::routines::optimization::{minimize, ProgressLogger, ReducedFunctional};
use crate::routines::output::evaluations::EvaluationLog;
use crate::routines::output::TmaxResult;
use crate::routines::reduction::Communicator;
use crate::routines::settings::Settings;
use crate::simulator::tape::DiffContext;
use crate::simulator::{ForwardModel, ForwardProblem};
use crate::structs::control::ControlSet;
use crate::structs::trace::SimulationTrace;

/// Largest difference tolerated between the validation trace and the trace of the last
/// optimizer evaluation at the same controls
const REPRODUCTION_TOLERANCE: f64 = 1e-9;

/// Estimates the control fields that make a forward model reproduce the measured data
///
/// A run checks the problem against the model, minimizes the reduced objective with L-BFGS-B
/// inside the control bounds and finishes with a validation solve at the optimized controls.
pub struct TmaxEstimation<'a, M: ForwardModel> {
    model: &'a M,
    problem: &'a ForwardProblem,
    comm: &'a dyn Communicator,
    controls: ControlSet,
    settings: Settings,
    status: Status,
}

impl<'a, M: ForwardModel> TmaxEstimation<'a, M> {
    pub fn new(
        model: &'a M,
        problem: &'a ForwardProblem,
        controls: ControlSet,
        comm: &'a dyn Communicator,
        settings: Settings,
    ) -> Self {
        TmaxEstimation {
            model,
            problem,
            comm,
            controls,
            settings,
            status: Status::Starting,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Current controls, the optimized ones once [TmaxEstimation::fit] returned
    pub fn controls(&self) -> &ControlSet {
        &self.controls
    }

    pub fn fit(&mut self) -> Result<TmaxResult> {
        let now = Instant::now();
        let coordinator = self.comm.is_coordinator();

        // Inconsistent data must fail before the first solve
        self.problem.check()?;
        self.model.check(&self.controls, self.problem)?;
        self.status = Status::InProgress;

        let x0 = self.controls.flatten();
        let (lower, upper) = self.controls.flat_bounds();
        if coordinator {
            tracing::info!(
                "Optimizing {} control fields ({} degrees of freedom)",
                self.controls.len(),
                x0.len()
            );
        }

        let mut log = if self.settings.io.write && coordinator {
            Some(EvaluationLog::create(&self.settings.io.output_folder)?)
        } else {
            None
        };

        let mut functional =
            ReducedFunctional::new(self.model, self.problem, self.controls.clone(), self.comm)
                .with_observer(ProgressLogger::new(self.comm));
        if let Some(log) = log.as_mut() {
            functional = functional.with_observer(log);
        }
        if let (true, Some(debug_file)) = (self.settings.io.write, &self.settings.io.debug_file) {
            functional = functional.with_debug_checkpoint(self.settings.io.output_path(debug_file));
        }

        let minimum = match minimize(
            functional.objective(),
            x0,
            lower,
            upper,
            &self.settings.optimizer,
        ) {
            Ok(minimum) => minimum,
            Err(err) => {
                // Hand back what the forward model raised, not the optimizer's copy of it
                let err = functional.take_failure().unwrap_or(err);
                self.status = Status::Stopped(format!("{}", err));
                return Err(err);
            }
        };

        // Leave the controls at the best point, with its trace as the last evaluation
        functional.evaluate(&minimum.x)?;
        let last_trace = functional.last_trace().ok_or_else(|| {
            TmaxError::Optimizer("no evaluation at the optimized controls".to_string())
        })?;
        let evaluations = functional.evaluations();
        self.controls = functional.into_controls();
        self.status = minimum.status.clone();

        if coordinator {
            tracing::info!(
                "Optimization finished after {} iterations and {} evaluations: {}",
                minimum.iterations,
                evaluations,
                self.status
            );
            tracing::info!("Final loss: {:.6e}", minimum.cost);
        }

        let trace = validate(self.model, &self.controls, self.problem)?;
        if let Err(err) = self.problem.check_trace(&trace) {
            self.status = Status::Stopped(format!("{}", err));
            return Err(err);
        }
        let deviation = trace.max_abs_diff(&last_trace);
        if deviation > REPRODUCTION_TOLERANCE {
            tracing::warn!(
                "Validation solve differs from the last evaluation by {:.3e}",
                deviation
            );
        }

        let summaries = self.controls.summaries(self.comm);
        if coordinator {
            for (p, summary) in summaries.iter().enumerate() {
                tracing::info!(
                    "Tmax{}: mean = {:.4e}, std = {:.4e}",
                    p,
                    summary.mean,
                    summary.std
                );
            }
            tracing::debug!("Estimation took {:.2?}", now.elapsed());
        }

        Ok(TmaxResult::new(
            self.controls.clone(),
            trace,
            self.problem,
            minimum.cost,
            minimum.iterations,
            evaluations,
            self.status.clone(),
            summaries,
            self.settings.clone(),
        ))
    }
}

/// One forward solve at `controls` without recording anything for differentiation
pub fn validate<M: ForwardModel + ?Sized>(
    model: &M,
    controls: &ControlSet,
    problem: &ForwardProblem,
) -> Result<SimulationTrace> {
    let mut ctx = DiffContext::disabled();
    let solution = model.solve(controls, problem, &mut ctx)?;
    tracing::debug!("Validation solve: loss = {:.6e}", solution.objective);
    Ok(solution.trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routines::reduction::SelfComm;
    use crate::simulator::regional::RegionalLaplaceModel;
    use crate::structs::control::{ControlBounds, FieldLayout};
    use crate::structs::geometry::Geometry;
    use crate::structs::targets::TargetSeries;
    use ndarray::{array, Array2};

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.io.write = false;
        settings.optimizer.max_iterations = 3;
        settings
    }

    fn controls(ndatapts: usize, ncells: usize) -> ControlSet {
        ControlSet::init(
            ndatapts,
            FieldLayout::serial(ncells),
            1e3,
            ControlBounds::new(0.0, 500e3).unwrap(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn strain_mismatch_fails_before_optimizing() {
        // Three strain rows for a mesh with two regions
        let problem = ForwardProblem::new(
            TargetSeries::new(
                array![1000.0, 1200.0],
                array![120.0, 110.0],
                Some(Array2::zeros((3, 2))),
                Some(Array2::zeros((3, 2))),
            )
            .unwrap(),
            Geometry::idealized(4, 2, 0.0).unwrap(),
            Default::default(),
        );
        let model = RegionalLaplaceModel;
        let mut estimation =
            TmaxEstimation::new(&model, &problem, controls(2, 4), &SelfComm, settings());

        let err = estimation.fit().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TmaxError>(),
            Some(TmaxError::Configuration(_))
        ));
        assert_eq!(estimation.status(), &Status::Starting);
    }

    #[test]
    fn validation_matches_annotated_solve() {
        let problem = ForwardProblem::new(
            TargetSeries::new(array![1000.0, 1500.0], array![120.0, 110.0], None, None).unwrap(),
            Geometry::idealized(4, 2, 0.0).unwrap(),
            Default::default(),
        );
        let model = RegionalLaplaceModel;
        let controls = controls(2, 4);

        let mut ctx = DiffContext::annotate();
        let annotated = model.solve(&controls, &problem, &mut ctx).unwrap();
        let trace = validate(&model, &controls, &problem).unwrap();
        assert_eq!(trace.max_abs_diff(&annotated.trace), 0.0);
    }
}
