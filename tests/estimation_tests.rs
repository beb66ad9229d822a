use std::cell::Cell;

use eyre::Result;
use ndarray::{array, Array1, Array2};
use tmaxopt::prelude::*;

/// `sum_p (x_p - t_p)^2` with one degree of freedom per timepoint, `t_p` taken from the LVP series
#[derive(Default)]
struct Distance {
    solves: Cell<usize>,
    fail_from: Option<usize>,
    reject: bool,
    /// Rows of the strain traces, one per region when unset
    trace_regions: Option<usize>,
}

struct Term {
    timepoint: usize,
    residual: f64,
}

impl Block for Term {
    fn contribution(&self) -> f64 {
        self.residual * self.residual
    }

    fn adjoint(&self, seed: f64, grad: &mut [Array1<f64>]) -> Result<()> {
        grad[self.timepoint][0] += seed * 2.0 * self.residual;
        Ok(())
    }
}

impl ForwardModel for Distance {
    fn check(&self, _controls: &ControlSet, _problem: &ForwardProblem) -> Result<()> {
        if self.reject {
            return Err(TmaxError::Configuration("rejected".to_string()).into());
        }
        Ok(())
    }

    fn solve(
        &self,
        controls: &ControlSet,
        problem: &ForwardProblem,
        ctx: &mut DiffContext,
    ) -> Result<ForwardSolution> {
        let solves = self.solves.get() + 1;
        self.solves.set(solves);
        if self.fail_from.map_or(false, |n| solves >= n) {
            return Err(TmaxError::Convergence {
                timepoint: 1,
                iterations: 40,
                residual: 1e-3,
            }
            .into());
        }

        let nregions = self.trace_regions.unwrap_or(problem.geometry.regions().len());
        let mut trace = SimulationTrace::zeros(controls.len(), nregions);
        let mut objective = 0.0;
        for (p, field) in controls.iter().enumerate() {
            let residual = field.values()[0] - problem.targets.lvp()[p];
            objective += residual * residual;
            trace.lvp[p] = field.values()[0];
            trace.lvv[p] = problem.targets.lvv()[p];
            ctx.record(|| {
                Box::new(Term {
                    timepoint: p,
                    residual,
                }) as Box<dyn Block>
            });
        }
        Ok(ForwardSolution {
            state: Array1::zeros(0),
            objective,
            trace,
        })
    }
}

fn problem() -> ForwardProblem {
    let targets =
        TargetSeries::new(array![500.0, 1000.0, 1500.0], array![120.0, 90.0, 60.0], None, None)
            .unwrap();
    ForwardProblem::new(
        targets,
        Geometry::idealized(1, 1, 0.0).unwrap(),
        Default::default(),
    )
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.io.write = false;
    settings.simulation.lower_bound = 0.0;
    settings.simulation.upper_bound = 2000e3;
    settings.simulation.init_opt_val = 1e3;
    settings.optimizer.max_iterations = 50;
    settings.optimizer.pgtol = 1e-6;
    settings
}

#[test]
fn estimation_recovers_the_targets() -> Result<()> {
    let model = Distance::default();
    let result = fit_with(&model, &problem(), settings(), &SelfComm)?;

    assert!(result.converged(), "{}", result.status());
    assert!(result.iterations() <= 50);
    for (x, t) in result.controls().flatten().iter().zip([500.0, 1000.0, 1500.0]) {
        assert!((x - t).abs() < 1e-3, "{} != {}", x, t);
    }
    // Every optimizer evaluation plus the validation solve
    assert_eq!(model.solves.get(), result.evaluations() + 1);
    assert_eq!(result.summaries().len(), 3);
    Ok(())
}

#[test]
fn validation_reproduces_the_last_evaluation() -> Result<()> {
    let model = Distance::default();
    let problem = problem();
    let controls = ControlSet::init(
        3,
        FieldLayout::serial(1),
        1e3,
        ControlBounds::new(0.0, 2000e3)?,
        None,
    )?;
    let functional = ReducedFunctional::new(&model, &problem, controls, &SelfComm);
    functional.evaluate(&[700.0, 900.0, 1400.0])?;
    let last = functional.last_trace().unwrap();

    let trace = validate(&model, &functional.controls(), &problem)?;
    assert_eq!(trace.max_abs_diff(&last), 0.0);
    assert_eq!(trace.lvp, array![700.0, 900.0, 1400.0]);
    Ok(())
}

#[test]
fn result_trace_comes_from_the_optimized_controls() -> Result<()> {
    let model = Distance::default();
    let result = fit_with(&model, &problem(), settings(), &SelfComm)?;
    assert_eq!(
        result.trace().lvp.to_vec(),
        result.controls().flatten()
    );
    Ok(())
}

#[test]
fn configuration_errors_come_before_any_solve() {
    let model = Distance {
        reject: true,
        ..Distance::default()
    };
    let err = fit_with(&model, &problem(), settings(), &SelfComm).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TmaxError>(),
        Some(TmaxError::Configuration(_))
    ));
    assert_eq!(model.solves.get(), 0);
}

#[test]
fn mismatched_strain_targets_are_rejected() {
    let err = TargetSeries::new(
        array![500.0, 1000.0, 1500.0],
        array![120.0, 90.0, 60.0],
        Some(Array2::zeros((16, 2))),
        Some(Array2::zeros((16, 2))),
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TmaxError>(),
        Some(TmaxError::Configuration(_))
    ));
}

#[test]
fn forward_failures_keep_their_type() {
    for fail_from in [1, 3] {
        let model = Distance {
            fail_from: Some(fail_from),
            ..Distance::default()
        };
        let err = fit_with(&model, &problem(), settings(), &SelfComm).unwrap_err();
        match err.downcast_ref::<TmaxError>() {
            Some(TmaxError::Convergence { timepoint, .. }) => assert_eq!(*timepoint, 1),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(model.solves.get(), fail_from);
    }
}

#[test]
fn trace_of_the_wrong_shape_is_rejected() {
    let model = Distance {
        trace_regions: Some(0),
        ..Distance::default()
    };
    let err = fit_with(&model, &problem(), settings(), &SelfComm).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TmaxError>(),
        Some(TmaxError::Configuration(_))
    ));
}

#[test]
fn failed_evaluation_is_kept_in_the_debug_log() -> Result<()> {
    let folder = std::env::temp_dir().join(format!("tmaxopt-failed-{}", std::process::id()));
    let mut settings = settings();
    settings.io.write = true;
    settings.io.output_folder = folder.to_string_lossy().to_string();

    let model = Distance {
        fail_from: Some(3),
        ..Distance::default()
    };
    assert!(fit_with(&model, &problem(), settings, &SelfComm).is_err());

    let debug = Checkpoint::read(folder.join("Tmax_debug.npz"))?;
    // Three fields for each of the three evaluations, plus the latest three
    assert_eq!(debug.len(), 3 * 3 + 3);
    assert_eq!(debug.get("Tmax2_eval3"), debug.get("Tmax2"));
    std::fs::remove_dir_all(&folder).ok();
    Ok(())
}

#[test]
fn starting_at_the_optimum_costs_one_evaluation() -> Result<()> {
    let folder = std::env::temp_dir().join(format!("tmaxopt-optimum-{}", std::process::id()));
    let path = folder.join("init.npz");
    let mut checkpoint = Checkpoint::new();
    checkpoint.insert("Tmax0", array![500.0]);
    checkpoint.insert("Tmax1", array![1000.0]);
    checkpoint.insert("Tmax2", array![1500.0]);
    checkpoint.write(&path)?;

    let mut settings = settings();
    settings.io.init_file = Some(path.to_string_lossy().to_string());
    let model = Distance::default();
    let result = fit_with(&model, &problem(), settings, &SelfComm)?;

    assert!(result.converged());
    assert_eq!(result.evaluations(), 1);
    assert_eq!(result.controls().flatten(), vec![500.0, 1000.0, 1500.0]);
    std::fs::remove_dir_all(&folder).ok();
    Ok(())
}

#[test]
fn outputs_are_written_to_the_output_folder() -> Result<()> {
    let folder = std::env::temp_dir().join(format!("tmaxopt-outputs-{}", std::process::id()));
    let mut settings = settings();
    settings.io.write = true;
    settings.io.output_folder = folder.to_string_lossy().to_string();
    settings.io.debug_file = Some("Tmax_debug.npz".to_string());

    let model = Distance::default();
    let result = fit_with(&model, &problem(), settings, &SelfComm)?;
    result.write_outputs()?;

    for name in [
        "evaluations.csv",
        "Tmax_debug.npz",
        "Tmax_opt.npz",
        "pv_loop.csv",
        "tmax_summary.csv",
        "regional_Tmax.csv",
        "total_Strain.csv",
        "settings.json",
    ] {
        assert!(folder.join(name).exists(), "{} is missing", name);
    }

    let evaluations = std::fs::read_to_string(folder.join("evaluations.csv"))?;
    assert_eq!(evaluations.lines().count(), result.evaluations() + 1);

    let debug = Checkpoint::read(folder.join("Tmax_debug.npz"))?;
    assert_eq!(debug.len(), 3 * result.evaluations() + 3);

    let optimized = Checkpoint::read(folder.join("Tmax_opt.npz"))?;
    assert_eq!(optimized.len(), 3);
    assert_eq!(optimized.field(2)?[0], result.controls().flatten()[2]);
    std::fs::remove_dir_all(&folder).ok();
    Ok(())
}
