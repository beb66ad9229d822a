use std::collections::VecDeque;

use argmin::core::{
    CostFunction, Error, Executor, Gradient, IterState, Problem, Solver, State,
    TerminationReason, TerminationStatus, KV,
};
use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::algorithms::Status;
use crate::error::TmaxError;
use crate::routines::settings::OptimizerSettings;

type BoxState = IterState<Vec<f64>, Vec<f64>, (), (), f64>;

/// Sufficient decrease parameter of the backtracking line search
const ARMIJO_C1: f64 = 1e-4;
/// Trial points tried before the line search gives up
const MAX_BACKTRACKS: usize = 20;

/// Limited-memory quasi-Newton method with box constraints
///
/// Iterates stay inside `[lower, upper]` at all times. Variables sitting on a bound with a
/// gradient pointing out of the box are held fixed, the others follow the two-loop L-BFGS
/// direction. Steps are projected back onto the box and accepted by a backtracking Armijo
/// search, so every trial point costs exactly one cost evaluation; the gradient is only asked
/// for at accepted points.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LbfgsB {
    lower: Vec<f64>,
    upper: Vec<f64>,
    memory: usize,
    pgtol: f64,
    ftol: f64,
    s: VecDeque<Vec<f64>>,
    y: VecDeque<Vec<f64>>,
}

impl LbfgsB {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>, memory: usize) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(TmaxError::Optimizer(format!(
                "{} lower bounds but {} upper bounds",
                lower.len(),
                upper.len()
            ))
            .into());
        }
        if lower.iter().zip(&upper).any(|(l, u)| !(l <= u)) {
            return Err(TmaxError::Optimizer("inconsistent bounds".to_string()).into());
        }
        Ok(LbfgsB {
            lower,
            upper,
            memory: memory.max(1),
            pgtol: 1e-5,
            ftol: 0.0,
            s: VecDeque::new(),
            y: VecDeque::new(),
        })
    }

    /// Stop once the infinity norm of the projected gradient falls to `pgtol`
    pub fn with_pgtol(mut self, pgtol: f64) -> Self {
        self.pgtol = pgtol;
        self
    }

    /// Stop once the relative decrease of the cost over one iteration falls to `ftol`
    pub fn with_ftol(mut self, ftol: f64) -> Self {
        self.ftol = ftol;
        self
    }

    fn project(&self, x: &mut [f64]) {
        for ((xi, l), u) in x.iter_mut().zip(&self.lower).zip(&self.upper) {
            *xi = xi.clamp(*l, *u);
        }
    }

    /// Infinity norm of `P(x - g) - x`
    fn projected_gradient_norm(&self, x: &[f64], g: &[f64]) -> f64 {
        x.iter()
            .zip(g)
            .zip(self.lower.iter().zip(&self.upper))
            .map(|((xi, gi), (l, u))| ((xi - gi).clamp(*l, *u) - xi).abs())
            .fold(0.0, f64::max)
    }

    fn free_variables(&self, x: &[f64], g: &[f64]) -> Vec<bool> {
        x.iter()
            .zip(g)
            .zip(self.lower.iter().zip(&self.upper))
            .map(|((xi, gi), (l, u))| !((*xi <= *l && *gi > 0.0) || (*xi >= *u && *gi < 0.0)))
            .collect()
    }

    /// Two-loop recursion on the free part of the gradient
    fn direction(&self, g: &[f64], free: &[bool]) -> Vec<f64> {
        let mut q: Vec<f64> = g
            .iter()
            .zip(free)
            .map(|(gi, f)| if *f { *gi } else { 0.0 })
            .collect();

        let mut alpha = vec![0.0; self.s.len()];
        for (i, (s, y)) in self.s.iter().zip(&self.y).enumerate().rev() {
            let rho = 1.0 / dot(y, s);
            alpha[i] = rho * dot(s, &q);
            axpy(-alpha[i], y, &mut q);
        }

        let gamma = match (self.s.back(), self.y.back()) {
            (Some(s), Some(y)) => dot(s, y) / dot(y, y),
            _ => 1.0,
        };
        q.iter_mut().for_each(|v| *v *= gamma);

        for (i, (s, y)) in self.s.iter().zip(&self.y).enumerate() {
            let rho = 1.0 / dot(y, s);
            let beta = rho * dot(y, &q);
            axpy(alpha[i] - beta, s, &mut q);
        }

        q.iter()
            .zip(free)
            .map(|(v, f)| if *f { -v } else { 0.0 })
            .collect()
    }

    fn remember(&mut self, s: Vec<f64>, y: Vec<f64>) {
        let sy = dot(&s, &y);
        if sy > f64::EPSILON * dot(&y, &y) {
            if self.s.len() == self.memory {
                self.s.pop_front();
                self.y.pop_front();
            }
            self.s.push_back(s);
            self.y.push_back(y);
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    y.iter_mut().zip(x).for_each(|(yi, xi)| *yi += alpha * xi);
}

impl<O> Solver<O, BoxState> for LbfgsB
where
    O: CostFunction<Param = Vec<f64>, Output = f64> + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
{
    const NAME: &'static str = "L-BFGS-B";

    fn init(
        &mut self,
        problem: &mut Problem<O>,
        state: BoxState,
    ) -> std::result::Result<(BoxState, Option<KV>), Error> {
        let mut x = state
            .get_param()
            .cloned()
            .ok_or_else(|| Error::msg("L-BFGS-B requires an initial parameter vector"))?;
        if x.len() != self.lower.len() {
            return Err(Error::msg(format!(
                "initial vector has {} entries but the bounds have {}",
                x.len(),
                self.lower.len()
            )));
        }
        self.project(&mut x);
        let cost = problem.cost(&x)?;
        let gradient = problem.gradient(&x)?;
        Ok((state.param(x).cost(cost).gradient(gradient), None))
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<O>,
        state: BoxState,
    ) -> std::result::Result<(BoxState, Option<KV>), Error> {
        let x = state
            .get_param()
            .cloned()
            .ok_or_else(|| Error::msg("missing parameter vector"))?;
        let g = state
            .get_gradient()
            .cloned()
            .ok_or_else(|| Error::msg("missing gradient"))?;
        let f = state.get_cost();

        if self.projected_gradient_norm(&x, &g) <= self.pgtol {
            return Ok((state.terminate_with(TerminationReason::SolverConverged), None));
        }

        let free = self.free_variables(&x, &g);
        let mut d = self.direction(&g, &free);
        if !(dot(&g, &d) < 0.0) {
            // Curvature information is useless here, restart from steepest descent
            self.s.clear();
            self.y.clear();
            d = g
                .iter()
                .zip(&free)
                .map(|(gi, f)| if *f { -gi } else { 0.0 })
                .collect();
        }

        let mut step = if self.s.is_empty() {
            let norm = dot(&d, &d).sqrt();
            if norm > 0.0 {
                (1.0 / norm).min(1.0)
            } else {
                1.0
            }
        } else {
            1.0
        };

        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let mut trial: Vec<f64> = x.iter().zip(&d).map(|(xi, di)| xi + step * di).collect();
            self.project(&mut trial);
            let f_trial = problem.cost(&trial)?;
            let decrease: f64 = g
                .iter()
                .zip(trial.iter().zip(&x))
                .map(|(gi, (t, xi))| gi * (t - xi))
                .sum();
            if f_trial.is_finite() && f_trial <= f + ARMIJO_C1 * decrease {
                accepted = Some((trial, f_trial));
                break;
            }
            step *= 0.5;
        }

        let (x_new, f_new) = match accepted {
            Some(point) => point,
            None => {
                return Ok((
                    state.terminate_with(TerminationReason::SolverExit(
                        "line search failed".to_string(),
                    )),
                    None,
                ))
            }
        };
        let g_new = problem.gradient(&x_new)?;

        let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        self.remember(s, y);

        let relative = (f - f_new) / f.abs().max(f_new.abs()).max(1.0);
        let converged = relative <= self.ftol
            || self.projected_gradient_norm(&x_new, &g_new) <= self.pgtol;

        let state = state.param(x_new).cost(f_new).gradient(g_new);
        if converged {
            Ok((state.terminate_with(TerminationReason::SolverConverged), None))
        } else {
            Ok((state, None))
        }
    }

    fn terminate(&mut self, state: &BoxState) -> TerminationStatus {
        match (state.get_param(), state.get_gradient()) {
            (Some(x), Some(g)) if self.projected_gradient_norm(x, g) <= self.pgtol => {
                TerminationStatus::Terminated(TerminationReason::SolverConverged)
            }
            _ => TerminationStatus::NotTerminated,
        }
    }
}

/// Outcome of a bounded minimization
#[derive(Debug, Clone)]
pub struct Minimum {
    pub x: Vec<f64>,
    pub cost: f64,
    pub iterations: u64,
    pub status: Status,
}

/// Minimize `objective` over the box `[lower, upper]` starting from `x0`
///
/// Errors raised by the objective abort the run. A line search that cannot decrease the cost
/// is not an error, it ends the run with [Status::Stopped].
pub fn minimize<O>(
    objective: O,
    x0: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    settings: &OptimizerSettings,
) -> Result<Minimum>
where
    O: CostFunction<Param = Vec<f64>, Output = f64> + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>,
{
    let solver = LbfgsB::new(lower, upper, settings.memory)?
        .with_pgtol(settings.pgtol)
        .with_ftol(settings.relative_tolerance());

    let result = Executor::new(objective, solver)
        .configure(|state| {
            state
                .param(x0)
                .max_iters(settings.max_iterations)
                .target_cost(f64::NEG_INFINITY)
        })
        .run()
        .map_err(|e| TmaxError::Optimizer(format!("{:#}", e)))?;

    let state = result.state();
    let status = match state.get_termination_status() {
        TerminationStatus::Terminated(TerminationReason::SolverConverged) => Status::Converged,
        TerminationStatus::Terminated(TerminationReason::MaxItersReached) => {
            Status::MaxIterations
        }
        TerminationStatus::Terminated(TerminationReason::SolverExit(msg)) => {
            Status::Stopped(msg.clone())
        }
        TerminationStatus::Terminated(other) => Status::Stopped(format!("{:?}", other)),
        TerminationStatus::NotTerminated => Status::InProgress,
    };

    let x = state
        .get_best_param()
        .or_else(|| state.get_param())
        .cloned()
        .ok_or_else(|| TmaxError::Optimizer("optimizer returned no parameters".to_string()))?;
    let cost = state.get_best_cost();

    tracing::debug!(
        "L-BFGS-B finished after {} iterations: {}",
        state.get_iter(),
        status
    );

    Ok(Minimum {
        x,
        cost,
        iterations: state.get_iter(),
        status,
    })
}
