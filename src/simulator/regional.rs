use std::sync::Arc;

use eyre::Result;
use ndarray::Array1;

use crate::error::TmaxError;
use crate::routines::settings::{MaterialSettings, SimulationSettings};
use crate::simulator::tape::{Block, DiffContext};
use crate::simulator::{ForwardModel, ForwardProblem, ForwardSolution};
use crate::structs::control::ControlSet;
use crate::structs::geometry::Regions;
use crate::structs::trace::SimulationTrace;

/// Pa to mmHg
pub const PA_TO_MMHG: f64 = 0.0075;

/// Reduced-order regional model of the left ventricle
///
/// Every material region carries one fiber stretch `λ_r` and the cavity carries one pressure
/// `P`. At each timepoint the cavity volume is prescribed and the unknowns satisfy
///
/// ```text
/// σ_pas(λ_r) + T_r g(λ_r) - c P = 0        for every region r
/// mean_r(λ_r^3) - V / V_ref = 0
/// ```
///
/// where `σ_pas` is the Guccione fiber stress, `g` the Guccione length-dependent activation,
/// `T_r` the regional mean of the Tmax field and `c` the wall ratio. The nonlinear system is
/// solved by Newton with load stepping, and every timepoint records its exact adjoint on the
/// tape.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionalLaplaceModel;

#[derive(Debug, Clone, Copy)]
struct Material {
    c: f64,
    bff: f64,
    b: f64,
    l0: f64,
    ca0_sq: f64,
    ca0max_sq: f64,
    lr: f64,
    wall_ratio: f64,
}

impl From<&MaterialSettings> for Material {
    fn from(settings: &MaterialSettings) -> Self {
        Material {
            c: settings.c_param,
            bff: settings.bff,
            b: settings.b,
            l0: settings.l0,
            ca0_sq: settings.ca0 * settings.ca0,
            ca0max_sq: settings.ca0max * settings.ca0max,
            lr: settings.lr,
            wall_ratio: settings.wall_ratio,
        }
    }
}

impl Material {
    /// Passive fiber stress and its derivative with respect to the stretch
    fn passive(&self, stretch: f64) -> (f64, f64) {
        let e = green_strain(stretch);
        let q = self.bff * e * e;
        let exp_q = q.exp();
        let stress = self.c * self.bff * e * exp_q;
        let d_stress = self.c * self.bff * exp_q * (1.0 + 2.0 * q) * stretch;
        (stress, d_stress)
    }

    /// Activation factor in `[0, 1)` and its derivative with respect to the stretch
    fn activation(&self, stretch: f64) -> (f64, f64) {
        let l = self.lr * stretch;
        if l <= self.l0 {
            return (0.0, 0.0);
        }
        let exp_l = (self.b * (l - self.l0)).exp();
        let e = exp_l - 1.0;
        let denom = self.ca0_sq * e + self.ca0max_sq;
        let g = self.ca0_sq * e / denom;
        let dg_de = self.ca0_sq * self.ca0max_sq / (denom * denom);
        (g, dg_de * self.b * self.lr * exp_l)
    }

    fn linearize(&self, volume_ratio: f64, tension: &[f64], state: &Equilibrium) -> Linearization {
        let n = state.stretch.len();
        let mut lin = Linearization {
            a: Vec::with_capacity(n),
            b: Vec::with_capacity(n),
            activation: Vec::with_capacity(n),
            f: Vec::with_capacity(n),
            g: 0.0,
        };
        let mut volume = 0.0;
        for (&stretch, &t) in state.stretch.iter().zip(tension.iter()) {
            let (stress, d_stress) = self.passive(stretch);
            let (act, d_act) = self.activation(stretch);
            lin.f.push(stress + t * act - self.wall_ratio * state.pressure);
            lin.a.push(d_stress + t * d_act);
            lin.b.push(3.0 * stretch * stretch / n as f64);
            lin.activation.push(act);
            volume += stretch.powi(3);
        }
        lin.g = volume / n as f64 - volume_ratio;
        lin
    }

    /// Newton solve of the equilibrium for one load increment, starting from `state`
    fn equilibrate(
        &self,
        volume_ratio: f64,
        tension: &[f64],
        state: &mut Equilibrium,
        timepoint: usize,
        settings: &SimulationSettings,
    ) -> Result<usize> {
        let mut lin = self.linearize(volume_ratio, tension, state);
        let initial = lin.norm();
        let mut residual = initial;
        if residual <= settings.abs_tol {
            return Ok(0);
        }

        for iteration in 1..=settings.max_newton_iter {
            let (d_stretch, d_pressure) = match lin.newton_step(self.wall_ratio) {
                Some(step) => step,
                None => break,
            };

            // Halve the step until every stretch stays positive
            let mut alpha = 1.0;
            while state
                .stretch
                .iter()
                .zip(d_stretch.iter())
                .any(|(l, dl)| l + alpha * dl <= 0.0)
            {
                alpha *= 0.5;
                if alpha < 1e-10 {
                    break;
                }
            }
            for (l, dl) in state.stretch.iter_mut().zip(d_stretch.iter()) {
                *l += alpha * dl;
            }
            state.pressure += alpha * d_pressure;

            lin = self.linearize(volume_ratio, tension, state);
            residual = lin.norm();
            if !residual.is_finite() {
                break;
            }
            if residual <= settings.abs_tol || residual <= settings.rel_tol * initial {
                return Ok(iteration);
            }
        }

        Err(TmaxError::Convergence {
            timepoint,
            iterations: settings.max_newton_iter,
            residual,
        }
        .into())
    }
}

fn green_strain(stretch: f64) -> f64 {
    0.5 * (stretch * stretch - 1.0)
}

#[derive(Debug, Clone)]
struct Equilibrium {
    stretch: Vec<f64>,
    pressure: f64,
}

impl Equilibrium {
    /// Stress-free state at the reference volume
    fn reference(nregions: usize) -> Self {
        Equilibrium {
            stretch: vec![1.0; nregions],
            pressure: 0.0,
        }
    }

    fn to_state(&self) -> Array1<f64> {
        self.stretch
            .iter()
            .copied()
            .chain(std::iter::once(self.pressure))
            .collect()
    }
}

/// Residual and Jacobian of the equilibrium system at one state
///
/// The Jacobian has an arrow structure: `a` on the diagonal of the stretch block, `-c` in the
/// pressure column and `b` in the volume row.
#[derive(Debug, Clone)]
struct Linearization {
    a: Vec<f64>,
    b: Vec<f64>,
    activation: Vec<f64>,
    f: Vec<f64>,
    g: f64,
}

impl Linearization {
    fn norm(&self) -> f64 {
        (self.f.iter().map(|f| f * f).sum::<f64>() + self.g * self.g).sqrt()
    }

    fn newton_step(&self, c: f64) -> Option<(Vec<f64>, f64)> {
        if self.a.iter().any(|&a| !(a > 0.0)) {
            return None;
        }
        let s_ba: f64 = self.b.iter().zip(&self.a).map(|(b, a)| b / a).sum();
        let s_bfa: f64 = self
            .b
            .iter()
            .zip(&self.f)
            .zip(&self.a)
            .map(|((b, f), a)| b * f / a)
            .sum();
        let d_pressure = (s_bfa - self.g) / (c * s_ba);
        let d_stretch = self
            .f
            .iter()
            .zip(&self.a)
            .map(|(f, a)| (c * d_pressure - f) / a)
            .collect();
        Some((d_stretch, d_pressure))
    }

    /// Derivative of a loss with respect to the regional tension
    ///
    /// `d_stretch` and `d_pressure` are the partial derivatives of the loss with respect to
    /// the state.
    fn tension_sensitivity(&self, c: f64, d_stretch: &[f64], d_pressure: f64) -> Vec<f64> {
        let s_ba: f64 = self.b.iter().zip(&self.a).map(|(b, a)| b / a).sum();
        let s_ja: f64 = d_stretch.iter().zip(&self.a).map(|(j, a)| j / a).sum();
        let nu = (s_ja + d_pressure / c) / s_ba;
        d_stretch
            .iter()
            .zip(&self.a)
            .zip(&self.b)
            .zip(&self.activation)
            .map(|(((j, a), b), act)| -((j - b * nu) / a) * act)
            .collect()
    }
}

/// Loss of one timepoint together with its linearization
struct EquilibriumBlock {
    timepoint: usize,
    contribution: f64,
    wall_ratio: f64,
    linearization: Linearization,
    d_stretch: Vec<f64>,
    d_pressure: f64,
    regions: Arc<Regions>,
}

impl Block for EquilibriumBlock {
    fn contribution(&self) -> f64 {
        self.contribution
    }

    fn adjoint(&self, seed: f64, grad: &mut [Array1<f64>]) -> Result<()> {
        let sensitivity =
            self.linearization
                .tension_sensitivity(self.wall_ratio, &self.d_stretch, self.d_pressure);
        let field = grad.get_mut(self.timepoint).ok_or_else(|| {
            TmaxError::Optimizer(format!("no gradient slot for timepoint {}", self.timepoint))
        })?;
        let cell_region = self.regions.cell_region();
        if field.len() != cell_region.len() {
            return Err(TmaxError::Optimizer(format!(
                "gradient of timepoint {} has {} entries for {} cells",
                self.timepoint,
                field.len(),
                cell_region.len()
            ))
            .into());
        }
        let sizes = self.regions.sizes();
        for (g, &r) in field.iter_mut().zip(cell_region.iter()) {
            *g += seed * sensitivity[r] / sizes[r] as f64;
        }
        Ok(())
    }
}

/// `k_reg * sum_p mean_c (T[p+1, c] - T[p, c])^2`
struct TemporalRegularization {
    weight: f64,
    global_len: f64,
    differences: Vec<Array1<f64>>,
}

impl Block for TemporalRegularization {
    fn contribution(&self) -> f64 {
        self.weight
            * self
                .differences
                .iter()
                .map(|d| d.dot(d))
                .sum::<f64>()
            / self.global_len
    }

    fn adjoint(&self, seed: f64, grad: &mut [Array1<f64>]) -> Result<()> {
        if grad.len() != self.differences.len() + 1 {
            return Err(TmaxError::Optimizer(format!(
                "regularization spans {} timepoints but the gradient has {}",
                self.differences.len() + 1,
                grad.len()
            ))
            .into());
        }
        let scale = seed * 2.0 * self.weight / self.global_len;
        for (p, d) in self.differences.iter().enumerate() {
            grad[p + 1].scaled_add(scale, d);
            grad[p].scaled_add(-scale, d);
        }
        Ok(())
    }
}

impl RegionalLaplaceModel {
    fn reference_volume(problem: &ForwardProblem) -> f64 {
        problem
            .simulation
            .material
            .reference_volume
            .unwrap_or(problem.targets.lvv()[0])
    }
}

impl ForwardModel for RegionalLaplaceModel {
    fn check(&self, controls: &ControlSet, problem: &ForwardProblem) -> Result<()> {
        let ndatapts = problem.ndatapts();
        if controls.len() != ndatapts {
            return Err(TmaxError::Configuration(format!(
                "{} control fields for {} timepoints",
                controls.len(),
                ndatapts
            ))
            .into());
        }

        let layout = controls.layout();
        let ncells = problem.geometry.ncells();
        if layout.local != layout.global || layout.global != ncells {
            return Err(TmaxError::Configuration(format!(
                "control fields hold {} of {} values but the mesh has {} cells",
                layout.local, layout.global, ncells
            ))
            .into());
        }

        let nregions = problem.geometry.regions().len();
        if let Some(strain) = problem.targets.strain() {
            if strain.nregions() != nregions {
                return Err(TmaxError::Configuration(format!(
                    "strain targets have {} rows but the mesh has {} regions",
                    strain.nregions(),
                    nregions
                ))
                .into());
            }
        }

        let vref = Self::reference_volume(problem);
        if !(vref > 0.0) || problem.targets.lvv().iter().any(|&v| !(v > 0.0)) {
            return Err(TmaxError::Configuration(
                "cavity volumes must be positive".to_string(),
            )
            .into());
        }
        if !(problem.simulation.material.wall_ratio > 0.0) {
            return Err(
                TmaxError::Configuration("wall_ratio must be positive".to_string()).into(),
            );
        }
        Ok(())
    }

    fn solve(
        &self,
        controls: &ControlSet,
        problem: &ForwardProblem,
        ctx: &mut DiffContext,
    ) -> Result<ForwardSolution> {
        self.check(controls, problem)?;

        let settings = &problem.simulation;
        let material = Material::from(&settings.material);
        let targets = &problem.targets;
        let ndatapts = targets.ndatapts();
        let regions = Arc::new(problem.geometry.regions().clone());
        let nregions = regions.len();
        let projections = problem.geometry.fiber_projections();
        let vref = Self::reference_volume(problem);

        let tension: Vec<Vec<f64>> = controls
            .iter()
            .map(|field| regions.mean(field.values()).to_vec())
            .collect();

        let strain_targets = if settings.k_str != 0.0 {
            targets.strain()
        } else {
            None
        };

        let mut state = Equilibrium::reference(nregions);
        let mut trace = SimulationTrace::zeros(ndatapts, nregions);
        let mut objective = 0.0;
        let mut start_ratio = 1.0;
        let mut start_tension = vec![0.0; nregions];

        for p in 0..ndatapts {
            let target_ratio = targets.lvv()[p] / vref;
            let nsteps = if p == 0 {
                settings.n_load_steps
            } else {
                settings.n_intermediate_steps
            }
            .max(1);

            let mut iterations = 0;
            let mut step_tension = vec![0.0; nregions];
            for s in 1..=nsteps {
                let frac = s as f64 / nsteps as f64;
                let ratio = start_ratio + frac * (target_ratio - start_ratio);
                for (t, (t0, t1)) in step_tension
                    .iter_mut()
                    .zip(start_tension.iter().zip(tension[p].iter()))
                {
                    *t = t0 + frac * (t1 - t0);
                }
                iterations += material.equilibrate(ratio, &step_tension, &mut state, p, settings)?;
            }
            tracing::trace!(
                "Timepoint {} reached in {} steps, {} Newton iterations",
                p,
                nsteps,
                iterations
            );

            // Loss and its partial derivatives at the converged state
            let pressure_mmhg = PA_TO_MMHG * state.pressure;
            let mismatch = pressure_mmhg - targets.lvp()[p];
            let mut contribution = settings.k_lvp * mismatch * mismatch;
            let d_pressure = 2.0 * settings.k_lvp * mismatch * PA_TO_MMHG;
            let mut d_stretch = vec![0.0; nregions];

            for (r, &stretch) in state.stretch.iter().enumerate() {
                let (cc, ll) = projections[r];
                let fiber = green_strain(stretch);
                let ecc = fiber * cc;
                let ell = fiber * ll;
                trace.ecc[[r, p]] = ecc;
                trace.ell[[r, p]] = ell;
                trace.err[[r, p]] = -(ecc + ell);

                if let Some(strain) = strain_targets {
                    let dc = ecc - strain.ecc()[[r, p]];
                    let dl = ell - strain.ell()[[r, p]];
                    contribution +=
                        settings.k_str * (settings.k_ecc * dc * dc + settings.k_ell * dl * dl);
                    d_stretch[r] = settings.k_str
                        * (2.0 * settings.k_ecc * dc * cc + 2.0 * settings.k_ell * dl * ll)
                        * stretch;
                }
            }
            trace.lvp[p] = pressure_mmhg;
            trace.lvv[p] = target_ratio * vref;
            objective += contribution;

            let linearization = material.linearize(target_ratio, &tension[p], &state);
            let wall_ratio = material.wall_ratio;
            let shared = regions.clone();
            ctx.record(move || {
                Box::new(EquilibriumBlock {
                    timepoint: p,
                    contribution,
                    wall_ratio,
                    linearization,
                    d_stretch,
                    d_pressure,
                    regions: shared,
                }) as Box<dyn Block>
            });

            start_ratio = target_ratio;
            start_tension.clone_from(&tension[p]);
        }

        trace.controls = controls.iter().map(|f| f.values().clone()).collect();

        if settings.k_reg != 0.0 && ndatapts > 1 {
            let global_len = controls.layout().global.max(1) as f64;
            let differences: Vec<Array1<f64>> = controls
                .fields()
                .windows(2)
                .map(|pair| pair[1].values() - pair[0].values())
                .collect();
            let regularization = TemporalRegularization {
                weight: settings.k_reg,
                global_len,
                differences,
            };
            objective += regularization.contribution();
            ctx.record(move || Box::new(regularization) as Box<dyn Block>);
        }

        Ok(ForwardSolution {
            state: state.to_state(),
            objective,
            trace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::control::{ControlBounds, FieldLayout};
    use crate::structs::geometry::Geometry;
    use crate::structs::targets::TargetSeries;
    use ndarray::{array, Array2};

    fn settings() -> SimulationSettings {
        SimulationSettings {
            n_load_steps: 4,
            n_intermediate_steps: 3,
            abs_tol: 1e-9,
            rel_tol: 1e-12,
            k_lvp: 1.0,
            k_str: 1e3,
            k_ecc: 1.0,
            k_ell: 0.5,
            k_reg: 1e-6,
            ..SimulationSettings::default()
        }
    }

    fn problem(simulation: SimulationSettings) -> ForwardProblem {
        let targets = TargetSeries::new(
            array![10.0, 80.0, 100.0],
            array![120.0, 100.0, 70.0],
            Some(array![[0.0, -0.05, -0.12], [0.0, -0.04, -0.10]]),
            Some(array![[0.0, -0.03, -0.08], [0.0, -0.02, -0.09]]),
        )
        .unwrap();
        let geometry = Geometry::idealized(4, 2, 60.0).unwrap();
        ForwardProblem::new(targets, geometry, simulation)
    }

    fn controls(values: &[f64]) -> ControlSet {
        let mut set = ControlSet::init(
            3,
            FieldLayout::serial(4),
            0.0,
            ControlBounds::new(0.0, 1e6).unwrap(),
            None,
        )
        .unwrap();
        set.assign(values).unwrap();
        set
    }

    fn values() -> Vec<f64> {
        vec![
            1.5e3, 2.5e3, 1.0e3, 2.0e3, //
            2.0e4, 3.5e4, 2.5e4, 3.0e4, //
            4.0e4, 5.0e4, 3.0e4, 4.5e4,
        ]
    }

    #[test]
    fn uniform_tension_gives_uniform_stretch() {
        let mut simulation = settings();
        simulation.k_str = 0.0;
        simulation.k_reg = 0.0;
        let problem = problem(simulation.clone());
        let set = controls(&[3e4; 12]);
        let solution = RegionalLaplaceModel
            .solve(&set, &problem, &mut DiffContext::disabled())
            .unwrap();

        let material = Material::from(&simulation.material);
        let stretch = (70.0f64 / 120.0).cbrt();
        assert!((solution.state[0] - stretch).abs() < 1e-10);
        assert!((solution.state[1] - stretch).abs() < 1e-10);

        let (stress, _) = material.passive(stretch);
        let (act, _) = material.activation(stretch);
        let pressure = (stress + 3e4 * act) / material.wall_ratio;
        assert!((solution.state[2] - pressure).abs() < 1e-6 * pressure);
        assert!((solution.trace.lvp[2] - PA_TO_MMHG * pressure).abs() < 1e-6);
    }

    #[test]
    fn tape_gradient_matches_finite_differences() {
        let problem = problem(settings());
        let x = values();

        let mut ctx = DiffContext::annotate();
        let solution = RegionalLaplaceModel
            .solve(&controls(&x), &problem, &mut ctx)
            .unwrap();
        let tape = ctx.into_tape().unwrap();
        assert!((tape.functional() - solution.objective).abs() < 1e-9 * solution.objective);

        let grad: Vec<f64> = tape
            .gradient(&[4, 4, 4])
            .unwrap()
            .into_iter()
            .flat_map(|g| g.to_vec())
            .collect();

        let objective = |x: &[f64]| {
            RegionalLaplaceModel
                .solve(&controls(x), &problem, &mut DiffContext::disabled())
                .unwrap()
                .objective
        };
        let h = 1.0;
        for i in 0..x.len() {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[i] += h;
            minus[i] -= h;
            let fd = (objective(&plus) - objective(&minus)) / (2.0 * h);
            assert!(
                (fd - grad[i]).abs() <= 1e-5 * fd.abs().max(1e-3),
                "component {}: adjoint {} vs finite difference {}",
                i,
                grad[i],
                fd
            );
        }
    }

    #[test]
    fn disabled_context_gives_identical_trace() {
        let problem = problem(settings());
        let set = controls(&values());
        let mut ctx = DiffContext::annotate();
        let annotated = RegionalLaplaceModel.solve(&set, &problem, &mut ctx).unwrap();
        let plain = RegionalLaplaceModel
            .solve(&set, &problem, &mut DiffContext::disabled())
            .unwrap();
        assert_eq!(annotated.trace, plain.trace);
        assert_eq!(annotated.objective, plain.objective);
        assert_eq!(ctx.tape().map(|t| t.len()), Some(4));
    }

    #[test]
    fn newton_failure_is_a_convergence_error() {
        let mut simulation = settings();
        simulation.max_newton_iter = 0;
        let problem = problem(simulation);
        let err = RegionalLaplaceModel
            .solve(&controls(&values()), &problem, &mut DiffContext::disabled())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TmaxError>(),
            Some(TmaxError::Convergence { timepoint: 0, .. })
        ));
    }

    #[test]
    fn strain_rows_must_match_regions() {
        let targets = TargetSeries::new(
            array![10.0, 80.0, 100.0],
            array![120.0, 100.0, 70.0],
            Some(Array2::zeros((3, 3))),
            Some(Array2::zeros((3, 3))),
        )
        .unwrap();
        let problem = ForwardProblem::new(
            targets,
            Geometry::idealized(4, 2, 60.0).unwrap(),
            settings(),
        );
        let err = RegionalLaplaceModel
            .check(&controls(&values()), &problem)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TmaxError>(),
            Some(TmaxError::Configuration(_))
        ));
    }
}
