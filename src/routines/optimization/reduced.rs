use std::cell::{Cell, RefCell};
use std::path::PathBuf;

use argmin::core::{CostFunction, Error, Gradient};
use eyre::{Report, Result};

use crate::error::TmaxError;
use crate::routines::optimization::observer::{EvaluationEvent, EvaluationObserver};
use crate::routines::reduction::Communicator;
use crate::simulator::tape::{DiffContext, Tape};
use crate::simulator::{ForwardModel, ForwardProblem};
use crate::structs::checkpoint::{evaluation_record_name, record_name, Checkpoint};
use crate::structs::control::ControlSet;
use crate::structs::trace::SimulationTrace;

/// Last control assignment that was solved for
struct Evaluation {
    x: Vec<f64>,
    objective: f64,
    tape: Tape,
    trace: SimulationTrace,
    gradient: Option<Vec<f64>>,
}

/// Control history of a run, rewritten to disk before every forward solve
///
/// Records are only ever added: `Tmax{p}_eval{n}` holds the controls of evaluation `n` and
/// `Tmax{p}` the most recent ones, so the file can seed a resumed run.
struct DebugLog {
    path: PathBuf,
    records: Checkpoint,
}

impl DebugLog {
    fn append(&mut self, evaluation: usize, controls: &ControlSet) -> Result<()> {
        for field in controls.iter() {
            self.records.insert(
                evaluation_record_name(field.index(), evaluation),
                field.values().clone(),
            );
            self.records
                .insert(record_name(field.index()), field.values().clone());
        }
        self.records.write(&self.path)
    }
}

/// The loss as a function of the flattened controls only
///
/// Every distinct control vector costs one annotated forward solve. The cost and the gradient
/// at the same point share that solve: the gradient replays the tape of the cached evaluation.
/// Observers are called before and after each solve, never for cache hits.
pub struct ReducedFunctional<'a, M: ForwardModel> {
    model: &'a M,
    problem: &'a ForwardProblem,
    comm: &'a dyn Communicator,
    controls: RefCell<ControlSet>,
    observers: RefCell<Vec<Box<dyn EvaluationObserver + 'a>>>,
    debug_log: RefCell<Option<DebugLog>>,
    cache: RefCell<Option<Evaluation>>,
    evaluations: Cell<usize>,
    failure: RefCell<Option<Report>>,
}

impl<'a, M: ForwardModel> ReducedFunctional<'a, M> {
    pub fn new(
        model: &'a M,
        problem: &'a ForwardProblem,
        controls: ControlSet,
        comm: &'a dyn Communicator,
    ) -> Self {
        ReducedFunctional {
            model,
            problem,
            comm,
            controls: RefCell::new(controls),
            observers: RefCell::new(Vec::new()),
            debug_log: RefCell::new(None),
            cache: RefCell::new(None),
            evaluations: Cell::new(0),
            failure: RefCell::new(None),
        }
    }

    pub fn with_observer(self, observer: impl EvaluationObserver + 'a) -> Self {
        self.observers.borrow_mut().push(Box::new(observer));
        self
    }

    /// Keep the controls of every evaluation in the checkpoint at `path`
    ///
    /// The controls are saved before the forward solve, so the file also holds the point of an
    /// evaluation that failed. Only the coordinator writes.
    pub fn with_debug_checkpoint(self, path: impl Into<PathBuf>) -> Self {
        if self.comm.is_coordinator() {
            *self.debug_log.borrow_mut() = Some(DebugLog {
                path: path.into(),
                records: Checkpoint::new(),
            });
        }
        self
    }

    /// Number of forward solves done so far
    pub fn evaluations(&self) -> usize {
        self.evaluations.get()
    }

    pub fn controls(&self) -> ControlSet {
        self.controls.borrow().clone()
    }

    /// Objective at `x`, solving the forward model unless `x` was the last point evaluated
    pub fn evaluate(&self, x: &[f64]) -> Result<f64> {
        if let Some(cached) = self.cache.borrow().as_ref() {
            if cached.x.as_slice() == x {
                return Ok(cached.objective);
            }
        }

        let summaries = {
            let mut controls = self.controls.borrow_mut();
            controls.assign(x)?;
            controls.summaries(self.comm)
        };
        let evaluation = self.evaluations.get() + 1;
        self.evaluations.set(evaluation);

        for observer in self.observers.borrow_mut().iter_mut() {
            observer.before_evaluation(&EvaluationEvent {
                evaluation,
                summaries: &summaries,
                loss: None,
            })?;
        }

        if let Some(log) = self.debug_log.borrow_mut().as_mut() {
            log.append(evaluation, &self.controls.borrow())?;
        }

        // A new assignment invalidates the previous tape
        self.cache.borrow_mut().take();
        let mut ctx = DiffContext::annotate();
        let solution = self
            .model
            .solve(&self.controls.borrow(), self.problem, &mut ctx)?;
        let tape = ctx
            .into_tape()
            .ok_or_else(|| TmaxError::Optimizer("forward solve dropped its tape".to_string()))?;

        for observer in self.observers.borrow_mut().iter_mut() {
            observer.after_evaluation(&EvaluationEvent {
                evaluation,
                summaries: &summaries,
                loss: Some(solution.objective),
            })?;
        }

        let objective = solution.objective;
        *self.cache.borrow_mut() = Some(Evaluation {
            x: x.to_vec(),
            objective,
            tape,
            trace: solution.trace,
            gradient: None,
        });
        Ok(objective)
    }

    /// Gradient at `x`, flattened in the same order as the controls
    pub fn gradient(&self, x: &[f64]) -> Result<Vec<f64>> {
        self.evaluate(x)?;
        let mut cache = self.cache.borrow_mut();
        let cached = cache
            .as_mut()
            .ok_or_else(|| TmaxError::Optimizer("no evaluation to differentiate".to_string()))?;
        if let Some(gradient) = &cached.gradient {
            return Ok(gradient.clone());
        }

        let controls = self.controls.borrow();
        let shape = vec![controls.layout().local; controls.len()];
        let gradient: Vec<f64> = cached
            .tape
            .gradient(&shape)?
            .into_iter()
            .flat_map(|g| g.to_vec())
            .collect();
        cached.gradient = Some(gradient.clone());
        Ok(gradient)
    }

    /// Trace of the most recent forward solve
    pub fn last_trace(&self) -> Option<SimulationTrace> {
        self.cache.borrow().as_ref().map(|c| c.trace.clone())
    }

    /// Control vector of the most recent forward solve
    pub fn last_point(&self) -> Option<Vec<f64>> {
        self.cache.borrow().as_ref().map(|c| c.x.clone())
    }

    /// The error that made the last evaluation fail, if any
    pub fn take_failure(&self) -> Option<Report> {
        self.failure.borrow_mut().take()
    }

    pub fn into_controls(self) -> ControlSet {
        self.controls.into_inner()
    }

    /// Keep the forward model's report and hand the optimizer a message-only copy
    fn fail(&self, report: Report) -> Error {
        let message = format!("{:#}", report);
        *self.failure.borrow_mut() = Some(report);
        Error::msg(message)
    }

    pub fn objective(&self) -> Objective<'_, 'a, M> {
        Objective { functional: self }
    }
}

/// Borrowing adapter that lets the optimizer drive a [ReducedFunctional]
pub struct Objective<'r, 'a, M: ForwardModel> {
    functional: &'r ReducedFunctional<'a, M>,
}

impl<M: ForwardModel> CostFunction for Objective<'_, '_, M> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, Error> {
        self.functional
            .evaluate(x)
            .map_err(|e| self.functional.fail(e))
    }
}

impl<M: ForwardModel> Gradient for Objective<'_, '_, M> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> std::result::Result<Self::Gradient, Error> {
        self.functional
            .gradient(x)
            .map_err(|e| self.functional.fail(e))
    }
}
