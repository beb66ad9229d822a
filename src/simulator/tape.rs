use eyre::Result;
use ndarray::Array1;

use crate::error::TmaxError;

/// One recorded step of a forward solve
///
/// A block contributes a scalar term to the objective and knows how to push an adjoint seed
/// for that term back onto the control fields. `grad[p]` is the gradient with respect to the
/// control field of timepoint `p`.
pub trait Block: Send {
    fn contribution(&self) -> f64;
    fn adjoint(&self, seed: f64, grad: &mut [Array1<f64>]) -> Result<()>;
}

/// Ordered record of the blocks of a forward solve
#[derive(Default)]
pub struct Tape {
    blocks: Vec<Box<dyn Block>>,
}

impl Tape {
    pub fn new() -> Self {
        Tape::default()
    }

    pub fn record(&mut self, block: Box<dyn Block>) {
        self.blocks.push(block);
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Objective value the recorded blocks add up to
    pub fn functional(&self) -> f64 {
        self.blocks.iter().map(|b| b.contribution()).sum()
    }

    /// Gradient of [Tape::functional] with respect to every control field
    ///
    /// Blocks are replayed in reverse order of recording. `shape` gives the local length of each
    /// field.
    pub fn gradient(&self, shape: &[usize]) -> Result<Vec<Array1<f64>>> {
        if self.blocks.is_empty() {
            return Err(TmaxError::Optimizer(
                "cannot differentiate an empty tape".to_string(),
            )
            .into());
        }
        let mut grad: Vec<Array1<f64>> = shape.iter().map(|&n| Array1::zeros(n)).collect();
        for block in self.blocks.iter().rev() {
            block.adjoint(1.0, &mut grad)?;
        }
        Ok(grad)
    }
}

impl std::fmt::Debug for Tape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tape")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

/// Differentiation context handed explicitly to every forward solve
///
/// An annotating context owns a tape that the model records its blocks on. A disabled context
/// runs the same code path and drops every block.
#[derive(Debug, Default)]
pub struct DiffContext {
    tape: Option<Tape>,
}

impl DiffContext {
    pub fn annotate() -> Self {
        DiffContext {
            tape: Some(Tape::new()),
        }
    }

    pub fn disabled() -> Self {
        DiffContext { tape: None }
    }

    pub fn is_annotating(&self) -> bool {
        self.tape.is_some()
    }

    /// Record a block; the closure only runs when annotating
    pub fn record<F>(&mut self, block: F)
    where
        F: FnOnce() -> Box<dyn Block>,
    {
        if let Some(tape) = self.tape.as_mut() {
            tape.record(block());
        }
    }

    pub fn tape(&self) -> Option<&Tape> {
        self.tape.as_ref()
    }

    pub fn into_tape(self) -> Option<Tape> {
        self.tape
    }
}
