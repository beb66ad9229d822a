use eyre::Result;

use crate::routines::reduction::{Communicator, ControlSummary};

/// What observers learn about one evaluation of the reduced objective
///
/// `summaries[p]` describes the control field of timepoint `p`. `loss` is only known once the
/// forward solve has finished.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationEvent<'e> {
    pub evaluation: usize,
    pub summaries: &'e [ControlSummary],
    pub loss: Option<f64>,
}

/// Hooks called around every forward solve of the reduced objective
///
/// Observers run on every rank. The summaries in the event are already reduced, so an
/// observer must not start collective operations of its own.
pub trait EvaluationObserver {
    /// Called with the new controls, before they are solved for
    fn before_evaluation(&mut self, _event: &EvaluationEvent) -> Result<()> {
        Ok(())
    }

    /// Called once the loss of the controls is known
    fn after_evaluation(&mut self, _event: &EvaluationEvent) -> Result<()> {
        Ok(())
    }
}

/// Logs the control summaries and the loss of every evaluation
///
/// Silent on every rank but the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct ProgressLogger {
    coordinator: bool,
}

impl ProgressLogger {
    pub fn new(comm: &dyn Communicator) -> Self {
        ProgressLogger {
            coordinator: comm.is_coordinator(),
        }
    }
}

impl EvaluationObserver for ProgressLogger {
    fn before_evaluation(&mut self, event: &EvaluationEvent) -> Result<()> {
        if !self.coordinator {
            return Ok(());
        }
        tracing::info!("Evaluation {}", event.evaluation);
        for (p, summary) in event.summaries.iter().enumerate() {
            tracing::info!(
                "Tmax{}: mean = {:.4e}, std = {:.4e}",
                p,
                summary.mean,
                summary.std
            );
        }
        Ok(())
    }

    fn after_evaluation(&mut self, event: &EvaluationEvent) -> Result<()> {
        if !self.coordinator {
            return Ok(());
        }
        if let Some(loss) = event.loss {
            tracing::info!("Evaluation {}: loss = {:.6e}", event.evaluation, loss);
        }
        Ok(())
    }
}
