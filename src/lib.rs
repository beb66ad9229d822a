//! Estimation of regional active tension (Tmax) in the left ventricle
//!
//! Given a patient mesh and measured pressure-volume and regional strain data over a cardiac
//! cycle, tmaxopt searches one bounded Tmax field per timepoint such that a forward model of
//! the ventricle reproduces the data. Gradients come from adjoint blocks recorded on an
//! explicit [simulator::tape::DiffContext] during each forward solve, and the bounded problem
//! is solved with L-BFGS-B.
//!
//! The usual entrypoint is [entrypoints::fit], configured from a TOML file read with
//! [routines::settings::read_settings]. [entrypoints::fit_with] accepts custom forward models.

pub mod algorithms;
pub mod entrypoints;
pub mod error;
pub mod routines;
pub mod simulator;
pub mod structs;

pub mod prelude {
    pub use crate::algorithms::{validate, Status, TmaxEstimation};
    pub use crate::entrypoints::{fit, fit_with};
    pub use crate::error::TmaxError;
    pub use crate::routines::data::{read_targets, MeshLoader, NpzMeshLoader};
    pub use crate::routines::optimization::{
        minimize, EvaluationEvent, EvaluationObserver, ReducedFunctional,
    };
    pub use crate::routines::output::TmaxResult;
    pub use crate::routines::reduction::{Communicator, ControlSummary, SelfComm};
    pub use crate::routines::settings::{read_settings, Settings};
    pub use crate::simulator::regional::RegionalLaplaceModel;
    pub use crate::simulator::tape::{Block, DiffContext, Tape};
    pub use crate::simulator::{ForwardModel, ForwardProblem, ForwardSolution};
    pub use crate::structs::checkpoint::Checkpoint;
    pub use crate::structs::control::{ControlBounds, ControlSet, FieldLayout};
    pub use crate::structs::geometry::Geometry;
    pub use crate::structs::targets::TargetSeries;
    pub use crate::structs::trace::SimulationTrace;
}
