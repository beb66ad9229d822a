pub mod lbfgsb;
pub mod observer;
pub mod reduced;

pub use lbfgsb::{minimize, LbfgsB, Minimum};
pub use observer::{EvaluationEvent, EvaluationObserver, ProgressLogger};
pub use reduced::{Objective, ReducedFunctional};
