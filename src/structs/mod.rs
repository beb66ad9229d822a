pub mod checkpoint;
pub mod control;
pub mod geometry;
pub mod targets;
pub mod trace;
