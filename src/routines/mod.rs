// Reading meshes, measured data and checkpoints
pub mod data;
// Routines for logging
pub mod logger;
// Optimizer and reduced objective
pub mod optimization;
// Routines for output
pub mod output;
// Collective reductions over field partitions
pub mod reduction;
// Routines for settings
pub mod settings;
