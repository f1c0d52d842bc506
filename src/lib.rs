//! Strategy workbench library crate
//!
//! Structural patching of strategy files and tracking of backtest refinement
//! runs. Exposed as a library so benchmarks and other front ends can drive
//! the same code paths as the CLI.

pub mod assistant;
pub mod backtest;
pub mod config;
pub mod diff;
pub mod gateway;
pub mod patch;
pub mod refine;
pub mod util;
