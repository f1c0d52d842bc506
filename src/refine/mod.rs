//! Refinement run tracking
//!
//! A run is one or a batch of backtest jobs for a strategy. The tracker
//! submits them, polls until each job completes or fails, reports every
//! outcome exactly once, and can ask the assistant to summarize the run.

pub mod narrate;
pub mod state;
pub mod tracker;

pub use narrate::follow_up_prompt;
pub use state::{BacktestSummary, RefinementState, RunKind, RunRequest, Stage, TrackerEvent};
pub use tracker::{Narrator, RefinementTracker, TrackerOptions};
