//! Core domain model: plans, stages, run state, and execution context

pub mod config;
pub mod context;
pub mod plan;
pub mod stage;
pub mod state;

pub use config::PlanConfig;
pub use context::{RunContext, Sensitive};
pub use plan::Plan;
pub use stage::{Stage, StageKind};
pub use state::{RunState, RunStatus, StageState};
