//! Run orchestration: ordered installs, readiness waits, teardown

pub mod engine;
pub mod runner;

pub use engine::{BootstrapEngine, EventHandler, RunEvent, TeardownReport};
pub use runner::StageRunner;

use crate::probe::ProbeError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Stage '{stage}' install failed: {source}")]
    Install {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Stage '{stage}' never became ready: {source}")]
    Readiness {
        stage: String,
        #[source]
        source: ProbeError,
    },

    #[error("Run cancelled during stage '{stage}'")]
    Cancelled { stage: String },

    #[error("Stage '{stage}' not found in plan")]
    UnknownStage { stage: String },
}
