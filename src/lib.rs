//! labforge - bootstrap and teardown orchestrator for a k3s network
//! lab plus its VPN + simulation-host cloud topology

pub mod cli;
pub mod cluster;
pub mod core;
pub mod exec;
pub mod infra;
pub mod probe;
pub mod secrets;
pub mod stages;

// Re-export commonly used types
pub use cluster::{ClusterClient, ShellCluster};
pub use core::{Plan, PlanConfig, RunContext, RunState, RunStatus, Sensitive, Stage, StageState};
pub use exec::{BootstrapEngine, EngineError, RunEvent, TeardownReport};
pub use infra::{InfraError, Provisioner, TopologyConfig};
pub use probe::{Check, ProbeError, ReadinessProbe};
pub use secrets::{SecretError, SecretSeeder, SecretStore};
pub use stages::{LabDriver, StageDriver};

/// Plan shipped in the binary, used when no plan file is given
pub const DEFAULT_PLAN: &str = include_str!("../plans/default.yaml");
