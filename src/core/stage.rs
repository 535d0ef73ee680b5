//! Stage domain model

use std::collections::HashSet;
use std::time::Duration;

use crate::core::state::StageState;

/// A single stage in a provisioning plan
#[derive(Debug, Clone)]
pub struct Stage {
    /// Unique stage identifier
    pub id: String,

    /// Human-readable stage name
    pub name: String,

    /// What this stage installs and removes
    pub kind: StageKind,

    /// Stage IDs that must be Ready before this stage installs
    pub dependencies: Vec<String>,

    /// How readiness is observed after install
    pub readiness: ReadinessSpec,

    /// Fixed interval between readiness polls
    pub poll_interval: Duration,

    /// Hard deadline for the readiness wait
    pub deadline: Duration,

    /// If set, teardown asks the operator to confirm with this warning
    /// before removing the stage (used for stages with persistent volumes)
    pub confirm_teardown: Option<String>,

    /// Runtime state
    pub state: StageState,
}

/// The install/uninstall behavior of a stage
#[derive(Debug, Clone)]
pub enum StageKind {
    /// Install k3s on the local host via the upstream install script
    K3s,

    /// Launch the secret store's dev-mode server as a detached process
    VaultDev { addr: String },

    /// Collect operator input, generate derived secrets, seed the store
    SecretSeed,

    /// Install a Helm chart
    Helm(HelmChartSpec),

    /// Apply a set of rendered Kubernetes manifests
    Manifests(ManifestSpec),
}

/// Helm chart installation parameters
#[derive(Debug, Clone)]
pub struct HelmChartSpec {
    /// Repository to add before installing (None for OCI/local charts)
    pub repo: Option<HelmRepo>,

    /// Chart reference, e.g. "external-secrets/external-secrets"
    pub chart: String,

    /// Release name
    pub release: String,

    /// Target namespace (created if absent)
    pub namespace: String,

    /// --set overrides; values are rendered against context variables
    pub set: Vec<(String, String)>,

    /// Optional values file path (relative to the plan file)
    pub values_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HelmRepo {
    pub name: String,
    pub url: String,
}

/// Manifest application parameters
#[derive(Debug, Clone)]
pub struct ManifestSpec {
    /// Target namespace (created if absent)
    pub namespace: String,

    /// Manifest file paths relative to the plan file
    pub files: Vec<String>,

    /// Inline manifest documents (rendered against context variables)
    pub inline: Vec<String>,

    /// When set, a Kubernetes secret holding the store token is created in
    /// this namespace before the manifests are applied (the secret-sync
    /// operator authenticates to the store through it)
    pub store_token_secret: Option<TokenSecretRef>,
}

#[derive(Debug, Clone)]
pub struct TokenSecretRef {
    pub namespace: String,
    pub name: String,
}

/// Declarative readiness check for a stage
#[derive(Debug, Clone)]
pub enum ReadinessSpec {
    /// Stage is ready as soon as its install action returns
    Immediate,
    /// Kubernetes API answers readyz
    Cluster,
    /// Secret store reports initialized and unsealed
    StoreHealthy,
    /// A deployment has at least one available replica
    Deployment { namespace: String, name: String },
    /// A pod reports phase Running
    Pod { namespace: String, name: String },
    /// An ExternalSecret object reports SecretSynced
    ExternalSecret { namespace: String, name: String },
}

impl ReadinessSpec {
    /// Human-readable description for wait logging
    pub fn describe(&self) -> String {
        match self {
            ReadinessSpec::Immediate => "install completion".to_string(),
            ReadinessSpec::Cluster => "Kubernetes API readiness".to_string(),
            ReadinessSpec::StoreHealthy => "secret store health".to_string(),
            ReadinessSpec::Deployment { namespace, name } => {
                format!("deployment {namespace}/{name}")
            }
            ReadinessSpec::Pod { namespace, name } => format!("pod {namespace}/{name}"),
            ReadinessSpec::ExternalSecret { namespace, name } => {
                format!("ExternalSecret {namespace}/{name} sync")
            }
        }
    }
}

/// Plan-level defaults applied when a stage omits its own values
#[derive(Debug, Clone)]
pub struct StageDefaults {
    pub poll_interval_secs: u64,
    pub deadline_secs: u64,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            deadline_secs: 300, // 5 minutes
        }
    }
}

impl Stage {
    /// Check if all dependencies have reached readiness
    pub fn dependencies_met(&self, ready_stages: &HashSet<String>) -> bool {
        self.dependencies.iter().all(|dep| ready_stages.contains(dep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::StageState;

    fn stage_with_deps(id: &str, deps: &[&str]) -> Stage {
        Stage {
            id: id.to_string(),
            name: id.to_string(),
            kind: StageKind::K3s,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            readiness: ReadinessSpec::Immediate,
            poll_interval: Duration::from_secs(2),
            deadline: Duration::from_secs(300),
            confirm_teardown: None,
            state: StageState::Pending,
        }
    }

    #[test]
    fn test_dependencies_met() {
        let stage = stage_with_deps("seed", &["vault"]);

        let mut ready = HashSet::new();
        assert!(!stage.dependencies_met(&ready));

        ready.insert("vault".to_string());
        assert!(stage.dependencies_met(&ready));
    }

    #[test]
    fn test_readiness_describe() {
        let spec = ReadinessSpec::Deployment {
            namespace: "external-secrets".to_string(),
            name: "external-secrets-webhook".to_string(),
        };
        assert_eq!(
            spec.describe(),
            "deployment external-secrets/external-secrets-webhook"
        );
    }
}
