//! Plan domain model

use std::collections::HashMap;
use std::time::Duration;

use crate::core::config::{PlanConfig, ReadinessConfig, StageConfig, StageKindConfig};
use crate::core::stage::{
    HelmChartSpec, HelmRepo, ManifestSpec, ReadinessSpec, Stage, StageDefaults, StageKind,
    TokenSecretRef,
};
use crate::core::state::{RunState, StageState};

/// A complete provisioning plan ready for execution
#[derive(Debug, Clone)]
pub struct Plan {
    /// Plan name
    pub name: String,

    /// Template variables available to all stages
    pub variables: HashMap<String, String>,

    /// All stages, keyed by ID
    pub stages: HashMap<String, Stage>,

    /// Run-level state
    pub state: RunState,

    /// Stage IDs in install order (dependencies first)
    bootstrap_order: Vec<String>,
}

impl Plan {
    /// Build a plan from validated configuration
    pub fn from_config(config: &PlanConfig) -> Self {
        let defaults = StageDefaults {
            poll_interval_secs: config
                .poll_interval_secs
                .unwrap_or(StageDefaults::default().poll_interval_secs),
            deadline_secs: config
                .deadline_secs
                .unwrap_or(StageDefaults::default().deadline_secs),
        };

        let mut stages = HashMap::new();
        for stage_config in &config.stages {
            let stage = stage_from_config(stage_config, &defaults);
            stages.insert(stage.id.clone(), stage);
        }

        let bootstrap_order = topological_sort(&config.stages);
        let state = RunState::new();

        Self {
            name: config.name.clone(),
            variables: config.variables.clone(),
            stages,
            state,
            bootstrap_order,
        }
    }

    /// Stage IDs in install order (dependencies before dependents)
    pub fn bootstrap_order(&self) -> &[String] {
        &self.bootstrap_order
    }

    /// Stage IDs in removal order (reverse of install order)
    pub fn teardown_order(&self) -> Vec<String> {
        let mut order = self.bootstrap_order.clone();
        order.reverse();
        order
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.get(id)
    }

    pub fn stage_mut(&mut self, id: &str) -> Option<&mut Stage> {
        self.stages.get_mut(id)
    }

    /// True when every stage has reached Ready
    pub fn is_complete(&self) -> bool {
        self.stages.values().all(|s| s.state.is_ready())
    }
}

fn stage_from_config(config: &StageConfig, defaults: &StageDefaults) -> Stage {
    let kind = match &config.kind {
        StageKindConfig::K3s => StageKind::K3s,
        StageKindConfig::VaultDev { addr } => StageKind::VaultDev { addr: addr.clone() },
        StageKindConfig::SecretSeed => StageKind::SecretSeed,
        StageKindConfig::Helm {
            chart,
            release,
            namespace,
            repo,
            set,
            values_file,
        } => {
            let mut set: Vec<(String, String)> = set
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            // HashMap iteration order is arbitrary; keep helm args stable
            set.sort();
            StageKind::Helm(HelmChartSpec {
                repo: repo.as_ref().map(|r| HelmRepo {
                    name: r.name.clone(),
                    url: r.url.clone(),
                }),
                chart: chart.clone(),
                release: release.clone(),
                namespace: namespace.clone(),
                set,
                values_file: values_file.clone(),
            })
        }
        StageKindConfig::Manifests {
            namespace,
            files,
            inline,
            store_token_secret,
        } => StageKind::Manifests(ManifestSpec {
            namespace: namespace.clone(),
            files: files.clone(),
            inline: inline.clone(),
            store_token_secret: store_token_secret.as_ref().map(|t| TokenSecretRef {
                namespace: t.namespace.clone(),
                name: t.name.clone(),
            }),
        }),
    };

    let readiness = match &config.readiness {
        Some(r) => readiness_from_config(r),
        None => default_readiness(&kind),
    };

    Stage {
        id: config.id.clone(),
        name: config.name.clone(),
        kind,
        dependencies: config.depends_on.clone(),
        readiness,
        poll_interval: Duration::from_secs(
            config.poll_interval_secs.unwrap_or(defaults.poll_interval_secs),
        ),
        deadline: Duration::from_secs(config.deadline_secs.unwrap_or(defaults.deadline_secs)),
        confirm_teardown: config.confirm_teardown.clone(),
        state: StageState::Pending,
    }
}

fn readiness_from_config(config: &ReadinessConfig) -> ReadinessSpec {
    match config {
        ReadinessConfig::Immediate => ReadinessSpec::Immediate,
        ReadinessConfig::Cluster => ReadinessSpec::Cluster,
        ReadinessConfig::StoreHealthy => ReadinessSpec::StoreHealthy,
        ReadinessConfig::Deployment { namespace, name } => ReadinessSpec::Deployment {
            namespace: namespace.clone(),
            name: name.clone(),
        },
        ReadinessConfig::Pod { namespace, name } => ReadinessSpec::Pod {
            namespace: namespace.clone(),
            name: name.clone(),
        },
        ReadinessConfig::ExternalSecret { namespace, name } => ReadinessSpec::ExternalSecret {
            namespace: namespace.clone(),
            name: name.clone(),
        },
    }
}

/// Readiness check used when a stage declares none
fn default_readiness(kind: &StageKind) -> ReadinessSpec {
    match kind {
        StageKind::K3s => ReadinessSpec::Cluster,
        StageKind::VaultDev { .. } => ReadinessSpec::StoreHealthy,
        _ => ReadinessSpec::Immediate,
    }
}

/// Order stages so dependencies come before dependents. Depth-first
/// post-order; ties broken by declaration order. Config validation has
/// already rejected cycles.
fn topological_sort(stages: &[StageConfig]) -> Vec<String> {
    let mut order = Vec::new();
    let mut visited = std::collections::HashSet::new();

    fn visit(
        id: &str,
        stages: &[StageConfig],
        visited: &mut std::collections::HashSet<String>,
        order: &mut Vec<String>,
    ) {
        if visited.contains(id) {
            return;
        }
        visited.insert(id.to_string());

        if let Some(stage) = stages.iter().find(|s| s.id == id) {
            for dep in &stage.depends_on {
                visit(dep, stages, visited, order);
            }
        }

        order.push(id.to_string());
    }

    for stage in stages {
        visit(&stage.id, stages, &mut visited, &mut order);
    }

    order
}
