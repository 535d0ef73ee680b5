//! Plan configuration from YAML

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::plan::Plan;

/// Top-level plan configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Plan name
    pub name: String,

    /// Plan version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Template variables available to all stages (hostnames, chart values)
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Ordered stage declarations
    pub stages: Vec<StageConfig>,

    /// Default seconds between readiness polls
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    /// Default readiness deadline per stage (in seconds)
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

/// Stage configuration as declared in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage identifier
    pub id: String,

    /// Human-readable stage name
    pub name: String,

    /// Stage behavior and its parameters
    #[serde(flatten)]
    pub kind: StageKindConfig,

    /// Stage IDs this stage depends on
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Readiness check (defaults per kind when omitted)
    #[serde(default)]
    pub readiness: Option<ReadinessConfig>,

    /// Seconds between readiness polls (overrides plan default)
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    /// Readiness deadline for this stage (overrides plan default)
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    /// Warning shown (and confirmed) before this stage is torn down
    #[serde(default)]
    pub confirm_teardown: Option<String>,
}

/// Stage kinds and their parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StageKindConfig {
    /// Local k3s install via the upstream script
    K3s,

    /// Detached dev-mode secret store server
    VaultDev {
        #[serde(default = "default_vault_addr")]
        addr: String,
    },

    /// Operator-input collection + secret store seeding
    SecretSeed,

    /// Helm chart install
    Helm {
        chart: String,
        release: String,
        namespace: String,
        #[serde(default)]
        repo: Option<HelmRepoConfig>,
        #[serde(default)]
        set: HashMap<String, String>,
        #[serde(default)]
        values_file: Option<String>,
    },

    /// Kubernetes manifest application
    Manifests {
        namespace: String,
        #[serde(default)]
        files: Vec<String>,
        #[serde(default)]
        inline: Vec<String>,
        #[serde(default)]
        store_token_secret: Option<TokenSecretConfig>,
    },
}

fn default_vault_addr() -> String {
    "http://127.0.0.1:8200".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelmRepoConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSecretConfig {
    pub namespace: String,
    pub name: String,
}

/// Readiness check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "kebab-case")]
pub enum ReadinessConfig {
    /// Stage is ready when its install action returns
    Immediate,
    /// Kubernetes API answers readyz
    Cluster,
    /// Secret store reports healthy
    StoreHealthy,
    /// Deployment has an available replica
    Deployment { namespace: String, name: String },
    /// Pod reports phase Running
    Pod { namespace: String, name: String },
    /// ExternalSecret reports synced
    ExternalSecret { namespace: String, name: String },
}

impl PlanConfig {
    /// Load plan configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse plan configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PlanConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the plan configuration
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            anyhow::bail!("Plan '{}' declares no stages", self.name);
        }

        // Check that all stage IDs are unique
        let mut seen_ids = HashSet::new();
        for stage in &self.stages {
            if !seen_ids.insert(&stage.id) {
                anyhow::bail!("Duplicate stage ID: {}", stage.id);
            }
        }

        // Check that all dependencies reference existing stages
        let stage_ids: HashSet<_> = self.stages.iter().map(|s| &s.id).collect();
        for stage in &self.stages {
            for dep in &stage.depends_on {
                if !stage_ids.contains(dep) {
                    anyhow::bail!(
                        "Stage '{}' depends on non-existent stage '{}'",
                        stage.id,
                        dep
                    );
                }
            }

            if let StageKindConfig::Helm { chart, release, .. } = &stage.kind {
                if chart.is_empty() || release.is_empty() {
                    anyhow::bail!("Stage '{}' has an empty chart or release name", stage.id);
                }
            }

            if let StageKindConfig::Manifests { files, inline, .. } = &stage.kind {
                if files.is_empty() && inline.is_empty() {
                    anyhow::bail!("Stage '{}' declares no manifests", stage.id);
                }
            }
        }

        // Check for cycles in the dependency graph
        self.check_cycles()?;

        Ok(())
    }

    /// Check for cycles in the stage dependency graph
    fn check_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for stage in &self.stages {
            if !visited.contains(&stage.id) {
                self.dfs_check(&stage.id, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        &self,
        stage_id: &str,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<()> {
        visited.insert(stage_id.to_string());
        recursion_stack.insert(stage_id.to_string());

        if let Some(stage) = self.stages.iter().find(|s| s.id == stage_id) {
            for dep in &stage.depends_on {
                if recursion_stack.contains(dep) {
                    anyhow::bail!("Cycle detected in dependency graph involving stage '{}'", dep);
                }
                if !visited.contains(dep) {
                    self.dfs_check(dep, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(stage_id);
        Ok(())
    }

    /// Convert config to a Plan domain model
    pub fn to_plan(&self) -> Plan {
        Plan::from_config(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_plan() {
        let yaml = r#"
name: "Lab bootstrap"
version: "1.0"

variables:
  netbox_host: "netbox.lab.local"

stages:
  - id: "k3s"
    name: "k3s cluster"
    kind: k3s

  - id: "vault"
    name: "Secret store (dev mode)"
    kind: vault-dev
    depends_on: ["k3s"]
"#;

        let config = PlanConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.name, "Lab bootstrap");
        assert_eq!(config.stages.len(), 2);
        assert_eq!(
            config.variables.get("netbox_host"),
            Some(&"netbox.lab.local".to_string())
        );
    }

    #[test]
    fn test_parse_helm_stage() {
        let yaml = r#"
name: "Lab bootstrap"
stages:
  - id: "external-secrets"
    name: "External Secrets Operator"
    kind: helm
    chart: "external-secrets/external-secrets"
    release: "external-secrets"
    namespace: "external-secrets"
    repo:
      name: "external-secrets"
      url: "https://charts.external-secrets.io"
    set:
      installCRDs: "true"
    readiness:
      check: deployment
      namespace: "external-secrets"
      name: "external-secrets-webhook"
"#;

        let config = PlanConfig::from_yaml(yaml).unwrap();
        match &config.stages[0].kind {
            StageKindConfig::Helm { chart, repo, set, .. } => {
                assert_eq!(chart, "external-secrets/external-secrets");
                assert_eq!(repo.as_ref().unwrap().name, "external-secrets");
                assert_eq!(set.get("installCRDs"), Some(&"true".to_string()));
            }
            other => panic!("Expected helm stage, got {other:?}"),
        }
        assert!(matches!(
            config.stages[0].readiness,
            Some(ReadinessConfig::Deployment { .. })
        ));
    }

    #[test]
    fn test_duplicate_stage_id_fails() {
        let yaml = r#"
name: "Bad plan"
stages:
  - id: "vault"
    name: "First"
    kind: vault-dev
  - id: "vault"
    name: "Duplicate"
    kind: vault-dev
"#;

        assert!(PlanConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_dependency_fails() {
        let yaml = r#"
name: "Bad plan"
stages:
  - id: "seed"
    name: "Seed"
    kind: secret-seed
    depends_on: ["nonexistent"]
"#;

        assert!(PlanConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_dependency_cycle_fails() {
        let yaml = r#"
name: "Bad plan"
stages:
  - id: "a"
    name: "A"
    kind: k3s
    depends_on: ["b"]
  - id: "b"
    name: "B"
    kind: secret-seed
    depends_on: ["a"]
"#;

        assert!(PlanConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_empty_manifest_stage_fails() {
        let yaml = r#"
name: "Bad plan"
stages:
  - id: "sync"
    name: "Sync objects"
    kind: manifests
    namespace: "vault"
"#;

        assert!(PlanConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_default_plan_parses() {
        let config = PlanConfig::from_yaml(crate::DEFAULT_PLAN).unwrap();
        assert!(config.stages.len() >= 6);
        // The shipped plan must stay linear: every stage after the first
        // depends on the one before it.
        for pair in config.stages.windows(2) {
            assert!(pair[1].depends_on.contains(&pair[0].id));
        }
    }
}
