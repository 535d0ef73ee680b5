//! Production stage driver: shells, charts, manifests

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::core::stage::{HelmChartSpec, ManifestSpec, ReadinessSpec, StageKind};
use crate::core::{RunContext, Stage};
use crate::secrets::input::InputProvider;
use crate::secrets::{KeyMaterialSource, SecretSeeder, SecretStore};
use crate::stages::{render_template, StageDriver};

const K3S_INSTALL_CMD: &str =
    "curl -sfL https://get.k3s.io | sh -s - --write-kubeconfig-mode 644";
const K3S_UNINSTALL_SCRIPT: &str = "/usr/local/bin/k3s-uninstall.sh";

/// StageDriver wired to the real lab: kubectl/helm for cluster work,
/// the vault CLI for the store, ssh-keygen for key material.
pub struct LabDriver<C: ClusterClient, S: SecretStore> {
    cluster: C,
    store: Arc<S>,
    input: Arc<dyn InputProvider>,
    keys: Arc<dyn KeyMaterialSource>,
    /// Dev-mode store server spawned by this run, if any
    store_child: Mutex<Option<Child>>,
    /// Directory manifest and values paths resolve against
    plan_dir: PathBuf,
}

impl<C: ClusterClient, S: SecretStore> LabDriver<C, S> {
    pub fn new(
        cluster: C,
        store: Arc<S>,
        input: Arc<dyn InputProvider>,
        keys: Arc<dyn KeyMaterialSource>,
        plan_dir: PathBuf,
    ) -> Self {
        Self {
            cluster,
            store,
            input,
            keys,
            store_child: Mutex::new(None),
            plan_dir,
        }
    }

    async fn run_shell(&self, script: &str) -> Result<()> {
        debug!(script, "Running shell command");
        let output = Command::new("sh")
            .args(["-c", script])
            .output()
            .await
            .context("Failed to spawn shell")?;
        if !output.status.success() {
            anyhow::bail!(
                "Command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn spawn_store(&self, addr: &str, ctx: &RunContext) -> Result<()> {
        let token = ctx
            .store_token()
            .ok_or_else(|| anyhow::anyhow!("No store token available to launch the dev server"))?;
        let listen = addr
            .trim_start_matches("http://")
            .trim_start_matches("https://");

        info!(addr, "Launching dev-mode secret store server");
        let child = Command::new("vault")
            .arg("server")
            .arg("-dev")
            .arg(format!("-dev-listen-address={listen}"))
            .arg(format!("-dev-root-token-id={}", token.expose()))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .context("Failed to spawn vault server")?;

        *self.store_child.lock().await = Some(child);
        Ok(())
    }

    async fn stop_store(&self) -> Result<()> {
        if let Some(mut child) = self.store_child.lock().await.take() {
            info!("Stopping dev-mode secret store server");
            child.kill().await?;
            return Ok(());
        }
        // Teardown in a fresh process has no child handle; match on the
        // dev-server command line instead
        let output = Command::new("pkill")
            .args(["-f", "vault server -dev"])
            .output()
            .await?;
        if !output.status.success() {
            debug!("No running dev-mode store server found");
        }
        Ok(())
    }

    async fn install_helm(&self, spec: &HelmChartSpec, ctx: &RunContext) -> Result<()> {
        if let Some(repo) = &spec.repo {
            self.cluster.add_helm_repo(&repo.name, &repo.url).await?;
        }
        self.cluster.ensure_namespace(&spec.namespace).await?;

        let set_values: Vec<(String, String)> = spec
            .set
            .iter()
            .map(|(k, v)| (k.clone(), render_template(v, &ctx.variables)))
            .collect();
        let values_file = spec
            .values_file
            .as_ref()
            .map(|f| self.resolve(f).display().to_string());

        self.cluster
            .helm_install(
                &spec.release,
                &spec.chart,
                &spec.namespace,
                &set_values,
                values_file.as_deref(),
            )
            .await
    }

    async fn install_manifests(&self, spec: &ManifestSpec, ctx: &RunContext) -> Result<()> {
        self.cluster.ensure_namespace(&spec.namespace).await?;

        if let Some(token_ref) = &spec.store_token_secret {
            let token = ctx.store_token().ok_or_else(|| {
                anyhow::anyhow!("No store token available to create {}", token_ref.name)
            })?;
            self.cluster
                .create_secret(&token_ref.namespace, &token_ref.name, "token", token)
                .await?;
        }

        for manifest in self.rendered_manifests(spec, ctx)? {
            self.cluster.apply_manifest(&manifest).await?;
        }
        Ok(())
    }

    async fn uninstall_manifests(&self, spec: &ManifestSpec, ctx: &RunContext) -> Result<()> {
        for manifest in self.rendered_manifests(spec, ctx)?.into_iter().rev() {
            self.cluster.delete_manifest(&manifest).await?;
        }
        if let Some(token_ref) = &spec.store_token_secret {
            self.cluster
                .delete_secret(&token_ref.namespace, &token_ref.name)
                .await?;
        }
        Ok(())
    }

    fn rendered_manifests(&self, spec: &ManifestSpec, ctx: &RunContext) -> Result<Vec<String>> {
        let mut manifests = Vec::new();
        for file in &spec.files {
            let path = self.resolve(file);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read manifest {}", path.display()))?;
            manifests.push(render_template(&content, &ctx.variables));
        }
        for inline in &spec.inline {
            manifests.push(render_template(inline, &ctx.variables));
        }
        Ok(manifests)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.plan_dir.join(p)
        }
    }
}

#[async_trait]
impl<C: ClusterClient, S: SecretStore> StageDriver for LabDriver<C, S> {
    async fn install(&self, stage: &Stage, ctx: &mut RunContext) -> Result<()> {
        match &stage.kind {
            StageKind::K3s => self.run_shell(K3S_INSTALL_CMD).await,
            StageKind::VaultDev { addr } => self.spawn_store(addr, ctx).await,
            StageKind::SecretSeed => {
                let seeder =
                    SecretSeeder::new(Arc::clone(&self.input), Arc::clone(&self.keys));
                let report = seeder.seed(self.store.as_ref(), &ctx.ssh_key_path).await?;
                info!(
                    records = report.records,
                    key_generated = report.key_generated,
                    "Secret store seeded"
                );
                ctx.merge_variables(report.variables);
                Ok(())
            }
            StageKind::Helm(spec) => self.install_helm(spec, ctx).await,
            StageKind::Manifests(spec) => self.install_manifests(spec, ctx).await,
        }
    }

    async fn uninstall(&self, stage: &Stage, ctx: &RunContext) -> Result<()> {
        match &stage.kind {
            StageKind::K3s => {
                if Path::new(K3S_UNINSTALL_SCRIPT).exists() {
                    self.run_shell(K3S_UNINSTALL_SCRIPT).await
                } else {
                    warn!("k3s uninstall script not found, skipping");
                    Ok(())
                }
            }
            StageKind::VaultDev { .. } => self.stop_store().await,
            // Seeded secrets live in the dev-mode store and disappear
            // with it
            StageKind::SecretSeed => Ok(()),
            StageKind::Helm(spec) => {
                self.cluster
                    .helm_uninstall(&spec.release, &spec.namespace)
                    .await?;
                self.cluster.delete_namespace(&spec.namespace).await
            }
            StageKind::Manifests(spec) => self.uninstall_manifests(spec, ctx).await,
        }
    }

    async fn ready(&self, stage: &Stage) -> Result<bool> {
        match &stage.readiness {
            ReadinessSpec::Immediate => Ok(true),
            ReadinessSpec::Cluster => self.cluster.cluster_ready().await,
            ReadinessSpec::StoreHealthy => self.store.healthy().await,
            ReadinessSpec::Deployment { namespace, name } => {
                self.cluster.deployment_available(namespace, name).await
            }
            ReadinessSpec::Pod { namespace, name } => {
                self.cluster.pod_running(namespace, name).await
            }
            ReadinessSpec::ExternalSecret { namespace, name } => {
                self.cluster.external_secret_synced(namespace, name).await
            }
        }
    }
}
