//! Kubernetes cluster operations via kubectl and helm

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::core::Sensitive;

/// Cluster-side operations the stage driver needs. Implemented by
/// shelling out in production and by a recording mock in tests.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn add_helm_repo(&self, name: &str, url: &str) -> Result<()>;

    async fn helm_install(
        &self,
        release: &str,
        chart: &str,
        namespace: &str,
        set_values: &[(String, String)],
        values_file: Option<&str>,
    ) -> Result<()>;

    async fn helm_uninstall(&self, release: &str, namespace: &str) -> Result<()>;

    /// Apply a rendered manifest document via stdin
    async fn apply_manifest(&self, manifest: &str) -> Result<()>;

    /// Delete the objects in a rendered manifest document; missing
    /// objects are not an error
    async fn delete_manifest(&self, manifest: &str) -> Result<()>;

    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;

    async fn delete_namespace(&self, namespace: &str) -> Result<()>;

    /// Create or replace a single-key opaque secret
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &Sensitive,
    ) -> Result<()>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// True when the API server answers readyz
    async fn cluster_ready(&self) -> Result<bool>;

    /// True when the deployment has at least one available replica
    async fn deployment_available(&self, namespace: &str, name: &str) -> Result<bool>;

    /// True when the pod reports phase Running
    async fn pod_running(&self, namespace: &str, name: &str) -> Result<bool>;

    /// True when the ExternalSecret object reports SecretSynced
    async fn external_secret_synced(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// ClusterClient backed by the kubectl and helm binaries
pub struct ShellCluster {
    kubeconfig: Option<PathBuf>,
}

impl ShellCluster {
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self { kubeconfig }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        if let Some(path) = &self.kubeconfig {
            cmd.env("KUBECONFIG", path);
        }
        cmd
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "Running cluster command");
        let output = self
            .command(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {program}"))?;

        if !output.status.success() {
            anyhow::bail!(
                "{program} {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_with_stdin(&self, program: &str, args: &[&str], input: &str) -> Result<String> {
        debug!(program, ?args, "Running cluster command with stdin");
        let mut child = self
            .command(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {program}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "{program} {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ClusterClient for ShellCluster {
    async fn add_helm_repo(&self, name: &str, url: &str) -> Result<()> {
        self.run("helm", &["repo", "add", name, url, "--force-update"])
            .await?;
        self.run("helm", &["repo", "update", name]).await?;
        Ok(())
    }

    async fn helm_install(
        &self,
        release: &str,
        chart: &str,
        namespace: &str,
        set_values: &[(String, String)],
        values_file: Option<&str>,
    ) -> Result<()> {
        let mut args: Vec<String> = vec![
            "upgrade".into(),
            "--install".into(),
            release.into(),
            chart.into(),
            "--namespace".into(),
            namespace.into(),
            "--create-namespace".into(),
            "--wait=false".into(),
        ];
        for (key, value) in set_values {
            args.push("--set".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(file) = values_file {
            args.push("--values".into());
            args.push(file.into());
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("helm", &arg_refs).await?;
        Ok(())
    }

    async fn helm_uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        let result = self
            .run(
                "helm",
                &["uninstall", release, "--namespace", namespace, "--wait"],
            )
            .await;
        // Uninstalling a release that was never installed is fine
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        self.run_with_stdin("kubectl", &["apply", "-f", "-"], manifest)
            .await?;
        Ok(())
    }

    async fn delete_manifest(&self, manifest: &str) -> Result<()> {
        self.run_with_stdin(
            "kubectl",
            &["delete", "-f", "-", "--ignore-not-found=true"],
            manifest,
        )
        .await?;
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let exists = self
            .run("kubectl", &["get", "namespace", namespace])
            .await
            .is_ok();
        if !exists {
            self.run("kubectl", &["create", "namespace", namespace])
                .await?;
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.run(
            "kubectl",
            &[
                "delete",
                "namespace",
                namespace,
                "--ignore-not-found=true",
                "--wait=true",
            ],
        )
        .await?;
        Ok(())
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &Sensitive,
    ) -> Result<()> {
        self.ensure_namespace(namespace).await?;
        // Replace rather than fail when the secret already exists
        let _ = self.delete_secret(namespace, name).await;
        let literal = format!("--from-literal={key}={}", value.expose());
        self.run(
            "kubectl",
            &[
                "create",
                "secret",
                "generic",
                name,
                "--namespace",
                namespace,
                &literal,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.run(
            "kubectl",
            &[
                "delete",
                "secret",
                name,
                "--namespace",
                namespace,
                "--ignore-not-found=true",
            ],
        )
        .await?;
        Ok(())
    }

    async fn cluster_ready(&self) -> Result<bool> {
        Ok(self
            .run("kubectl", &["get", "--raw", "/readyz"])
            .await
            .is_ok())
    }

    async fn deployment_available(&self, namespace: &str, name: &str) -> Result<bool> {
        let result = self
            .run(
                "kubectl",
                &[
                    "get",
                    "deployment",
                    name,
                    "--namespace",
                    namespace,
                    "-o",
                    "jsonpath={.status.availableReplicas}",
                ],
            )
            .await;
        match result {
            Ok(replicas) => Ok(replicas.trim().parse::<u32>().unwrap_or(0) > 0),
            // Not created yet counts as not ready, not as failure
            Err(_) => Ok(false),
        }
    }

    async fn pod_running(&self, namespace: &str, name: &str) -> Result<bool> {
        let result = self
            .run(
                "kubectl",
                &[
                    "get",
                    "pod",
                    name,
                    "--namespace",
                    namespace,
                    "-o",
                    "jsonpath={.status.phase}",
                ],
            )
            .await;
        match result {
            Ok(phase) => Ok(phase.trim() == "Running"),
            Err(_) => Ok(false),
        }
    }

    async fn external_secret_synced(&self, namespace: &str, name: &str) -> Result<bool> {
        let result = self
            .run(
                "kubectl",
                &[
                    "get",
                    "externalsecret",
                    name,
                    "--namespace",
                    namespace,
                    "-o",
                    "jsonpath={.status.conditions[?(@.type=='Ready')].status}",
                ],
            )
            .await;
        match result {
            Ok(status) => Ok(status.trim() == "True"),
            Err(_) => Ok(false),
        }
    }
}
