//! Secret store access via the vault CLI

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::core::Sensitive;
use crate::secrets::SecretStore;

/// SecretStore driving the vault binary. Address and token are passed
/// to the child process environment only, never to argv.
pub struct VaultCliStore {
    addr: String,
    token: Sensitive,
    mount: String,
}

#[derive(Debug, Deserialize)]
struct VaultStatus {
    initialized: bool,
    sealed: bool,
}

impl VaultCliStore {
    pub fn new(addr: impl Into<String>, token: Sensitive, mount: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            token,
            mount: mount.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("vault");
        cmd.env("VAULT_ADDR", &self.addr);
        cmd.env("VAULT_TOKEN", self.token.expose());
        cmd
    }
}

#[async_trait]
impl SecretStore for VaultCliStore {
    async fn put(&self, path: &str, fields: Vec<(String, Sensitive)>) -> Result<()> {
        // Field values go over stdin as JSON so they never show up in
        // the process list
        let mut body = serde_json::Map::new();
        for (name, value) in &fields {
            body.insert(
                name.clone(),
                serde_json::Value::String(value.expose().to_string()),
            );
        }
        let body = serde_json::Value::Object(body).to_string();

        let mut cmd = self.command();
        cmd.args(["kv", "put", &format!("-mount={}", self.mount), path, "-"]);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::piped());

        debug!(path, fields = fields.len(), "vault kv put");
        let mut child = cmd.spawn().context("Failed to run vault")?;
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(body.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "vault kv put {path} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let output = self
            .command()
            .args([
                "kv",
                "list",
                "-format=json",
                &format!("-mount={}", self.mount),
                prefix,
            ])
            .output()
            .await
            .context("Failed to run vault")?;

        if !output.status.success() {
            anyhow::bail!(
                "vault kv list {prefix} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let entries: Vec<String> = serde_json::from_slice(&output.stdout)
            .context("Unexpected vault kv list output")?;
        Ok(entries)
    }

    async fn healthy(&self) -> Result<bool> {
        // vault status exits non-zero when sealed; the JSON body still
        // tells us which case we hit
        let output = self
            .command()
            .args(["status", "-format=json"])
            .output()
            .await
            .context("Failed to run vault")?;

        if output.stdout.is_empty() {
            anyhow::bail!(
                "vault status produced no output: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let status: VaultStatus =
            serde_json::from_slice(&output.stdout).context("Unexpected vault status output")?;
        Ok(status.initialized && !status.sealed)
    }
}
