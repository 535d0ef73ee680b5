//! Secret collection and store seeding

pub mod input;
pub mod schema;
pub mod vault;

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};

use crate::core::Sensitive;
use input::InputProvider;
use schema::{FieldSource, SECRET_GROUPS};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret store is not reachable: {0}")]
    StoreUnreachable(String),

    #[error("Failed to write secret group '{path}': {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Missing input for '{label}': {source}")]
    MissingInput {
        label: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("SSH key generation failed: {0}")]
    KeygenFailed(String),

    #[error("Secret group '{path}' did not read back after write")]
    VerifyFailed { path: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// KV write/read surface of the secret store
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Write all fields of one group at the given path, replacing any
    /// previous version
    async fn put(&self, path: &str, fields: Vec<(String, Sensitive)>) -> anyhow::Result<()>;

    /// List entry names directly under a path prefix
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// True when the store is initialized and unsealed
    async fn healthy(&self) -> anyhow::Result<bool>;
}

/// Produces the SSH private key seeded into the store
pub trait KeyMaterialSource: Send + Sync {
    /// Return the private key at `path`, generating a new one when the
    /// file does not exist. The bool is true when a key was generated.
    fn ensure_private_key(&self, path: &Path) -> Result<(Sensitive, bool), SecretError>;
}

/// KeyMaterialSource backed by the ssh-keygen binary
pub struct SshKeygen;

impl KeyMaterialSource for SshKeygen {
    fn ensure_private_key(&self, path: &Path) -> Result<(Sensitive, bool), SecretError> {
        if path.exists() {
            debug!(path = %path.display(), "Reusing existing SSH key");
            let key = std::fs::read_to_string(path)?;
            return Ok((Sensitive::new(key), false));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "Generating new ed25519 SSH keypair");
        let output = Command::new("ssh-keygen")
            .args(["-t", "ed25519", "-N", "", "-C", "labforge", "-f"])
            .arg(path)
            .output()?;

        if !output.status.success() {
            return Err(SecretError::KeygenFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let key = std::fs::read_to_string(path)?;
        Ok((Sensitive::new(key), true))
    }
}

/// Outcome of a seeding run
#[derive(Debug)]
pub struct SeedReport {
    /// Number of secret groups written
    pub records: usize,
    /// Non-confidential answers published as plan variables
    pub variables: HashMap<String, String>,
    /// True when a fresh SSH keypair was generated
    pub key_generated: bool,
}

/// Collects operator input and writes the full secret schema to the
/// store. All input is gathered before the first write, so an aborted
/// prompt leaves the store untouched.
pub struct SecretSeeder {
    input: Arc<dyn InputProvider>,
    keys: Arc<dyn KeyMaterialSource>,
}

impl SecretSeeder {
    pub fn new(input: Arc<dyn InputProvider>, keys: Arc<dyn KeyMaterialSource>) -> Self {
        Self { input, keys }
    }

    pub async fn seed(
        &self,
        store: &dyn SecretStore,
        ssh_key_path: &Path,
    ) -> Result<SeedReport, SecretError> {
        let healthy = store
            .healthy()
            .await
            .map_err(|e| SecretError::StoreUnreachable(e.to_string()))?;
        if !healthy {
            return Err(SecretError::StoreUnreachable(
                "store reports sealed or uninitialized".to_string(),
            ));
        }

        // Collect every value up front; no writes happen until all
        // prompts have succeeded.
        let mut variables = HashMap::new();
        let mut key_generated = false;
        let mut pending: Vec<(&str, Vec<(String, Sensitive)>)> = Vec::new();

        for group in SECRET_GROUPS {
            let mut fields = Vec::with_capacity(group.fields.len());
            for field in group.fields {
                let value = match field.source {
                    FieldSource::Prompt {
                        label,
                        confidential,
                        default,
                        var_key,
                    } => {
                        if confidential {
                            self.input.prompt_secret(label).map_err(|source| {
                                SecretError::MissingInput {
                                    label: label.to_string(),
                                    source,
                                }
                            })?
                        } else {
                            let answer = self.input.prompt(label, default).map_err(|source| {
                                SecretError::MissingInput {
                                    label: label.to_string(),
                                    source,
                                }
                            })?;
                            if let Some(key) = var_key {
                                variables.insert(key.to_string(), answer.clone());
                            }
                            Sensitive::new(answer)
                        }
                    }
                    FieldSource::ApiToken => Sensitive::new(generate_token()),
                    FieldSource::SshPrivateKey => {
                        let (key, generated) = self.keys.ensure_private_key(ssh_key_path)?;
                        key_generated = key_generated || generated;
                        key
                    }
                };
                fields.push((field.name.to_string(), value));
            }
            pending.push((group.path, fields));
        }

        for (path, fields) in pending {
            info!(path, "Writing secret group");
            store
                .put(path, fields)
                .await
                .map_err(|source| SecretError::WriteFailed {
                    path: path.to_string(),
                    source,
                })?;
        }

        // Read back the listing to confirm every group landed
        for group in SECRET_GROUPS {
            let (prefix, name) = split_path(group.path);
            let entries = store
                .list(prefix)
                .await
                .map_err(|e| SecretError::StoreUnreachable(e.to_string()))?;
            if !entries.iter().any(|e| e.trim_end_matches('/') == name) {
                return Err(SecretError::VerifyFailed {
                    path: group.path.to_string(),
                });
            }
        }

        Ok(SeedReport {
            records: SECRET_GROUPS.len(),
            variables,
            key_generated,
        })
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((prefix, name)) => (prefix, name),
        None => ("", path),
    }
}

/// 40 hex characters, matching the NetBox API token format. Also used
/// for the dev-mode store's root token.
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| format!("{:02x}", rng.gen::<u8>()))
        .collect()
}
