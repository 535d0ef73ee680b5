//! Provisioner state file and locking

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::infra::resource::{Durability, ResourceKind, ResourceState};

const STATE_VERSION: u32 = 1;

/// One managed cloud object as last observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub state: ResourceState,
    pub durability: Durability,

    /// Provider-assigned identifier, once created
    #[serde(default)]
    pub id: Option<String>,

    /// Extra provider attributes (ENI IDs, addresses, reserved IPs)
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl ResourceRecord {
    pub fn new(kind: ResourceKind, durability: Durability) -> Self {
        Self {
            kind,
            state: ResourceState::Absent,
            durability,
            id: None,
            attrs: BTreeMap::new(),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

/// Full provisioner state, serialized as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfraState {
    pub version: u32,
    /// Incremented on every save
    pub serial: u64,
    pub updated_at: DateTime<Utc>,

    /// Resources keyed by their plan name ("vpc", "gateway", ...)
    pub resources: BTreeMap<String, ResourceRecord>,

    /// Values surfaced to the operator (public IPs, config paths)
    pub outputs: BTreeMap<String, String>,
}

impl InfraState {
    pub fn empty() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn resource(&self, key: &str) -> Option<&ResourceRecord> {
        self.resources.get(key)
    }
}

impl Default for InfraState {
    fn default() -> Self {
        Self::empty()
    }
}

/// Held while a provisioner run mutates state. Dropping releases it.
pub struct StateLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl StateLock {
    /// Lock that owns nothing, for in-memory backends
    pub fn unmanaged() -> Self {
        Self { release: None }
    }

    /// Lock released by running the closure on drop
    pub fn with_release(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Where provisioner state lives
pub trait StateBackend: Send + Sync {
    /// Load state, or an empty state when none has been written yet
    fn load(&self) -> Result<InfraState>;

    /// Persist state; the serial is bumped by the caller
    fn save(&self, state: &InfraState) -> Result<()>;

    /// Take the exclusive mutation lock. Fails fast when another run
    /// holds it.
    fn lock(&self, owner: &str) -> Result<StateLock>;
}

/// JSON file next to a `.lock` marker
pub struct LocalStateBackend {
    path: PathBuf,
}

impl LocalStateBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn lock_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".lock");
        PathBuf::from(p)
    }
}

impl StateBackend for LocalStateBackend {
    fn load(&self) -> Result<InfraState> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No state file yet, starting empty");
            return Ok(InfraState::empty());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {}", self.path.display()))?;
        let state: InfraState = serde_json::from_str(&content)
            .with_context(|| format!("State file {} is corrupt", self.path.display()))?;
        if state.version != STATE_VERSION {
            anyhow::bail!(
                "State file {} has version {}, this build expects {}",
                self.path.display(),
                state.version,
                STATE_VERSION
            );
        }
        Ok(state)
    }

    fn save(&self, state: &InfraState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write to a sibling and rename so a crash never leaves a
        // half-written state file
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), serial = state.serial, "State saved");
        Ok(())
    }

    fn lock(&self, owner: &str) -> Result<StateLock> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => {
                use std::io::Write;
                let mut file = file;
                let _ = writeln!(file, "{owner} {}", Utc::now().to_rfc3339());
                Ok(StateLock::with_release(move || {
                    if let Err(e) = std::fs::remove_file(&lock_path) {
                        warn!(path = %lock_path.display(), error = %e, "Failed to release state lock");
                    }
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&lock_path).unwrap_or_default();
                anyhow::bail!(
                    "State is locked by another run ({}); remove {} if it is stale",
                    holder.trim(),
                    lock_path.display()
                )
            }
            Err(e) => Err(e).context("Failed to create state lock"),
        }
    }
}

impl StateBackend for Box<dyn StateBackend> {
    fn load(&self) -> Result<InfraState> {
        (**self).load()
    }

    fn save(&self, state: &InfraState) -> Result<()> {
        (**self).save(state)
    }

    fn lock(&self, owner: &str) -> Result<StateLock> {
        (**self).lock(owner)
    }
}

/// State object in a shared bucket plus a separate lock object, driven
/// through the cloud CLI. The primary backend for multi-operator use;
/// the local file is the fallback for a single machine.
pub struct S3StateBackend {
    bucket: String,
    key: String,
}

impl S3StateBackend {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse an `s3://bucket/path/to/state.json` URI
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("s3://")
            .with_context(|| format!("'{uri}' is not an s3:// URI"))?;
        let (bucket, key) = rest
            .split_once('/')
            .with_context(|| format!("'{uri}' is missing an object key"))?;
        if bucket.is_empty() || key.is_empty() {
            anyhow::bail!("'{uri}' is missing a bucket or object key");
        }
        Ok(Self::new(bucket, key))
    }

    fn lock_key(&self) -> String {
        format!("{}.lock", self.key)
    }

    fn run(args: &[&str]) -> Result<std::process::Output> {
        std::process::Command::new("aws")
            .args(args)
            .output()
            .context("Failed to run the aws CLI, is it installed?")
    }
}

impl StateBackend for S3StateBackend {
    fn load(&self) -> Result<InfraState> {
        let uri = format!("s3://{}/{}", self.bucket, self.key);
        let output = Self::run(&["s3", "cp", &uri, "-"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("404") || stderr.contains("does not exist") {
                debug!(%uri, "No remote state yet, starting empty");
                return Ok(InfraState::empty());
            }
            anyhow::bail!("Failed to fetch state from {uri}: {}", stderr.trim());
        }
        let state: InfraState = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("State object {uri} is corrupt"))?;
        if state.version != STATE_VERSION {
            anyhow::bail!(
                "State object {uri} has version {}, this build expects {}",
                state.version,
                STATE_VERSION
            );
        }
        Ok(state)
    }

    fn save(&self, state: &InfraState) -> Result<()> {
        use std::io::Write;

        let uri = format!("s3://{}/{}", self.bucket, self.key);
        let content = serde_json::to_string_pretty(state)?;
        let mut child = std::process::Command::new("aws")
            .args(["s3", "cp", "-", &uri])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .context("Failed to run the aws CLI, is it installed?")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            anyhow::bail!(
                "Failed to write state to {uri}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(%uri, serial = state.serial, "State saved");
        Ok(())
    }

    fn lock(&self, owner: &str) -> Result<StateLock> {
        let lock_key = self.lock_key();
        // Conditional put: only one run can create the lock object
        let output = Self::run(&[
            "s3api",
            "put-object",
            "--bucket",
            &self.bucket,
            "--key",
            &lock_key,
            "--if-none-match",
            "*",
            "--content-type",
            "text/plain",
            "--metadata",
            &format!("owner={owner}"),
            "--body",
            "/dev/null",
        ])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("PreconditionFailed") || stderr.contains("412") {
                anyhow::bail!(
                    "State is locked by another run; remove s3://{}/{} if it is stale",
                    self.bucket,
                    lock_key
                );
            }
            anyhow::bail!("Failed to take the state lock: {}", stderr.trim());
        }

        let bucket = self.bucket.clone();
        Ok(StateLock::with_release(move || {
            let release = Self::run(&[
                "s3api",
                "delete-object",
                "--bucket",
                &bucket,
                "--key",
                &lock_key,
            ]);
            match release {
                Ok(output) if output.status.success() => {}
                _ => warn!(bucket = %bucket, key = %lock_key, "Failed to release state lock"),
            }
        }))
    }
}
