//! Shared test doubles for labforge
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use labforge::cluster::ClusterClient;
use labforge::core::{RunContext, Sensitive, Stage};
use labforge::infra::topology::Cidr;
use labforge::infra::wireguard::{WgKeySource, WgKeypair};
use labforge::infra::{
    CloudProvider, InfraError, IngressRule, Instance, InstanceRequest, VpcIds,
};
use labforge::secrets::{KeyMaterialSource, SecretError, SecretStore};
use labforge::stages::StageDriver;

/// Records install/uninstall order; readiness can be delayed per stage
pub struct MockDriver {
    pub installed: Mutex<Vec<String>>,
    pub uninstalled: Mutex<Vec<String>>,
    /// Stage IDs whose install fails
    pub failing: HashSet<String>,
    /// Stage IDs that are never ready
    pub never_ready: HashSet<String>,
    /// Per-stage polls before readiness holds
    ready_after: HashMap<String, u32>,
    polls: Mutex<HashMap<String, u32>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            installed: Mutex::new(Vec::new()),
            uninstalled: Mutex::new(Vec::new()),
            failing: HashSet::new(),
            never_ready: HashSet::new(),
            ready_after: HashMap::new(),
            polls: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing_on(mut self, stage_id: &str) -> Self {
        self.failing.insert(stage_id.to_string());
        self
    }

    pub fn never_ready_on(mut self, stage_id: &str) -> Self {
        self.never_ready.insert(stage_id.to_string());
        self
    }

    pub fn ready_after(mut self, stage_id: &str, polls: u32) -> Self {
        self.ready_after.insert(stage_id.to_string(), polls);
        self
    }

    pub fn install_order(&self) -> Vec<String> {
        self.installed.lock().unwrap().clone()
    }

    pub fn uninstall_order(&self) -> Vec<String> {
        self.uninstalled.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageDriver for MockDriver {
    async fn install(&self, stage: &Stage, _ctx: &mut RunContext) -> anyhow::Result<()> {
        if self.failing.contains(&stage.id) {
            anyhow::bail!("scripted install failure");
        }
        self.installed.lock().unwrap().push(stage.id.clone());
        Ok(())
    }

    async fn uninstall(&self, stage: &Stage, _ctx: &RunContext) -> anyhow::Result<()> {
        if self.failing.contains(&stage.id) {
            anyhow::bail!("scripted uninstall failure");
        }
        self.uninstalled.lock().unwrap().push(stage.id.clone());
        Ok(())
    }

    async fn ready(&self, stage: &Stage) -> anyhow::Result<bool> {
        if self.never_ready.contains(&stage.id) {
            return Ok(false);
        }
        let threshold = self.ready_after.get(&stage.id).copied().unwrap_or(0);
        let mut polls = self.polls.lock().unwrap();
        let seen = polls.entry(stage.id.clone()).or_insert(0);
        *seen += 1;
        Ok(*seen > threshold)
    }
}

/// ClusterClient that records every operation in order. Clones share
/// the log, so a copy kept outside the driver sees everything.
#[derive(Clone)]
pub struct MockCluster {
    ops: Arc<Mutex<Vec<String>>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    pub fn operations(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn add_helm_repo(&self, name: &str, _url: &str) -> anyhow::Result<()> {
        self.record(format!("repo-add {name}"));
        Ok(())
    }

    async fn helm_install(
        &self,
        release: &str,
        _chart: &str,
        namespace: &str,
        set_values: &[(String, String)],
        _values_file: Option<&str>,
    ) -> anyhow::Result<()> {
        let sets = set_values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        self.record(format!("helm-install {namespace}/{release} [{sets}]"));
        Ok(())
    }

    async fn helm_uninstall(&self, release: &str, namespace: &str) -> anyhow::Result<()> {
        self.record(format!("helm-uninstall {namespace}/{release}"));
        Ok(())
    }

    async fn apply_manifest(&self, manifest: &str) -> anyhow::Result<()> {
        self.record(format!("apply {}", first_line(manifest)));
        Ok(())
    }

    async fn delete_manifest(&self, manifest: &str) -> anyhow::Result<()> {
        self.record(format!("delete {}", first_line(manifest)));
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> anyhow::Result<()> {
        self.record(format!("ensure-ns {namespace}"));
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> anyhow::Result<()> {
        self.record(format!("delete-ns {namespace}"));
        Ok(())
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        _value: &Sensitive,
    ) -> anyhow::Result<()> {
        self.record(format!("create-secret {namespace}/{name}:{key}"));
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        self.record(format!("delete-secret {namespace}/{name}"));
        Ok(())
    }

    async fn cluster_ready(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn deployment_available(&self, _namespace: &str, _name: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn pod_running(&self, _namespace: &str, _name: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn external_secret_synced(&self, _namespace: &str, _name: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn first_line(manifest: &str) -> String {
    // Identify a manifest by its kind line for readable assertions
    manifest
        .lines()
        .find(|l| l.trim_start().starts_with("kind:"))
        .unwrap_or("")
        .trim()
        .to_string()
}

/// In-memory SecretStore
pub struct MockStore {
    pub healthy: bool,
    pub records: Mutex<BTreeMap<String, Vec<(String, String)>>>,
    /// Paths whose writes fail
    pub failing_paths: HashSet<String>,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            healthy: true,
            records: Mutex::new(BTreeMap::new()),
            failing_paths: HashSet::new(),
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::new()
        }
    }

    pub fn failing_on(mut self, path: &str) -> Self {
        self.failing_paths.insert(path.to_string());
        self
    }

    pub fn record(&self, path: &str) -> Option<Vec<(String, String)>> {
        self.records.lock().unwrap().get(path).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl SecretStore for MockStore {
    async fn put(&self, path: &str, fields: Vec<(String, Sensitive)>) -> anyhow::Result<()> {
        if self.failing_paths.contains(path) {
            anyhow::bail!("scripted write failure");
        }
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k, v.expose().to_string()))
            .collect();
        self.records
            .lock()
            .unwrap()
            .insert(path.to_string(), fields);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let records = self.records.lock().unwrap();
        let prefix_slash = format!("{prefix}/");
        Ok(records
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix_slash))
            .map(str::to_string)
            .collect())
    }

    async fn healthy(&self) -> anyhow::Result<bool> {
        Ok(self.healthy)
    }
}

/// KeyMaterialSource with a fixed key, no subprocess
pub struct StaticKeys {
    pub key: String,
}

impl StaticKeys {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }
}

impl KeyMaterialSource for StaticKeys {
    fn ensure_private_key(&self, path: &Path) -> Result<(Sensitive, bool), SecretError> {
        if path.exists() {
            let key = std::fs::read_to_string(path)?;
            return Ok((Sensitive::new(key), false));
        }
        Ok((Sensitive::new(self.key.clone()), true))
    }
}

/// Deterministic WireGuard keys
pub struct StaticWgKeys {
    counter: AtomicU32,
}

impl StaticWgKeys {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl WgKeySource for StaticWgKeys {
    async fn generate(&self) -> Result<WgKeypair, InfraError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(WgKeypair {
            private: Sensitive::new(format!("private-{n}")),
            public: format!("public-{n}"),
        })
    }
}

/// Scripted CloudProvider. Instances live in a map; spot capacity can
/// be made to fail for the first N launches. Clones share all state so
/// a copy kept outside the provisioner sees every call.
#[derive(Clone)]
pub struct MockCloud {
    calls: Arc<Mutex<Vec<String>>>,
    next_id: Arc<AtomicU32>,
    instances: Arc<Mutex<HashMap<String, Instance>>>,
    /// Request name to instance id, for reclaiming by role
    names: Arc<Mutex<HashMap<String, String>>>,
    /// Request name to user data handed to the last launch
    user_data: Arc<Mutex<HashMap<String, Option<String>>>>,
    /// Remaining run_instance calls that fail with CapacityUnavailable
    capacity_failures: Arc<AtomicU32>,
    /// Always reachable unless set
    pub unreachable: bool,
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU32::new(1)),
            instances: Arc::new(Mutex::new(HashMap::new())),
            names: Arc::new(Mutex::new(HashMap::new())),
            user_data: Arc::new(Mutex::new(HashMap::new())),
            capacity_failures: Arc::new(AtomicU32::new(0)),
            unreachable: false,
        }
    }

    pub fn with_capacity_failures(self, count: u32) -> Self {
        self.capacity_failures.store(count, Ordering::SeqCst);
        self
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn id(&self, prefix: &str) -> String {
        format!("{prefix}-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Simulate a spot reclaim of the most recent instance launched
    /// under the given request name
    pub fn reclaim(&self, name: &str) {
        if let Some(id) = self.names.lock().unwrap().get(name) {
            self.instances.lock().unwrap().remove(id);
        }
    }

    pub fn instance_id(&self, name: &str) -> Option<String> {
        self.names.lock().unwrap().get(name).cloned()
    }

    pub fn launch_user_data(&self, name: &str) -> Option<String> {
        self.user_data.lock().unwrap().get(name).cloned().flatten()
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.instances.lock().unwrap().get(instance_id).cloned()
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn create_vpc(&self, _name: &str, cidr: Cidr) -> Result<VpcIds, InfraError> {
        self.record(format!("create-vpc {cidr}"));
        Ok(VpcIds {
            vpc_id: self.id("vpc"),
            route_table_id: self.id("rtb"),
        })
    }

    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), InfraError> {
        self.record(format!("delete-vpc {vpc_id}"));
        Ok(())
    }

    async fn create_subnet(&self, _vpc_id: &str, cidr: Cidr) -> Result<String, InfraError> {
        self.record(format!("create-subnet {cidr}"));
        Ok(self.id("subnet"))
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), InfraError> {
        self.record(format!("delete-subnet {subnet_id}"));
        Ok(())
    }

    async fn create_security_group(
        &self,
        _vpc_id: &str,
        name: &str,
        _rules: &[IngressRule],
    ) -> Result<String, InfraError> {
        self.record(format!("create-sg {name}"));
        Ok(self.id("sg"))
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), InfraError> {
        self.record(format!("delete-sg {group_id}"));
        Ok(())
    }

    async fn run_instance(&self, request: &InstanceRequest) -> Result<Instance, InfraError> {
        if self.capacity_failures.load(Ordering::SeqCst) > 0 {
            self.capacity_failures.fetch_sub(1, Ordering::SeqCst);
            self.record(format!("run-instance {} CAPACITY", request.name));
            return Err(InfraError::CapacityUnavailable {
                instance_type: request.instance_type.clone(),
            });
        }

        let instance = Instance {
            id: self.id("i"),
            eni_id: self.id("eni"),
            private_ip: request.private_ip.unwrap_or_else(|| "10.10.1.5".parse().unwrap()),
            public_ip: None,
        };
        self.record(format!(
            "run-instance {} ip={} market={:?}",
            request.name, instance.private_ip, request.market
        ));
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance.clone());
        self.names
            .lock()
            .unwrap()
            .insert(request.name.clone(), instance.id.clone());
        self.user_data
            .lock()
            .unwrap()
            .insert(request.name.clone(), request.user_data.clone());
        Ok(instance)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), InfraError> {
        self.record(format!("terminate {instance_id}"));
        self.instances.lock().unwrap().remove(instance_id);
        Ok(())
    }

    async fn instance_running(&self, instance_id: &str) -> Result<bool, InfraError> {
        Ok(self.instances.lock().unwrap().contains_key(instance_id))
    }

    async fn instance_exists(&self, instance_id: &str) -> Result<bool, InfraError> {
        Ok(self.instances.lock().unwrap().contains_key(instance_id))
    }

    async fn public_ip(&self, instance_id: &str) -> Result<Option<Ipv4Addr>, InfraError> {
        if self.instances.lock().unwrap().contains_key(instance_id) {
            Ok(Some("203.0.113.10".parse().unwrap()))
        } else {
            Ok(None)
        }
    }

    async fn set_source_dest_check(&self, eni_id: &str, enabled: bool) -> Result<(), InfraError> {
        self.record(format!("src-dest-check {eni_id} {enabled}"));
        Ok(())
    }

    async fn create_route(
        &self,
        _route_table_id: &str,
        destination: Cidr,
        eni_id: &str,
    ) -> Result<(), InfraError> {
        self.record(format!("create-route {destination} via {eni_id}"));
        Ok(())
    }

    async fn delete_route(
        &self,
        _route_table_id: &str,
        destination: Cidr,
    ) -> Result<(), InfraError> {
        self.record(format!("delete-route {destination}"));
        Ok(())
    }

    async fn reachable(
        &self,
        _via_public_ip: Ipv4Addr,
        _ssh_user: &str,
        _ssh_key_path: &Path,
        target: Ipv4Addr,
    ) -> Result<bool, InfraError> {
        self.record(format!("ping {target}"));
        Ok(!self.unreachable)
    }
}
