//! Ordered create/refresh/destroy over the cloud topology

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::infra::resource::{Durability, ResourceKind, ResourceState};
use crate::infra::state::{InfraState, ResourceRecord, StateBackend};
use crate::infra::topology::{Market, TopologyConfig};
use crate::infra::wireguard::{ClientConfig, ServerConfig, WgKeypair, WgKeySource};
use crate::infra::{CloudProvider, InfraError, IngressRule, InstanceRequest};
use crate::probe::{Check, ReadinessProbe};

/// Creation order; destroy walks it backwards. Routes come last since
/// they point at instance ENIs.
const RESOURCE_ORDER: &[&str] = &[
    "vpc",
    "subnet",
    "gateway-sg",
    "sim-sg",
    "gateway",
    "sim-host",
    "route-sim",
    "route-vpn",
];

fn resource_template(key: &str, sim_market: Market) -> (ResourceKind, Durability) {
    match key {
        "vpc" => (ResourceKind::Vpc, Durability::Durable),
        "subnet" => (ResourceKind::Subnet, Durability::Durable),
        "gateway-sg" | "sim-sg" => (ResourceKind::SecurityGroup, Durability::Durable),
        "gateway" => (ResourceKind::Instance, Durability::Durable),
        "sim-host" => (
            ResourceKind::Instance,
            if sim_market == Market::Spot {
                Durability::Interruptible
            } else {
                Durability::Durable
            },
        ),
        _ => (ResourceKind::Route, Durability::Durable),
    }
}

/// What apply would do to one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanAction {
    Create { resource: String },
    Keep { resource: String },
    /// Present in state but observed gone (spot reclaim)
    Replace { resource: String },
}

struct InstanceRunning<'a, P: CloudProvider> {
    provider: &'a P,
    instance_id: &'a str,
}

#[async_trait]
impl<P: CloudProvider> Check for InstanceRunning<'_, P> {
    async fn check(&self) -> anyhow::Result<bool> {
        Ok(self.provider.instance_running(self.instance_id).await?)
    }
}

struct InstanceGone<'a, P: CloudProvider> {
    provider: &'a P,
    instance_id: &'a str,
}

#[async_trait]
impl<P: CloudProvider> Check for InstanceGone<'_, P> {
    async fn check(&self) -> anyhow::Result<bool> {
        Ok(!self.provider.instance_exists(self.instance_id).await?)
    }
}

struct SimHostReachable<'a, P: CloudProvider> {
    provider: &'a P,
    gateway_ip: Ipv4Addr,
    ssh_user: &'a str,
    ssh_key_path: &'a std::path::Path,
    target: Ipv4Addr,
}

#[async_trait]
impl<P: CloudProvider> Check for SimHostReachable<'_, P> {
    async fn check(&self) -> anyhow::Result<bool> {
        Ok(self
            .provider
            .reachable(self.gateway_ip, self.ssh_user, self.ssh_key_path, self.target)
            .await?)
    }
}

/// Creates, repairs, and destroys the lab's cloud topology against a
/// persisted state file
pub struct Provisioner<P: CloudProvider, B: StateBackend> {
    provider: P,
    backend: B,
    config: TopologyConfig,
    wg_keys: Box<dyn WgKeySource>,
    /// Where the operator's tunnel config lands
    wg_config_path: PathBuf,
    /// How long to wait for instances and connectivity
    wait_deadline: Duration,
}

impl<P: CloudProvider, B: StateBackend> Provisioner<P, B> {
    pub fn new(
        provider: P,
        backend: B,
        config: TopologyConfig,
        wg_keys: Box<dyn WgKeySource>,
        wg_config_path: PathBuf,
    ) -> Self {
        Self {
            provider,
            backend,
            config,
            wg_keys,
            wg_config_path,
            wait_deadline: Duration::from_secs(300),
        }
    }

    pub fn with_wait_deadline(mut self, deadline: Duration) -> Self {
        self.wait_deadline = deadline;
        self
    }

    fn record<'a>(&self, state: &'a mut InfraState, key: &str) -> &'a mut ResourceRecord {
        let (kind, durability) = resource_template(key, self.config.sim_host.market);
        state
            .resources
            .entry(key.to_string())
            .or_insert_with(|| ResourceRecord::new(kind, durability))
    }

    fn transition(
        record: &mut ResourceRecord,
        key: &str,
        next: ResourceState,
    ) -> Result<(), InfraError> {
        if record.state == next {
            return Ok(());
        }
        if !record.state.can_transition_to(next) {
            return Err(InfraError::InvalidTransition {
                resource: key.to_string(),
                from: record.state,
                to: next,
            });
        }
        record.state = next;
        Ok(())
    }

    fn persist(&self, state: &mut InfraState) -> Result<(), InfraError> {
        state.serial += 1;
        state.updated_at = chrono::Utc::now();
        self.backend.save(state)?;
        Ok(())
    }

    /// Check instance records against the cloud; a reclaimed spot
    /// instance becomes Absent again, keeping its reserved address
    async fn refresh(&self, state: &mut InfraState) -> Result<Vec<String>, InfraError> {
        let mut lost = Vec::new();
        for key in ["gateway", "sim-host"] {
            let Some(record) = state.resources.get_mut(key) else {
                continue;
            };
            if record.state != ResourceState::Active {
                continue;
            }
            let Some(id) = record.id.clone() else {
                continue;
            };
            if !self.provider.instance_exists(&id).await? {
                warn!(resource = key, instance = %id, "Instance gone, marking absent");
                Self::transition(record, key, ResourceState::Absent)?;
                record.id = None;
                // Reserved private_ip and route attrs stay so the
                // replacement reuses them
                lost.push(key.to_string());
            }
        }
        Ok(lost)
    }

    /// Read-only diff between state and the desired topology
    pub async fn plan(&self) -> Result<Vec<PlanAction>, InfraError> {
        let mut state = self.backend.load()?;
        let lost = self.refresh(&mut state).await?;

        let mut actions = Vec::new();
        for key in RESOURCE_ORDER {
            let resource = key.to_string();
            let action = match state.resource(key) {
                Some(r) if r.state == ResourceState::Active => {
                    // A route pointing at a lost instance's ENI must be
                    // re-pointed
                    let via_lost = matches!(*key, "route-sim" if lost.iter().any(|l| l == "sim-host"))
                        || matches!(*key, "route-vpn" if lost.iter().any(|l| l == "gateway"));
                    if via_lost {
                        PlanAction::Replace { resource }
                    } else {
                        PlanAction::Keep { resource }
                    }
                }
                Some(r) if r.state == ResourceState::Absent && r.attr("private_ip").is_some() => {
                    PlanAction::Replace { resource }
                }
                _ => PlanAction::Create { resource },
            };
            actions.push(action);
        }
        Ok(actions)
    }

    /// Create everything that is missing, in order. Safe to re-run; an
    /// interrupted or reclaimed topology converges back to complete.
    pub async fn apply(&self, cancel: &AtomicBool) -> Result<InfraState, InfraError> {
        let _lock = self.backend.lock("apply")?;
        let mut state = self.backend.load()?;
        self.refresh(&mut state).await?;
        self.persist(&mut state)?;

        let vpc = self.ensure_vpc(&mut state).await?;
        let subnet_id = self.ensure_subnet(&mut state, &vpc.0).await?;
        let gateway_sg = self.ensure_security_group(&mut state, "gateway-sg", &vpc.0).await?;
        let sim_sg = self.ensure_security_group(&mut state, "sim-sg", &vpc.0).await?;

        // Tunnel keys are generated up front so the gateway boots with
        // its side of the tunnel already configured
        let gateway_created = !self.is_active(&state, "gateway");
        let wg = if gateway_created {
            let server = self.wg_keys.generate().await?;
            let client = self.wg_keys.generate().await?;
            Some((server, client))
        } else {
            None
        };
        let gateway_user_data = wg.as_ref().map(|(server, client)| {
            ServerConfig {
                address: self.config.wg_server_ip(),
                address_prefix: self.config.vpn_client_cidr.prefix(),
                private_key: server.private.duplicate(),
                listen_port: self.config.wireguard.listen_port,
                client_public_key: client.public.clone(),
                client_ip: self.config.wg_client_ip(),
            }
            .user_data()
        });
        let gateway = self
            .ensure_instance(
                &mut state,
                cancel,
                "gateway",
                &self.config.gateway.clone(),
                &subnet_id,
                &gateway_sg,
                None,
                gateway_user_data,
            )
            .await?;
        let sim_private_ip = self.reserved_ip(&state, "sim-host");
        let sim = self
            .ensure_instance(
                &mut state,
                cancel,
                "sim-host",
                &self.config.sim_host.clone(),
                &subnet_id,
                &sim_sg,
                Some(sim_private_ip),
                None,
            )
            .await?;

        // Both instances forward traffic for networks that are not
        // their own address
        self.provider.set_source_dest_check(&gateway.0, false).await?;
        self.provider.set_source_dest_check(&sim.0, false).await?;

        let route_table_id = vpc.1;
        self.ensure_route(&mut state, cancel, "route-sim", &route_table_id, &sim.0)
            .await?;
        self.ensure_route(&mut state, cancel, "route-vpn", &route_table_id, &gateway.0)
            .await?;

        let gateway_public = self
            .provider
            .public_ip(&state.resource("gateway").and_then(|r| r.id.clone()).unwrap_or_default())
            .await?
            .ok_or_else(|| InfraError::Provider {
                operation: "public-ip".to_string(),
                message: "gateway has no public address".to_string(),
            })?;

        state
            .outputs
            .insert("gateway_public_ip".to_string(), gateway_public.to_string());
        state
            .outputs
            .insert("sim_host_private_ip".to_string(), sim.1.to_string());
        state
            .outputs
            .insert("wg_endpoint".to_string(), format!(
                "{gateway_public}:{}",
                self.config.wireguard.listen_port
            ));
        let key = self.config.ssh_key_path.display();
        let user = &self.config.ssh_user;
        state.outputs.insert(
            "gateway_ssh".to_string(),
            format!("ssh -i {key} {user}@{gateway_public}"),
        );
        state.outputs.insert(
            "sim_host_ssh".to_string(),
            format!("ssh -i {key} -J {user}@{gateway_public} {user}@{}", sim.1),
        );
        self.persist(&mut state)?;

        if let Some((server, client)) = wg {
            self.write_client_config(&mut state, gateway_public, &server.public, client)?;
            self.persist(&mut state)?;
        }

        self.verify_connectivity(cancel, gateway_public, sim.1).await?;
        info!("Topology apply complete");
        Ok(state)
    }

    fn is_active(&self, state: &InfraState, key: &str) -> bool {
        state
            .resource(key)
            .map(|r| r.state == ResourceState::Active)
            .unwrap_or(false)
    }

    fn reserved_ip(&self, state: &InfraState, key: &str) -> Ipv4Addr {
        state
            .resource(key)
            .and_then(|r| r.attr("private_ip"))
            .and_then(|ip| ip.parse().ok())
            .unwrap_or(self.config.sim_host_ip)
    }

    async fn ensure_vpc(
        &self,
        state: &mut InfraState,
    ) -> Result<(String, String), InfraError> {
        if self.is_active(state, "vpc") {
            let record = self.record(state, "vpc");
            let vpc_id = record.id.clone().unwrap_or_default();
            let rt = record.attr("route_table_id").unwrap_or_default().to_string();
            return Ok((vpc_id, rt));
        }

        let record = self.record(state, "vpc");
        Self::transition(record, "vpc", ResourceState::Planned)?;
        Self::transition(record, "vpc", ResourceState::Applying)?;
        info!(cidr = %self.config.vpc_cidr, "Creating VPC");
        let ids = self
            .provider
            .create_vpc("labforge-vpc", self.config.vpc_cidr)
            .await?;

        let record = self.record(state, "vpc");
        record.id = Some(ids.vpc_id.clone());
        record
            .attrs
            .insert("route_table_id".to_string(), ids.route_table_id.clone());
        Self::transition(record, "vpc", ResourceState::Active)?;
        self.persist(state)?;
        Ok((ids.vpc_id, ids.route_table_id))
    }

    async fn ensure_subnet(
        &self,
        state: &mut InfraState,
        vpc_id: &str,
    ) -> Result<String, InfraError> {
        if self.is_active(state, "subnet") {
            return Ok(self
                .record(state, "subnet")
                .id
                .clone()
                .unwrap_or_default());
        }

        let record = self.record(state, "subnet");
        Self::transition(record, "subnet", ResourceState::Planned)?;
        Self::transition(record, "subnet", ResourceState::Applying)?;
        info!(cidr = %self.config.subnet_cidr, "Creating subnet");
        let subnet_id = self
            .provider
            .create_subnet(vpc_id, self.config.subnet_cidr)
            .await?;

        let record = self.record(state, "subnet");
        record.id = Some(subnet_id.clone());
        Self::transition(record, "subnet", ResourceState::Active)?;
        self.persist(state)?;
        Ok(subnet_id)
    }

    fn ingress_rules(&self, key: &str) -> Vec<IngressRule> {
        let vpc = self.config.vpc_cidr.to_string();
        let vpn = self.config.vpn_client_cidr.to_string();
        match key {
            "gateway-sg" => vec![
                IngressRule {
                    protocol: "udp".to_string(),
                    port: Some(self.config.wireguard.listen_port),
                    cidr: "0.0.0.0/0".to_string(),
                },
                IngressRule {
                    protocol: "tcp".to_string(),
                    port: Some(22),
                    cidr: "0.0.0.0/0".to_string(),
                },
                IngressRule {
                    protocol: "-1".to_string(),
                    port: None,
                    cidr: vpc,
                },
            ],
            _ => vec![
                IngressRule {
                    protocol: "-1".to_string(),
                    port: None,
                    cidr: vpc,
                },
                IngressRule {
                    protocol: "-1".to_string(),
                    port: None,
                    cidr: vpn,
                },
            ],
        }
    }

    async fn ensure_security_group(
        &self,
        state: &mut InfraState,
        key: &str,
        vpc_id: &str,
    ) -> Result<String, InfraError> {
        if self.is_active(state, key) {
            return Ok(self.record(state, key).id.clone().unwrap_or_default());
        }

        let record = self.record(state, key);
        Self::transition(record, key, ResourceState::Planned)?;
        Self::transition(record, key, ResourceState::Applying)?;
        info!(group = key, "Creating security group");
        let rules = self.ingress_rules(key);
        let group_id = self
            .provider
            .create_security_group(vpc_id, &format!("labforge-{key}"), &rules)
            .await?;

        let record = self.record(state, key);
        record.id = Some(group_id.clone());
        Self::transition(record, key, ResourceState::Active)?;
        self.persist(state)?;
        Ok(group_id)
    }

    /// Returns (eni_id, private_ip) of the active instance
    async fn ensure_instance(
        &self,
        state: &mut InfraState,
        cancel: &AtomicBool,
        key: &str,
        instance: &crate::infra::topology::InstanceConfig,
        subnet_id: &str,
        security_group_id: &str,
        private_ip: Option<Ipv4Addr>,
        user_data: Option<String>,
    ) -> Result<(String, Ipv4Addr), InfraError> {
        if self.is_active(state, key) {
            let record = self.record(state, key);
            let eni = record.attr("eni_id").unwrap_or_default().to_string();
            let ip = record
                .attr("private_ip")
                .and_then(|v| v.parse().ok())
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            return Ok((eni, ip));
        }

        let record = self.record(state, key);
        Self::transition(record, key, ResourceState::Planned)?;
        Self::transition(record, key, ResourceState::Applying)?;
        self.persist(state)?;

        info!(
            instance = key,
            instance_type = %instance.instance_type,
            market = ?instance.market,
            "Launching instance"
        );
        let request = InstanceRequest {
            name: format!("labforge-{key}"),
            ami: self.config.ami.clone(),
            instance_type: instance.instance_type.clone(),
            key_name: self.config.key_name.clone(),
            subnet_id: subnet_id.to_string(),
            security_group_id: security_group_id.to_string(),
            private_ip,
            market: instance.market,
            user_data,
        };
        let launched = match self.provider.run_instance(&request).await {
            Ok(launched) => launched,
            Err(e) => {
                // Roll the record back so a retry plans cleanly
                let record = self.record(state, key);
                Self::transition(record, key, ResourceState::Absent)?;
                self.persist(state)?;
                return Err(e);
            }
        };

        let probe = ReadinessProbe::new(
            format!("instance {key} running"),
            Duration::from_secs(5),
            self.wait_deadline,
        );
        let check = InstanceRunning {
            provider: &self.provider,
            instance_id: &launched.id,
        };
        probe
            .wait(cancel, &check)
            .await
            .map_err(|e| InfraError::Other(e.into()))?;

        let record = self.record(state, key);
        record.id = Some(launched.id.clone());
        record
            .attrs
            .insert("eni_id".to_string(), launched.eni_id.clone());
        record
            .attrs
            .insert("private_ip".to_string(), launched.private_ip.to_string());
        Self::transition(record, key, ResourceState::Active)?;
        self.persist(state)?;
        Ok((launched.eni_id, launched.private_ip))
    }

    async fn ensure_route(
        &self,
        state: &mut InfraState,
        _cancel: &AtomicBool,
        key: &str,
        route_table_id: &str,
        eni_id: &str,
    ) -> Result<(), InfraError> {
        let destination = match key {
            "route-sim" => self.config.sim_cidr,
            _ => self.config.vpn_client_cidr,
        };

        // Re-point the route when the target instance (and so its ENI)
        // was replaced
        if self.is_active(state, key) {
            let record = self.record(state, key);
            if record.attr("eni_id") == Some(eni_id) {
                return Ok(());
            }
            info!(route = key, "Target ENI changed, re-pointing route");
            self.provider.delete_route(route_table_id, destination).await?;
            let record = self.record(state, key);
            Self::transition(record, key, ResourceState::Destroying)?;
            Self::transition(record, key, ResourceState::Absent)?;
        }

        let record = self.record(state, key);
        Self::transition(record, key, ResourceState::Planned)?;
        Self::transition(record, key, ResourceState::Applying)?;
        info!(route = key, %destination, eni = eni_id, "Creating route");
        self.provider
            .create_route(route_table_id, destination, eni_id)
            .await?;

        let record = self.record(state, key);
        record.id = Some(format!("{route_table_id}:{destination}"));
        record.attrs.insert("eni_id".to_string(), eni_id.to_string());
        Self::transition(record, key, ResourceState::Active)?;
        self.persist(state)?;
        Ok(())
    }

    fn write_client_config(
        &self,
        state: &mut InfraState,
        gateway_public: Ipv4Addr,
        server_public: &str,
        client: WgKeypair,
    ) -> Result<(), InfraError> {
        // The tunnel must carry the VPN client block, the whole VPC,
        // and the simulated lab networks
        let required = [
            self.config.vpn_client_cidr,
            self.config.vpc_cidr,
            self.config.sim_cidr,
        ];
        let config = ClientConfig {
            address: self.config.wg_client_ip(),
            address_prefix: self.config.vpn_client_cidr.prefix(),
            private_key: client.private,
            server_public_key: server_public.to_string(),
            endpoint: format!("{gateway_public}:{}", self.config.wireguard.listen_port),
            allowed_ips: required.to_vec(),
        };
        config.validate_allowed_ips(&required)?;
        config.write(&self.wg_config_path)?;

        state
            .outputs
            .insert("wg_server_public_key".to_string(), server_public.to_string());
        state
            .outputs
            .insert("wg_client_public_key".to_string(), client.public);
        state.outputs.insert(
            "wg_client_config".to_string(),
            self.wg_config_path.display().to_string(),
        );
        Ok(())
    }

    async fn verify_connectivity(
        &self,
        cancel: &AtomicBool,
        gateway_public: Ipv4Addr,
        sim_private: Ipv4Addr,
    ) -> Result<(), InfraError> {
        let probe = ReadinessProbe::new(
            format!("sim host {sim_private} via gateway"),
            Duration::from_secs(10),
            self.wait_deadline,
        );
        let check = SimHostReachable {
            provider: &self.provider,
            gateway_ip: gateway_public,
            ssh_user: &self.config.ssh_user,
            ssh_key_path: &self.config.ssh_key_path,
            target: sim_private,
        };
        probe
            .wait(cancel, &check)
            .await
            .map_err(|e| InfraError::Unreachable(e.to_string()))?;
        Ok(())
    }

    /// Tear the topology down in reverse creation order
    pub async fn destroy(&self, cancel: &AtomicBool) -> Result<(), InfraError> {
        let _lock = self.backend.lock("destroy")?;
        let mut state = self.backend.load()?;
        self.refresh(&mut state).await?;

        for key in RESOURCE_ORDER.iter().rev() {
            let Some(record) = state.resources.get(*key) else {
                continue;
            };
            if record.state != ResourceState::Active {
                continue;
            }
            let id = record.id.clone();
            let rt = state
                .resource("vpc")
                .and_then(|r| r.attr("route_table_id"))
                .map(str::to_string);

            let record = self.record(&mut state, key);
            let kind = record.kind;
            Self::transition(record, key, ResourceState::Destroying)?;
            self.persist(&mut state)?;

            info!(resource = key, "Destroying");
            match (kind, id) {
                (ResourceKind::Route, _) => {
                    if let Some(rt) = rt {
                        let destination = match *key {
                            "route-sim" => self.config.sim_cidr,
                            _ => self.config.vpn_client_cidr,
                        };
                        self.provider.delete_route(&rt, destination).await?;
                    }
                }
                (ResourceKind::Instance, Some(id)) => {
                    self.provider.terminate_instance(&id).await?;
                    let probe = ReadinessProbe::new(
                        format!("instance {key} terminated"),
                        Duration::from_secs(5),
                        self.wait_deadline,
                    );
                    let check = InstanceGone {
                        provider: &self.provider,
                        instance_id: &id,
                    };
                    probe
                        .wait(cancel, &check)
                        .await
                        .map_err(|e| InfraError::Other(e.into()))?;
                }
                (ResourceKind::SecurityGroup, Some(id)) => {
                    self.provider.delete_security_group(&id).await?;
                }
                (ResourceKind::Subnet, Some(id)) => {
                    self.provider.delete_subnet(&id).await?;
                }
                (ResourceKind::Vpc, Some(id)) => {
                    self.provider.delete_vpc(&id).await?;
                }
                _ => {}
            }

            let record = self.record(&mut state, key);
            Self::transition(record, key, ResourceState::Absent)?;
            record.id = None;
            record.attrs.clear();
            self.persist(&mut state)?;
        }

        state.outputs.clear();
        self.persist(&mut state)?;
        info!("Topology destroyed");
        Ok(())
    }

    /// Outputs recorded by the last apply
    pub fn outputs(&self) -> Result<std::collections::BTreeMap<String, String>, InfraError> {
        Ok(self.backend.load()?.outputs)
    }
}
