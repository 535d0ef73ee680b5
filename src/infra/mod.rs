//! Cloud topology provisioning

pub mod ec2;
pub mod provisioner;
pub mod resource;
pub mod state;
pub mod topology;
pub mod wireguard;

use std::net::Ipv4Addr;

use async_trait::async_trait;

pub use provisioner::{PlanAction, Provisioner};
pub use state::{InfraState, LocalStateBackend, S3StateBackend, StateBackend};
pub use topology::TopologyConfig;

use topology::{Cidr, Market};

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    /// The provider has no capacity for the requested instance right
    /// now; retryable
    #[error("No capacity available for instance type {instance_type}")]
    CapacityUnavailable { instance_type: String },

    #[error("Cloud operation '{operation}' failed: {message}")]
    Provider { operation: String, message: String },

    #[error("Connectivity check failed: {0}")]
    Unreachable(String),

    #[error("Resource '{resource}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        resource: String,
        from: resource::ResourceState,
        to: resource::ResourceState,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InfraError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, InfraError::CapacityUnavailable { .. })
    }
}

/// VPC plus its main route table
#[derive(Debug, Clone)]
pub struct VpcIds {
    pub vpc_id: String,
    pub route_table_id: String,
}

/// One inbound firewall rule
#[derive(Debug, Clone)]
pub struct IngressRule {
    /// "tcp", "udp", or "-1" for all
    pub protocol: String,
    /// None opens all ports for the protocol
    pub port: Option<u16>,
    pub cidr: String,
}

/// Parameters for launching one instance
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub name: String,
    pub ami: String,
    pub instance_type: String,
    pub key_name: String,
    pub subnet_id: String,
    pub security_group_id: String,
    /// Reserved address; lets a replacement instance keep the IP of an
    /// interrupted one
    pub private_ip: Option<Ipv4Addr>,
    pub market: Market,
    pub user_data: Option<String>,
}

/// A launched instance as the provider reports it
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: String,
    pub eni_id: String,
    pub private_ip: Ipv4Addr,
    pub public_ip: Option<Ipv4Addr>,
}

/// Cloud operations the provisioner needs. Implemented against the aws
/// CLI in production and by a scripted mock in tests.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_vpc(&self, name: &str, cidr: Cidr) -> Result<VpcIds, InfraError>;
    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), InfraError>;

    async fn create_subnet(&self, vpc_id: &str, cidr: Cidr) -> Result<String, InfraError>;
    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), InfraError>;

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        rules: &[IngressRule],
    ) -> Result<String, InfraError>;
    async fn delete_security_group(&self, group_id: &str) -> Result<(), InfraError>;

    async fn run_instance(&self, request: &InstanceRequest) -> Result<Instance, InfraError>;
    async fn terminate_instance(&self, instance_id: &str) -> Result<(), InfraError>;

    /// True when the instance reports state "running"
    async fn instance_running(&self, instance_id: &str) -> Result<bool, InfraError>;

    /// False when the instance is gone or terminated (spot reclaim)
    async fn instance_exists(&self, instance_id: &str) -> Result<bool, InfraError>;

    /// Public address, once the provider has assigned one
    async fn public_ip(&self, instance_id: &str) -> Result<Option<Ipv4Addr>, InfraError>;

    /// Instances that forward foreign traffic need the source/dest
    /// check off on their ENI
    async fn set_source_dest_check(&self, eni_id: &str, enabled: bool) -> Result<(), InfraError>;

    async fn create_route(
        &self,
        route_table_id: &str,
        destination: Cidr,
        eni_id: &str,
    ) -> Result<(), InfraError>;
    async fn delete_route(
        &self,
        route_table_id: &str,
        destination: Cidr,
    ) -> Result<(), InfraError>;

    /// Ping `target` from the gateway's shell over SSH
    async fn reachable(
        &self,
        via_public_ip: Ipv4Addr,
        ssh_user: &str,
        ssh_key_path: &std::path::Path,
        target: Ipv4Addr,
    ) -> Result<bool, InfraError>;
}
